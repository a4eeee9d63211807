use std::{borrow::Cow, fmt, sync::Arc};

use http::{
    HeaderMap, HeaderName, HeaderValue, Request, StatusCode, Uri, header, request, response,
};
use thiserror::Error;

use crate::core::{
    context::ClientConnection,
    destination::DestinationModel,
    transforms::{
        context::{
            QueryTransformContext, RequestTransformContext, ResponseTrailersTransformContext,
            ResponseTransformContext,
        },
        forwarded::{ForwardedAction, ForwardedTransform, XForwardedKind},
        headers,
    },
};

/// Errors raised while applying a chain to a request
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransformError {
    #[error("Invalid destination URI '{uri}': {reason}")]
    InvalidDestinationUri { uri: String, reason: String },

    #[error("Invalid Host header value '{0}'")]
    InvalidHost(String),
}

/// Response statuses a response or trailer transform applies to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ResponseCondition {
    /// Status codes below 400
    #[default]
    Success,
    Always,
    /// Status codes of 400 and above
    Failure,
}

impl ResponseCondition {
    pub fn matches(&self, status: StatusCode) -> bool {
        match self {
            Self::Always => true,
            Self::Success => status.as_u16() < 400,
            Self::Failure => status.as_u16() >= 400,
        }
    }
}

macro_rules! transform_fn {
    ($name:ident, $ctx:ident) => {
        /// Code-defined transform step
        #[derive(Clone)]
        pub struct $name(Arc<dyn Fn(&mut $ctx<'_>) + Send + Sync>);

        impl $name {
            pub fn new<F>(f: F) -> Self
            where
                F: Fn(&mut $ctx<'_>) + Send + Sync + 'static,
            {
                Self(Arc::new(f))
            }

            pub fn call(&self, context: &mut $ctx<'_>) {
                (self.0)(context)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(stringify!($name))
            }
        }
    };
}

transform_fn!(RequestTransformFn, RequestTransformContext);
transform_fn!(ResponseTransformFn, ResponseTransformContext);
transform_fn!(ResponseTrailersTransformFn, ResponseTrailersTransformContext);

/// One step of the request sub-chain
#[derive(Debug, Clone)]
pub enum RequestTransform {
    /// Whether the inbound Host is forwarded instead of the destination's
    OriginalHost(bool),
    HeaderValue {
        name: HeaderName,
        value: HeaderValue,
        append: bool,
    },
    HeaderRemove(HeaderName),
    /// Copies only the listed inbound headers
    HeadersAllowed(Vec<HeaderName>),
    XForwarded {
        kind: XForwardedKind,
        header: HeaderName,
        action: ForwardedAction,
    },
    Forwarded(ForwardedTransform),
    ClientCert(HeaderName),
    PathPrefix(String),
    PathRemovePrefix(String),
    PathSet(String),
    QueryValue {
        key: String,
        value: String,
        append: bool,
    },
    QueryRemove(String),
    Custom(RequestTransformFn),
}

impl RequestTransform {
    pub fn apply(&self, context: &mut RequestTransformContext<'_>) {
        match self {
            Self::OriginalHost(use_original_host) => {
                context.use_original_host = *use_original_host;
            }
            Self::HeaderValue {
                name,
                value,
                append,
            } => {
                let mut values = headers::take_header(context, name);
                if !*append {
                    values.clear();
                }
                values.push(value.clone());
                headers::add_values(&mut context.proxy_request.headers, name, values);
            }
            Self::HeaderRemove(name) => {
                context.proxy_request.headers.remove(name);
            }
            Self::HeadersAllowed(allowed) => {
                for name in allowed {
                    for value in context.inbound.headers.get_all(name) {
                        context.proxy_request.headers.append(name.clone(), value.clone());
                    }
                }
            }
            Self::XForwarded {
                kind,
                header,
                action,
            } => kind.apply(context, header, *action),
            Self::Forwarded(forwarded) => forwarded.apply(context),
            Self::ClientCert(name) => {
                context.proxy_request.headers.remove(name);
                if let Some(value) = context
                    .connection
                    .client_certificate
                    .as_deref()
                    .and_then(|c| HeaderValue::from_str(c).ok())
                {
                    context.proxy_request.headers.insert(name.clone(), value);
                }
            }
            Self::PathPrefix(prefix) => {
                context.path = format!("{prefix}{}", context.path);
            }
            Self::PathRemovePrefix(prefix) => {
                if let Some(rest) = strip_path_prefix(&context.path, prefix) {
                    context.path = rest.to_string();
                }
            }
            Self::PathSet(path) => {
                context.path = path.clone();
            }
            Self::QueryValue { key, value, append } => {
                if *append {
                    context.query.append(key, value);
                } else {
                    context.query.set(key, value);
                }
            }
            Self::QueryRemove(key) => context.query.remove(key),
            Self::Custom(f) => f.call(context),
        }
    }
}

/// Strips `prefix` when it matches whole leading segments of `path`
fn strip_path_prefix<'p>(path: &'p str, prefix: &str) -> Option<&'p str> {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return None;
    }
    let head = path.get(..prefix.len())?;
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    let rest = &path[prefix.len()..];
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

/// One step of the response sub-chain
#[derive(Debug, Clone)]
pub enum ResponseTransform {
    HeaderValue {
        name: HeaderName,
        value: HeaderValue,
        append: bool,
        condition: ResponseCondition,
    },
    HeaderRemove {
        name: HeaderName,
        condition: ResponseCondition,
    },
    /// Copies only the listed response headers
    HeadersAllowed(Vec<HeaderName>),
    Custom(ResponseTransformFn),
}

impl ResponseTransform {
    pub fn apply(&self, context: &mut ResponseTransformContext<'_>) {
        match self {
            Self::HeaderValue {
                name,
                value,
                append,
                condition,
            } => {
                if condition.matches(context.status()) {
                    if !*append {
                        context.headers.remove(name);
                    }
                    context.headers.append(name.clone(), value.clone());
                }
            }
            Self::HeaderRemove { name, condition } => {
                if condition.matches(context.status()) {
                    context.headers.remove(name);
                }
            }
            Self::HeadersAllowed(allowed) => {
                for name in allowed {
                    for value in context.proxy_response.headers.get_all(name) {
                        context.headers.append(name.clone(), value.clone());
                    }
                }
            }
            Self::Custom(f) => f.call(context),
        }
    }
}

/// One step of the trailer sub-chain
#[derive(Debug, Clone)]
pub enum ResponseTrailersTransform {
    HeaderValue {
        name: HeaderName,
        value: HeaderValue,
        append: bool,
        condition: ResponseCondition,
    },
    HeaderRemove {
        name: HeaderName,
        condition: ResponseCondition,
    },
    HeadersAllowed(Vec<HeaderName>),
    Custom(ResponseTrailersTransformFn),
}

impl ResponseTrailersTransform {
    pub fn apply(&self, context: &mut ResponseTrailersTransformContext<'_>) {
        match self {
            Self::HeaderValue {
                name,
                value,
                append,
                condition,
            } => {
                if condition.matches(context.status) {
                    if !*append {
                        context.trailers.remove(name);
                    }
                    context.trailers.append(name.clone(), value.clone());
                }
            }
            Self::HeaderRemove { name, condition } => {
                if condition.matches(context.status) {
                    context.trailers.remove(name);
                }
            }
            Self::HeadersAllowed(allowed) => {
                for name in allowed {
                    for value in context.proxy_trailers.get_all(name) {
                        context.trailers.append(name.clone(), value.clone());
                    }
                }
            }
            Self::Custom(f) => f.call(context),
        }
    }
}

/// Immutable, ordered transforms of one route, built once and shared across requests
#[derive(Debug, Clone, Default)]
pub struct TransformChain {
    should_copy_request_headers: Option<bool>,
    should_copy_response_headers: Option<bool>,
    should_copy_response_trailers: Option<bool>,
    request_transforms: Arc<[RequestTransform]>,
    response_transforms: Arc<[ResponseTransform]>,
    response_trailers_transforms: Arc<[ResponseTrailersTransform]>,
}

impl TransformChain {
    pub fn new(
        should_copy_request_headers: Option<bool>,
        should_copy_response_headers: Option<bool>,
        should_copy_response_trailers: Option<bool>,
        request_transforms: Vec<RequestTransform>,
        response_transforms: Vec<ResponseTransform>,
        response_trailers_transforms: Vec<ResponseTrailersTransform>,
    ) -> Self {
        Self {
            should_copy_request_headers,
            should_copy_response_headers,
            should_copy_response_trailers,
            request_transforms: request_transforms.into(),
            response_transforms: response_transforms.into(),
            response_trailers_transforms: response_trailers_transforms.into(),
        }
    }

    pub fn should_copy_request_headers(&self) -> Option<bool> {
        self.should_copy_request_headers
    }

    pub fn should_copy_response_headers(&self) -> Option<bool> {
        self.should_copy_response_headers
    }

    pub fn should_copy_response_trailers(&self) -> Option<bool> {
        self.should_copy_response_trailers
    }

    pub fn request_transforms(&self) -> &[RequestTransform] {
        &self.request_transforms
    }

    pub fn response_transforms(&self) -> &[ResponseTransform] {
        &self.response_transforms
    }

    pub fn response_trailers_transforms(&self) -> &[ResponseTrailersTransform] {
        &self.response_trailers_transforms
    }

    /// Whether trailers need rewriting rather than passing through untouched
    pub fn transforms_trailers(&self) -> bool {
        self.should_copy_response_trailers == Some(false)
            || !self.response_trailers_transforms.is_empty()
    }

    /// Builds the outgoing request head for `inbound`.
    ///
    /// Host resolution after the chain: a Host set by a transform wins; otherwise the
    /// inbound Host when the original host is kept, else the destination's override host,
    /// else no Host at all.
    pub fn transform_request(
        &self,
        inbound: &request::Parts,
        connection: &ClientConnection,
        destination: Option<&DestinationModel>,
        destination_prefix: &str,
    ) -> Result<request::Parts, TransformError> {
        let (mut proxy_request, ()) = Request::new(()).into_parts();
        proxy_request.method = inbound.method.clone();
        proxy_request.version = inbound.version;

        let headers_copied = self.should_copy_request_headers.unwrap_or(true);
        if headers_copied {
            headers::copy_request_headers(&inbound.headers, &mut proxy_request.headers);
        }

        let mut context = RequestTransformContext {
            inbound,
            connection,
            proxy_request,
            path: inbound.uri.path().to_string(),
            query: QueryTransformContext::new(inbound.uri.query()),
            destination_prefix: destination_prefix.to_string(),
            headers_copied,
            use_original_host: false,
        };

        for transform in self.request_transforms.iter() {
            transform.apply(&mut context);
        }

        let RequestTransformContext {
            mut proxy_request,
            path,
            query,
            destination_prefix,
            use_original_host,
            ..
        } = context;

        if !proxy_request.headers.contains_key(header::HOST) {
            let host = if use_original_host {
                headers::inbound_host(inbound)
            } else {
                destination.and_then(|d| d.host()).map(str::to_string)
            };
            if let Some(host) = host {
                let value = HeaderValue::from_str(&host)
                    .map_err(|_| TransformError::InvalidHost(host.clone()))?;
                proxy_request.headers.insert(header::HOST, value);
            }
        }

        proxy_request.uri = make_destination_uri(&destination_prefix, &path, &query)?;
        Ok(proxy_request)
    }

    /// Fills `response_headers` from the destination's response.
    ///
    /// Returns whether the response body should be forwarded.
    pub fn transform_response(
        &self,
        inbound: &request::Parts,
        proxy_response: &response::Parts,
        response_headers: &mut HeaderMap,
    ) -> bool {
        let headers_copied = self.should_copy_response_headers.unwrap_or(true);
        if headers_copied {
            headers::copy_response_headers(&proxy_response.headers, response_headers);
        }

        let mut context = ResponseTransformContext {
            inbound,
            proxy_response,
            headers: response_headers,
            headers_copied,
            suppress_response_body: false,
        };

        for transform in self.response_transforms.iter() {
            transform.apply(&mut context);
        }

        !context.suppress_response_body
    }

    pub fn transform_response_trailers(
        &self,
        status: StatusCode,
        proxy_trailers: &HeaderMap,
    ) -> HeaderMap {
        let mut trailers = HeaderMap::new();
        let headers_copied = self.should_copy_response_trailers.unwrap_or(true);
        if headers_copied {
            headers::copy_trailers(proxy_trailers, &mut trailers);
        }

        let mut context = ResponseTrailersTransformContext {
            status,
            proxy_trailers,
            trailers: &mut trailers,
            headers_copied,
        };

        for transform in self.response_trailers_transforms.iter() {
            transform.apply(&mut context);
        }

        trailers
    }
}

fn make_destination_uri(
    prefix: &str,
    path: &str,
    query: &QueryTransformContext,
) -> Result<Uri, TransformError> {
    let path = encode_path(path);
    let mut target = String::with_capacity(prefix.len() + path.len() + 16);
    target.push_str(prefix);
    if target.ends_with('/') && path.starts_with('/') {
        target.push_str(&path[1..]);
    } else {
        target.push_str(&path);
    }
    target.push_str(&query.to_query_string());

    target
        .parse::<Uri>()
        .map_err(|e| TransformError::InvalidDestinationUri {
            reason: e.to_string(),
            uri: target,
        })
}

/// Percent-encodes bytes that may not appear in a URI path; existing escapes are kept.
fn encode_path(path: &str) -> Cow<'_, str> {
    fn needs_encoding(b: u8) -> bool {
        !b.is_ascii_graphic()
            || matches!(
                b,
                b'"' | b'#' | b'<' | b'>' | b'?' | b'\\' | b'^' | b'`' | b'{' | b'|' | b'}'
            )
    }

    if !path.bytes().any(needs_encoding) {
        return Cow::Borrowed(path);
    }

    let mut encoded = String::with_capacity(path.len() * 3);
    for b in path.bytes() {
        if needs_encoding(b) {
            encoded.push_str(&format!("%{b:02X}"));
        } else {
            encoded.push(b as char);
        }
    }
    Cow::Owned(encoded)
}

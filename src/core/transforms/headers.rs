//! Header copying rules and the header-related transform directives.
use http::{HeaderMap, HeaderName, HeaderValue, header, request};

use crate::{
    config::models::TransformValues,
    core::transforms::{
        builder::{
            Contribution, TransformBuildError, TransformBuilderContext, TransformFactory,
            TransformRouteValidationContext, check_parameter_count, parse_bool,
            parse_header_name, parse_header_value,
        },
        chain::{RequestTransform, ResponseCondition, ResponseTrailersTransform, ResponseTransform},
        context::RequestTransformContext,
    },
};

const REQUEST_HEADERS_COPY: &str = "RequestHeadersCopy";
const REQUEST_HEADER_ORIGINAL_HOST: &str = "RequestHeaderOriginalHost";
const REQUEST_HEADER: &str = "RequestHeader";
const REQUEST_HEADER_REMOVE: &str = "RequestHeaderRemove";
const REQUEST_HEADERS_ALLOWED: &str = "RequestHeadersAllowed";
const RESPONSE_HEADERS_COPY: &str = "ResponseHeadersCopy";
const RESPONSE_HEADER: &str = "ResponseHeader";
const RESPONSE_HEADER_REMOVE: &str = "ResponseHeaderRemove";
const RESPONSE_HEADERS_ALLOWED: &str = "ResponseHeadersAllowed";
const RESPONSE_TRAILERS_COPY: &str = "ResponseTrailersCopy";
const RESPONSE_TRAILER: &str = "ResponseTrailer";
const RESPONSE_TRAILER_REMOVE: &str = "ResponseTrailerRemove";
const RESPONSE_TRAILERS_ALLOWED: &str = "ResponseTrailersAllowed";
const SET: &str = "Set";
const APPEND: &str = "Append";
const WHEN: &str = "When";

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Copies inbound request headers, minus hop-by-hop headers and Host.
///
/// `TE: trailers` survives so gRPC calls keep working.
pub fn copy_request_headers(source: &HeaderMap, destination: &mut HeaderMap) {
    for (name, value) in source {
        if name == header::HOST {
            continue;
        }
        if is_hop_by_hop(name) {
            let keep_te = name == header::TE
                && value
                    .to_str()
                    .is_ok_and(|v| v.trim().eq_ignore_ascii_case("trailers"));
            if !keep_te {
                continue;
            }
        }
        destination.append(name.clone(), value.clone());
    }
}

pub fn copy_response_headers(source: &HeaderMap, destination: &mut HeaderMap) {
    for (name, value) in source {
        if !is_hop_by_hop(name) {
            destination.append(name.clone(), value.clone());
        }
    }
}

pub fn copy_trailers(source: &HeaderMap, destination: &mut HeaderMap) {
    for (name, value) in source {
        destination.append(name.clone(), value.clone());
    }
}

/// Removes `name` from the outgoing request and returns its previous values.
///
/// When inbound headers were not copied, the inbound values are returned instead.
pub fn take_header(context: &mut RequestTransformContext<'_>, name: &HeaderName) -> Vec<HeaderValue> {
    let source = if context.headers_copied {
        &context.proxy_request.headers
    } else {
        &context.inbound.headers
    };
    let values = source.get_all(name).iter().cloned().collect();
    context.proxy_request.headers.remove(name);
    values
}

pub fn add_values(headers: &mut HeaderMap, name: &HeaderName, values: Vec<HeaderValue>) {
    for value in values {
        headers.append(name.clone(), value);
    }
}

/// Host the client addressed, from the Host header or an absolute-form URI
pub fn inbound_host(inbound: &request::Parts) -> Option<String> {
    inbound
        .headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| inbound.uri.authority().map(|a| a.to_string()))
        .filter(|h| !h.is_empty())
}

/// Claims the header and header-copy directives
#[derive(Debug, Default, Clone, Copy)]
pub struct HeaderTransformFactory;

impl HeaderTransformFactory {
    fn parse(
        &self,
        values: &TransformValues,
    ) -> Option<Result<Vec<Contribution>, TransformBuildError>> {
        if let Some(raw) = values.get(REQUEST_HEADERS_COPY) {
            return Some(bool_directive(values, REQUEST_HEADERS_COPY, raw).map(|b| {
                vec![Contribution::CopyRequestHeaders(b)]
            }));
        }
        if let Some(raw) = values.get(RESPONSE_HEADERS_COPY) {
            return Some(bool_directive(values, RESPONSE_HEADERS_COPY, raw).map(|b| {
                vec![Contribution::CopyResponseHeaders(b)]
            }));
        }
        if let Some(raw) = values.get(RESPONSE_TRAILERS_COPY) {
            return Some(bool_directive(values, RESPONSE_TRAILERS_COPY, raw).map(|b| {
                vec![Contribution::CopyResponseTrailers(b)]
            }));
        }
        if let Some(raw) = values.get(REQUEST_HEADER_ORIGINAL_HOST) {
            return Some(bool_directive(values, REQUEST_HEADER_ORIGINAL_HOST, raw).map(|b| {
                vec![Contribution::Request(RequestTransform::OriginalHost(b))]
            }));
        }
        if let Some(raw) = values.get(REQUEST_HEADER) {
            return Some(request_header(values, raw));
        }
        if let Some(raw) = values.get(REQUEST_HEADER_REMOVE) {
            return Some(single_header(values, raw).map(|name| {
                vec![Contribution::Request(RequestTransform::HeaderRemove(name))]
            }));
        }
        if let Some(raw) = values.get(REQUEST_HEADERS_ALLOWED) {
            return Some(allowed_headers(values, raw).map(|names| {
                vec![
                    Contribution::CopyRequestHeaders(false),
                    Contribution::Request(RequestTransform::HeadersAllowed(names)),
                ]
            }));
        }
        if let Some(raw) = values.get(RESPONSE_HEADER) {
            return Some(response_header(values, RESPONSE_HEADER, raw).map(
                |(name, value, append, condition)| {
                    vec![Contribution::Response(ResponseTransform::HeaderValue {
                        name,
                        value,
                        append,
                        condition,
                    })]
                },
            ));
        }
        if let Some(raw) = values.get(RESPONSE_HEADER_REMOVE) {
            return Some(header_remove(values, raw).map(|(name, condition)| {
                vec![Contribution::Response(ResponseTransform::HeaderRemove {
                    name,
                    condition,
                })]
            }));
        }
        if let Some(raw) = values.get(RESPONSE_HEADERS_ALLOWED) {
            return Some(allowed_headers(values, raw).map(|names| {
                vec![
                    Contribution::CopyResponseHeaders(false),
                    Contribution::Response(ResponseTransform::HeadersAllowed(names)),
                ]
            }));
        }
        if let Some(raw) = values.get(RESPONSE_TRAILER) {
            return Some(response_header(values, RESPONSE_TRAILER, raw).map(
                |(name, value, append, condition)| {
                    vec![Contribution::ResponseTrailers(
                        ResponseTrailersTransform::HeaderValue {
                            name,
                            value,
                            append,
                            condition,
                        },
                    )]
                },
            ));
        }
        if let Some(raw) = values.get(RESPONSE_TRAILER_REMOVE) {
            return Some(header_remove(values, raw).map(|(name, condition)| {
                vec![Contribution::ResponseTrailers(
                    ResponseTrailersTransform::HeaderRemove { name, condition },
                )]
            }));
        }
        if let Some(raw) = values.get(RESPONSE_TRAILERS_ALLOWED) {
            return Some(allowed_headers(values, raw).map(|names| {
                vec![
                    Contribution::CopyResponseTrailers(false),
                    Contribution::ResponseTrailers(ResponseTrailersTransform::HeadersAllowed(
                        names,
                    )),
                ]
            }));
        }
        None
    }
}

impl TransformFactory for HeaderTransformFactory {
    fn validate(
        &self,
        context: &mut TransformRouteValidationContext<'_>,
        values: &TransformValues,
    ) -> bool {
        context.check(self.parse(values))
    }

    fn build(&self, context: &mut TransformBuilderContext<'_>, values: &TransformValues) -> bool {
        context.contribute(self.parse(values))
    }
}

fn bool_directive(values: &TransformValues, key: &str, raw: &str) -> Result<bool, TransformBuildError> {
    check_parameter_count(values, 1)?;
    parse_bool(key, raw)
}

fn single_header(values: &TransformValues, raw: &str) -> Result<HeaderName, TransformBuildError> {
    check_parameter_count(values, 1)?;
    parse_header_name(raw)
}

fn allowed_headers(
    values: &TransformValues,
    raw: &str,
) -> Result<Vec<HeaderName>, TransformBuildError> {
    check_parameter_count(values, 1)?;
    header_list(raw)
}

fn request_header(
    values: &TransformValues,
    raw: &str,
) -> Result<Vec<Contribution>, TransformBuildError> {
    check_parameter_count(values, 2)?;
    let name = parse_header_name(raw)?;
    let (value, append) = set_or_append(values, REQUEST_HEADER)?;
    let value = parse_header_value(&name, value)?;
    Ok(vec![Contribution::Request(RequestTransform::HeaderValue {
        name,
        value,
        append,
    })])
}

fn response_header(
    values: &TransformValues,
    transform: &str,
    raw: &str,
) -> Result<(HeaderName, HeaderValue, bool, ResponseCondition), TransformBuildError> {
    let condition = when(values)?;
    check_parameter_count(values, if values.contains_key(WHEN) { 3 } else { 2 })?;
    let name = parse_header_name(raw)?;
    let (value, append) = set_or_append(values, transform)?;
    let value = parse_header_value(&name, value)?;
    Ok((name, value, append, condition))
}

fn header_remove(
    values: &TransformValues,
    raw: &str,
) -> Result<(HeaderName, ResponseCondition), TransformBuildError> {
    let condition = when(values)?;
    check_parameter_count(values, if values.contains_key(WHEN) { 2 } else { 1 })?;
    Ok((parse_header_name(raw)?, condition))
}

fn set_or_append<'v>(
    values: &'v TransformValues,
    transform: &str,
) -> Result<(&'v str, bool), TransformBuildError> {
    if let Some(value) = values.get(SET) {
        Ok((value, false))
    } else if let Some(value) = values.get(APPEND) {
        Ok((value, true))
    } else {
        Err(TransformBuildError::UnexpectedParameters {
            transform: transform.to_string(),
            keys: values.keys().collect::<Vec<_>>().join(";"),
            expected: "'Set' or 'Append'".to_string(),
        })
    }
}

fn when(values: &TransformValues) -> Result<ResponseCondition, TransformBuildError> {
    match values.get(WHEN) {
        None => Ok(ResponseCondition::default()),
        Some(raw) if raw.eq_ignore_ascii_case("Success") => Ok(ResponseCondition::Success),
        Some(raw) if raw.eq_ignore_ascii_case("Always") => Ok(ResponseCondition::Always),
        Some(raw) if raw.eq_ignore_ascii_case("Failure") => Ok(ResponseCondition::Failure),
        Some(raw) => Err(TransformBuildError::InvalidValue {
            key: WHEN.to_string(),
            value: raw.to_string(),
            expected: "'Success', 'Always' or 'Failure'".to_string(),
        }),
    }
}

fn header_list(raw: &str) -> Result<Vec<HeaderName>, TransformBuildError> {
    raw.split(';')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(parse_header_name)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_copy_skips_hop_by_hop_and_host() {
        let mut source = HeaderMap::new();
        source.insert(header::HOST, HeaderValue::from_static("example.com"));
        source.insert(header::CONNECTION, HeaderValue::from_static("close"));
        source.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        source.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        source.insert(header::TE, HeaderValue::from_static("trailers"));
        source.append("x-multi", HeaderValue::from_static("a"));
        source.append("x-multi", HeaderValue::from_static("b"));

        let mut destination = HeaderMap::new();
        copy_request_headers(&source, &mut destination);

        assert!(!destination.contains_key(header::HOST));
        assert!(!destination.contains_key(header::CONNECTION));
        assert!(!destination.contains_key(header::TRANSFER_ENCODING));
        assert!(!destination.contains_key("keep-alive"));
        assert_eq!(destination[header::TE], "trailers");
        assert_eq!(destination.get_all("x-multi").iter().count(), 2);
    }

    #[test]
    fn te_other_than_trailers_is_dropped() {
        let mut source = HeaderMap::new();
        source.insert(header::TE, HeaderValue::from_static("gzip"));
        let mut destination = HeaderMap::new();
        copy_request_headers(&source, &mut destination);
        assert!(destination.is_empty());
    }

    #[test]
    fn parses_response_header_with_condition() {
        let values = TransformValues::new()
            .with(RESPONSE_HEADER, "x-served-by")
            .with(APPEND, "waypoint")
            .with(WHEN, "always");

        let contributions = HeaderTransformFactory.parse(&values).unwrap().unwrap();
        assert!(matches!(
            &contributions[..],
            [Contribution::Response(ResponseTransform::HeaderValue {
                append: true,
                condition: ResponseCondition::Always,
                ..
            })]
        ));
    }

    #[test]
    fn request_header_requires_set_or_append() {
        let values = TransformValues::new()
            .with(REQUEST_HEADER, "x-a")
            .with("Replace", "b");
        let error = HeaderTransformFactory.parse(&values).unwrap().unwrap_err();
        assert!(matches!(error, TransformBuildError::UnexpectedParameters { .. }));
    }

    #[test]
    fn copy_flag_rejects_non_boolean() {
        let values = TransformValues::new().with(REQUEST_HEADERS_COPY, "maybe");
        assert!(HeaderTransformFactory.parse(&values).unwrap().is_err());
    }

    #[test]
    fn unrelated_entries_are_not_claimed() {
        let values = TransformValues::new().with("PathSet", "/");
        assert!(HeaderTransformFactory.parse(&values).is_none());
    }
}

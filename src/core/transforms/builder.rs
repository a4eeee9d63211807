//! Turns the declarative transform directives of a route into an immutable [`TransformChain`].
//!
//! Directives are offered to the built-in factories first and then to registered factories in
//! registration order; the first factory that claims a directive stops the search. Providers
//! run after every directive was claimed, again in registration order. Once all of them ran,
//! the default host and forwarding transforms are appended unless a directive suppressed them.
use std::{fmt, sync::Arc};

use http::{HeaderName, HeaderValue};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    config::models::{ClusterConfig, RouteConfig, TransformValues},
    core::transforms::{
        chain::{
            RequestTransform, RequestTransformFn, ResponseTrailersTransform,
            ResponseTrailersTransformFn, ResponseTransform, ResponseTransformFn, TransformChain,
        },
        context::{
            RequestTransformContext, ResponseTrailersTransformContext, ResponseTransformContext,
        },
        forwarded::{ForwardedAction, ForwardedTransform, ForwardedTransformFactory, XForwardedKind},
        headers::HeaderTransformFactory,
        path::{PathTransformFactory, QueryTransformFactory},
    },
};

/// Errors reported while validating or building transforms
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransformBuildError {
    /// No factory claimed the directive; carries its keys joined by `;`
    #[error("Unknown transform: {0}")]
    UnknownTransform(String),

    #[error("The transform contains more parameters than expected: {0}")]
    TooManyParameters(String),

    #[error("Unexpected value '{value}' for '{key}'. Expected: {expected}")]
    InvalidValue {
        key: String,
        value: String,
        expected: String,
    },

    #[error("Unexpected parameters for {transform}: {keys}. Expected {expected}")]
    UnexpectedParameters {
        transform: String,
        keys: String,
        expected: String,
    },

    #[error("Invalid header name '{0}'")]
    InvalidHeaderName(String),

    #[error("Invalid value for header '{name}'")]
    InvalidHeaderValue { name: String },

    /// Raised by registered factories and providers
    #[error("{0}")]
    Custom(String),
}

/// What one parsed directive adds to the chain under construction
#[derive(Debug, Clone)]
pub(crate) enum Contribution {
    Request(RequestTransform),
    Response(ResponseTransform),
    ResponseTrailers(ResponseTrailersTransform),
    CopyRequestHeaders(bool),
    CopyResponseHeaders(bool),
    CopyResponseTrailers(bool),
    /// The route configured the X-Forwarded headers itself
    SuppressDefaultForwarders,
}

/// Claims and builds individual transform directives
pub trait TransformFactory: Send + Sync {
    /// Returns `true` when the directive was claimed. Problems go to `context.errors`.
    fn validate(&self, context: &mut TransformRouteValidationContext<'_>, values: &TransformValues)
    -> bool;

    /// Returns `true` when the directive was claimed and added to `context`.
    fn build(&self, context: &mut TransformBuilderContext<'_>, values: &TransformValues) -> bool;
}

/// Adds transforms for every route, independent of its directives
pub trait TransformProvider: Send + Sync {
    fn validate_route(&self, _context: &mut TransformRouteValidationContext<'_>) {}

    fn validate_cluster(&self, _context: &mut TransformClusterValidationContext<'_>) {}

    fn apply(&self, context: &mut TransformBuilderContext<'_>);
}

#[derive(Debug)]
pub struct TransformRouteValidationContext<'a> {
    pub route: &'a RouteConfig,
    pub errors: Vec<TransformBuildError>,
}

impl TransformRouteValidationContext<'_> {
    pub(crate) fn check(
        &mut self,
        parsed: Option<Result<Vec<Contribution>, TransformBuildError>>,
    ) -> bool {
        match parsed {
            None => false,
            Some(Ok(_)) => true,
            Some(Err(error)) => {
                self.errors.push(error);
                true
            }
        }
    }
}

#[derive(Debug)]
pub struct TransformClusterValidationContext<'a> {
    pub cluster: &'a ClusterConfig,
    pub errors: Vec<TransformBuildError>,
}

/// Chain under construction for one route
#[derive(Debug)]
pub struct TransformBuilderContext<'a> {
    pub route: &'a RouteConfig,
    pub cluster: Option<&'a ClusterConfig>,
    pub copy_request_headers: Option<bool>,
    pub copy_response_headers: Option<bool>,
    pub copy_response_trailers: Option<bool>,
    pub request_transforms: Vec<RequestTransform>,
    pub response_transforms: Vec<ResponseTransform>,
    pub response_trailers_transforms: Vec<ResponseTrailersTransform>,
    /// `Some(false)` once the route configured X-Forwarded itself
    pub use_default_forwarders: Option<bool>,
    pub errors: Vec<TransformBuildError>,
}

impl<'a> TransformBuilderContext<'a> {
    fn new(route: &'a RouteConfig, cluster: Option<&'a ClusterConfig>) -> Self {
        Self {
            route,
            cluster,
            copy_request_headers: None,
            copy_response_headers: None,
            copy_response_trailers: None,
            request_transforms: Vec::new(),
            response_transforms: Vec::new(),
            response_trailers_transforms: Vec::new(),
            use_default_forwarders: None,
            errors: Vec::new(),
        }
    }

    pub fn add_request_transform<F>(&mut self, f: F)
    where
        F: Fn(&mut RequestTransformContext<'_>) + Send + Sync + 'static,
    {
        self.request_transforms
            .push(RequestTransform::Custom(RequestTransformFn::new(f)));
    }

    pub fn add_response_transform<F>(&mut self, f: F)
    where
        F: Fn(&mut ResponseTransformContext<'_>) + Send + Sync + 'static,
    {
        self.response_transforms
            .push(ResponseTransform::Custom(ResponseTransformFn::new(f)));
    }

    pub fn add_response_trailers_transform<F>(&mut self, f: F)
    where
        F: Fn(&mut ResponseTrailersTransformContext<'_>) + Send + Sync + 'static,
    {
        self.response_trailers_transforms
            .push(ResponseTrailersTransform::Custom(ResponseTrailersTransformFn::new(f)));
    }

    pub(crate) fn contribute(
        &mut self,
        parsed: Option<Result<Vec<Contribution>, TransformBuildError>>,
    ) -> bool {
        match parsed {
            None => false,
            Some(Err(error)) => {
                self.errors.push(error);
                true
            }
            Some(Ok(contributions)) => {
                for contribution in contributions {
                    self.add(contribution);
                }
                true
            }
        }
    }

    fn add(&mut self, contribution: Contribution) {
        match contribution {
            Contribution::Request(t) => self.request_transforms.push(t),
            Contribution::Response(t) => self.response_transforms.push(t),
            Contribution::ResponseTrailers(t) => self.response_trailers_transforms.push(t),
            Contribution::CopyRequestHeaders(b) => self.copy_request_headers = Some(b),
            Contribution::CopyResponseHeaders(b) => self.copy_response_headers = Some(b),
            Contribution::CopyResponseTrailers(b) => self.copy_response_trailers = Some(b),
            Contribution::SuppressDefaultForwarders => self.use_default_forwarders = Some(false),
        }
    }

    /// Appends the host and forwarding defaults the route did not configure itself.
    fn apply_defaults(&mut self) {
        let has_host = self
            .request_transforms
            .iter()
            .any(|t| matches!(t, RequestTransform::OriginalHost(_)));
        let has_forwarded = self
            .request_transforms
            .iter()
            .any(|t| matches!(t, RequestTransform::Forwarded(_)));
        let has_x_forwarded = self
            .request_transforms
            .iter()
            .any(|t| matches!(t, RequestTransform::XForwarded { .. }));
        let defaults_on = self.use_default_forwarders != Some(false);
        // X-Forwarded: Off leaves no X-Forwarded transform behind
        let x_forwarded_off = !defaults_on && !has_x_forwarded;

        if has_forwarded {
            if defaults_on {
                for kind in XForwardedKind::ALL {
                    self.request_transforms
                        .push(kind.transform(ForwardedAction::Remove));
                }
            }
            if !has_host && !x_forwarded_off {
                self.request_transforms.push(RequestTransform::OriginalHost(false));
            }
        } else {
            if !has_host {
                self.request_transforms.push(RequestTransform::OriginalHost(false));
            }
            if defaults_on {
                for kind in XForwardedKind::ALL {
                    self.request_transforms.push(kind.transform(ForwardedAction::Set));
                }
            }
            if !x_forwarded_off {
                self.request_transforms
                    .push(RequestTransform::Forwarded(ForwardedTransform::remove()));
            }
        }
    }

    fn into_chain(self) -> TransformChain {
        TransformChain::new(
            self.copy_request_headers,
            self.copy_response_headers,
            self.copy_response_trailers,
            self.request_transforms,
            self.response_transforms,
            self.response_trailers_transforms,
        )
    }
}

/// Validates and builds transform chains.
///
/// Cheap to clone; factories and providers are shared.
#[derive(Clone)]
pub struct TransformBuilder {
    factories: Vec<Arc<dyn TransformFactory>>,
    providers: Vec<Arc<dyn TransformProvider>>,
}

impl Default for TransformBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransformBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformBuilder")
            .field("factories", &self.factories.len())
            .field("providers", &self.providers.len())
            .finish()
    }
}

impl TransformBuilder {
    /// A builder with only the built-in directives registered
    pub fn new() -> Self {
        Self {
            factories: vec![
                Arc::new(HeaderTransformFactory),
                Arc::new(ForwardedTransformFactory),
                Arc::new(PathTransformFactory),
                Arc::new(QueryTransformFactory),
            ],
            providers: Vec::new(),
        }
    }

    pub fn with_factory(mut self, factory: impl TransformFactory + 'static) -> Self {
        self.factories.push(Arc::new(factory));
        self
    }

    pub fn with_provider(mut self, provider: impl TransformProvider + 'static) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    /// Every problem found in the route's directives, in declaration order
    pub fn validate_route(&self, route: &RouteConfig) -> Vec<TransformBuildError> {
        let mut context = TransformRouteValidationContext {
            route,
            errors: Vec::new(),
        };

        for values in route.transforms.iter().flatten() {
            let claimed = self
                .factories
                .iter()
                .any(|factory| factory.validate(&mut context, values));
            if !claimed {
                context.errors.push(unknown_transform(values));
            }
        }

        for provider in &self.providers {
            provider.validate_route(&mut context);
        }

        context.errors
    }

    pub fn validate_cluster(&self, cluster: &ClusterConfig) -> Vec<TransformBuildError> {
        let mut context = TransformClusterValidationContext {
            cluster,
            errors: Vec::new(),
        };
        for provider in &self.providers {
            provider.validate_cluster(&mut context);
        }
        context.errors
    }

    /// Builds the chain for `route`, failing with the first error encountered.
    pub fn build(
        &self,
        route: &RouteConfig,
        cluster: Option<&ClusterConfig>,
    ) -> Result<TransformChain, TransformBuildError> {
        let mut context = TransformBuilderContext::new(route, cluster);

        for values in route.transforms.iter().flatten() {
            let claimed = self
                .factories
                .iter()
                .any(|factory| factory.build(&mut context, values));
            if !claimed {
                context.errors.push(unknown_transform(values));
            }
        }

        for provider in &self.providers {
            provider.apply(&mut context);
        }

        if let Some(error) = context.errors.first() {
            warn!(
                route.id = %route.route_id,
                error = %error,
                errors = context.errors.len(),
                "Failed to build transforms"
            );
            return Err(error.clone());
        }

        context.apply_defaults();
        let chain = context.into_chain();
        debug!(
            route.id = %route.route_id,
            request = chain.request_transforms().len(),
            response = chain.response_transforms().len(),
            trailers = chain.response_trailers_transforms().len(),
            "Built transforms"
        );
        Ok(chain)
    }

    /// Builds a chain from code instead of directives. Defaults still apply.
    pub fn create<F>(&self, configure: F) -> Result<TransformChain, TransformBuildError>
    where
        F: FnOnce(&mut TransformBuilderContext<'_>),
    {
        let route = RouteConfig::default();
        let mut context = TransformBuilderContext::new(&route, None);
        configure(&mut context);

        if let Some(error) = context.errors.first() {
            return Err(error.clone());
        }
        context.apply_defaults();
        Ok(context.into_chain())
    }
}

fn unknown_transform(values: &TransformValues) -> TransformBuildError {
    TransformBuildError::UnknownTransform(values.keys().collect::<Vec<_>>().join(";"))
}

/// Rejects directives carrying more keys than the claiming factory understands.
pub(crate) fn check_parameter_count(
    values: &TransformValues,
    expected: usize,
) -> Result<(), TransformBuildError> {
    if values.len() > expected {
        Err(TransformBuildError::TooManyParameters(
            values.keys().collect::<Vec<_>>().join(";"),
        ))
    } else {
        Ok(())
    }
}

pub(crate) fn parse_bool(key: &str, raw: &str) -> Result<bool, TransformBuildError> {
    if raw.eq_ignore_ascii_case("true") {
        Ok(true)
    } else if raw.eq_ignore_ascii_case("false") {
        Ok(false)
    } else {
        Err(TransformBuildError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
            expected: "'true' or 'false'".to_string(),
        })
    }
}

pub(crate) fn parse_header_name(raw: &str) -> Result<HeaderName, TransformBuildError> {
    HeaderName::from_bytes(raw.trim().as_bytes())
        .map_err(|_| TransformBuildError::InvalidHeaderName(raw.to_string()))
}

pub(crate) fn parse_header_value(
    name: &HeaderName,
    raw: &str,
) -> Result<HeaderValue, TransformBuildError> {
    HeaderValue::from_str(raw).map_err(|_| TransformBuildError::InvalidHeaderValue {
        name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(transforms: Vec<TransformValues>) -> RouteConfig {
        RouteConfig {
            route_id: "route1".to_string(),
            transforms: Some(transforms),
            ..RouteConfig::default()
        }
    }

    #[test]
    fn defaults_without_directives() {
        let builder = TransformBuilder::new();
        for route in [RouteConfig::new("r"), route(Vec::new())] {
            let chain = builder.build(&route, None).unwrap();
            let transforms = chain.request_transforms();
            assert_eq!(transforms.len(), 6);
            assert!(matches!(transforms[0], RequestTransform::OriginalHost(false)));
            let kinds: Vec<_> = transforms[1..5]
                .iter()
                .map(|t| match t {
                    RequestTransform::XForwarded { kind, action, .. } => {
                        assert_eq!(*action, ForwardedAction::Set);
                        *kind
                    }
                    other => panic!("unexpected transform {other:?}"),
                })
                .collect();
            assert_eq!(kinds, XForwardedKind::ALL.to_vec());
            assert!(matches!(
                &transforms[5],
                RequestTransform::Forwarded(f) if f.action == ForwardedAction::Remove
            ));
            assert!(chain.response_transforms().is_empty());
            assert!(chain.response_trailers_transforms().is_empty());
        }
    }

    #[test]
    fn x_forwarded_off_keeps_only_host() {
        let route = route(vec![TransformValues::new().with("X-Forwarded", "Off")]);
        let chain = TransformBuilder::new().build(&route, None).unwrap();
        assert!(matches!(
            chain.request_transforms(),
            [RequestTransform::OriginalHost(false)]
        ));
    }

    #[test]
    fn forwarded_replaces_x_forwarded_with_removals() {
        let route = route(vec![TransformValues::new().with("Forwarded", "proto")]);
        let chain = TransformBuilder::new().build(&route, None).unwrap();
        let transforms = chain.request_transforms();
        assert_eq!(transforms.len(), 6);
        assert!(matches!(&transforms[0], RequestTransform::Forwarded(f) if f.proto));
        assert!(transforms[1..5].iter().all(|t| matches!(
            t,
            RequestTransform::XForwarded {
                action: ForwardedAction::Remove,
                ..
            }
        )));
        assert!(matches!(transforms[5], RequestTransform::OriginalHost(false)));
    }

    #[test]
    fn forwarded_with_x_forwarded_off_is_alone() {
        let route = route(vec![
            TransformValues::new().with("X-Forwarded", "Off"),
            TransformValues::new().with("Forwarded", "proto"),
        ]);
        let chain = TransformBuilder::new().build(&route, None).unwrap();
        assert!(matches!(
            chain.request_transforms(),
            [RequestTransform::Forwarded(f)] if f.proto && !f.host
        ));
    }

    #[test]
    fn explicit_original_host_replaces_default() {
        let route = route(vec![
            TransformValues::new().with("RequestHeaderOriginalHost", "true"),
        ]);
        let chain = TransformBuilder::new().build(&route, None).unwrap();
        let hosts: Vec<_> = chain
            .request_transforms()
            .iter()
            .filter_map(|t| match t {
                RequestTransform::OriginalHost(b) => Some(*b),
                _ => None,
            })
            .collect();
        assert_eq!(hosts, vec![true]);
        assert_eq!(chain.request_transforms().len(), 6);
    }

    #[test]
    fn unknown_directive_reports_all_keys() {
        let route = route(vec![
            TransformValues::new().with("Foo", "1").with("Bar", "2"),
            TransformValues::new().with("RequestHeadersCopy", "maybe"),
        ]);
        let builder = TransformBuilder::new();

        let errors = builder.validate_route(&route);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].to_string(), "Unknown transform: Foo;Bar");

        let error = builder.build(&route, None).unwrap_err();
        assert_eq!(error, errors[0]);
    }

    struct Tagging;

    impl TransformFactory for Tagging {
        fn validate(
            &self,
            context: &mut TransformRouteValidationContext<'_>,
            values: &TransformValues,
        ) -> bool {
            if !values.contains_key("Tag") {
                return false;
            }
            if values.get("Tag") == Some("") {
                context
                    .errors
                    .push(TransformBuildError::Custom("empty tag".to_string()));
            }
            true
        }

        fn build(&self, context: &mut TransformBuilderContext<'_>, values: &TransformValues) -> bool {
            let Some(tag) = values.get("Tag") else {
                return false;
            };
            let value = HeaderValue::from_str(tag).unwrap();
            context.add_response_transform(move |ctx| {
                ctx.headers.insert("x-tag", value.clone());
            });
            true
        }
    }

    struct ClusterTag;

    impl TransformProvider for ClusterTag {
        fn validate_cluster(&self, context: &mut TransformClusterValidationContext<'_>) {
            if context.cluster.destinations.is_empty() {
                context
                    .errors
                    .push(TransformBuildError::Custom("no destinations".to_string()));
            }
        }

        fn apply(&self, context: &mut TransformBuilderContext<'_>) {
            if let Some(cluster) = context.cluster {
                let id = HeaderValue::from_str(&cluster.cluster_id).unwrap();
                context.add_request_transform(move |ctx| {
                    ctx.proxy_request.headers.insert("x-cluster", id.clone());
                });
            }
        }
    }

    #[test]
    fn registered_extensions_run_after_builtins() {
        let builder = TransformBuilder::new()
            .with_factory(Tagging)
            .with_provider(ClusterTag);
        let route = route(vec![TransformValues::new().with("Tag", "blue")]);
        let cluster = ClusterConfig::new("cluster1");

        assert!(builder.validate_route(&route).is_empty());
        assert_eq!(builder.validate_cluster(&cluster).len(), 1);

        let chain = builder.build(&route, Some(&cluster)).unwrap();
        assert_eq!(chain.response_transforms().len(), 1);
        assert!(matches!(
            chain.request_transforms()[0],
            RequestTransform::Custom(_)
        ));
        assert_eq!(chain.request_transforms().len(), 7);
    }

    #[test]
    fn create_applies_defaults() {
        let chain = TransformBuilder::new()
            .create(|context| {
                context.copy_request_headers = Some(false);
                context.add_request_transform(|_| {});
            })
            .unwrap();
        assert_eq!(chain.should_copy_request_headers(), Some(false));
        assert_eq!(chain.request_transforms().len(), 7);
    }

    #[test]
    fn create_returns_first_error() {
        let error = TransformBuilder::new()
            .create(|context| {
                context
                    .errors
                    .push(TransformBuildError::Custom("first".to_string()));
                context
                    .errors
                    .push(TransformBuildError::Custom("second".to_string()));
            })
            .unwrap_err();
        assert_eq!(error, TransformBuildError::Custom("first".to_string()));
    }
}

#![allow(clippy::collapsible_if)]

use std::collections::HashSet;

use url::Url;

use crate::{
    adapters::{ClientFactoryError, ForwardingClient},
    config::models::{ClusterConfig, ProxyConfig, RouteConfig},
    core::{
        affinity::SessionAffinity,
        cluster::AvailableDestinationsPolicy,
        forwarder::ForwarderRequestSettings,
        transforms::{TransformBuildError, TransformBuilder},
    },
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Duplicate {kind} id '{id}'")]
    DuplicateId { kind: &'static str, id: String },

    #[error("Route '{route_id}' references unknown cluster '{cluster_id}'")]
    UnknownCluster { route_id: String, cluster_id: String },

    #[error("Route '{route_id}' transforms: {source}")]
    Transform {
        route_id: String,
        source: TransformBuildError,
    },

    #[error("Cluster '{cluster_id}' http_client: {source}")]
    HttpClient {
        cluster_id: String,
        source: ClientFactoryError,
    },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Checks a whole [`ProxyConfig`] before any of it is bound.
///
/// Every problem is collected; a single error is returned as is, several are folded into
/// `ValidationFailed`.
pub struct ProxyConfigValidator;

impl ProxyConfigValidator {
    pub fn validate(config: &ProxyConfig, transforms: &TransformBuilder) -> ValidationResult<()> {
        let mut errors = Self::collect_errors(config, transforms);

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(&errors),
            }),
        }
    }

    /// Same checks as [`validate`](Self::validate), returning every error found.
    pub fn collect_errors(
        config: &ProxyConfig,
        transforms: &TransformBuilder,
    ) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        let mut cluster_ids = HashSet::new();
        for cluster in &config.clusters {
            if !cluster.cluster_id.is_empty() && !cluster_ids.insert(cluster.cluster_id.as_str()) {
                errors.push(ValidationError::DuplicateId {
                    kind: "cluster",
                    id: cluster.cluster_id.clone(),
                });
            }
            errors.extend(Self::validate_cluster(cluster, transforms));
        }

        let mut route_ids = HashSet::new();
        for route in &config.routes {
            if !route.route_id.is_empty() && !route_ids.insert(route.route_id.as_str()) {
                errors.push(ValidationError::DuplicateId {
                    kind: "route",
                    id: route.route_id.clone(),
                });
            }
            errors.extend(Self::validate_route(route, &cluster_ids, transforms));
        }

        if !errors.is_empty() {
            tracing::warn!(errors = errors.len(), "Proxy configuration rejected");
        }
        errors
    }

    fn validate_route(
        route: &RouteConfig,
        cluster_ids: &HashSet<&str>,
        transforms: &TransformBuilder,
    ) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if route.route_id.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "route_id".to_string(),
            });
        }

        if let Some(cluster_id) = &route.cluster_id {
            if !cluster_ids.contains(cluster_id.as_str()) {
                errors.push(ValidationError::UnknownCluster {
                    route_id: route.route_id.clone(),
                    cluster_id: cluster_id.clone(),
                });
            }
        }

        errors.extend(
            transforms
                .validate_route(route)
                .into_iter()
                .map(|source| ValidationError::Transform {
                    route_id: route.route_id.clone(),
                    source,
                }),
        );

        errors
    }

    fn validate_cluster(
        cluster: &ClusterConfig,
        transforms: &TransformBuilder,
    ) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let cluster_id = &cluster.cluster_id;

        if cluster_id.trim().is_empty() {
            errors.push(ValidationError::MissingField {
                field: "cluster_id".to_string(),
            });
        }

        for (destination_id, destination) in &cluster.destinations {
            if let Err(e) = Self::validate_address(
                &destination.address,
                &format!("cluster '{cluster_id}' destination '{destination_id}' address"),
            ) {
                errors.push(e);
            }
            if let Some(health) = &destination.health {
                if let Err(e) = Self::validate_address(
                    health,
                    &format!("cluster '{cluster_id}' destination '{destination_id}' health"),
                ) {
                    errors.push(e);
                }
            }
        }

        let in_cluster = |error: ValidationError| match error {
            ValidationError::InvalidField { field, message } => ValidationError::InvalidField {
                field: format!("cluster '{cluster_id}' {field}"),
                message,
            },
            ValidationError::MissingField { field } => ValidationError::MissingField {
                field: format!("cluster '{cluster_id}' {field}"),
            },
            other => other,
        };

        if let Err(e) = SessionAffinity::bind(cluster.session_affinity.as_ref()) {
            errors.push(in_cluster(e));
        }
        if let Err(e) = ForwarderRequestSettings::from_config(cluster.http_request.as_ref()) {
            errors.push(in_cluster(e));
        }
        if let Err(e) = AvailableDestinationsPolicy::from_config(cluster.health_check.as_ref()) {
            errors.push(in_cluster(e));
        }
        if let Some(http_client) = &cluster.http_client {
            if let Err(source) = ForwardingClient::check_config(http_client) {
                errors.push(ValidationError::HttpClient {
                    cluster_id: cluster_id.clone(),
                    source,
                });
            }
        }

        errors.extend(
            transforms
                .validate_cluster(cluster)
                .into_iter()
                .map(|e| ValidationError::InvalidField {
                    field: format!("cluster '{cluster_id}' transforms"),
                    message: e.to_string(),
                }),
        );

        errors
    }

    /// Destinations are plain `http`/`https` base addresses with a host
    fn validate_address(address: &str, field: &str) -> ValidationResult<()> {
        let url = Url::parse(address).map_err(|e| ValidationError::InvalidField {
            field: field.to_string(),
            message: format!("Invalid URL format '{address}': {e}"),
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: format!("URL must use http or https scheme: {address}"),
            });
        }

        if url.host_str().is_none() {
            return Err(ValidationError::InvalidField {
                field: field.to_string(),
                message: format!("URL must have a valid host: {address}"),
            });
        }

        Ok(())
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: &[ValidationError]) -> String {
        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::{
        DestinationConfig, HealthCheckConfig, HttpClientConfig, SessionAffinityConfig,
        TransformValues, WebProxyConfig,
    };

    fn minimal_valid_config() -> ProxyConfig {
        ProxyConfig {
            routes: vec![RouteConfig::new("route1").with_cluster("cluster1")],
            clusters: vec![
                ClusterConfig::new("cluster1")
                    .with_destination("d1", DestinationConfig::new("http://localhost:3000")),
            ],
        }
    }

    fn validate(config: &ProxyConfig) -> ValidationResult<()> {
        ProxyConfigValidator::validate(config, &TransformBuilder::new())
    }

    #[test]
    fn validate_accepts_minimal_config() {
        assert!(validate(&minimal_valid_config()).is_ok());
    }

    #[test]
    fn validate_rejects_unknown_cluster_reference() {
        let mut config = minimal_valid_config();
        config.routes[0].cluster_id = Some("missing".to_string());

        assert_eq!(
            validate(&config),
            Err(ValidationError::UnknownCluster {
                route_id: "route1".to_string(),
                cluster_id: "missing".to_string(),
            })
        );
    }

    #[test]
    fn validate_rejects_duplicate_ids() {
        let mut config = minimal_valid_config();
        config.clusters.push(ClusterConfig::new("cluster1"));

        assert_eq!(
            validate(&config),
            Err(ValidationError::DuplicateId {
                kind: "cluster",
                id: "cluster1".to_string(),
            })
        );
    }

    #[test]
    fn validate_rejects_non_http_destination() {
        let mut config = minimal_valid_config();
        config.clusters[0]
            .destinations
            .insert("d2".to_string(), DestinationConfig::new("ftp://files:21"));

        assert!(matches!(
            validate(&config),
            Err(ValidationError::InvalidField { field, .. }) if field.contains("'d2'")
        ));
    }

    #[test]
    fn validate_reports_unknown_transform() {
        let mut config = minimal_valid_config();
        config.routes[0] = config.routes[0]
            .clone()
            .with_transform(TransformValues::new().with("Foo", "bar"));

        assert!(matches!(
            validate(&config),
            Err(ValidationError::Transform { route_id, .. }) if route_id == "route1"
        ));
    }

    #[test]
    fn validate_rejects_unknown_affinity_policy() {
        let mut config = minimal_valid_config();
        config.clusters[0].session_affinity = Some(SessionAffinityConfig {
            policy: Some("Sticky".to_string()),
            ..SessionAffinityConfig::new("My.Affinity")
        });

        assert!(matches!(
            validate(&config),
            Err(ValidationError::InvalidField { field, .. })
                if field == "cluster 'cluster1' session_affinity.policy"
        ));
    }

    #[test]
    fn validate_ignores_disabled_affinity() {
        let mut config = minimal_valid_config();
        config.clusters[0].session_affinity = Some(SessionAffinityConfig {
            enabled: Some(false),
            policy: Some("Sticky".to_string()),
            ..SessionAffinityConfig::new("My.Affinity")
        });

        assert!(validate(&config).is_ok());
    }

    #[test]
    fn validate_rejects_bad_http_client_settings() {
        let mut config = minimal_valid_config();
        config.clusters[0].http_client = Some(HttpClientConfig {
            request_header_encoding: Some("not-an-encoding".to_string()),
            ..HttpClientConfig::default()
        });

        assert!(matches!(
            validate(&config),
            Err(ValidationError::HttpClient {
                source: ClientFactoryError::UnknownHeaderEncoding { .. },
                ..
            })
        ));

        config.clusters[0].http_client = Some(HttpClientConfig {
            web_proxy: Some(WebProxyConfig {
                address: Some("socks5://proxy:1080".to_string()),
                bypass_on_local: None,
            }),
            ..HttpClientConfig::default()
        });
        assert!(matches!(
            validate(&config),
            Err(ValidationError::HttpClient {
                source: ClientFactoryError::InvalidWebProxy { .. },
                ..
            })
        ));
    }

    #[test]
    fn validate_collects_multiple_errors() {
        let mut config = minimal_valid_config();
        config.routes.push(RouteConfig::new("route2").with_cluster("nope"));
        config.clusters[0].health_check = Some(HealthCheckConfig {
            available_destinations_policy: Some("Everything".to_string()),
            ..HealthCheckConfig::default()
        });

        let errors = ProxyConfigValidator::collect_errors(&config, &TransformBuilder::new());
        assert_eq!(errors.len(), 2);

        match validate(&config) {
            Err(ValidationError::ValidationFailed { message }) => {
                assert!(message.starts_with("Found 2 validation errors"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}

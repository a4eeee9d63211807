//! Configuration data structures for Waypoint.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files. They are
//! serde‑friendly and lean on `Option` so that an absent setting can be told apart from an
//! explicit one; the runtime decides the defaults when a cluster or route is bound.
//! Builders here are considered part of the public API for embedding.
use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

/// Finalized routes and clusters consumed by the forwarding core
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub routes: Vec<RouteConfig>,
    pub clusters: Vec<ClusterConfig>,
}

impl ProxyConfig {
    pub fn cluster(&self, cluster_id: &str) -> Option<&ClusterConfig> {
        self.clusters.iter().find(|c| c.cluster_id == cluster_id)
    }

    pub fn route(&self, route_id: &str) -> Option<&RouteConfig> {
        self.routes.iter().find(|r| r.route_id == route_id)
    }
}

/// A matched route and the cluster it forwards to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub route_id: String,
    #[serde(default)]
    pub cluster_id: Option<String>,
    /// Ordered transform directives. Each entry is a small key/value map.
    #[serde(default)]
    pub transforms: Option<Vec<TransformValues>>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl RouteConfig {
    pub fn new(route_id: impl Into<String>) -> Self {
        Self {
            route_id: route_id.into(),
            ..Self::default()
        }
    }

    pub fn with_cluster(mut self, cluster_id: impl Into<String>) -> Self {
        self.cluster_id = Some(cluster_id.into());
        self
    }

    pub fn with_transform(mut self, transform: TransformValues) -> Self {
        self.transforms.get_or_insert_with(Vec::new).push(transform);
        self
    }
}

/// One transform directive.
///
/// Keys compare case-insensitively. Entries added in code keep their insertion order;
/// deserialized entries go through a `BTreeMap` and come out sorted by key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, String>",
    into = "BTreeMap<String, String>"
)]
pub struct TransformValues {
    entries: Vec<(String, String)>,
}

impl TransformValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert; replaces an existing key that differs only by case.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(&key))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for TransformValues {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut values = Self::new();
        for (k, v) in iter {
            values.insert(k, v);
        }
        values
    }
}

impl From<BTreeMap<String, String>> for TransformValues {
    fn from(map: BTreeMap<String, String>) -> Self {
        map.into_iter().collect()
    }
}

impl From<TransformValues> for BTreeMap<String, String> {
    fn from(values: TransformValues) -> Self {
        values.entries.into_iter().collect()
    }
}

/// A named group of equivalent destinations sharing one transport policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub cluster_id: String,
    #[serde(default)]
    pub session_affinity: Option<SessionAffinityConfig>,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
    #[serde(default)]
    pub http_client: Option<HttpClientConfig>,
    #[serde(default)]
    pub http_request: Option<ForwarderRequestConfig>,
    #[serde(default)]
    pub destinations: BTreeMap<String, DestinationConfig>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl ClusterConfig {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            ..Self::default()
        }
    }

    pub fn with_destination(
        mut self,
        destination_id: impl Into<String>,
        destination: DestinationConfig,
    ) -> Self {
        self.destinations.insert(destination_id.into(), destination);
        self
    }

    pub fn with_session_affinity(mut self, affinity: SessionAffinityConfig) -> Self {
        self.session_affinity = Some(affinity);
        self
    }
}

/// One backend endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Base address, e.g. `https://10.0.0.5:8443/api`
    pub address: String,
    /// Address used by active health probes when it differs from `address`
    #[serde(default)]
    pub health: Option<String>,
    /// Host header sent to this destination unless the original host is kept
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl DestinationConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }
}

/// TLS protocol versions offered to destinations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SslProtocol {
    Tls12,
    Tls13,
}

/// Outbound connection settings for a cluster.
///
/// Two configs that compare equal produce interchangeable transports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    pub ssl_protocols: Option<Vec<SslProtocol>>,
    /// Skip server certificate validation. Only honoured when explicitly `true`.
    pub dangerous_accept_any_server_certificate: Option<bool>,
    pub max_connections_per_server: Option<usize>,
    pub enable_multiple_http2_connections: Option<bool>,
    /// Encoding label (WHATWG) used for outgoing request header values
    pub request_header_encoding: Option<String>,
    /// Encoding label (WHATWG) used to decode response header values
    pub response_header_encoding: Option<String>,
    pub web_proxy: Option<WebProxyConfig>,
}

/// Upstream HTTP proxy reached with CONNECT tunnels
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebProxyConfig {
    /// `http://[user:password@]proxy:port`
    pub address: Option<String>,
    /// Connect directly to loopback destinations
    pub bypass_on_local: Option<bool>,
}

/// How the requested HTTP version is negotiated with a destination
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpVersionPolicy {
    #[default]
    RequestVersionOrLower,
    RequestVersionOrHigher,
    RequestVersionExact,
}

/// Per-request forwarding settings for a cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderRequestConfig {
    /// Maximum time to wait for the destination's response head, e.g. `"100s"`
    #[serde(with = "humantime_opt")]
    pub activity_timeout: Option<Duration>,
    /// `"1.0"`, `"1.1"`, `"2"` or `"3"`
    pub version: Option<String>,
    pub version_policy: Option<HttpVersionPolicy>,
    pub allow_response_buffering: Option<bool>,
}

/// Session affinity settings for a cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAffinityConfig {
    #[serde(default)]
    pub enabled: Option<bool>,
    /// `HashCookie` (default) or `HashHeader`
    #[serde(default)]
    pub policy: Option<String>,
    /// `Redistribute` (default) or `Return503Error`
    #[serde(default)]
    pub failure_policy: Option<String>,
    /// Cookie or header name carrying the affinity key
    pub affinity_key_name: String,
    #[serde(default)]
    pub cookie: Option<SessionAffinityCookieConfig>,
}

impl SessionAffinityConfig {
    pub fn new(affinity_key_name: impl Into<String>) -> Self {
        Self {
            enabled: Some(true),
            affinity_key_name: affinity_key_name.into(),
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }
}

/// When the affinity cookie gets the `secure` attribute
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CookieSecurePolicy {
    #[default]
    SameAsRequest,
    Always,
    None,
}

/// `SameSite` attribute of the affinity cookie
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SameSiteMode {
    #[default]
    Unspecified,
    None,
    Lax,
    Strict,
}

/// Attributes of the affinity cookie
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionAffinityCookieConfig {
    pub path: Option<String>,
    pub domain: Option<String>,
    pub http_only: Option<bool>,
    pub secure_policy: Option<CookieSecurePolicy>,
    pub same_site: Option<SameSiteMode>,
    #[serde(with = "humantime_opt")]
    pub expiration: Option<Duration>,
    #[serde(with = "humantime_opt")]
    pub max_age: Option<Duration>,
    pub is_essential: Option<bool>,
}

/// Health check settings; only the verdicts are consumed here
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub active: Option<ActiveHealthCheckConfig>,
    pub passive: Option<PassiveHealthCheckConfig>,
    /// `HealthyAndUnknown` (default) or `HealthyOrPanic`
    pub available_destinations_policy: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActiveHealthCheckConfig {
    pub enabled: Option<bool>,
    #[serde(with = "humantime_opt")]
    pub interval: Option<Duration>,
    #[serde(with = "humantime_opt")]
    pub timeout: Option<Duration>,
    pub policy: Option<String>,
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PassiveHealthCheckConfig {
    pub enabled: Option<bool>,
    pub policy: Option<String>,
    #[serde(with = "humantime_opt")]
    pub reactivation_period: Option<Duration>,
}

/// Optional durations written as humantime strings (`"1h"`, `"100s"`)
mod humantime_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_values_lookup_ignores_case() {
        let values = TransformValues::new()
            .with("RequestHeader", "x-foo")
            .with("Set", "bar");

        assert_eq!(values.get("requestheader"), Some("x-foo"));
        assert_eq!(values.get("SET"), Some("bar"));
        assert!(!values.contains_key("Append"));
        assert_eq!(values.keys().collect::<Vec<_>>(), vec!["RequestHeader", "Set"]);
    }

    #[test]
    fn transform_values_insert_replaces_case_variant() {
        let mut values = TransformValues::new().with("PathSet", "/a");
        values.insert("pathset", "/b");

        assert_eq!(values.len(), 1);
        assert_eq!(values.get("PathSet"), Some("/b"));
    }

    #[test]
    fn transform_values_order() {
        let built = TransformValues::new()
            .with("RequestHeader", "x-a")
            .with("Append", "1");
        assert_eq!(built.keys().collect::<Vec<_>>(), ["RequestHeader", "Append"]);

        let parsed: TransformValues =
            serde_json::from_str(r#"{ "RequestHeader": "x-a", "Append": "1" }"#).unwrap();
        assert_eq!(parsed.keys().collect::<Vec<_>>(), ["Append", "RequestHeader"]);
        assert_eq!(parsed.get("requestheader"), Some("x-a"));
    }

    #[test]
    fn cluster_config_deserializes_durations() {
        let json = r#"{
            "cluster_id": "cluster1",
            "session_affinity": {
                "enabled": true,
                "affinity_key_name": "My.Affinity",
                "cookie": { "max_age": "1h", "same_site": "Lax", "secure_policy": "Always" }
            },
            "http_request": { "activity_timeout": "100s", "version_policy": "RequestVersionExact" },
            "destinations": { "d1": { "address": "http://localhost:8080" } }
        }"#;

        let cluster: ClusterConfig = serde_json::from_str(json).unwrap();
        let cookie = cluster.session_affinity.unwrap().cookie.unwrap();
        assert_eq!(cookie.max_age, Some(Duration::from_secs(3600)));
        assert_eq!(cookie.same_site, Some(SameSiteMode::Lax));
        assert_eq!(cookie.secure_policy, Some(CookieSecurePolicy::Always));

        let request = cluster.http_request.unwrap();
        assert_eq!(request.activity_timeout, Some(Duration::from_secs(100)));
        assert_eq!(
            request.version_policy,
            Some(HttpVersionPolicy::RequestVersionExact)
        );
        assert_eq!(cluster.destinations["d1"].address, "http://localhost:8080");
    }

    #[test]
    fn http_client_configs_compare_by_value() {
        let a = HttpClientConfig {
            max_connections_per_server: Some(10),
            ssl_protocols: Some(vec![SslProtocol::Tls12]),
            ..HttpClientConfig::default()
        };
        let mut b = a.clone();
        assert_eq!(a, b);

        b.dangerous_accept_any_server_certificate = Some(true);
        assert_ne!(a, b);
    }
}

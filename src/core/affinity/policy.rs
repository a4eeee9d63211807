use std::{fmt, str::FromStr, sync::Arc};

use chrono::{TimeDelta, Utc};
use http::{HeaderMap, HeaderName, HeaderValue, header};

use crate::{
    config::models::{
        CookieSecurePolicy, SameSiteMode, SessionAffinityConfig, SessionAffinityCookieConfig,
    },
    core::{
        affinity::{AffinityResult, AffinityStatus, hash::affinity_key},
        cluster::ClusterState,
        context::{ClientConnection, ProxyContext},
        destination::DestinationState,
    },
};

/// Where the affinity key travels between the client and the proxy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SessionAffinityPolicy {
    #[default]
    HashCookie,
    HashHeader,
}

impl SessionAffinityPolicy {
    pub const HASH_COOKIE: &'static str = "HashCookie";
    pub const HASH_HEADER: &'static str = "HashHeader";

    pub fn name(&self) -> &'static str {
        match self {
            Self::HashCookie => Self::HASH_COOKIE,
            Self::HashHeader => Self::HASH_HEADER,
        }
    }

    /// Narrows `candidates` to the destination named by the request's affinity key.
    pub fn find_affinitized_destinations(
        &self,
        request_headers: &HeaderMap,
        cluster: &ClusterState,
        config: &SessionAffinityConfig,
        candidates: &[Arc<DestinationState>],
    ) -> AffinityResult {
        let Some(key) = self.extract_key(request_headers, &config.affinity_key_name) else {
            return AffinityResult::new(AffinityStatus::AffinityKeyNotSet);
        };

        if key.is_empty() {
            tracing::debug!(
                cluster.id = %cluster.cluster_id(),
                affinity.key_name = %config.affinity_key_name,
                "Affinity key present but empty"
            );
            return AffinityResult::new(AffinityStatus::AffinityKeyExtractionFailed);
        }

        match candidates
            .iter()
            .find(|d| affinity_key(d.destination_id()) == key)
        {
            Some(destination) => AffinityResult {
                status: AffinityStatus::Ok,
                destinations: vec![destination.clone()],
                affinity_key: Some(key),
            },
            None => {
                tracing::debug!(
                    cluster.id = %cluster.cluster_id(),
                    affinity.key = %key,
                    candidates = candidates.len(),
                    "No destination matches the affinity key"
                );
                AffinityResult {
                    status: AffinityStatus::DestinationNotFound,
                    destinations: Vec::new(),
                    affinity_key: Some(key),
                }
            }
        }
    }

    /// Writes the affinity carrier for `destination` onto the response.
    ///
    /// Does nothing when the request already carried this destination's key.
    pub fn affinitize_response(
        &self,
        context: &ProxyContext,
        connection: &ClientConnection,
        config: &SessionAffinityConfig,
        destination: &DestinationState,
        response_headers: &mut HeaderMap,
    ) {
        let key = affinity_key(destination.destination_id());
        if context.affinity_key() == Some(key.as_str()) {
            return;
        }

        match self {
            Self::HashCookie => {
                let cookie = build_cookie(
                    &config.affinity_key_name,
                    &key,
                    config.cookie.as_ref(),
                    connection.is_https,
                );
                match HeaderValue::from_str(&cookie) {
                    Ok(value) => {
                        response_headers.append(header::SET_COOKIE, value);
                    }
                    Err(e) => tracing::warn!(
                        cluster.id = %context.cluster().cluster_id(),
                        error = %e,
                        "Affinity cookie is not a valid header value"
                    ),
                }
            }
            Self::HashHeader => match HeaderName::from_bytes(config.affinity_key_name.as_bytes()) {
                Ok(name) => {
                    // The key is hex, always a valid header value.
                    if let Ok(value) = HeaderValue::from_str(&key) {
                        response_headers.insert(name, value);
                    }
                }
                Err(e) => tracing::warn!(
                    cluster.id = %context.cluster().cluster_id(),
                    affinity.key_name = %config.affinity_key_name,
                    error = %e,
                    "Affinity key name is not a valid header name"
                ),
            },
        }
    }

    fn extract_key(&self, headers: &HeaderMap, name: &str) -> Option<String> {
        match self {
            Self::HashCookie => find_cookie(headers, name),
            Self::HashHeader => headers
                .get(name)
                .map(|v| v.to_str().map(|s| s.trim().to_string()).unwrap_or_default()),
        }
    }
}

impl FromStr for SessionAffinityPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case(Self::HASH_COOKIE) {
            Ok(Self::HashCookie)
        } else if s.eq_ignore_ascii_case(Self::HASH_HEADER) {
            Ok(Self::HashHeader)
        } else {
            Err(format!("No session affinity policy named '{s}'"))
        }
    }
}

impl fmt::Display for SessionAffinityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn find_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| k.trim() == name)
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
}

fn build_cookie(
    name: &str,
    value: &str,
    options: Option<&SessionAffinityCookieConfig>,
    is_https: bool,
) -> String {
    let defaults = SessionAffinityCookieConfig::default();
    let options = options.unwrap_or(&defaults);
    let mut cookie = format!("{name}={value}");

    if let Some(expires) = options
        .expiration
        .and_then(|e| TimeDelta::from_std(e).ok())
        .and_then(|e| Utc::now().checked_add_signed(e))
    {
        cookie.push_str(&format!(
            "; expires={}",
            expires.format("%a, %d %b %Y %H:%M:%S GMT")
        ));
    }
    if let Some(max_age) = options.max_age {
        cookie.push_str(&format!("; max-age={}", max_age.as_secs()));
    }
    if let Some(domain) = &options.domain {
        cookie.push_str(&format!("; domain={domain}"));
    }
    if let Some(path) = &options.path {
        cookie.push_str(&format!("; path={path}"));
    }

    let secure = match options.secure_policy.unwrap_or_default() {
        CookieSecurePolicy::Always => true,
        CookieSecurePolicy::SameAsRequest => is_https,
        CookieSecurePolicy::None => false,
    };
    if secure {
        cookie.push_str("; secure");
    }

    match options.same_site.unwrap_or_default() {
        SameSiteMode::Unspecified => {}
        SameSiteMode::None => cookie.push_str("; samesite=none"),
        SameSiteMode::Lax => cookie.push_str("; samesite=lax"),
        SameSiteMode::Strict => cookie.push_str("; samesite=strict"),
    }

    if options.http_only.unwrap_or(true) {
        cookie.push_str("; httponly");
    }

    cookie
}

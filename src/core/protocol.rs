//! Wire-protocol helpers: version policy names, gRPC detection and the WebSocket handshake.
use base64::{Engine, engine::general_purpose::STANDARD};
use http::{HeaderMap, Version, header};
use rand::Rng;
use sha1::{Digest, Sha1};

use crate::config::models::HttpVersionPolicy;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const WEBSOCKET_KEY_LENGTH: usize = 24;
const GRPC_CONTENT_TYPE: &str = "application/grpc";

pub fn version_policy_name(policy: HttpVersionPolicy) -> &'static str {
    match policy {
        HttpVersionPolicy::RequestVersionOrLower => "RequestVersionOrLower",
        HttpVersionPolicy::RequestVersionOrHigher => "RequestVersionOrHigher",
        HttpVersionPolicy::RequestVersionExact => "RequestVersionExact",
    }
}

impl HttpVersionPolicy {
    /// Maps the numeric representation (0, 1, 2) used by management surfaces.
    ///
    /// # Panics
    ///
    /// Panics on any other value.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::RequestVersionOrLower,
            1 => Self::RequestVersionOrHigher,
            2 => Self::RequestVersionExact,
            other => panic!("Unknown HTTP version policy value: {other}"),
        }
    }
}

/// Parses `"1.0"`, `"1.1"`, `"2"`, `"2.0"`, `"3"` and `"3.0"`.
pub fn parse_http_version(raw: &str) -> Option<Version> {
    match raw.trim() {
        "1.0" => Some(Version::HTTP_10),
        "1.1" => Some(Version::HTTP_11),
        "2" | "2.0" => Some(Version::HTTP_2),
        "3" | "3.0" => Some(Version::HTTP_3),
        _ => None,
    }
}

pub fn is_http2_or_greater(version: Version) -> bool {
    version == Version::HTTP_2 || version == Version::HTTP_3
}

pub fn is_grpc_content_type(content_type: Option<&str>) -> bool {
    let Some(content_type) = content_type else {
        return false;
    };

    // Cheap prefix test before paying for a full media type parse.
    let prefix_matches = content_type
        .get(..GRPC_CONTENT_TYPE.len())
        .is_some_and(|p| p.eq_ignore_ascii_case(GRPC_CONTENT_TYPE));
    if !prefix_matches {
        return false;
    }

    content_type
        .parse::<mime::Mime>()
        .is_ok_and(|m| m.essence_str().eq_ignore_ascii_case(GRPC_CONTENT_TYPE))
}

pub fn is_grpc_request(headers: &HeaderMap) -> bool {
    is_grpc_content_type(
        headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok()),
    )
}

/// `Connection: upgrade` together with `Upgrade: websocket`
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    let connection_upgrade = headers.get_all(header::CONNECTION).iter().any(|v| {
        v.to_str()
            .map(|s| s.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")))
            .unwrap_or(false)
    });
    let upgrade_websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    connection_upgrade && upgrade_websocket
}

pub fn create_sec_websocket_key() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    STANDARD.encode(bytes)
}

pub fn check_sec_websocket_key(key: Option<&str>) -> bool {
    key.is_some_and(|k| k.len() == WEBSOCKET_KEY_LENGTH)
}

/// # Panics
///
/// Panics when `key` does not pass [`check_sec_websocket_key`]; callers validate first.
pub fn create_sec_websocket_accept(key: &str) -> String {
    assert!(
        check_sec_websocket_key(Some(key)),
        "Sec-WebSocket-Key must be a 24 character value, got {key:?}"
    );

    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_policy_names() {
        assert_eq!(
            version_policy_name(HttpVersionPolicy::RequestVersionOrLower),
            "RequestVersionOrLower"
        );
        assert_eq!(
            version_policy_name(HttpVersionPolicy::RequestVersionOrHigher),
            "RequestVersionOrHigher"
        );
        assert_eq!(
            version_policy_name(HttpVersionPolicy::RequestVersionExact),
            "RequestVersionExact"
        );
    }

    #[test]
    #[should_panic(expected = "Unknown HTTP version policy value")]
    fn unknown_raw_version_policy_panics() {
        let _ = HttpVersionPolicy::from_raw(7);
    }

    #[test]
    fn grpc_content_types() {
        assert!(is_grpc_content_type(Some("application/grpc")));
        assert!(is_grpc_content_type(Some("APPLICATION/GRPC")));
        assert!(is_grpc_content_type(Some("application/grpc; charset=utf-8")));

        assert!(!is_grpc_content_type(None));
        assert!(!is_grpc_content_type(Some("")));
        assert!(!is_grpc_content_type(Some("application/json")));
        assert!(!is_grpc_content_type(Some("application/grpc-web")));
        assert!(!is_grpc_content_type(Some("application/grpcfoo")));
        assert!(!is_grpc_content_type(Some("application/grpc+proto")));
    }

    #[test]
    fn websocket_key_is_24_chars() {
        let key = create_sec_websocket_key();
        assert_eq!(key.len(), 24);
        assert!(check_sec_websocket_key(Some(&key)));
        assert_ne!(key, create_sec_websocket_key());
    }

    #[test]
    fn websocket_key_check_rejects_bad_lengths() {
        assert!(!check_sec_websocket_key(None));
        assert!(!check_sec_websocket_key(Some("")));
        assert!(!check_sec_websocket_key(Some("dGhlIHNhbXBsZSBub25jZQ")));
    }

    #[test]
    fn websocket_accept_matches_rfc_sample() {
        let accept = create_sec_websocket_accept("dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(accept.len(), 28);
    }

    #[test]
    #[should_panic]
    fn websocket_accept_rejects_invalid_key() {
        let _ = create_sec_websocket_accept("short");
    }

    #[test]
    fn detects_websocket_upgrade() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, "keep-alive, Upgrade".parse().unwrap());
        headers.insert(header::UPGRADE, "websocket".parse().unwrap());
        assert!(is_websocket_upgrade(&headers));

        headers.insert(header::UPGRADE, "h2c".parse().unwrap());
        assert!(!is_websocket_upgrade(&headers));
    }

    #[test]
    fn parses_configured_versions() {
        assert_eq!(parse_http_version("1.1"), Some(Version::HTTP_11));
        assert_eq!(parse_http_version("2"), Some(Version::HTTP_2));
        assert_eq!(parse_http_version("2.0"), Some(Version::HTTP_2));
        assert_eq!(parse_http_version("4"), None);
        assert!(is_http2_or_greater(Version::HTTP_3));
        assert!(!is_http2_or_greater(Version::HTTP_11));
    }
}

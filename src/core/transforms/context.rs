use http::{HeaderMap, StatusCode, request, response};
use url::form_urlencoded;

use crate::core::context::ClientConnection;

/// Mutable state threaded through the request sub-chain
#[derive(Debug)]
pub struct RequestTransformContext<'a> {
    /// The request as it arrived at the proxy
    pub inbound: &'a request::Parts,
    pub connection: &'a ClientConnection,
    /// Outgoing request head; its URI is assembled after the chain ran
    pub proxy_request: request::Parts,
    pub path: String,
    pub query: QueryTransformContext,
    /// Destination address the path and query are appended to
    pub destination_prefix: String,
    /// Whether inbound headers were copied before the chain ran
    pub headers_copied: bool,
    pub use_original_host: bool,
}

/// Mutable state threaded through the response sub-chain
#[derive(Debug)]
pub struct ResponseTransformContext<'a> {
    pub inbound: &'a request::Parts,
    /// Head of the response returned by the destination
    pub proxy_response: &'a response::Parts,
    /// Headers sent back to the client
    pub headers: &'a mut HeaderMap,
    pub headers_copied: bool,
    /// Set to drop the destination's response body
    pub suppress_response_body: bool,
}

impl ResponseTransformContext<'_> {
    pub fn status(&self) -> StatusCode {
        self.proxy_response.status
    }
}

/// Mutable state threaded through the trailer sub-chain
#[derive(Debug)]
pub struct ResponseTrailersTransformContext<'a> {
    pub status: StatusCode,
    /// Trailers returned by the destination
    pub proxy_trailers: &'a HeaderMap,
    /// Trailers sent back to the client
    pub trailers: &'a mut HeaderMap,
    pub headers_copied: bool,
}

/// Query string being rewritten. Untouched queries are forwarded byte for byte.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryTransformContext {
    original: Option<String>,
    pairs: Vec<(String, String)>,
    modified: bool,
}

impl QueryTransformContext {
    pub fn new(query: Option<&str>) -> Self {
        let original = query.filter(|q| !q.is_empty()).map(str::to_string);
        let pairs = original
            .as_deref()
            .map(|q| {
                form_urlencoded::parse(q.as_bytes())
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            original,
            pairs,
            modified: false,
        }
    }

    /// First value of `key`, compared case-insensitively
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Replaces every value of `key` with `value`, keeping the first occurrence's position.
    pub fn set(&mut self, key: &str, value: &str) {
        match self.pairs.iter().position(|(k, _)| k.eq_ignore_ascii_case(key)) {
            Some(index) => {
                self.pairs[index].1 = value.to_string();
                let mut seen = 0usize;
                self.pairs.retain(|(k, _)| {
                    if k.eq_ignore_ascii_case(key) {
                        seen += 1;
                        seen == 1
                    } else {
                        true
                    }
                });
            }
            None => self.pairs.push((key.to_string(), value.to_string())),
        }
        self.modified = true;
    }

    pub fn append(&mut self, key: &str, value: &str) {
        self.pairs.push((key.to_string(), value.to_string()));
        self.modified = true;
    }

    pub fn remove(&mut self, key: &str) {
        let before = self.pairs.len();
        self.pairs.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        self.modified |= self.pairs.len() != before;
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// `""` or `"?a=b&c=d"`
    pub fn to_query_string(&self) -> String {
        if !self.modified {
            return self
                .original
                .as_deref()
                .map(|q| format!("?{q}"))
                .unwrap_or_default();
        }

        if self.pairs.is_empty() {
            return String::new();
        }

        let encoded = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.pairs.iter())
            .finish();
        format!("?{encoded}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untouched_query_is_preserved_verbatim() {
        let query = QueryTransformContext::new(Some("a=%20b&c"));
        assert_eq!(query.to_query_string(), "?a=%20b&c");
        assert_eq!(QueryTransformContext::new(None).to_query_string(), "");
    }

    #[test]
    fn set_replaces_all_values() {
        let mut query = QueryTransformContext::new(Some("z=1&a=1&A=2"));
        query.set("a", "3");
        assert_eq!(query.to_query_string(), "?z=1&a=3");
    }

    #[test]
    fn append_and_remove() {
        let mut query = QueryTransformContext::new(Some("a=1"));
        query.append("a", "2");
        query.append("b", "x y");
        assert_eq!(query.to_query_string(), "?a=1&a=2&b=x+y");

        query.remove("A");
        assert_eq!(query.get("b"), Some("x y"));
        assert_eq!(query.to_query_string(), "?b=x+y");

        query.remove("b");
        assert_eq!(query.to_query_string(), "");
    }
}

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connecting to or exchanging with the destination fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when the request cannot be sent as built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) through which requests reach destinations
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send one request to the destination its absolute URI names
    ///
    /// # Arguments
    /// * `req` - The fully transformed outgoing request
    ///
    /// # Returns
    /// A future that resolves to the destination's response head and streaming body
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;
}

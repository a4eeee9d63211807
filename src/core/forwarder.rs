//! Sends one transformed request to a destination and shapes the response for the client.
//!
//! The forwarder owns the protocol decisions of a single exchange: which HTTP version goes on
//! the wire and how an accepted WebSocket upgrade is tunnelled. The activity timeout and the
//! caller's cancellation cover the response head and then every frame of the response body.
use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use axum::body::Body as AxumBody;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode, Version, header, request};
use http_body_util::BodyExt;
use hyper::{
    body::{Body, Frame, SizeHint},
    upgrade::OnUpgrade,
};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::{
    config::{
        models::{ForwarderRequestConfig, HttpVersionPolicy},
        validation::{ValidationError, ValidationResult},
    },
    core::{
        context::ClientConnection,
        destination::DestinationModel,
        protocol,
        transforms::{TransformChain, TransformError},
    },
    metrics,
    ports::http_client::{HttpClient, HttpClientError},
};

const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(100);

/// Request settings of a cluster, parsed once when the cluster model is bound
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderRequestSettings {
    pub activity_timeout: Duration,
    pub version: Version,
    pub version_policy: HttpVersionPolicy,
    pub allow_response_buffering: bool,
}

impl Default for ForwarderRequestSettings {
    fn default() -> Self {
        Self {
            activity_timeout: DEFAULT_ACTIVITY_TIMEOUT,
            version: Version::HTTP_2,
            version_policy: HttpVersionPolicy::default(),
            allow_response_buffering: false,
        }
    }
}

impl ForwarderRequestSettings {
    pub fn from_config(config: Option<&ForwarderRequestConfig>) -> ValidationResult<Self> {
        let defaults = Self::default();
        let Some(config) = config else {
            return Ok(defaults);
        };

        let version = match config.version.as_deref() {
            Some(raw) => protocol::parse_http_version(raw).ok_or_else(|| {
                ValidationError::InvalidField {
                    field: "http_request.version".to_string(),
                    message: format!("'{raw}' is not a supported HTTP version"),
                }
            })?,
            None => defaults.version,
        };

        if config.activity_timeout == Some(Duration::ZERO) {
            return Err(ValidationError::InvalidField {
                field: "http_request.activity_timeout".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            activity_timeout: config.activity_timeout.unwrap_or(defaults.activity_timeout),
            version,
            version_policy: config.version_policy.unwrap_or(defaults.version_policy),
            allow_response_buffering: config
                .allow_response_buffering
                .unwrap_or(defaults.allow_response_buffering),
        })
    }

    /// Version put on the wire for a request, before ALPN has its say
    pub fn outgoing_version(&self, is_grpc: bool, is_upgrade: bool) -> Version {
        if is_upgrade {
            return Version::HTTP_11;
        }
        if is_grpc {
            return Version::HTTP_2;
        }
        match self.version_policy {
            HttpVersionPolicy::RequestVersionExact => self.version,
            // TLS connections offer h2 through ALPN; cleartext stays on HTTP/1.x
            HttpVersionPolicy::RequestVersionOrLower => {
                if self.version == Version::HTTP_10 {
                    Version::HTTP_10
                } else {
                    Version::HTTP_11
                }
            }
            HttpVersionPolicy::RequestVersionOrHigher => {
                if protocol::is_http2_or_greater(self.version) {
                    Version::HTTP_2
                } else {
                    Version::HTTP_11
                }
            }
        }
    }
}

/// Ways a single forwarding attempt fails. Each is reported once and never retried.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ForwarderError {
    #[error("Failed to build the outgoing request: {0}")]
    RequestCreation(#[from] TransformError),

    #[error("Request to the destination failed: {0}")]
    Request(#[source] HttpClientError),

    #[error("No response from the destination within {0:?}")]
    RequestTimedOut(Duration),

    #[error("The request was canceled")]
    RequestCanceled,

    #[error("Missing or invalid Sec-WebSocket-Key")]
    InvalidWebSocketKey,

    #[error("Invalid upgrade response: {0}")]
    UpgradeResponseInvalid(String),
}

impl ForwarderError {
    /// Status returned to the client when the exchange failed
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RequestCreation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Request(_) | Self::UpgradeResponseInvalid(_) | Self::RequestCanceled => {
                StatusCode::BAD_GATEWAY
            }
            Self::RequestTimedOut(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::InvalidWebSocketKey => StatusCode::BAD_REQUEST,
        }
    }

    /// Label used for the forwarded requests counter
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::RequestCreation(_) => "request_creation",
            Self::Request(_) => "request",
            Self::RequestTimedOut(_) => "timeout",
            Self::RequestCanceled => "canceled",
            Self::InvalidWebSocketKey => "invalid_websocket_key",
            Self::UpgradeResponseInvalid(_) => "upgrade_invalid",
        }
    }
}

/// Where and how one request is sent
#[derive(Clone, Copy)]
pub struct ForwardTarget<'a> {
    pub cluster_id: &'a str,
    /// Destination address the request path is appended to
    pub destination_prefix: &'a str,
    pub destination: Option<&'a DestinationModel>,
    pub client: &'a dyn HttpClient,
    pub settings: &'a ForwarderRequestSettings,
    pub transformer: &'a Arc<TransformChain>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HttpForwarder;

impl HttpForwarder {
    pub fn new() -> Self {
        Self
    }

    /// Forwards `request` to `target` and returns the response to send to the client.
    pub async fn send(
        &self,
        request: Request<AxumBody>,
        connection: &ClientConnection,
        target: ForwardTarget<'_>,
        cancellation: &CancellationToken,
    ) -> Result<Response<AxumBody>, ForwarderError> {
        let (mut inbound, body) = request.into_parts();
        let timer = metrics::ForwardTimer::new(target.cluster_id);

        let result = self
            .exchange(&mut inbound, body, connection, target, cancellation)
            .await;
        drop(timer);

        match &result {
            Ok(response) => {
                metrics::increment_forwarded_request(target.cluster_id, "success");
                tracing::debug!(
                    cluster.id = target.cluster_id,
                    http.status_code = response.status().as_u16(),
                    "Destination responded"
                );
            }
            Err(error) => {
                metrics::increment_forwarded_request(target.cluster_id, error.outcome());
                tracing::warn!(cluster.id = target.cluster_id, error = %error, "Forwarding failed");
            }
        }
        result
    }

    async fn exchange(
        &self,
        inbound: &mut request::Parts,
        body: AxumBody,
        connection: &ClientConnection,
        target: ForwardTarget<'_>,
        cancellation: &CancellationToken,
    ) -> Result<Response<AxumBody>, ForwarderError> {
        let is_upgrade = protocol::is_websocket_upgrade(&inbound.headers);
        let websocket_key = if is_upgrade {
            let key = inbound
                .headers
                .get(header::SEC_WEBSOCKET_KEY)
                .and_then(|v| v.to_str().ok());
            if !protocol::check_sec_websocket_key(key) {
                return Err(ForwarderError::InvalidWebSocketKey);
            }
            key.map(str::to_string)
        } else {
            None
        };
        let client_upgrade = inbound.extensions.remove::<OnUpgrade>();
        let is_grpc = protocol::is_grpc_request(&inbound.headers);

        let mut proxy_request = target.transformer.transform_request(
            inbound,
            connection,
            target.destination,
            target.destination_prefix,
        )?;
        proxy_request.version = target.settings.outgoing_version(is_grpc, is_upgrade);
        if is_upgrade {
            restore_upgrade_headers(&inbound.headers, &mut proxy_request.headers);
        }

        let send = target
            .client
            .send_request(Request::from_parts(proxy_request, body));
        let mut response = tokio::select! {
            _ = cancellation.cancelled() => return Err(ForwarderError::RequestCanceled),
            result = tokio::time::timeout(target.settings.activity_timeout, send) => match result {
                Err(_) => return Err(ForwarderError::RequestTimedOut(target.settings.activity_timeout)),
                Ok(result) => result.map_err(ForwarderError::Request)?,
            },
        };

        let upgraded = response.status() == StatusCode::SWITCHING_PROTOCOLS;
        if upgraded {
            let Some(key) = websocket_key.as_deref() else {
                return Err(ForwarderError::UpgradeResponseInvalid(
                    "the destination switched protocols without an upgrade request".to_string(),
                ));
            };
            let accept = response
                .headers()
                .get(header::SEC_WEBSOCKET_ACCEPT)
                .and_then(|v| v.to_str().ok());
            if accept != Some(protocol::create_sec_websocket_accept(key).as_str()) {
                return Err(ForwarderError::UpgradeResponseInvalid(
                    "Sec-WebSocket-Accept does not match the request key".to_string(),
                ));
            }

            let destination_upgrade = hyper::upgrade::on(&mut response);
            match client_upgrade {
                Some(client_upgrade) => spawn_tunnel(
                    target.cluster_id.to_string(),
                    client_upgrade,
                    destination_upgrade,
                    cancellation.child_token(),
                ),
                None => tracing::warn!(
                    cluster.id = target.cluster_id,
                    "Inbound connection cannot be upgraded; the tunnel is not started"
                ),
            }
        }

        let (upstream, upstream_body) = response.into_parts();
        let mut headers = HeaderMap::new();
        let forward_body = target
            .transformer
            .transform_response(inbound, &upstream, &mut headers);
        if upgraded {
            restore_upgrade_headers(&upstream.headers, &mut headers);
        }

        let body = if !forward_body || upgraded {
            AxumBody::empty()
        } else {
            let body = if target.transformer.transforms_trailers() {
                let chain = Arc::clone(target.transformer);
                let status = upstream.status;
                AxumBody::new(upstream_body.map_frame(move |frame| match frame.into_trailers() {
                    Ok(trailers) => {
                        Frame::trailers(chain.transform_response_trailers(status, &trailers))
                    }
                    Err(frame) => frame,
                }))
            } else {
                upstream_body
            };
            AxumBody::new(GuardedBody::new(
                body,
                cancellation.clone(),
                target.settings.activity_timeout,
            ))
        };

        let mut response = Response::new(body);
        *response.status_mut() = upstream.status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Header copies drop hop-by-hop headers; an upgrade needs `Connection` and `Upgrade` back.
fn restore_upgrade_headers(source: &HeaderMap, target: &mut HeaderMap) {
    target.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    if let Some(upgrade) = source.get(header::UPGRADE) {
        target.insert(header::UPGRADE, upgrade.clone());
    }
}

fn spawn_tunnel(
    cluster_id: String,
    client_upgrade: OnUpgrade,
    destination_upgrade: OnUpgrade,
    cancellation: CancellationToken,
) {
    metrics::increment_websocket_tunnels();
    tokio::spawn(async move {
        let (client, destination) = match tokio::try_join!(client_upgrade, destination_upgrade) {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(cluster.id = %cluster_id, error = %e, "Upgrade failed");
                return;
            }
        };
        let mut client = TokioIo::new(client);
        let mut destination = TokioIo::new(destination);

        tokio::select! {
            _ = cancellation.cancelled() => {
                tracing::debug!(cluster.id = %cluster_id, "Tunnel canceled");
            }
            result = tokio::io::copy_bidirectional(&mut client, &mut destination) => match result {
                Ok((sent, received)) => tracing::debug!(
                    cluster.id = %cluster_id,
                    sent,
                    received,
                    "Tunnel closed"
                ),
                Err(e) => tracing::debug!(cluster.id = %cluster_id, error = %e, "Tunnel aborted"),
            },
        }
    });
}

/// Response body that fails once the caller cancels or the destination goes quiet.
///
/// Each frame pushes the idle deadline back by the activity timeout. On either failure the
/// upstream body is dropped, which releases its connection.
struct GuardedBody {
    inner: AxumBody,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    idle: Pin<Box<Sleep>>,
    activity_timeout: Duration,
    done: bool,
}

impl GuardedBody {
    fn new(inner: AxumBody, cancellation: CancellationToken, activity_timeout: Duration) -> Self {
        Self {
            inner,
            cancelled: Box::pin(cancellation.cancelled_owned()),
            idle: Box::pin(tokio::time::sleep(activity_timeout)),
            activity_timeout,
            done: false,
        }
    }

    fn abort(&mut self, error: ForwarderError) -> Poll<Option<Result<Frame<Bytes>, axum::Error>>> {
        tracing::debug!(error = %error, "Response body aborted");
        self.done = true;
        self.inner = AxumBody::empty();
        Poll::Ready(Some(Err(axum::Error::new(error))))
    }
}

impl Body for GuardedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if this.cancelled.as_mut().poll(cx).is_ready() {
            return this.abort(ForwarderError::RequestCanceled);
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(frame)) => {
                let deadline = Instant::now() + this.activity_timeout;
                this.idle.as_mut().reset(deadline);
                Poll::Ready(Some(frame))
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => {
                if this.idle.as_mut().poll(cx).is_ready() {
                    let timeout = this.activity_timeout;
                    this.abort(ForwarderError::RequestTimedOut(timeout))
                } else {
                    Poll::Pending
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Never produces a frame
    struct Silent;

    impl Body for Silent {
        type Data = Bytes;
        type Error = std::convert::Infallible;

        fn poll_frame(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn test_guarded_body_passes_frames_through() {
        let body = GuardedBody::new(
            AxumBody::from("hello"),
            CancellationToken::new(),
            Duration::from_millis(50),
        );
        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"hello");
    }

    #[tokio::test]
    async fn test_guarded_body_times_out_when_idle() {
        let body = GuardedBody::new(
            AxumBody::new(Silent),
            CancellationToken::new(),
            Duration::from_millis(50),
        );
        let result = tokio::time::timeout(Duration::from_secs(2), body.collect())
            .await
            .expect("idle body must fail on its own");
        let error = result.unwrap_err();
        assert!(error.to_string().contains("No response from the destination"));
    }

    #[tokio::test]
    async fn test_guarded_body_stops_on_cancellation() {
        let cancellation = CancellationToken::new();
        let body = GuardedBody::new(
            AxumBody::new(Silent),
            cancellation.clone(),
            Duration::from_secs(100),
        );
        let collect = tokio::spawn(body.collect());
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancellation.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), collect)
            .await
            .expect("canceled body must finish")
            .unwrap();
        assert_eq!(result.unwrap_err().to_string(), "The request was canceled");
    }

    #[test]
    fn test_settings_defaults() {
        let settings = ForwarderRequestSettings::from_config(None).unwrap();
        assert_eq!(settings.activity_timeout, Duration::from_secs(100));
        assert_eq!(settings.version, Version::HTTP_2);
        assert_eq!(
            settings.version_policy,
            HttpVersionPolicy::RequestVersionOrLower
        );
    }

    #[test]
    fn test_settings_reject_unknown_version() {
        let config = ForwarderRequestConfig {
            version: Some("4".to_string()),
            ..ForwarderRequestConfig::default()
        };
        assert!(matches!(
            ForwarderRequestSettings::from_config(Some(&config)),
            Err(ValidationError::InvalidField { .. })
        ));
    }

    #[test]
    fn test_outgoing_version() {
        let mut settings = ForwarderRequestSettings::default();
        assert_eq!(settings.outgoing_version(false, false), Version::HTTP_11);
        assert_eq!(settings.outgoing_version(true, false), Version::HTTP_2);
        assert_eq!(settings.outgoing_version(true, true), Version::HTTP_11);

        settings.version_policy = HttpVersionPolicy::RequestVersionExact;
        assert_eq!(settings.outgoing_version(false, false), Version::HTTP_2);

        settings.version_policy = HttpVersionPolicy::RequestVersionOrHigher;
        settings.version = Version::HTTP_11;
        assert_eq!(settings.outgoing_version(false, false), Version::HTTP_11);
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            ForwarderError::RequestTimedOut(Duration::from_secs(1)).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            ForwarderError::InvalidWebSocketKey.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ForwarderError::RequestCanceled.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }
}

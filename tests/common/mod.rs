// Shared fixtures for the integration tests
#![allow(dead_code)]

use std::{
    net::SocketAddr,
    pin::Pin,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use bytes::Bytes;
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri, Version};
use hyper::body::{Body, Frame};
use waypoint::{
    ClientConnection, ClusterState, HttpClient, HttpClientError, RouteModel, TransformBuilder,
    config::models::{ClusterConfig, RouteConfig},
    ports::http_client::HttpClientResult,
};

/// What the mock saw of an outgoing request
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

/// Canned reply of the mock destination
#[derive(Debug, Clone)]
pub enum Reply {
    Respond {
        status: StatusCode,
        headers: Vec<(&'static str, &'static str)>,
        body: &'static str,
    },
    Delay(Duration),
    Fail(&'static str),
    /// 200 whose body sends `first` and then goes silent
    Stall { first: &'static str },
}

/// Body that yields one chunk and then stays pending; flags when it is dropped.
struct StalledBody {
    first: Option<&'static str>,
    dropped: Arc<AtomicBool>,
}

impl Body for StalledBody {
    type Data = Bytes;
    type Error = std::convert::Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.get_mut().first.take() {
            Some(chunk) => Poll::Ready(Some(Ok(Frame::data(Bytes::from_static(chunk.as_bytes()))))),
            None => Poll::Pending,
        }
    }
}

impl Drop for StalledBody {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct MockHttpClient {
    reply: Reply,
    requests: Mutex<Vec<RecordedRequest>>,
    body_dropped: Arc<AtomicBool>,
}

impl MockHttpClient {
    pub fn new(reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            reply,
            requests: Mutex::new(Vec::new()),
            body_dropped: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Whether the last stalled body handed out has been released
    pub fn body_dropped(&self) -> bool {
        self.body_dropped.load(Ordering::SeqCst)
    }

    pub fn ok(body: &'static str) -> Arc<Self> {
        Self::new(Reply::Respond {
            status: StatusCode::OK,
            headers: vec![("content-type", "text/plain")],
            body,
        })
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn send_request(&self, request: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>> {
        self.requests.lock().unwrap().push(RecordedRequest {
            method: request.method().clone(),
            uri: request.uri().clone(),
            version: request.version(),
            headers: request.headers().clone(),
        });

        match &self.reply {
            Reply::Respond {
                status,
                headers,
                body,
            } => {
                let mut builder = Response::builder().status(*status);
                for (name, value) in headers {
                    builder = builder.header(*name, *value);
                }
                Ok(builder.body(AxumBody::from(*body)).unwrap())
            }
            Reply::Delay(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(Response::new(AxumBody::empty()))
            }
            Reply::Fail(message) => Err(HttpClientError::ConnectionError(message.to_string())),
            Reply::Stall { first } => Ok(Response::new(AxumBody::new(StalledBody {
                first: Some(*first),
                dropped: self.body_dropped.clone(),
            }))),
        }
    }
}

pub fn connection(is_https: bool) -> ClientConnection {
    let remote: SocketAddr = "10.0.0.1:5000".parse().unwrap();
    ClientConnection {
        remote_addr: Some(remote),
        local_addr: Some("10.0.0.254:443".parse().unwrap()),
        is_https,
        ..ClientConnection::default()
    }
}

/// Binds `cluster_config` to `client` and builds the route forwarding to it.
pub fn bind_route(
    route_config: RouteConfig,
    cluster_config: ClusterConfig,
    client: Arc<dyn HttpClient>,
) -> (Arc<RouteModel>, Arc<ClusterState>) {
    let cluster = Arc::new(ClusterState::new(cluster_config.cluster_id.clone()));
    cluster.update_model(cluster_config.clone(), client).unwrap();

    let chain = TransformBuilder::new()
        .build(&route_config, Some(&cluster_config))
        .unwrap();
    let route = Arc::new(RouteModel::new(
        route_config,
        Some(cluster.clone()),
        Arc::new(chain),
    ));
    (route, cluster)
}

pub fn get(uri: &str, host: &str) -> Request<AxumBody> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(http::header::HOST, host)
        .body(AxumBody::empty())
        .unwrap()
}

use std::{borrow::Cow, net::IpAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use encoding_rs::Encoding;
use http::{HeaderMap, HeaderValue, Uri, header};
use http_body_util::BodyExt;
use hyper::{Request, Response, body::Incoming};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{
        Client,
        connect::{Connect, HttpConnector, proxy::Tunnel},
    },
    rt::TokioExecutor,
};
use rustls::{
    DigitallySignedStruct, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use rustls_native_certs::load_native_certs;
use tokio::sync::Semaphore;
use url::Url;

use crate::{
    adapters::client_factory::ClientFactoryError,
    config::models::{HttpClientConfig, SslProtocol},
    metrics,
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Pair of pooled clients sharing one connector: ALPN-negotiated and HTTP/2 prior knowledge.
struct Transport<C> {
    negotiated: Client<C, AxumBody>,
    h2c: Client<C, AxumBody>,
}

impl<C> Transport<C>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    fn new(connector: C, max_connections_per_server: Option<usize>) -> Self {
        let mut builder = Client::builder(TokioExecutor::new());
        builder.pool_idle_timeout(POOL_IDLE_TIMEOUT);
        if let Some(max) = max_connections_per_server {
            builder.pool_max_idle_per_host(max);
        }

        let negotiated = builder.build(connector.clone());
        let h2c = builder.http2_only(true).build(connector);
        Self { negotiated, h2c }
    }

    async fn send(
        &self,
        request: Request<AxumBody>,
    ) -> Result<Response<Incoming>, hyper_util::client::legacy::Error> {
        // Cleartext HTTP/2 has no ALPN to negotiate with
        let prior_knowledge = request.version() == http::Version::HTTP_2
            && request.uri().scheme() == Some(&http::uri::Scheme::HTTP);
        if prior_knowledge {
            self.h2c.request(request).await
        } else {
            self.negotiated.request(request).await
        }
    }
}

/// Outbound transport of one cluster.
///
/// Built from a cluster's [`HttpClientConfig`] by the client factory and shared through an
/// `Arc`. Dropping the last reference releases the connection pools.
pub struct ForwardingClient {
    cluster_id: String,
    direct: Transport<HttpsConnector<HttpConnector>>,
    proxied: Option<Transport<HttpsConnector<Tunnel<HttpConnector>>>>,
    bypass_proxy_on_local: bool,
    connection_limits: Option<(usize, scc::HashMap<String, Arc<Semaphore>>)>,
    request_header_encoding: Option<&'static Encoding>,
    response_header_encoding: Option<&'static Encoding>,
}

impl std::fmt::Debug for ForwardingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardingClient")
            .field("cluster_id", &self.cluster_id)
            .field("proxied", &self.proxied.is_some())
            .field("bypass_proxy_on_local", &self.bypass_proxy_on_local)
            .finish_non_exhaustive()
    }
}

impl ForwardingClient {
    /// Builds a transport for `cluster_id`. A missing config means every default.
    pub fn new(
        cluster_id: &str,
        config: Option<&HttpClientConfig>,
    ) -> Result<Self, ClientFactoryError> {
        let default_config = HttpClientConfig::default();
        let config = config.unwrap_or(&default_config);

        let request_header_encoding = config
            .request_header_encoding
            .as_deref()
            .map(header_encoding)
            .transpose()?;
        let response_header_encoding = config
            .response_header_encoding
            .as_deref()
            .map(header_encoding)
            .transpose()?;

        let tls_config = tls_config(config)?;
        let max_connections = config.max_connections_per_server.filter(|max| *max > 0);

        let direct = Transport::new(
            https_connector(tls_config.clone(), http_connector()),
            max_connections,
        );

        let web_proxy = config
            .web_proxy
            .as_ref()
            .and_then(|p| p.address.as_deref().map(|a| (a, p.bypass_on_local)));
        let (proxied, bypass_proxy_on_local) = match web_proxy {
            Some((address, bypass_on_local)) => {
                let tunnel = proxy_tunnel(address)?;
                tracing::debug!(cluster.id = cluster_id, proxy = %address, "Using web proxy");
                (
                    Some(Transport::new(
                        https_connector(tls_config, tunnel),
                        max_connections,
                    )),
                    bypass_on_local.unwrap_or(false),
                )
            }
            None => (None, false),
        };

        if config.enable_multiple_http2_connections == Some(false) {
            tracing::debug!(
                cluster.id = cluster_id,
                "HTTP/2 requests are multiplexed over pooled connections; single-connection mode is not enforced"
            );
        }

        Ok(Self {
            cluster_id: cluster_id.to_string(),
            direct,
            proxied,
            bypass_proxy_on_local,
            connection_limits: max_connections.map(|max| (max, scc::HashMap::new())),
            request_header_encoding,
            response_header_encoding,
        })
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Checks the parts of `config` that can fail to build, without creating any pool.
    pub fn check_config(config: &HttpClientConfig) -> Result<(), ClientFactoryError> {
        for label in [
            config.request_header_encoding.as_deref(),
            config.response_header_encoding.as_deref(),
        ]
        .into_iter()
        .flatten()
        {
            header_encoding(label)?;
        }
        if let Some(address) = config.web_proxy.as_ref().and_then(|p| p.address.as_deref()) {
            proxy_tunnel(address)?;
        }
        Ok(())
    }

    fn uses_proxy(&self, uri: &Uri) -> bool {
        self.proxied.is_some() && !(self.bypass_proxy_on_local && is_local(uri))
    }

    /// Per-authority semaphore. Entries nothing else references are dropped whenever a new
    /// authority is added, so the map tracks only authorities with requests in flight.
    fn connection_limit(&self, uri: &Uri) -> Option<Arc<Semaphore>> {
        let (max, limits) = self.connection_limits.as_ref()?;
        let key = format!(
            "{}://{}",
            uri.scheme_str().unwrap_or("http"),
            uri.authority().map(|a| a.as_str()).unwrap_or_default()
        );
        if let Some(semaphore) = limits.read(&key, |_, s| s.clone()) {
            return Some(semaphore);
        }

        // Only the map holds it: no permit is out and nobody waits on it
        limits.retain(|_, semaphore| Arc::strong_count(semaphore) > 1);
        Some(
            limits
                .entry(key)
                .or_insert_with(|| Arc::new(Semaphore::new(*max)))
                .get()
                .clone(),
        )
    }
}

impl Drop for ForwardingClient {
    fn drop(&mut self) {
        tracing::debug!(cluster.id = %self.cluster_id, "Forwarding client disposed");
        metrics::increment_client_event(&self.cluster_id, "disposed");
    }
}

#[async_trait]
impl HttpClient for ForwardingClient {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>> {
        if req.uri().host().is_none() {
            return Err(HttpClientError::InvalidRequest(format!(
                "Outgoing URI has no host: {}",
                req.uri()
            )));
        }

        if let Some(encoding) = self.request_header_encoding {
            encode_headers(req.headers_mut(), encoding);
        }

        let permit = match self.connection_limit(req.uri()) {
            Some(semaphore) => Some(
                semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| HttpClientError::ConnectionError(e.to_string()))?,
            ),
            None => None,
        };

        let method = req.method().clone();
        let uri = req.uri().clone();
        tracing::debug!(
            cluster.id = %self.cluster_id,
            http.method = %method,
            url = %uri,
            version = ?req.version(),
            "Sending request to destination"
        );

        let result = match &self.proxied {
            Some(proxied) if self.uses_proxy(&uri) => proxied.send(req).await,
            _ => self.direct.send(req).await,
        };

        let response = result.map_err(|e| {
            tracing::debug!(
                cluster.id = %self.cluster_id,
                error = %e,
                "Request to {method} {uri} failed"
            );
            HttpClientError::ConnectionError(format!("Request to {method} {uri} failed: {e}"))
        })?;

        let (mut parts, body) = response.into_parts();
        if let Some(encoding) = self.response_header_encoding {
            decode_headers(&mut parts.headers, encoding);
        }

        // The permit lives as long as the response body is being read
        let body = match permit {
            Some(permit) => AxumBody::new(body.map_frame(move |frame| {
                let _held = &permit;
                frame
            })),
            None => AxumBody::new(body),
        };

        Ok(Response::from_parts(parts, body))
    }
}

fn header_encoding(label: &str) -> Result<&'static Encoding, ClientFactoryError> {
    Encoding::for_label(label.trim().as_bytes()).ok_or_else(|| {
        ClientFactoryError::UnknownHeaderEncoding {
            label: label.to_string(),
        }
    })
}

/// Re-encodes non-ASCII UTF-8 header values with `encoding`
fn encode_headers(headers: &mut HeaderMap, encoding: &'static Encoding) {
    for value in headers.values_mut() {
        if value.as_bytes().is_ascii() {
            continue;
        }
        let Ok(text) = std::str::from_utf8(value.as_bytes()) else {
            continue;
        };
        let (bytes, _, _) = encoding.encode(text);
        if let Ok(encoded) = HeaderValue::from_bytes(&bytes) {
            *value = encoded;
        }
    }
}

/// Decodes non-ASCII header values from `encoding` into UTF-8
fn decode_headers(headers: &mut HeaderMap, encoding: &'static Encoding) {
    for value in headers.values_mut() {
        if value.as_bytes().is_ascii() {
            continue;
        }
        let (text, _) = encoding.decode_without_bom_handling(value.as_bytes());
        if let Cow::Owned(text) = text {
            if let Ok(decoded) = HeaderValue::from_str(&text) {
                *value = decoded;
            }
        }
    }
}

fn http_connector() -> HttpConnector {
    let mut connector = HttpConnector::new();
    connector.enforce_http(false);
    connector.set_connect_timeout(Some(CONNECT_TIMEOUT));
    connector.set_nodelay(true);
    connector
}

fn https_connector<C>(tls_config: rustls::ClientConfig, connector: C) -> HttpsConnector<C> {
    hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls_config)
        .https_or_http()
        .enable_all_versions()
        .wrap_connector(connector)
}

fn tls_config(config: &HttpClientConfig) -> Result<rustls::ClientConfig, ClientFactoryError> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

    let versions: Vec<&'static rustls::SupportedProtocolVersion> = match &config.ssl_protocols {
        Some(protocols) if !protocols.is_empty() => protocols
            .iter()
            .map(|p| match p {
                SslProtocol::Tls12 => &rustls::version::TLS12,
                SslProtocol::Tls13 => &rustls::version::TLS13,
            })
            .collect(),
        _ => rustls::DEFAULT_VERSIONS.to_vec(),
    };

    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&versions)
        .map_err(|e| ClientFactoryError::Tls(e.to_string()))?;

    if config.dangerous_accept_any_server_certificate == Some(true) {
        tracing::warn!("Server certificate validation is disabled for this cluster");
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCertificate))
            .with_no_client_auth());
    }

    let mut root_cert_store = rustls::RootCertStore::empty();
    let native_certs = load_native_certs();
    for cert in native_certs.certs {
        if root_cert_store.add(cert).is_err() {
            tracing::warn!("Failed to add native certificate to rustls RootCertStore");
        }
    }
    if !native_certs.errors.is_empty() {
        tracing::warn!(
            "Some native certificates failed to load: {:?}",
            native_certs.errors
        );
    }

    Ok(builder
        .with_root_certificates(root_cert_store)
        .with_no_client_auth())
}

/// Builds the CONNECT tunnel for `address`; credentials in the URL become `Proxy-Authorization`.
fn proxy_tunnel(address: &str) -> Result<Tunnel<HttpConnector>, ClientFactoryError> {
    let invalid = |reason: String| ClientFactoryError::InvalidWebProxy {
        address: address.to_string(),
        reason,
    };

    let mut url = Url::parse(address).map_err(|e| invalid(e.to_string()))?;
    if url.scheme() != "http" {
        return Err(invalid("only http:// proxies are supported".to_string()));
    }

    let credentials = (!url.username().is_empty())
        .then(|| format!("{}:{}", url.username(), url.password().unwrap_or_default()));
    url.set_username("").map_err(|_| invalid("cannot strip credentials".to_string()))?;
    url.set_password(None)
        .map_err(|_| invalid("cannot strip credentials".to_string()))?;

    let proxy_uri: Uri = url
        .as_str()
        .parse()
        .map_err(|e: http::uri::InvalidUri| invalid(e.to_string()))?;

    let tunnel = Tunnel::new(proxy_uri, http_connector());
    match credentials {
        Some(credentials) => {
            let value = HeaderValue::from_str(&format!("Basic {}", BASE64.encode(credentials)))
                .map_err(|e| invalid(e.to_string()))?;
            Ok(tunnel.with_auth(value))
        }
        None => Ok(tunnel),
    }
}

fn is_local(uri: &Uri) -> bool {
    let Some(host) = uri.host() else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok_and(|ip| ip.is_loopback())
}

#[derive(Debug)]
struct AcceptAnyServerCertificate;

impl ServerCertVerifier for AcceptAnyServerCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

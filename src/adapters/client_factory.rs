//! Per-cluster forwarding client lifecycle.
use std::sync::Arc;

use thiserror::Error;

use crate::{
    adapters::http_client::ForwardingClient, config::models::HttpClientConfig, metrics,
    ports::http_client::HttpClient,
};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClientFactoryError {
    #[error("Unknown header encoding '{label}'")]
    UnknownHeaderEncoding { label: String },

    #[error("Invalid web proxy address '{address}': {reason}")]
    InvalidWebProxy { address: String, reason: String },

    #[error("TLS configuration error: {0}")]
    Tls(String),
}

/// Inputs to one client construction decision
#[derive(Clone)]
pub struct ForwardingClientContext<'a> {
    pub cluster_id: &'a str,
    pub old_config: Option<&'a HttpClientConfig>,
    pub old_client: Option<Arc<dyn HttpClient>>,
    pub new_config: Option<&'a HttpClientConfig>,
}

/// Builds [`ForwardingClient`]s, reusing the previous one while the config is unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForwardingClientFactory;

impl ForwardingClientFactory {
    pub fn new() -> Self {
        Self
    }

    pub fn create_client(
        &self,
        context: ForwardingClientContext<'_>,
    ) -> Result<Arc<dyn HttpClient>, ClientFactoryError> {
        let default_config = HttpClientConfig::default();
        let old_config = context.old_config.unwrap_or(&default_config);
        let new_config = context.new_config.unwrap_or(&default_config);

        if let Some(old_client) = context.old_client {
            if old_config == new_config {
                tracing::debug!(cluster.id = context.cluster_id, "Forwarding client reused");
                metrics::increment_client_event(context.cluster_id, "reused");
                return Ok(old_client);
            }
        }

        let client = ForwardingClient::new(context.cluster_id, Some(new_config))?;
        tracing::info!(
            cluster.id = context.cluster_id,
            max_connections_per_server = ?new_config.max_connections_per_server,
            web_proxy = new_config.web_proxy.as_ref().and_then(|p| p.address.as_deref()),
            "Forwarding client created"
        );
        metrics::increment_client_event(context.cluster_id, "created");
        Ok(Arc::new(client))
    }
}

use std::{net::SocketAddr, sync::Arc};

use thiserror::Error;

use crate::core::{
    cluster::{ClusterDestinationsState, ClusterModel, ClusterState},
    destination::DestinationState,
    route::RouteModel,
};

/// Facts about the client connection that a request arrived on
#[derive(Debug, Clone, Default)]
pub struct ClientConnection {
    pub remote_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
    pub is_https: bool,
    /// Path the proxy is mounted under, forwarded as `X-Forwarded-Prefix`
    pub path_base: String,
    /// Base64 DER of the client certificate, when one was presented
    pub client_certificate: Option<String>,
}

impl ClientConnection {
    pub fn scheme(&self) -> &'static str {
        if self.is_https { "https" } else { "http" }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProxyContextError {
    /// The destination for a request can only be chosen once
    #[error("Proxied destination already set to '{0}'")]
    DestinationAlreadySet(String),
}

/// Per-request state shared by the affinity, selection and forwarding steps
#[derive(Debug)]
pub struct ProxyContext {
    route: Arc<RouteModel>,
    cluster: Arc<ClusterState>,
    cluster_model: Arc<ClusterModel>,
    all_destinations: Vec<Arc<DestinationState>>,
    available_destinations: Vec<Arc<DestinationState>>,
    proxied_destination: Option<Arc<DestinationState>>,
    affinity_key: Option<String>,
}

impl ProxyContext {
    pub fn new(
        route: Arc<RouteModel>,
        cluster: Arc<ClusterState>,
        cluster_model: Arc<ClusterModel>,
        destinations: &ClusterDestinationsState,
    ) -> Self {
        Self {
            route,
            cluster,
            cluster_model,
            all_destinations: destinations.all_destinations().to_vec(),
            available_destinations: destinations.available_destinations().to_vec(),
            proxied_destination: None,
            affinity_key: None,
        }
    }

    pub fn route(&self) -> &Arc<RouteModel> {
        &self.route
    }

    pub fn cluster(&self) -> &Arc<ClusterState> {
        &self.cluster
    }

    pub fn cluster_model(&self) -> &Arc<ClusterModel> {
        &self.cluster_model
    }

    pub fn all_destinations(&self) -> &[Arc<DestinationState>] {
        &self.all_destinations
    }

    pub fn available_destinations(&self) -> &[Arc<DestinationState>] {
        &self.available_destinations
    }

    /// Narrows the candidates, e.g. to the affinitized destination
    pub fn set_available_destinations(&mut self, destinations: Vec<Arc<DestinationState>>) {
        self.available_destinations = destinations;
    }

    pub fn proxied_destination(&self) -> Option<&Arc<DestinationState>> {
        self.proxied_destination.as_ref()
    }

    pub fn set_proxied_destination(
        &mut self,
        destination: Arc<DestinationState>,
    ) -> Result<(), ProxyContextError> {
        if let Some(existing) = &self.proxied_destination {
            return Err(ProxyContextError::DestinationAlreadySet(
                existing.destination_id().to_string(),
            ));
        }
        self.proxied_destination = Some(destination);
        Ok(())
    }

    /// Affinity key the request carried, if any
    pub fn affinity_key(&self) -> Option<&str> {
        self.affinity_key.as_deref()
    }

    pub fn set_affinity_key(&mut self, key: impl Into<String>) {
        self.affinity_key = Some(key.into());
    }
}

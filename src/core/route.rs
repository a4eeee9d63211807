use std::sync::Arc;

use crate::{
    config::models::RouteConfig,
    core::{cluster::ClusterState, transforms::TransformChain},
};

/// A route bound to its cluster and its built transform chain
#[derive(Debug, Clone)]
pub struct RouteModel {
    config: RouteConfig,
    cluster: Option<Arc<ClusterState>>,
    transformer: Arc<TransformChain>,
}

impl RouteModel {
    pub fn new(
        config: RouteConfig,
        cluster: Option<Arc<ClusterState>>,
        transformer: Arc<TransformChain>,
    ) -> Self {
        Self {
            config,
            cluster,
            transformer,
        }
    }

    pub fn config(&self) -> &RouteConfig {
        &self.config
    }

    pub fn route_id(&self) -> &str {
        &self.config.route_id
    }

    pub fn cluster(&self) -> Option<&Arc<ClusterState>> {
        self.cluster.as_ref()
    }

    pub fn transformer(&self) -> &Arc<TransformChain> {
        &self.transformer
    }
}

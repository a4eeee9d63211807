//! Waypoint - the request-forwarding core of a reverse proxy.
//!
//! Waypoint takes a request that has already been matched to a route and carries it to one
//! destination of the route's cluster. It owns the parts of a proxy that sit between routing
//! and the wire:
//!
//! - Topology snapshots: clusters, destinations and their health, swapped atomically
//! - Transform pipelines built from declarative route config (headers, path, query,
//!   `X-Forwarded-*` and RFC 7239 `Forwarded`)
//! - Session affinity through a hashed cookie or header, with a failure policy
//! - Pooled forwarding clients per cluster (TLS, HTTP/2, web proxies, header encodings)
//! - WebSocket upgrades tunnelled end to end
//!
//! Listening sockets, routing and health probing stay with the embedding application.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use waypoint::{
//!     ClientConnection, ClusterState, ForwardingClientContext, ForwardingClientFactory,
//!     ProxyPipeline, RandomPicker, RouteModel, TransformBuilder,
//!     config::{ProxyConfigValidator, load_config},
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = load_config("waypoint.yaml").await?;
//! let transforms = TransformBuilder::new();
//! ProxyConfigValidator::validate(&config, &transforms)?;
//!
//! let cluster_config = config.clusters[0].clone();
//! let client = ForwardingClientFactory::new().create_client(ForwardingClientContext {
//!     cluster_id: &cluster_config.cluster_id,
//!     old_config: None,
//!     old_client: None,
//!     new_config: cluster_config.http_client.as_ref(),
//! })?;
//! let cluster = Arc::new(ClusterState::new(cluster_config.cluster_id.clone()));
//! cluster.update_model(cluster_config.clone(), client)?;
//!
//! let route_config = config.routes[0].clone();
//! let chain = transforms.build(&route_config, Some(&cluster_config))?;
//! let route = Arc::new(RouteModel::new(route_config, Some(cluster), Arc::new(chain)));
//!
//! let pipeline = ProxyPipeline::new(RandomPicker::new());
//! # let _ = (route, pipeline, ClientConnection::default());
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations) while keeping
//! forwarding logic inside `core`. Prefer the re-exports below over reaching into internal
//! modules directly.
//!
//! # Error Handling
//! Configuration and forwarding failures are domain error enums built with `thiserror`.
//! Loading configuration returns `eyre::Result<T>` with context attached through `WrapErr`.
//!
//! # Concurrency & Data Structures
//! Snapshots are published through `arc_swap::ArcSwap`; the destination registry is an
//! `scc::HashMap`. No lock is held across an `.await` on the request path.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{ClientFactoryError, ForwardingClient, ForwardingClientContext, ForwardingClientFactory},
    core::{
        ClientConnection, ClusterModel, ClusterState, DestinationHealth, DestinationModel,
        DestinationPicker, DestinationState, ForwarderError, HttpForwarder, ProxyContext,
        ProxyError, ProxyOutcome, ProxyPipeline, RandomPicker, RouteModel,
        affinity::{AffinityStatus, SessionAffinity},
        transforms::{TransformBuildError, TransformBuilder, TransformChain},
    },
    ports::http_client::{HttpClient, HttpClientError},
};

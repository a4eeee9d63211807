//! Per-request orchestration of the forwarding core.
//!
//! For a request already matched to a route:
//! * Take one destinations snapshot of the route's cluster
//! * Narrow the candidates with session affinity, applying the failure policy
//! * Let the [`DestinationPicker`] choose a destination
//! * Forward through the cluster's transport
//! * Write the affinity carrier onto the response
use std::sync::Arc;

use axum::body::Body as AxumBody;
use http::{Request, Response, StatusCode};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    core::{
        affinity::{AffinityStatus, FailurePolicyOutcome},
        context::{ClientConnection, ProxyContext, ProxyContextError},
        forwarder::{ForwardTarget, ForwarderError, HttpForwarder},
        picker::DestinationPicker,
        route::RouteModel,
    },
    metrics, tracing_setup,
};

/// Failures that end a request before or while it is forwarded
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProxyError {
    #[error("Route '{0}' has no cluster")]
    RouteWithoutCluster(String),

    #[error("Cluster '{0}' has no model bound yet")]
    ClusterNotReady(String),

    #[error(transparent)]
    Context(#[from] ProxyContextError),

    #[error(transparent)]
    Forwarder(#[from] ForwarderError),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RouteWithoutCluster(_) | Self::ClusterNotReady(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Context(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Forwarder(e) => e.status_code(),
        }
    }

    pub fn into_response(self) -> Response<AxumBody> {
        status_response(self.status_code())
    }
}

/// How a request that did not fail ended
#[derive(Debug)]
pub enum ProxyOutcome {
    /// The destination's response, transformed for the client
    Forwarded(Response<AxumBody>),
    /// Nothing to pick from after health and affinity filtering
    NoAvailableDestinations,
    /// The affinity failure policy stopped the request
    AffinityRejected(StatusCode),
}

impl ProxyOutcome {
    pub fn into_response(self) -> Response<AxumBody> {
        match self {
            Self::Forwarded(response) => response,
            Self::NoAvailableDestinations => status_response(StatusCode::SERVICE_UNAVAILABLE),
            Self::AffinityRejected(status) => status_response(status),
        }
    }
}

fn status_response(status: StatusCode) -> Response<AxumBody> {
    let mut response = Response::new(AxumBody::empty());
    *response.status_mut() = status;
    response
}

pub struct ProxyPipeline<P> {
    picker: P,
    forwarder: HttpForwarder,
}

impl<P: DestinationPicker> ProxyPipeline<P> {
    pub fn new(picker: P) -> Self {
        Self {
            picker,
            forwarder: HttpForwarder::new(),
        }
    }

    /// Proxies `request` along `route`.
    pub async fn proxy(
        &self,
        route: &Arc<RouteModel>,
        request: Request<AxumBody>,
        connection: &ClientConnection,
        cancellation: &CancellationToken,
    ) -> Result<ProxyOutcome, ProxyError> {
        let span = tracing_setup::create_proxy_span(
            route.route_id(),
            request.method().as_str(),
            request.uri().path(),
        );
        self.run(route, request, connection, cancellation)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        route: &Arc<RouteModel>,
        request: Request<AxumBody>,
        connection: &ClientConnection,
        cancellation: &CancellationToken,
    ) -> Result<ProxyOutcome, ProxyError> {
        let cluster = route
            .cluster()
            .ok_or_else(|| ProxyError::RouteWithoutCluster(route.route_id().to_string()))?;
        let model = cluster
            .model()
            .ok_or_else(|| ProxyError::ClusterNotReady(cluster.cluster_id().to_string()))?;
        let snapshot = cluster.destinations_state();
        let mut context =
            ProxyContext::new(route.clone(), cluster.clone(), model.clone(), &snapshot);

        if let Some(affinity) = model.session_affinity() {
            let result = affinity.policy().find_affinitized_destinations(
                request.headers(),
                cluster,
                affinity.config(),
                context.available_destinations(),
            );
            metrics::increment_affinity_resolution(cluster.cluster_id(), result.status.as_str());
            tracing::Span::current().record("affinity.status", result.status.as_str());

            if let Some(key) = result.affinity_key {
                context.set_affinity_key(key);
            }
            match result.status {
                AffinityStatus::Ok => context.set_available_destinations(result.destinations),
                AffinityStatus::AffinityKeyNotSet => {}
                failure => {
                    if let FailurePolicyOutcome::Reject(status) =
                        affinity.failure_policy().handle(cluster.cluster_id(), failure)
                    {
                        return Ok(ProxyOutcome::AffinityRejected(status));
                    }
                }
            }
        }

        let picked = if context.available_destinations().is_empty() {
            None
        } else {
            self.picker.pick(&context, context.available_destinations())
        };
        let Some(destination) = picked else {
            tracing::warn!(
                cluster.id = %cluster.cluster_id(),
                all = context.all_destinations().len(),
                "No available destinations"
            );
            return Ok(ProxyOutcome::NoAvailableDestinations);
        };
        context.set_proxied_destination(destination.clone())?;

        let _in_flight = destination.track_request();
        let destination_model = destination.model();
        let span = tracing_setup::create_forward_span(
            cluster.cluster_id(),
            destination.destination_id(),
            request.method().as_str(),
            request.uri().path(),
        );
        let target = ForwardTarget {
            cluster_id: cluster.cluster_id(),
            destination_prefix: destination_model.address(),
            destination: Some(destination_model.as_ref()),
            client: model.http_client().as_ref(),
            settings: model.request_settings(),
            transformer: route.transformer(),
        };
        let mut response = self
            .forwarder
            .send(request, connection, target, cancellation)
            .instrument(span)
            .await?;

        if let Some(affinity) = model.session_affinity() {
            affinity.policy().affinitize_response(
                &context,
                connection,
                affinity.config(),
                &destination,
                response.headers_mut(),
            );
        }

        Ok(ProxyOutcome::Forwarded(response))
    }
}

impl<P: std::fmt::Debug> std::fmt::Debug for ProxyPipeline<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyPipeline")
            .field("picker", &self.picker)
            .finish_non_exhaustive()
    }
}

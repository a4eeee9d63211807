//! Metrics helpers for Waypoint.
//!
//! Thin wrappers around the `metrics` crate macros. No exporter is installed here; the embedding
//! application registers whatever recorder it prefers and these calls feed it.
//!
//! Provided metrics:
//! * `waypoint_destination_health` (gauge, labels: destination, kind)
//! * `waypoint_forwarded_requests_total` (counter, labels: cluster, outcome)
//! * `waypoint_forward_duration_seconds` (histogram, labels: cluster)
//! * `waypoint_forwarding_clients_total` (counter, labels: cluster, event)
//! * `waypoint_affinity_resolutions_total` (counter, labels: cluster, status)
//! * `waypoint_websocket_tunnels_total` (counter)
use std::time::{Duration, Instant};

use metrics::{Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::Lazy;

use crate::core::destination::DestinationHealth;

pub const WAYPOINT_DESTINATION_HEALTH: &str = "waypoint_destination_health";
pub const WAYPOINT_FORWARDED_REQUESTS_TOTAL: &str = "waypoint_forwarded_requests_total";
pub const WAYPOINT_FORWARD_DURATION_SECONDS: &str = "waypoint_forward_duration_seconds";
pub const WAYPOINT_FORWARDING_CLIENTS_TOTAL: &str = "waypoint_forwarding_clients_total"; // labels: cluster, event
pub const WAYPOINT_AFFINITY_RESOLUTIONS_TOTAL: &str = "waypoint_affinity_resolutions_total";
pub const WAYPOINT_WEBSOCKET_TUNNELS_TOTAL: &str = "waypoint_websocket_tunnels_total";

/// Last health value recorded per `(destination, kind)`
pub static DESTINATION_HEALTH_GAUGES: Lazy<scc::HashMap<(String, &'static str), f64>> =
    Lazy::new(|| {
        describe_gauge!(
            WAYPOINT_DESTINATION_HEALTH,
            "Health verdict per destination and check kind (1 healthy, 0 unhealthy, -1 unknown)"
        );
        describe_counter!(
            WAYPOINT_FORWARDED_REQUESTS_TOTAL,
            Unit::Count,
            "Requests forwarded to destinations, by outcome."
        );
        describe_histogram!(
            WAYPOINT_FORWARD_DURATION_SECONDS,
            Unit::Seconds,
            "Time until the destination's response head arrived."
        );
        describe_counter!(
            WAYPOINT_FORWARDING_CLIENTS_TOTAL,
            Unit::Count,
            "Forwarding client lifecycle events (created, reused, disposed)."
        );
        describe_counter!(
            WAYPOINT_AFFINITY_RESOLUTIONS_TOTAL,
            Unit::Count,
            "Session affinity lookups, by resulting status."
        );
        describe_counter!(
            WAYPOINT_WEBSOCKET_TUNNELS_TOTAL,
            Unit::Count,
            "Upgraded connections tunnelled to destinations."
        );

        scc::HashMap::new()
    });

fn health_value(health: DestinationHealth) -> f64 {
    match health {
        DestinationHealth::Healthy => 1.0,
        DestinationHealth::Unhealthy => 0.0,
        DestinationHealth::Unknown => -1.0,
    }
}

/// Record a destination's active or passive health verdict.
pub fn set_destination_health(destination_id: &str, kind: &'static str, health: DestinationHealth) {
    let value = health_value(health);
    DESTINATION_HEALTH_GAUGES.upsert((destination_id.to_string(), kind), value);

    gauge!(
        WAYPOINT_DESTINATION_HEALTH,
        "destination" => destination_id.to_string(),
        "kind" => kind
    )
    .set(value);
}

/// Last recorded health value, mostly for diagnostics.
pub fn destination_health_value(destination_id: &str, kind: &'static str) -> Option<f64> {
    DESTINATION_HEALTH_GAUGES.read(&(destination_id.to_string(), kind), |_, v| *v)
}

pub fn increment_forwarded_request(cluster_id: &str, outcome: &'static str) {
    counter!(
        WAYPOINT_FORWARDED_REQUESTS_TOTAL,
        "cluster" => cluster_id.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_forward_duration(cluster_id: &str, duration: Duration) {
    histogram!(
        WAYPOINT_FORWARD_DURATION_SECONDS,
        "cluster" => cluster_id.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn increment_client_event(cluster_id: &str, event: &'static str) {
    counter!(
        WAYPOINT_FORWARDING_CLIENTS_TOTAL,
        "cluster" => cluster_id.to_string(),
        "event" => event
    )
    .increment(1);
}

pub fn increment_affinity_resolution(cluster_id: &str, status: &'static str) {
    counter!(
        WAYPOINT_AFFINITY_RESOLUTIONS_TOTAL,
        "cluster" => cluster_id.to_string(),
        "status" => status
    )
    .increment(1);
}

pub fn increment_websocket_tunnels() {
    counter!(WAYPOINT_WEBSOCKET_TUNNELS_TOTAL).increment(1);
}

/// RAII helper measuring how long a destination took to answer.
pub struct ForwardTimer {
    start: Instant,
    cluster_id: String,
}

impl ForwardTimer {
    pub fn new(cluster_id: &str) -> Self {
        Self {
            start: Instant::now(),
            cluster_id: cluster_id.to_string(),
        }
    }
}

impl Drop for ForwardTimer {
    fn drop(&mut self) {
        record_forward_duration(&self.cluster_id, self.start.elapsed());
    }
}

/// Register metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    tracing::info!("Initializing Waypoint metrics");
    Lazy::force(&DESTINATION_HEALTH_GAUGES);
    Ok(())
}

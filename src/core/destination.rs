use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicUsize, Ordering},
    },
};

use arc_swap::ArcSwap;

use crate::{config::models::DestinationConfig, metrics::set_destination_health};

const HEALTH_UNKNOWN: u8 = 0;
const HEALTH_HEALTHY: u8 = 1;
const HEALTH_UNHEALTHY: u8 = 2;

/// Verdict reported by an active prober or by passive response analysis
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DestinationHealth {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

impl DestinationHealth {
    fn from_raw(raw: u8) -> Self {
        match raw {
            HEALTH_HEALTHY => Self::Healthy,
            HEALTH_UNHEALTHY => Self::Unhealthy,
            _ => Self::Unknown,
        }
    }

    fn into_raw(self) -> u8 {
        match self {
            Self::Unknown => HEALTH_UNKNOWN,
            Self::Healthy => HEALTH_HEALTHY,
            Self::Unhealthy => HEALTH_UNHEALTHY,
        }
    }
}

impl fmt::Display for DestinationHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Healthy => write!(f, "healthy"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Active and passive verdicts, written by external health logic
#[derive(Debug, Default)]
pub struct DestinationHealthState {
    active: AtomicU8,
    passive: AtomicU8,
}

impl DestinationHealthState {
    pub fn active(&self) -> DestinationHealth {
        DestinationHealth::from_raw(self.active.load(Ordering::Acquire))
    }

    pub fn passive(&self) -> DestinationHealth {
        DestinationHealth::from_raw(self.passive.load(Ordering::Acquire))
    }

    pub fn set_active(&self, health: DestinationHealth) {
        self.active.store(health.into_raw(), Ordering::Release);
    }

    pub fn set_passive(&self, health: DestinationHealth) {
        self.passive.store(health.into_raw(), Ordering::Release);
    }

    /// Either verdict being `Unhealthy` takes the destination out of rotation.
    pub fn is_available(&self) -> bool {
        self.active() != DestinationHealth::Unhealthy
            && self.passive() != DestinationHealth::Unhealthy
    }
}

/// Immutable view of a destination's configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationModel {
    config: DestinationConfig,
}

impl DestinationModel {
    pub fn new(config: DestinationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DestinationConfig {
        &self.config
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    /// Host header override for this destination
    pub fn host(&self) -> Option<&str> {
        self.config.host.as_deref()
    }
}

/// Live state of one destination.
///
/// Shared through `Arc` between the cluster registry, topology snapshots and in-flight requests.
#[derive(Debug)]
pub struct DestinationState {
    destination_id: String,
    model: ArcSwap<DestinationModel>,
    health: DestinationHealthState,
    concurrent_requests: AtomicUsize,
}

impl DestinationState {
    pub fn new(destination_id: impl Into<String>) -> Self {
        Self::with_model(destination_id, DestinationModel::default())
    }

    pub fn with_model(destination_id: impl Into<String>, model: DestinationModel) -> Self {
        Self {
            destination_id: destination_id.into(),
            model: ArcSwap::from_pointee(model),
            health: DestinationHealthState::default(),
            concurrent_requests: AtomicUsize::new(0),
        }
    }

    pub fn destination_id(&self) -> &str {
        &self.destination_id
    }

    pub fn model(&self) -> Arc<DestinationModel> {
        self.model.load_full()
    }

    pub fn set_model(&self, model: DestinationModel) {
        self.model.store(Arc::new(model));
    }

    pub fn health(&self) -> &DestinationHealthState {
        &self.health
    }

    pub fn set_active_health(&self, health: DestinationHealth) {
        self.health.set_active(health);
        set_destination_health(&self.destination_id, "active", health);
    }

    pub fn set_passive_health(&self, health: DestinationHealth) {
        self.health.set_passive(health);
        set_destination_health(&self.destination_id, "passive", health);
    }

    pub fn concurrent_request_count(&self) -> usize {
        self.concurrent_requests.load(Ordering::Relaxed)
    }

    /// Counts a request against this destination until the guard is dropped.
    pub fn track_request(self: &Arc<Self>) -> ConcurrentRequestGuard {
        self.concurrent_requests.fetch_add(1, Ordering::Relaxed);
        ConcurrentRequestGuard {
            destination: Arc::clone(self),
        }
    }
}

#[derive(Debug)]
pub struct ConcurrentRequestGuard {
    destination: Arc<DestinationState>,
}

impl Drop for ConcurrentRequestGuard {
    fn drop(&mut self) {
        self.destination
            .concurrent_requests
            .fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_starts_unknown_and_available() {
        let destination = DestinationState::new("d1");
        assert_eq!(destination.health().active(), DestinationHealth::Unknown);
        assert_eq!(destination.health().passive(), DestinationHealth::Unknown);
        assert!(destination.health().is_available());
    }

    #[test]
    fn either_unhealthy_verdict_makes_destination_unavailable() {
        let destination = DestinationState::new("d1");
        destination.set_active_health(DestinationHealth::Healthy);
        destination.set_passive_health(DestinationHealth::Unhealthy);
        assert!(!destination.health().is_available());

        destination.set_passive_health(DestinationHealth::Healthy);
        assert!(destination.health().is_available());

        destination.set_active_health(DestinationHealth::Unhealthy);
        assert!(!destination.health().is_available());
    }

    #[test]
    fn request_guard_tracks_concurrency() {
        let destination = Arc::new(DestinationState::new("d1"));
        let first = destination.track_request();
        let second = destination.track_request();
        assert_eq!(destination.concurrent_request_count(), 2);

        drop(first);
        assert_eq!(destination.concurrent_request_count(), 1);
        drop(second);
        assert_eq!(destination.concurrent_request_count(), 0);
    }

    #[test]
    fn model_can_be_replaced() {
        let destination = DestinationState::new("d1");
        assert_eq!(destination.model().address(), "");

        destination.set_model(DestinationModel::new(
            DestinationConfig::new("http://localhost:1").with_host("d1-host"),
        ));
        assert_eq!(destination.model().address(), "http://localhost:1");
        assert_eq!(destination.model().host(), Some("d1-host"));
    }
}

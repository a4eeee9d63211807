use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use arc_swap::{ArcSwap, ArcSwapOption};

use crate::{
    config::{
        models::{ClusterConfig, HealthCheckConfig},
        validation::{ValidationError, ValidationResult},
    },
    core::{
        affinity::SessionAffinity,
        destination::{DestinationModel, DestinationState},
        forwarder::ForwarderRequestSettings,
    },
    ports::http_client::HttpClient,
};

const POLICY_HEALTHY_AND_UNKNOWN: &str = "HealthyAndUnknown";
const POLICY_HEALTHY_OR_PANIC: &str = "HealthyOrPanic";

/// Which destinations stay selectable given their health verdicts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AvailableDestinationsPolicy {
    #[default]
    HealthyAndUnknown,
    /// Like `HealthyAndUnknown`, but falls back to every destination when none qualify.
    HealthyOrPanic,
}

impl AvailableDestinationsPolicy {
    pub fn from_config(health: Option<&HealthCheckConfig>) -> ValidationResult<Self> {
        match health.and_then(|h| h.available_destinations_policy.as_deref()) {
            None => Ok(Self::HealthyAndUnknown),
            Some(name) if name.eq_ignore_ascii_case(POLICY_HEALTHY_AND_UNKNOWN) => {
                Ok(Self::HealthyAndUnknown)
            }
            Some(name) if name.eq_ignore_ascii_case(POLICY_HEALTHY_OR_PANIC) => {
                Ok(Self::HealthyOrPanic)
            }
            Some(other) => Err(ValidationError::InvalidField {
                field: "health_check.available_destinations_policy".to_string(),
                message: format!(
                    "Unknown available destinations policy '{other}', expected \
                     '{POLICY_HEALTHY_AND_UNKNOWN}' or '{POLICY_HEALTHY_OR_PANIC}'"
                ),
            }),
        }
    }

    pub fn select(&self, all: &[Arc<DestinationState>]) -> Vec<Arc<DestinationState>> {
        let healthy: Vec<_> = all
            .iter()
            .filter(|d| d.health().is_available())
            .cloned()
            .collect();

        match self {
            Self::HealthyOrPanic if healthy.is_empty() => all.to_vec(),
            _ => healthy,
        }
    }
}

/// Config-bound view of a cluster, replaced as a whole on reconfiguration
pub struct ClusterModel {
    config: ClusterConfig,
    http_client: Arc<dyn HttpClient>,
    session_affinity: Option<SessionAffinity>,
    request_settings: ForwarderRequestSettings,
    available_policy: AvailableDestinationsPolicy,
}

impl ClusterModel {
    /// Binds the policy names and request settings so the request path never parses strings.
    pub fn new(config: ClusterConfig, http_client: Arc<dyn HttpClient>) -> ValidationResult<Self> {
        let session_affinity = SessionAffinity::bind(config.session_affinity.as_ref())?;
        let request_settings = ForwarderRequestSettings::from_config(config.http_request.as_ref())?;
        let available_policy = AvailableDestinationsPolicy::from_config(config.health_check.as_ref())?;

        Ok(Self {
            config,
            http_client,
            session_affinity,
            request_settings,
            available_policy,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn cluster_id(&self) -> &str {
        &self.config.cluster_id
    }

    pub fn http_client(&self) -> &Arc<dyn HttpClient> {
        &self.http_client
    }

    pub fn session_affinity(&self) -> Option<&SessionAffinity> {
        self.session_affinity.as_ref()
    }

    pub fn request_settings(&self) -> &ForwarderRequestSettings {
        &self.request_settings
    }

    pub fn available_destinations_policy(&self) -> AvailableDestinationsPolicy {
        self.available_policy
    }
}

impl std::fmt::Debug for ClusterModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterModel")
            .field("cluster_id", &self.config.cluster_id)
            .field("session_affinity", &self.session_affinity)
            .field("request_settings", &self.request_settings)
            .finish_non_exhaustive()
    }
}

/// Consistent pair of destination lists; `available` is always a subset of `all`.
#[derive(Debug, Default)]
pub struct ClusterDestinationsState {
    all: Vec<Arc<DestinationState>>,
    available: Vec<Arc<DestinationState>>,
}

impl ClusterDestinationsState {
    pub fn new(all: Vec<Arc<DestinationState>>, mut available: Vec<Arc<DestinationState>>) -> Self {
        let before = available.len();
        available.retain(|d| all.iter().any(|a| Arc::ptr_eq(a, d)));
        if available.len() != before {
            tracing::warn!(
                dropped = before - available.len(),
                "Available destinations not present in the full list were dropped"
            );
        }
        Self { all, available }
    }

    pub fn all_destinations(&self) -> &[Arc<DestinationState>] {
        &self.all
    }

    pub fn available_destinations(&self) -> &[Arc<DestinationState>] {
        &self.available
    }
}

/// Registry of destinations keyed by id
#[derive(Debug, Default)]
pub struct Destinations {
    map: scc::HashMap<String, Arc<DestinationState>>,
}

impl Destinations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing destination or inserts the one built by `factory`.
    pub fn get_or_add<F>(&self, destination_id: &str, factory: F) -> Arc<DestinationState>
    where
        F: FnOnce(&str) -> DestinationState,
    {
        self.map
            .entry(destination_id.to_string())
            .or_insert_with(|| Arc::new(factory(destination_id)))
            .get()
            .clone()
    }

    pub fn get(&self, destination_id: &str) -> Option<Arc<DestinationState>> {
        self.map.read(destination_id, |_, d| d.clone())
    }

    pub fn remove(&self, destination_id: &str) -> Option<Arc<DestinationState>> {
        self.map.remove(destination_id).map(|(_, d)| d)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Every registered destination, ordered by id
    pub fn to_sorted_vec(&self) -> Vec<Arc<DestinationState>> {
        let mut destinations = Vec::with_capacity(self.map.len());
        self.map.scan(|_, d| destinations.push(d.clone()));
        destinations.sort_by(|a, b| a.destination_id().cmp(b.destination_id()));
        destinations
    }
}

/// Live state of one cluster
#[derive(Debug)]
pub struct ClusterState {
    cluster_id: String,
    model: ArcSwapOption<ClusterModel>,
    destinations: Destinations,
    destinations_state: ArcSwap<ClusterDestinationsState>,
    /// Held by publishers only, from reading the registry until the snapshot is stored
    publish: Mutex<()>,
    revision: AtomicU64,
}

impl ClusterState {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            model: ArcSwapOption::empty(),
            destinations: Destinations::new(),
            destinations_state: ArcSwap::from_pointee(ClusterDestinationsState::default()),
            publish: Mutex::new(()),
            revision: AtomicU64::new(0),
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn model(&self) -> Option<Arc<ClusterModel>> {
        self.model.load_full()
    }

    pub fn destinations(&self) -> &Destinations {
        &self.destinations
    }

    /// Snapshot taken once per request
    pub fn destinations_state(&self) -> Arc<ClusterDestinationsState> {
        self.destinations_state.load_full()
    }

    /// Bumped every time a new model or destinations snapshot is published
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    pub fn set_model(&self, model: ClusterModel) {
        self.model.store(Some(Arc::new(model)));
        self.revision.fetch_add(1, Ordering::AcqRel);
    }

    /// Binds `config` into a new model, syncs the destination registry with it and
    /// republishes the destinations snapshot.
    pub fn update_model(
        &self,
        config: ClusterConfig,
        http_client: Arc<dyn HttpClient>,
    ) -> ValidationResult<()> {
        let model = ClusterModel::new(config, http_client)?;

        for (destination_id, destination_config) in &model.config().destinations {
            let destination = self
                .destinations
                .get_or_add(destination_id, |id| DestinationState::new(id));
            let destination_model = DestinationModel::new(destination_config.clone());
            if *destination.model() != destination_model {
                destination.set_model(destination_model);
            }
        }

        for destination in self.destinations.to_sorted_vec() {
            if !model
                .config()
                .destinations
                .contains_key(destination.destination_id())
            {
                self.destinations.remove(destination.destination_id());
            }
        }

        tracing::debug!(
            cluster.id = %self.cluster_id,
            destinations = self.destinations.len(),
            "Cluster model updated"
        );

        self.set_model(model);
        self.update_destinations_state();
        Ok(())
    }

    /// Recomputes the all/available pair from the registry and publishes it in one swap.
    ///
    /// Publishers are serialized so an older computation never lands after a newer one;
    /// readers only ever load the swapped pointer.
    pub fn update_destinations_state(&self) {
        let _publish = self.publish.lock().unwrap_or_else(PoisonError::into_inner);
        let all = self.destinations.to_sorted_vec();
        let policy = self
            .model()
            .map(|m| m.available_destinations_policy())
            .unwrap_or_default();
        let available = policy.select(&all);

        tracing::trace!(
            cluster.id = %self.cluster_id,
            all = all.len(),
            available = available.len(),
            "Publishing destinations snapshot"
        );

        self.destinations_state
            .store(Arc::new(ClusterDestinationsState::new(all, available)));
        self.revision.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::core::destination::DestinationHealth;

    #[test]
    fn get_or_add_is_idempotent() {
        let destinations = Destinations::new();
        let first = destinations.get_or_add("d1", |id| DestinationState::new(id));
        let second = destinations.get_or_add("d1", |_| panic!("factory must not run twice"));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(destinations.len(), 1);
        assert!(destinations.get("d1").is_some());
        assert!(destinations.remove("d1").is_some());
        assert!(destinations.is_empty());
    }

    #[test]
    fn snapshot_filters_unhealthy_destinations() {
        let cluster = ClusterState::new("cluster1");
        let d1 = cluster.destinations().get_or_add("d1", |id| DestinationState::new(id));
        let d2 = cluster.destinations().get_or_add("d2", |id| DestinationState::new(id));
        cluster.destinations().get_or_add("d3", |id| DestinationState::new(id));

        d2.set_active_health(DestinationHealth::Unhealthy);
        d1.set_passive_health(DestinationHealth::Healthy);
        cluster.update_destinations_state();

        let state = cluster.destinations_state();
        let all: Vec<_> = state.all_destinations().iter().map(|d| d.destination_id()).collect();
        let available: Vec<_> = state
            .available_destinations()
            .iter()
            .map(|d| d.destination_id())
            .collect();
        assert_eq!(all, vec!["d1", "d2", "d3"]);
        assert_eq!(available, vec!["d1", "d3"]);
    }

    #[test]
    fn empty_available_set_is_not_an_error() {
        let cluster = ClusterState::new("cluster1");
        let d1 = cluster.destinations().get_or_add("d1", |id| DestinationState::new(id));
        d1.set_active_health(DestinationHealth::Unhealthy);
        cluster.update_destinations_state();

        let state = cluster.destinations_state();
        assert_eq!(state.all_destinations().len(), 1);
        assert!(state.available_destinations().is_empty());
    }

    #[test]
    fn healthy_or_panic_falls_back_to_all() {
        let d1 = Arc::new(DestinationState::new("d1"));
        d1.set_passive_health(DestinationHealth::Unhealthy);
        let all = vec![d1];

        assert!(AvailableDestinationsPolicy::HealthyAndUnknown.select(&all).is_empty());
        assert_eq!(AvailableDestinationsPolicy::HealthyOrPanic.select(&all).len(), 1);
    }

    #[test]
    fn foreign_available_destinations_are_dropped() {
        let d1 = Arc::new(DestinationState::new("d1"));
        let stranger = Arc::new(DestinationState::new("d1"));
        let state = ClusterDestinationsState::new(vec![d1.clone()], vec![d1, stranger]);
        assert_eq!(state.available_destinations().len(), 1);
    }

    #[test]
    fn available_is_always_subset_of_all_under_concurrent_updates() {
        let cluster = Arc::new(ClusterState::new("cluster1"));
        for i in 0..8 {
            cluster
                .destinations()
                .get_or_add(&format!("d{i}"), |id| DestinationState::new(id));
        }
        cluster.update_destinations_state();

        let writer = {
            let cluster = cluster.clone();
            thread::spawn(move || {
                for round in 0..500 {
                    let id = format!("d{}", round % 8);
                    if round % 3 == 0 {
                        cluster.destinations().remove(&id);
                    } else {
                        let d = cluster.destinations().get_or_add(&id, |id| DestinationState::new(id));
                        d.set_active_health(if round % 2 == 0 {
                            DestinationHealth::Unhealthy
                        } else {
                            DestinationHealth::Healthy
                        });
                    }
                    cluster.update_destinations_state();
                }
            })
        };

        for _ in 0..2000 {
            let state = cluster.destinations_state();
            for available in state.available_destinations() {
                assert!(
                    state
                        .all_destinations()
                        .iter()
                        .any(|d| Arc::ptr_eq(d, available))
                );
            }
        }

        writer.join().unwrap();
    }

    #[test]
    fn racing_publishers_leave_the_latest_snapshot() {
        let cluster = Arc::new(ClusterState::new("cluster1"));
        for i in 0..8 {
            cluster
                .destinations()
                .get_or_add(&format!("d{i}"), |id| DestinationState::new(id));
        }

        let publishers: Vec<_> = (0..8)
            .map(|i| {
                let cluster = cluster.clone();
                thread::spawn(move || {
                    let destination = cluster.destinations().get(&format!("d{i}")).unwrap();
                    for round in 0..200 {
                        destination.set_active_health(if round % 2 == 0 {
                            DestinationHealth::Unhealthy
                        } else {
                            DestinationHealth::Healthy
                        });
                        cluster.update_destinations_state();
                    }
                    // Odd publishers finish unhealthy
                    if i % 2 == 1 {
                        destination.set_active_health(DestinationHealth::Unhealthy);
                    }
                    cluster.update_destinations_state();
                })
            })
            .collect();
        for publisher in publishers {
            publisher.join().unwrap();
        }

        let state = cluster.destinations_state();
        let available: Vec<_> = state
            .available_destinations()
            .iter()
            .map(|d| d.destination_id().to_string())
            .collect();
        assert_eq!(available, vec!["d0", "d2", "d4", "d6"]);
        assert_eq!(state.all_destinations().len(), 8);
        assert_eq!(cluster.revision(), 8 * 201);
    }
}

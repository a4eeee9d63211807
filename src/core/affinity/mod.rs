//! Session affinity: pins a client to the destination it was first sent to.
//!
//! The destination is identified by a digest of its id (see [`affinity_key`]) carried in a
//! cookie or header. Policies are closed enums resolved when a cluster is bound, so the
//! request path never looks anything up by name.
mod failure;
mod hash;
mod policy;

use std::sync::Arc;

pub use failure::{AffinityFailurePolicy, FailurePolicyOutcome};
pub use hash::affinity_key;
pub use policy::SessionAffinityPolicy;

use crate::{
    config::{
        models::SessionAffinityConfig,
        validation::{ValidationError, ValidationResult},
    },
    core::destination::DestinationState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AffinityStatus {
    Ok,
    /// The request carried no affinity key
    AffinityKeyNotSet,
    /// The carrier was present but held no usable key
    AffinityKeyExtractionFailed,
    /// No candidate destination matches the key
    DestinationNotFound,
}

impl AffinityStatus {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::AffinityKeyExtractionFailed | Self::DestinationNotFound
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::AffinityKeyNotSet => "key_not_set",
            Self::AffinityKeyExtractionFailed => "key_extraction_failed",
            Self::DestinationNotFound => "destination_not_found",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AffinityResult {
    pub status: AffinityStatus,
    /// Exactly one destination when `status` is `Ok`, otherwise empty
    pub destinations: Vec<Arc<DestinationState>>,
    /// Key extracted from the request, if one was found
    pub affinity_key: Option<String>,
}

impl AffinityResult {
    pub fn new(status: AffinityStatus) -> Self {
        Self {
            status,
            destinations: Vec::new(),
            affinity_key: None,
        }
    }
}

/// Affinity settings of a cluster with their policies resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionAffinity {
    config: SessionAffinityConfig,
    policy: SessionAffinityPolicy,
    failure_policy: AffinityFailurePolicy,
}

impl SessionAffinity {
    /// Returns `None` when affinity is absent or disabled.
    pub fn bind(config: Option<&SessionAffinityConfig>) -> ValidationResult<Option<Self>> {
        let Some(config) = config.filter(|c| c.is_enabled()) else {
            return Ok(None);
        };

        if config.affinity_key_name.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "session_affinity.affinity_key_name".to_string(),
            });
        }

        let policy = match config.policy.as_deref() {
            None => SessionAffinityPolicy::default(),
            Some(name) => name.parse().map_err(|message| ValidationError::InvalidField {
                field: "session_affinity.policy".to_string(),
                message,
            })?,
        };

        let failure_policy = match config.failure_policy.as_deref() {
            None => AffinityFailurePolicy::default(),
            Some(name) => name.parse().map_err(|message| ValidationError::InvalidField {
                field: "session_affinity.failure_policy".to_string(),
                message,
            })?,
        };

        Ok(Some(Self {
            config: config.clone(),
            policy,
            failure_policy,
        }))
    }

    pub fn config(&self) -> &SessionAffinityConfig {
        &self.config
    }

    pub fn policy(&self) -> SessionAffinityPolicy {
        self.policy
    }

    pub fn failure_policy(&self) -> AffinityFailurePolicy {
        self.failure_policy
    }
}

use std::{fmt, str::FromStr};

use http::StatusCode;

use crate::core::affinity::AffinityStatus;

/// What to do when a request's affinity cannot be honoured
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AffinityFailurePolicy {
    /// Drop the affinity and pick from every available destination
    #[default]
    Redistribute,
    /// Stop the request with `503 Service Unavailable`
    Return503Error,
}

/// Result of applying a failure policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicyOutcome {
    Continue,
    Reject(StatusCode),
}

impl AffinityFailurePolicy {
    pub const REDISTRIBUTE: &'static str = "Redistribute";
    pub const RETURN_503_ERROR: &'static str = "Return503Error";

    pub fn name(&self) -> &'static str {
        match self {
            Self::Redistribute => Self::REDISTRIBUTE,
            Self::Return503Error => Self::RETURN_503_ERROR,
        }
    }

    /// Only meaningful for `AffinityKeyExtractionFailed` and `DestinationNotFound`.
    pub fn handle(&self, cluster_id: &str, status: AffinityStatus) -> FailurePolicyOutcome {
        debug_assert!(status.is_failure(), "{status:?} is not an affinity failure");

        match self {
            Self::Redistribute => {
                tracing::debug!(
                    cluster.id = %cluster_id,
                    affinity.status = ?status,
                    "Affinity failed, redistributing request"
                );
                FailurePolicyOutcome::Continue
            }
            Self::Return503Error => {
                tracing::info!(
                    cluster.id = %cluster_id,
                    affinity.status = ?status,
                    "Affinity failed, rejecting request"
                );
                FailurePolicyOutcome::Reject(StatusCode::SERVICE_UNAVAILABLE)
            }
        }
    }
}

impl FromStr for AffinityFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case(Self::REDISTRIBUTE) {
            Ok(Self::Redistribute)
        } else if s.eq_ignore_ascii_case(Self::RETURN_503_ERROR) {
            Ok(Self::Return503Error)
        } else {
            Err(format!("No affinity failure policy named '{s}'"))
        }
    }
}

impl fmt::Display for AffinityFailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

use std::sync::Arc;

use rand::Rng;

use crate::core::{context::ProxyContext, destination::DestinationState};

/// Chooses the destination a request is forwarded to.
///
/// `candidates` are the available destinations after session affinity narrowed them and
/// are never empty.
pub trait DestinationPicker: Send + Sync + 'static {
    fn pick(
        &self,
        context: &ProxyContext,
        candidates: &[Arc<DestinationState>],
    ) -> Option<Arc<DestinationState>>;
}

impl<F> DestinationPicker for F
where
    F: Fn(&[Arc<DestinationState>]) -> Option<Arc<DestinationState>> + Send + Sync + 'static,
{
    fn pick(
        &self,
        _context: &ProxyContext,
        candidates: &[Arc<DestinationState>],
    ) -> Option<Arc<DestinationState>> {
        self(candidates)
    }
}

/// Uniformly random choice; the fallback when no other picker is plugged in
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPicker;

impl RandomPicker {
    pub fn new() -> Self {
        Self
    }
}

impl DestinationPicker for RandomPicker {
    fn pick(
        &self,
        _context: &ProxyContext,
        candidates: &[Arc<DestinationState>],
    ) -> Option<Arc<DestinationState>> {
        match candidates.len() {
            0 => None,
            1 => Some(candidates[0].clone()),
            len => Some(candidates[rand::rng().random_range(0..len)].clone()),
        }
    }
}

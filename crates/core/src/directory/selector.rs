use super::criteria::SearchCriteria;
use super::registry::RelayRegistry;
use super::router::OnionRouter;
use crate::crypto::SecureRandom;
use std::sync::Arc;

/// Picks relays from the registry
///
/// Selection among the matching routers is uniform and draws from the
/// injected secure random source. An empty match set yields `None`, never
/// an error.
#[derive(Clone)]
pub struct RelaySelector {
    rng: Arc<dyn SecureRandom>,
}

impl RelaySelector {
    pub fn new(rng: Arc<dyn SecureRandom>) -> Self {
        Self { rng }
    }

    /// Random router matching `criteria`
    pub fn select<'a>(
        &self,
        registry: &'a RelayRegistry,
        criteria: &SearchCriteria,
    ) -> Option<&'a OnionRouter> {
        let candidates = registry.filter(criteria);
        let index = self.rng.random_index(candidates.len())?;
        candidates.get(index).copied()
    }

    /// Every router matching `criteria`
    pub fn select_all<'a>(
        &self,
        registry: &'a RelayRegistry,
        criteria: &SearchCriteria,
    ) -> Vec<&'a OnionRouter> {
        registry.filter(criteria)
    }

    pub fn rng(&self) -> &Arc<dyn SecureRandom> {
        &self.rng
    }
}

impl std::fmt::Debug for RelaySelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelaySelector").finish_non_exhaustive()
    }
}

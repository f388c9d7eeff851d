use super::criteria::SearchCriteria;
use super::router::OnionRouter;
use minitor_common::Fingerprint;
use std::collections::HashMap;

/// In-memory map of the relays in the current consensus
///
/// Records are replaced wholesale when a new consensus is parsed; there are
/// no partial updates.
#[derive(Debug, Clone, Default)]
pub struct RelayRegistry {
    routers: HashMap<Fingerprint, OnionRouter>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_routers(routers: impl IntoIterator<Item = OnionRouter>) -> Self {
        let mut registry = Self::new();
        for router in routers {
            registry.insert(router);
        }
        registry
    }

    /// Inserts a router, replacing any record with the same fingerprint
    pub fn insert(&mut self, router: OnionRouter) {
        self.routers.insert(router.fingerprint, router);
    }

    pub fn clear(&mut self) {
        self.routers.clear();
    }

    pub fn len(&self) -> usize {
        self.routers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&OnionRouter> {
        self.routers.get(fingerprint)
    }

    /// First router carrying `name`; nicknames are not unique
    pub fn by_name(&self, name: &str) -> Option<&OnionRouter> {
        let mut named: Vec<&OnionRouter> = self.routers.values().filter(|r| r.name == name).collect();
        named.sort_by_key(|r| r.fingerprint);
        named.into_iter().next()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OnionRouter> {
        self.routers.values()
    }

    /// Routers matching `criteria`, ordered by fingerprint
    pub fn filter(&self, criteria: &SearchCriteria) -> Vec<&OnionRouter> {
        let mut matches: Vec<&OnionRouter> =
            self.routers.values().filter(|r| criteria.matches(r)).collect();
        matches.sort_by_key(|r| r.fingerprint);
        matches
    }
}

use super::router::{OnionRouter, RouterFlags};
use minitor_common::Fingerprint;
use std::collections::HashSet;

/// Filter for relay queries
///
/// Each field is an independent predicate; a router matches when all of
/// them hold. Empty port sets accept any port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchCriteria {
    pub allowed_dir_ports: HashSet<u16>,
    pub allowed_or_ports: HashSet<u16>,
    pub forbidden: HashSet<Fingerprint>,
    pub flags: RouterFlags,
}

impl SearchCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dir_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.allowed_dir_ports = ports.into_iter().collect();
        self
    }

    pub fn with_or_ports(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.allowed_or_ports = ports.into_iter().collect();
        self
    }

    pub fn with_flags(mut self, flags: RouterFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn forbid(mut self, fingerprint: Fingerprint) -> Self {
        self.forbidden.insert(fingerprint);
        self
    }

    pub fn forbid_all<'a>(mut self, fingerprints: impl IntoIterator<Item = &'a Fingerprint>) -> Self {
        self.forbidden.extend(fingerprints);
        self
    }

    pub fn matches(&self, router: &OnionRouter) -> bool {
        (self.allowed_dir_ports.is_empty() || self.allowed_dir_ports.contains(&router.dir_port))
            && (self.allowed_or_ports.is_empty() || self.allowed_or_ports.contains(&router.or_port))
            && !self.forbidden.contains(&router.fingerprint)
            && router.flags.satisfies(self.flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn router(id: u8, or_port: u16, dir_port: u16, flags: RouterFlags) -> OnionRouter {
        OnionRouter::new(
            Fingerprint::from_bytes([id; 20]),
            format!("r{id}"),
            Ipv4Addr::new(10, 0, 0, id),
            or_port,
            dir_port,
            flags,
        )
    }

    #[test]
    fn empty_criteria_match_everything() {
        assert!(SearchCriteria::new().matches(&router(1, 9001, 0, RouterFlags::empty())));
    }

    #[test]
    fn predicates_intersect() {
        let criteria = SearchCriteria::new()
            .with_or_ports([443])
            .with_dir_ports([80])
            .with_flags(RouterFlags::GUARD | RouterFlags::RUNNING);

        assert!(criteria.matches(&router(1, 443, 80, RouterFlags::GUARD | RouterFlags::RUNNING | RouterFlags::FAST)));
        assert!(!criteria.matches(&router(2, 9001, 80, RouterFlags::GUARD | RouterFlags::RUNNING)));
        assert!(!criteria.matches(&router(3, 443, 9030, RouterFlags::GUARD | RouterFlags::RUNNING)));
        assert!(!criteria.matches(&router(4, 443, 80, RouterFlags::GUARD)));
    }

    #[test]
    fn forbidden_routers_are_excluded() {
        let r = router(5, 443, 0, RouterFlags::empty());
        let criteria = SearchCriteria::new().forbid(r.fingerprint);
        assert!(!criteria.matches(&r));
    }
}

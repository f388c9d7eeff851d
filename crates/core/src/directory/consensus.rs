/// Consensus acquisition and the queries built on it
///
/// The consensus is loaded from a cache file when one is present and still
/// valid, and otherwise downloaded from a random directory authority,
/// trying each directory path in turn.
use super::authority::{DirectoryAuthority, DEFAULT_AUTHORITIES};
use super::criteria::SearchCriteria;
use super::descriptor::{DescriptorSource, ServerDescriptor};
use super::document::ConsensusDocument;
use super::fetch::{DirectoryFetcher, HttpDirectoryFetcher};
use super::registry::RelayRegistry;
use super::router::{OnionRouter, RouterFlags};
use super::selector::RelaySelector;
use crate::crypto::SecureRandom;
use async_trait::async_trait;
use minitor_common::config::directory::{
    CONSENSUS_PATHS, DEFAULT_ALLOWED_DIR_PORTS, DEFAULT_MAX_TRY_COUNT, DESCRIPTOR_BATCH_SIZE,
    SERVER_DESCRIPTOR_PATH,
};
use minitor_common::{ClientConfig, Fingerprint, Result, Timestamp, TorError};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Consensus<F: DirectoryFetcher = HttpDirectoryFetcher> {
    fetcher: F,
    selector: RelaySelector,
    authorities: Vec<DirectoryAuthority>,
    registry: RelayRegistry,
    valid_after: Option<Timestamp>,
    valid_until: Option<Timestamp>,
    shared_rand_current: Option<[u8; 32]>,
    shared_rand_previous: Option<[u8; 32]>,
    allowed_dir_ports: HashSet<u16>,
    allowed_dir_flags: RouterFlags,
    max_try_count: usize,
    /// ed25519 identities learned from server descriptors
    ed25519_identities: HashMap<Fingerprint, [u8; 32]>,
}

impl<F: DirectoryFetcher> Consensus<F> {
    /// Empty consensus; call [`Consensus::acquire`] to populate it
    pub fn new(fetcher: F, rng: Arc<dyn SecureRandom>) -> Self {
        Self {
            fetcher,
            selector: RelaySelector::new(rng),
            authorities: DEFAULT_AUTHORITIES.to_vec(),
            registry: RelayRegistry::new(),
            valid_after: None,
            valid_until: None,
            shared_rand_current: None,
            shared_rand_previous: None,
            allowed_dir_ports: DEFAULT_ALLOWED_DIR_PORTS.into_iter().collect(),
            allowed_dir_flags: RouterFlags::V2DIR | RouterFlags::RUNNING | RouterFlags::VALID,
            max_try_count: DEFAULT_MAX_TRY_COUNT,
            ed25519_identities: HashMap::new(),
        }
    }

    pub fn from_config(fetcher: F, rng: Arc<dyn SecureRandom>, config: &ClientConfig) -> Self {
        let mut consensus = Self::new(fetcher, rng);
        consensus.set_allowed_dir_ports(config.allowed_dir_ports.iter().copied());
        consensus.set_max_try_count(config.max_try_count);
        consensus
    }

    /// Loads a usable consensus, from `cache_path` when possible
    ///
    /// A missing cache file forces a download. A cached document whose
    /// `valid-until` has passed is discarded and downloaded again, while a
    /// fresh download is trusted regardless of its validity window. After a
    /// download the raw document overwrites the cache file.
    pub async fn acquire(&mut self, cache_path: Option<&Path>, force_download: bool) -> Result<()> {
        let mut force = force_download || !cache_path.is_some_and(|p| p.exists());

        loop {
            if force {
                let document = self.download_consensus().await.ok_or(TorError::NoConsensus)?;
                let count = self.parse_consensus(&document, false);
                if count == 0 {
                    warn!("Downloaded consensus lists no usable routers");
                    return Err(TorError::NoConsensus);
                }
                info!("Downloaded consensus with {} routers", count);

                if let Some(path) = cache_path {
                    if let Err(e) = tokio::fs::write(path, document.as_bytes()).await {
                        warn!("Failed to write consensus cache {}: {}", path.display(), e);
                    }
                }
                return Ok(());
            }

            let Some(path) = cache_path else {
                force = true;
                continue;
            };
            let document = match tokio::fs::read(path).await {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    warn!("Failed to read consensus cache {}: {}", path.display(), e);
                    force = true;
                    continue;
                }
            };

            let count = self.parse_consensus(&document, true);
            if count > 0 && self.is_usable_at(Timestamp::now()) {
                info!("Loaded cached consensus with {} routers", count);
                return Ok(());
            }
            debug!("Cached consensus is stale or empty; downloading");
            force = true;
        }
    }

    /// First non-empty body among the consensus paths, in order
    async fn download_consensus(&self) -> Option<String> {
        for path in CONSENSUS_PATHS {
            if let Some(body) = self.download_from_random_router(path, true).await {
                debug!("Consensus obtained from {}", path);
                return Some(String::from_utf8_lossy(&body).into_owned());
            }
            warn!("No consensus from {}", path);
        }
        None
    }

    /// Fetches `path` from a random directory, retrying while the body is empty
    ///
    /// Authorities are used when `only_authorities` is set or the registry
    /// is still empty; otherwise any relay matching the directory criteria.
    pub async fn download_from_random_router(&self, path: &str, only_authorities: bool) -> Option<Vec<u8>> {
        for attempt in 1..=self.max_try_count {
            let addr = self.pick_directory(only_authorities)?;
            debug!("Directory request {} to {} (attempt {})", path, addr, attempt);
            match self.fetcher.fetch(addr, path).await {
                Ok(body) if !body.is_empty() => return Some(body),
                Ok(_) => debug!("Empty response from {}", addr),
                Err(e) => debug!("Directory request to {} failed: {}", addr, e),
            }
        }
        None
    }

    fn pick_directory(&self, only_authorities: bool) -> Option<SocketAddr> {
        if !only_authorities && !self.registry.is_empty() {
            let criteria = SearchCriteria::new()
                .with_dir_ports(self.allowed_dir_ports.iter().copied())
                .with_flags(self.allowed_dir_flags);
            if let Some(addr) = self
                .selector
                .select(&self.registry, &criteria)
                .and_then(OnionRouter::dir_addr)
            {
                return Some(addr);
            }
        }
        let index = self.selector.rng().random_index(self.authorities.len())?;
        Some(self.authorities[index].dir_addr())
    }

    /// Replaces the registry with the routers of `text`
    ///
    /// With `reject_invalid`, a document whose `valid-until` has passed
    /// leaves the registry empty. Returns the number of routers loaded.
    pub fn parse_consensus(&mut self, text: &str, reject_invalid: bool) -> usize {
        self.registry.clear();
        self.ed25519_identities.clear();

        let document = ConsensusDocument::parse(text);
        self.valid_after = document.valid_after;
        self.valid_until = document.valid_until;
        self.shared_rand_current = document.shared_rand_current;
        self.shared_rand_previous = document.shared_rand_previous;

        if reject_invalid && !document.is_valid_at(Timestamp::now()) {
            debug!("Rejecting consensus valid until {:?}", document.valid_until);
            return 0;
        }
        if document.skipped_entries > 0 {
            debug!("Skipped {} malformed consensus entries", document.skipped_entries);
        }

        for router in document.routers {
            self.registry.insert(router);
        }
        self.registry.len()
    }

    pub fn is_usable_at(&self, now: Timestamp) -> bool {
        self.valid_until.is_some_and(|until| until >= now)
    }

    pub fn registry(&self) -> &RelayRegistry {
        &self.registry
    }

    pub fn selector(&self) -> &RelaySelector {
        &self.selector
    }

    pub fn valid_after(&self) -> Option<Timestamp> {
        self.valid_after
    }

    pub fn valid_until(&self) -> Option<Timestamp> {
        self.valid_until
    }

    pub fn shared_rand_current(&self) -> Option<[u8; 32]> {
        self.shared_rand_current
    }

    pub fn shared_rand_previous(&self) -> Option<[u8; 32]> {
        self.shared_rand_previous
    }

    pub fn get_onion_router_by_name(&self, name: &str) -> Option<&OnionRouter> {
        self.registry.by_name(name)
    }

    pub fn get_onion_router_by_identity_fingerprint(&self, fingerprint: &Fingerprint) -> Option<&OnionRouter> {
        self.registry.get(fingerprint)
    }

    pub fn get_onion_routers_by_criteria(&self, criteria: &SearchCriteria) -> Vec<&OnionRouter> {
        self.selector.select_all(&self.registry, criteria)
    }

    pub fn get_random_onion_router_by_criteria(&self, criteria: &SearchCriteria) -> Option<&OnionRouter> {
        self.selector.select(&self.registry, criteria)
    }

    /// Server descriptor of one relay
    pub async fn get_onion_router_descriptor(&self, fingerprint: &Fingerprint) -> Result<ServerDescriptor> {
        let path = format!("{}{}", SERVER_DESCRIPTOR_PATH, fingerprint.to_hex());
        let body = self
            .download_from_random_router(&path, false)
            .await
            .ok_or_else(|| TorError::directory(format!("no descriptor for {fingerprint}")))?;
        ServerDescriptor::parse(&String::from_utf8_lossy(&body))
            .ok_or_else(|| TorError::directory(format!("unparseable descriptor for {fingerprint}")))
    }

    /// ed25519 identities of every `HSDir` relay, fetching the missing ones
    pub async fn hsdir_identities(&mut self) -> Result<Vec<(Fingerprint, [u8; 32])>> {
        let hsdirs: Vec<Fingerprint> = self
            .registry
            .filter(&SearchCriteria::new().with_flags(RouterFlags::HSDIR | RouterFlags::RUNNING))
            .into_iter()
            .map(|r| r.fingerprint)
            .collect();
        let missing: Vec<Fingerprint> = hsdirs
            .iter()
            .filter(|fp| !self.ed25519_identities.contains_key(fp))
            .copied()
            .collect();

        if !missing.is_empty() {
            info!("Fetching descriptors of {} HSDir relays", missing.len());
        }
        for batch in missing.chunks(DESCRIPTOR_BATCH_SIZE) {
            let ids: Vec<String> = batch.iter().map(Fingerprint::to_hex).collect();
            let path = format!("{}{}", SERVER_DESCRIPTOR_PATH, ids.join("+"));
            let Some(body) = self.download_from_random_router(&path, false).await else {
                warn!("Descriptor batch of {} relays could not be fetched", batch.len());
                continue;
            };
            for descriptor in ServerDescriptor::parse_all(&String::from_utf8_lossy(&body)) {
                if let (Some(fp), Some(ed)) = (descriptor.fingerprint, descriptor.ed25519_identity) {
                    self.ed25519_identities.insert(fp, ed);
                }
            }
        }

        let known: Vec<(Fingerprint, [u8; 32])> = hsdirs
            .into_iter()
            .filter_map(|fp| self.ed25519_identities.get(&fp).map(|ed| (fp, *ed)))
            .collect();
        if known.is_empty() {
            return Err(TorError::onion("no HSDir identities available"));
        }
        Ok(known)
    }

    pub fn allowed_dir_flags(&self) -> RouterFlags {
        self.allowed_dir_flags
    }

    pub fn set_allowed_dir_flags(&mut self, flags: RouterFlags) {
        self.allowed_dir_flags = flags;
    }

    pub fn allowed_dir_ports(&self) -> &HashSet<u16> {
        &self.allowed_dir_ports
    }

    pub fn set_allowed_dir_ports(&mut self, ports: impl IntoIterator<Item = u16>) {
        self.allowed_dir_ports = ports.into_iter().collect();
    }

    pub fn max_try_count(&self) -> usize {
        self.max_try_count
    }

    pub fn set_max_try_count(&mut self, count: usize) {
        self.max_try_count = count.max(1);
    }
}

#[async_trait]
impl<F: DirectoryFetcher> DescriptorSource for Consensus<F> {
    async fn server_descriptor(&self, fingerprint: &Fingerprint) -> Result<ServerDescriptor> {
        self.get_onion_router_descriptor(fingerprint).await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockFetcher;
    use super::*;
    use crate::crypto::random::testing::SeededRandom;
    use crate::directory::descriptor::testing::render_descriptor;
    use crate::directory::document::testing::{render_consensus, TestRelay};

    const STALE: (&str, &str) = ("2000-01-01 00:00:00", "2000-01-01 03:00:00");
    const FRESH: (&str, &str) = ("2024-01-01 00:00:00", "2999-01-01 00:00:00");

    fn relays(ids: std::ops::RangeInclusive<u8>) -> Vec<TestRelay> {
        ids.map(|i| TestRelay::new(i, 443, 80, "Fast Guard HSDir Running Stable V2Dir Valid"))
            .collect()
    }

    fn doc(window: (&str, &str), ids: std::ops::RangeInclusive<u8>) -> String {
        render_consensus(window.0, window.1, &relays(ids))
    }

    fn consensus(fetcher: MockFetcher) -> Consensus<MockFetcher> {
        Consensus::new(fetcher, Arc::new(SeededRandom::new(3)))
    }

    #[tokio::test]
    async fn stale_cache_triggers_download() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("consensus");
        std::fs::write(&cache, doc(STALE, 1..=3)).unwrap();

        let fresh = doc(FRESH, 10..=14);
        let served = fresh.clone();
        let mut consensus = consensus(MockFetcher::new(move |_| Ok(served.clone().into_bytes())));
        consensus.acquire(Some(&cache), false).await.unwrap();

        assert_eq!(consensus.registry().len(), 5);
        assert!(consensus
            .get_onion_router_by_identity_fingerprint(&Fingerprint::from_bytes([10; 20]))
            .is_some());
        assert_eq!(consensus.fetcher.paths().len(), 1);
        assert_eq!(std::fs::read_to_string(&cache).unwrap(), fresh);
    }

    #[tokio::test]
    async fn valid_cache_is_used_without_download() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("consensus");
        std::fs::write(&cache, doc(FRESH, 1..=3)).unwrap();

        let mut consensus = consensus(MockFetcher::failing());
        consensus.acquire(Some(&cache), false).await.unwrap();

        assert_eq!(consensus.registry().len(), 3);
        assert!(consensus.fetcher.paths().is_empty());
    }

    #[tokio::test]
    async fn expired_download_is_trusted() {
        let stale = doc(STALE, 1..=2);
        let mut consensus = consensus(MockFetcher::new(move |_| Ok(stale.clone().into_bytes())));
        consensus.acquire(None, true).await.unwrap();

        assert_eq!(consensus.registry().len(), 2);
        assert!(!consensus.is_usable_at(Timestamp::now()));
    }

    #[tokio::test]
    async fn missing_cache_behaves_like_forced_download() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent");

        let mut unforced = consensus(MockFetcher::failing());
        let mut forced = consensus(MockFetcher::failing());
        let a = unforced.acquire(Some(&missing), false).await;
        let b = forced.acquire(None, true).await;
        let mut none = consensus(MockFetcher::failing());
        let c = none.acquire(None, false).await;

        assert!(matches!(a, Err(TorError::NoConsensus)));
        assert!(matches!(b, Err(TorError::NoConsensus)));
        assert!(matches!(c, Err(TorError::NoConsensus)));
        assert_eq!(unforced.fetcher.paths(), forced.fetcher.paths());
        assert_eq!(unforced.fetcher.paths().len(), CONSENSUS_PATHS.len() * DEFAULT_MAX_TRY_COUNT);
        assert!(!missing.exists());
    }

    #[tokio::test]
    async fn falls_back_through_paths_in_order() {
        let fresh = doc(FRESH, 1..=4);
        let mut consensus = consensus(MockFetcher::new(move |path| {
            if path.ends_with("consensus-microdesc") {
                Ok(fresh.clone().into_bytes())
            } else {
                Ok(Vec::new())
            }
        }));
        consensus.set_max_try_count(2);
        consensus.acquire(None, true).await.unwrap();

        let expected: Vec<String> = CONSENSUS_PATHS[..3]
            .iter()
            .flat_map(|p| [p.to_string(), p.to_string()])
            .chain(std::iter::once(CONSENSUS_PATHS[3].to_string()))
            .collect();
        assert_eq!(consensus.fetcher.paths(), expected);

        let authorities: HashSet<SocketAddr> =
            DEFAULT_AUTHORITIES.iter().map(|a| a.dir_addr()).collect();
        assert!(consensus
            .fetcher
            .calls
            .lock()
            .unwrap()
            .iter()
            .all(|(addr, _)| authorities.contains(addr)));
    }

    #[tokio::test]
    async fn cached_document_without_routers_forces_download() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("consensus");
        std::fs::write(&cache, render_consensus(FRESH.0, FRESH.1, &[])).unwrap();

        let fresh = doc(FRESH, 1..=2);
        let mut consensus = consensus(MockFetcher::new(move |_| Ok(fresh.clone().into_bytes())));
        consensus.acquire(Some(&cache), false).await.unwrap();
        assert_eq!(consensus.registry().len(), 2);
    }

    #[tokio::test]
    async fn descriptors_come_from_directory_relays() {
        let mut consensus = consensus(MockFetcher::new(|_| {
            Ok(render_descriptor("relay1", 1, [5; 32], [6; 32]).into_bytes())
        }));
        consensus.parse_consensus(&doc(FRESH, 1..=3), false);

        let fp = Fingerprint::from_bytes([1; 20]);
        let descriptor = consensus.get_onion_router_descriptor(&fp).await.unwrap();
        assert_eq!(descriptor.ntor_onion_key, Some([5; 32]));

        let calls = consensus.fetcher.calls.lock().unwrap().clone();
        assert_eq!(calls[0].1, format!("{SERVER_DESCRIPTOR_PATH}{}", fp.to_hex()));
        let relay_addrs: HashSet<SocketAddr> =
            consensus.registry().iter().filter_map(OnionRouter::dir_addr).collect();
        assert!(relay_addrs.contains(&calls[0].0));
    }

    #[tokio::test]
    async fn hsdir_identities_are_fetched_in_batches_and_cached() {
        let mut consensus = consensus(MockFetcher::new(|path| {
            let ids = path.trim_start_matches(SERVER_DESCRIPTOR_PATH);
            let body: String = ids
                .split('+')
                .map(|hex| {
                    let fp = Fingerprint::from_hex(hex).unwrap();
                    let id = fp.as_bytes()[0];
                    render_descriptor("hsdir", id, [id; 32], [id.wrapping_add(100); 32])
                })
                .collect();
            Ok(body.into_bytes())
        }));
        consensus.parse_consensus(&doc(FRESH, 1..=5), false);

        let ids = consensus.hsdir_identities().await.unwrap();
        assert_eq!(ids.len(), 5);
        assert!(ids.contains(&(Fingerprint::from_bytes([2; 20]), [102; 32])));

        consensus.hsdir_identities().await.unwrap();
        assert_eq!(consensus.fetcher.paths().len(), 1);
    }

    #[tokio::test]
    async fn directory_flags_nobody_has_fall_back_to_authorities() {
        let mut consensus = consensus(MockFetcher::new(|_| {
            Ok(render_descriptor("relay1", 1, [5; 32], [6; 32]).into_bytes())
        }));
        consensus.parse_consensus(&doc(FRESH, 1..=3), false);
        consensus.set_allowed_dir_flags(RouterFlags::EXIT | RouterFlags::V2DIR);
        assert_eq!(consensus.allowed_dir_flags(), RouterFlags::EXIT | RouterFlags::V2DIR);

        let fp = Fingerprint::from_bytes([1; 20]);
        consensus.get_onion_router_descriptor(&fp).await.unwrap();

        let calls = consensus.fetcher.calls.lock().unwrap().clone();
        let authorities: HashSet<SocketAddr> =
            DEFAULT_AUTHORITIES.iter().map(DirectoryAuthority::dir_addr).collect();
        assert!(authorities.contains(&calls[0].0));
    }

    #[test]
    fn criteria_queries_honor_forbidden_routers() {
        let mut consensus = consensus(MockFetcher::failing());
        consensus.parse_consensus(&doc(FRESH, 1..=4), false);

        let forbidden = Fingerprint::from_bytes([2; 20]);
        let criteria = SearchCriteria::new()
            .with_flags(RouterFlags::GUARD)
            .forbid(forbidden);
        let found = consensus.get_onion_routers_by_criteria(&criteria);
        assert_eq!(found.len(), 3);
        assert!(found.iter().all(|r| r.fingerprint != forbidden));

        let none = SearchCriteria::new().with_flags(RouterFlags::EXIT);
        assert!(consensus.get_onion_routers_by_criteria(&none).is_empty());
        assert!(consensus.get_random_onion_router_by_criteria(&none).is_none());
        assert_eq!(
            consensus
                .get_onion_router_by_identity_fingerprint(&forbidden)
                .map(|r| r.name.as_str()),
            Some("relay2")
        );
    }

    #[test]
    fn parse_with_rejection_leaves_registry_empty() {
        let mut consensus = consensus(MockFetcher::failing());
        assert_eq!(consensus.parse_consensus(&doc(STALE, 1..=3), true), 0);
        assert!(consensus.registry().is_empty());
        assert_eq!(consensus.parse_consensus(&doc(STALE, 1..=3), false), 3);
    }
}

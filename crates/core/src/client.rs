/// The client facade: one consensus, one circuit, streams over it
///
/// `TorClient::bootstrap` acquires the consensus; circuits are then built
/// either relay by relay or in one go with `build_circuit`, and streams are
/// opened over whatever circuit is current.
use crate::circuit::{CircuitBuilder, CircuitConnector, CircuitState};
use crate::crypto::{OsRandom, SecureRandom};
use crate::directory::{Consensus, DirectoryFetcher, HttpDirectoryFetcher, OnionRouter, RouterFlags};
use crate::protocol::TorConnector;
use crate::service::OnionServiceClient;
use crate::stream::{AppStream, StreamMultiplexer, StreamTarget};
use crate::transport::HttpResponse;
use minitor_common::config::circuit::BUILD_ATTEMPTS;
use minitor_common::{ClientConfig, Fingerprint, Result, TorError};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct TorClient<C: CircuitConnector = TorConnector, F: DirectoryFetcher = HttpDirectoryFetcher> {
    // Field order matters: the circuit goes before the consensus it was built from
    builder: CircuitBuilder<C>,
    consensus: Consensus<F>,

    /// Relays already on the current circuit
    forbidden: HashSet<Fingerprint>,
    rng: Arc<dyn SecureRandom>,
    config: ClientConfig,
}

impl TorClient {
    /// Acquires a consensus over the network, honoring the cache settings
    pub async fn bootstrap(config: ClientConfig) -> Result<Self> {
        let rng: Arc<dyn SecureRandom> = Arc::new(OsRandom);
        let fetcher = HttpDirectoryFetcher::new(config.connect_timeout(), config.io_timeout());
        let connector = TorConnector::new(rng.clone(), config.connect_timeout(), config.io_timeout());
        Self::with_components(config, fetcher, connector, rng).await
    }
}

impl<C: CircuitConnector, F: DirectoryFetcher> TorClient<C, F> {
    /// Like [`TorClient::bootstrap`] with caller-supplied transports
    pub async fn with_components(
        config: ClientConfig,
        fetcher: F,
        connector: C,
        rng: Arc<dyn SecureRandom>,
    ) -> Result<Self> {
        let mut consensus = Consensus::from_config(fetcher, rng.clone(), &config);
        consensus
            .acquire(config.cache_path.as_deref(), config.force_download)
            .await?;
        info!(
            "Consensus ready with {} routers",
            consensus.registry().len()
        );

        Ok(Self {
            builder: CircuitBuilder::new(Arc::new(connector)),
            consensus,
            forbidden: HashSet::new(),
            rng,
            config,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn consensus(&self) -> &Consensus<F> {
        &self.consensus
    }

    pub fn state(&self) -> CircuitState {
        self.builder.state()
    }

    pub fn hop_count(&self) -> usize {
        self.builder.hop_count()
    }

    /// Every relay in the consensus, by nickname
    pub fn routers(&self) -> Vec<&OnionRouter> {
        let mut routers: Vec<&OnionRouter> = self.consensus.registry().iter().collect();
        routers.sort_by(|a, b| a.name.cmp(&b.name).then(a.fingerprint.cmp(&b.fingerprint)));
        routers
    }

    /// Adds `router` as the next hop; a failure leaves no circuit at all
    pub async fn extend_to(&mut self, router: &OnionRouter) -> Result<()> {
        let result = self.builder.extend_to(router, &self.consensus).await;
        match &result {
            Ok(()) => {
                self.forbidden.insert(router.fingerprint);
            }
            Err(_) => self.forbidden.clear(),
        }
        result
    }

    pub async fn extend_to_name(&mut self, name: &str) -> Result<()> {
        let router = self
            .consensus
            .get_onion_router_by_name(name)
            .cloned()
            .ok_or_else(|| TorError::RouterNotFound(name.to_string()))?;
        self.extend_to(&router).await
    }

    /// Adds a random relay with `flags`; `Ok(false)` when none qualifies
    pub async fn extend_to_random(&mut self, flags: RouterFlags, or_ports: &[u16]) -> Result<bool> {
        let result = self
            .builder
            .extend_to_random(&self.consensus, &mut self.forbidden, flags, or_ports)
            .await;
        if self.builder.state() == CircuitState::Empty {
            self.forbidden.clear();
        }
        result
    }

    /// Replaces the current circuit with a fresh guard-to-exit one
    pub async fn build_circuit(&mut self) -> Result<()> {
        let hops = self.config.hop_count;
        let mut last_error = TorError::CircuitNotEstablished;

        for attempt in 1..=BUILD_ATTEMPTS {
            self.new_circuit().await;
            match self
                .builder
                .build_path(&self.consensus, &mut self.forbidden, hops, true)
                .await
            {
                Ok(()) => {
                    info!("Built {}-hop circuit on attempt {}", hops, attempt);
                    return Ok(());
                }
                Err(err) => {
                    warn!("Circuit attempt {}/{} failed: {}", attempt, BUILD_ATTEMPTS, err);
                    last_error = err;
                }
            }
        }
        self.forbidden.clear();
        Err(last_error)
    }

    /// Drops the current circuit, if any
    pub async fn new_circuit(&mut self) {
        self.builder.release().await;
        self.forbidden.clear();
    }

    /// Opens a stream over the current circuit
    ///
    /// Onion targets first rendezvous with the service, which extends the
    /// circuit by a virtual hop.
    pub async fn open_stream(&mut self, target: &StreamTarget, tls: bool) -> Result<AppStream<'_, C::Circuit>> {
        let connector = self.builder.connector().clone();
        let circuit = self.builder.circuit_mut()?;
        let mut resolver = OnionServiceClient::new(&mut self.consensus, connector, self.rng.clone());
        StreamMultiplexer::new(circuit, &mut resolver)
            .open_stream(target, tls)
            .await
    }

    /// GET `url` over the current circuit
    pub async fn http_get(&mut self, url: &str) -> Result<HttpResponse> {
        let connector = self.builder.connector().clone();
        let circuit = self.builder.circuit_mut()?;
        let mut resolver = OnionServiceClient::new(&mut self.consensus, connector, self.rng.clone());
        StreamMultiplexer::new(circuit, &mut resolver).http_get(url).await
    }

    /// Destroys the circuit before the client goes away
    pub async fn close(mut self) {
        debug!("Closing client");
        self.new_circuit().await;
    }
}

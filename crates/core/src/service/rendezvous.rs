/// Onion service client: descriptor lookup, introduction and rendezvous
///
/// 1. Find the responsible HSDirs on the ring and fetch the descriptor over BEGIN_DIR
/// 2. Turn the last hop of the client's circuit into a rendezvous point
/// 3. Introduce ourselves to the service through one of its introduction points
/// 4. Finish the hs-ntor handshake from RENDEZVOUS2 and add the service as a virtual hop
use super::address::OnionAddress;
use super::descriptor::{HsDescriptor, IntroPoint};
use super::handshake::HsNtorClient;
use super::hsdir::{shared_random_value, HsDirRing};
use super::keyblind::{time_period, ServiceKeys};
use crate::circuit::{CircuitBuilder, CircuitConnector, ExtendTarget, HopInfo, LinkSpecifier, OnionCircuit};
use crate::crypto::{random_array, SecureRandom};
use crate::directory::fetch::directory_body;
use crate::directory::{Consensus, DirectoryFetcher};
use crate::protocol::cell::{RelayCommand, RelayMessage};
use crate::stream::{OnionResolver, TorStream};
use crate::transport::{http, ByteStream, HttpRequest};
use async_trait::async_trait;
use minitor_common::config::directory::{HS_DESCRIPTOR_PATH, MAX_DOCUMENT_SIZE};
use minitor_common::config::onion::MAX_INTRO_ATTEMPTS;
use minitor_common::{Fingerprint, Result, Timestamp, TorError};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const REND_COOKIE_LEN: usize = 20;

/// AUTH_KEY_TYPE of an ed25519 introduction point key
const AUTH_KEY_TYPE_ED25519: u8 = 2;

/// ONION_KEY_TYPE of an ntor key
const ONION_KEY_TYPE_NTOR: u8 = 1;

/// The encrypted part of INTRODUCE1 is padded to at least this size
const INTRODUCE1_PLAINTEXT_MIN: usize = 246;

/// Hops built before the final relay of a temporary circuit
const TEMPORARY_PATH_HOPS: usize = 2;

/// Resolves onion addresses for one client
pub struct OnionServiceClient<'a, C: CircuitConnector, F: DirectoryFetcher> {
    consensus: &'a mut Consensus<F>,
    connector: Arc<C>,
    rng: Arc<dyn SecureRandom>,
}

impl<'a, C: CircuitConnector, F: DirectoryFetcher> OnionServiceClient<'a, C, F> {
    pub fn new(consensus: &'a mut Consensus<F>, connector: Arc<C>, rng: Arc<dyn SecureRandom>) -> Self {
        Self {
            consensus,
            connector,
            rng,
        }
    }

    /// Fetches and decrypts the service's current descriptor
    pub async fn fetch_descriptor(&mut self, keys: &ServiceKeys, valid_after: Timestamp) -> Result<HsDescriptor> {
        let srv = shared_random_value(
            self.consensus.shared_rand_current(),
            self.consensus.shared_rand_previous(),
            valid_after,
            keys.period,
        );
        let hsdirs = self.consensus.hsdir_identities().await?;
        let ring = HsDirRing::new(&hsdirs, &srv, keys.period);
        let responsible = ring.responsible(&keys.blinded_key, keys.period);
        debug!("{} of {} HSDirs responsible for the descriptor", responsible.len(), ring.len());

        let path = format!(
            "{}{}",
            HS_DESCRIPTOR_PATH,
            data_encoding::BASE64_NOPAD.encode(&keys.blinded_key)
        );
        for fingerprint in responsible {
            match self.fetch_from_hsdir(&fingerprint, &path, keys).await {
                Ok(descriptor) => return Ok(descriptor),
                Err(err) => warn!("HSDir ${} could not serve {}: {}", fingerprint, path, err),
            }
        }
        Err(TorError::onion("no responsible HSDir returned a usable descriptor"))
    }

    async fn fetch_from_hsdir(
        &self,
        fingerprint: &Fingerprint,
        path: &str,
        keys: &ServiceKeys,
    ) -> Result<HsDescriptor> {
        let router = self
            .consensus
            .get_onion_router_by_identity_fingerprint(fingerprint)
            .cloned()
            .ok_or_else(|| TorError::RouterNotFound(fingerprint.to_hex()))?;
        let descriptor = self.consensus.get_onion_router_descriptor(fingerprint).await?;
        let target = ExtendTarget::from_router(&router, &descriptor)?;

        let mut circuit = self.temporary_circuit(&target).await?;
        let result = download(&mut circuit, &router.ip.to_string(), path).await;
        if let Err(err) = circuit.destroy().await {
            debug!("Error while destroying directory circuit: {}", err);
        }

        let body = result?;
        HsDescriptor::decrypt(&String::from_utf8_lossy(&body), keys)
    }

    /// Guard and middle relays followed by `target`
    async fn temporary_circuit(&self, target: &ExtendTarget) -> Result<C::Circuit> {
        let mut builder = CircuitBuilder::new(self.connector.clone());
        let mut forbidden: HashSet<Fingerprint> = HashSet::from([target.fingerprint]);
        builder
            .build_path(&*self.consensus, &mut forbidden, TEMPORARY_PATH_HOPS, false)
            .await?;
        builder.extend_to_target(target).await?;
        builder.take_circuit().ok_or(TorError::CircuitNotEstablished)
    }

    /// Link specifiers and ntor key of the circuit's last hop
    async fn rendezvous_point(&self, hop: HopInfo) -> Result<ExtendTarget> {
        if hop.is_virtual {
            return Err(TorError::onion("circuit already ends at an onion service"));
        }

        let ntor_onion_key = match (hop.ntor_onion_key, hop.fingerprint) {
            (Some(key), _) => key,
            (None, Some(fingerprint)) => self
                .consensus
                .get_onion_router_descriptor(&fingerprint)
                .await?
                .ntor_onion_key
                .ok_or_else(|| TorError::onion(format!("rendezvous point {hop} has no ntor key")))?,
            (None, None) => {
                return Err(TorError::onion(format!("rendezvous point {hop} is unknown")));
            }
        };
        ExtendTarget::from_link_specifiers(hop.link_specifiers, ntor_onion_key)
    }

    /// Sends INTRODUCE1 through each introduction point until one is acknowledged
    async fn introduce(
        &self,
        descriptor: &HsDescriptor,
        keys: &ServiceKeys,
        cookie: &[u8; REND_COOKIE_LEN],
        rendezvous_point: &ExtendTarget,
    ) -> Result<HsNtorClient> {
        let mut last_error = TorError::onion("descriptor lists no introduction points");
        for (attempt, intro) in descriptor
            .intro_points
            .iter()
            .take(MAX_INTRO_ATTEMPTS)
            .enumerate()
        {
            debug!("Introduction attempt {} via {:?}", attempt + 1, intro.link_specifiers);
            match self.introduce_via(intro, keys, cookie, rendezvous_point).await {
                Ok(handshake) => return Ok(handshake),
                Err(err) => {
                    warn!("Introduction attempt {} failed: {}", attempt + 1, err);
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }

    async fn introduce_via(
        &self,
        intro: &IntroPoint,
        keys: &ServiceKeys,
        cookie: &[u8; REND_COOKIE_LEN],
        rendezvous_point: &ExtendTarget,
    ) -> Result<HsNtorClient> {
        let target = intro.extend_target()?;
        let handshake = HsNtorClient::new(&*self.rng, intro.enc_key, intro.auth_key, keys.subcredential);
        let body = handshake.seal_introduce(
            &introduce1_header(&intro.auth_key),
            introduce1_plaintext(cookie, rendezvous_point),
        )?;

        let mut circuit = self.temporary_circuit(&target).await?;
        let result = async {
            circuit
                .send_relay(RelayMessage::new(RelayCommand::Introduce1, 0, body))
                .await?;
            wait_for(&mut circuit, RelayCommand::IntroduceAck).await
        }
        .await;
        if let Err(err) = circuit.destroy().await {
            debug!("Error while destroying introduction circuit: {}", err);
        }

        let ack = result?;
        let status = match ack.data.get(..2) {
            Some(status) => u16::from_be_bytes([status[0], status[1]]),
            None => return Err(TorError::onion("short INTRODUCE_ACK")),
        };
        if status != 0 {
            return Err(TorError::onion(format!("introduction refused with status {status}")));
        }
        Ok(handshake)
    }
}

#[async_trait]
impl<'a, C: CircuitConnector, F: DirectoryFetcher> OnionResolver for OnionServiceClient<'a, C, F> {
    async fn rendezvous(&mut self, circuit: &mut dyn OnionCircuit, address: &OnionAddress) -> Result<()> {
        let public_key = *address.public_key().ok_or_else(|| {
            TorError::Unsupported(format!("{address}: version 2 onion services are no longer served"))
        })?;

        let valid_after = self.consensus.valid_after().unwrap_or_else(Timestamp::now);
        let keys = ServiceKeys::derive(&public_key, time_period(valid_after))?;
        let descriptor = self.fetch_descriptor(&keys, valid_after).await?;
        info!(
            "Fetched descriptor of {} with {} introduction points",
            address,
            descriptor.intro_points.len()
        );

        let last_hop = circuit
            .hops()
            .last()
            .cloned()
            .ok_or(TorError::CircuitNotEstablished)?;
        let rendezvous_point = self.rendezvous_point(last_hop).await?;
        let cookie: [u8; REND_COOKIE_LEN] = random_array(&*self.rng);
        circuit
            .send_relay(RelayMessage::new(
                RelayCommand::EstablishRendezvous,
                0,
                cookie.to_vec(),
            ))
            .await?;
        wait_for(circuit, RelayCommand::RendezvousEstablished).await?;
        info!("Rendezvous point {} established", rendezvous_point.name);

        let handshake = self
            .introduce(&descriptor, &keys, &cookie, &rendezvous_point)
            .await?;
        let rendezvous2 = wait_for(circuit, RelayCommand::Rendezvous2).await?;
        let crypto = handshake.complete(&rendezvous2.data)?;
        circuit.add_virtual_hop(HopInfo::onion_service(address.to_hostname()), crypto)?;
        info!("Connected to onion service {}", address);
        Ok(())
    }
}

/// Fetches `path` from the directory service of the circuit's last hop
async fn download<O: OnionCircuit + ?Sized>(circuit: &mut O, host: &str, path: &str) -> Result<Vec<u8>> {
    let mut stream = TorStream::begin_dir(circuit).await?;
    let response = http::fetch(&mut stream, &HttpRequest::directory(host, path), MAX_DOCUMENT_SIZE).await;
    if let Err(err) = stream.close().await {
        debug!("Error closing directory stream: {}", err);
    }
    directory_body(path, response?)
}

/// Next circuit-level message of kind `command`
async fn wait_for<O: OnionCircuit + ?Sized>(circuit: &mut O, command: RelayCommand) -> Result<RelayMessage> {
    loop {
        let message = circuit.recv_relay().await?;
        if message.command == command && message.stream_id == 0 {
            return Ok(message);
        }
        debug!(
            "Ignoring {:?} on stream {} while waiting for {:?}",
            message.command, message.stream_id, command
        );
    }
}

/// Cleartext part of INTRODUCE1, up to CLIENT_PK
fn introduce1_header(auth_key: &[u8; 32]) -> Vec<u8> {
    let mut header = vec![0u8; 20];
    header.push(AUTH_KEY_TYPE_ED25519);
    header.extend_from_slice(&(auth_key.len() as u16).to_be_bytes());
    header.extend_from_slice(auth_key);
    header.push(0);
    header
}

/// Encrypted part of INTRODUCE1: cookie and rendezvous point
fn introduce1_plaintext(cookie: &[u8; REND_COOKIE_LEN], rendezvous_point: &ExtendTarget) -> Vec<u8> {
    let mut plaintext = cookie.to_vec();
    plaintext.push(0);
    plaintext.push(ONION_KEY_TYPE_NTOR);
    plaintext.extend_from_slice(&(rendezvous_point.ntor_onion_key.len() as u16).to_be_bytes());
    plaintext.extend_from_slice(&rendezvous_point.ntor_onion_key);
    LinkSpecifier::encode_list(&rendezvous_point.link_specifiers, &mut plaintext);
    if plaintext.len() < INTRODUCE1_PLAINTEXT_MIN {
        plaintext.resize(INTRODUCE1_PLAINTEXT_MIN, 0);
    }
    plaintext
}

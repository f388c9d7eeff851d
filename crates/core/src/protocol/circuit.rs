/// Tor circuits over a link channel
///
/// `TorCircuit` owns its channel: one circuit per link. Relay messages are
/// sealed for the last hop and onion-encrypted hop by hop on the way out;
/// on the way back each layer is peeled until a hop recognizes the cell.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use minitor_common::config::circuit::CIRCUIT_SENDME_INCREMENT;
use minitor_common::config::protocol::CELL_PAYLOAD_LEN;
use minitor_common::{Result, TorError};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, trace, warn};

use super::cell::{Cell, CellCommand, RelayCommand, RelayMessage};
use super::channel::Channel;
use super::handshake::{CreateFastHandshake, NtorHandshake, NTOR_HANDSHAKE_TYPE};
use super::relay_crypto::LayerCrypto;
use crate::circuit::{CircuitConnector, ExtendTarget, HopInfo, LinkSpecifier, OnionCircuit};
use crate::crypto::SecureRandom;
use crate::directory::OnionRouter;
use crate::transport::{connect_relay_link, LinkStream};

/// RELAY_EARLY cells a client may send on one circuit
const MAX_RELAY_EARLY: u8 = 8;

/// DESTROY reason: none given
const DESTROY_REASON_NONE: u8 = 0;

struct Hop {
    crypto: LayerCrypto,
    /// DATA cells received from this hop since the circuit opened
    delivered: u32,
}

pub struct TorCircuit<S = LinkStream> {
    channel: Channel<S>,
    circ_id: u32,
    hops: Vec<Hop>,
    infos: Vec<HopInfo>,
    rng: Arc<dyn SecureRandom>,
    relay_early_left: u8,
    next_stream_id: u16,
    closed: bool,
}

impl<S> TorCircuit<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Creates a one-hop circuit on `channel` with CREATE_FAST
    pub async fn create_fast(
        mut channel: Channel<S>,
        rng: Arc<dyn SecureRandom>,
        first_hop: HopInfo,
    ) -> Result<Self> {
        // Client-initiated ids have the high bit set
        let circ_id = rng.random_u32() | 0x8000_0000;
        let handshake = CreateFastHandshake::new(rng.as_ref());
        debug!("Sending CREATE_FAST on circuit {:#x}", circ_id);
        channel
            .send_cell(&Cell::new(
                circ_id,
                CellCommand::CreateFast,
                handshake.client_payload().to_vec(),
            ))
            .await?;

        let crypto = loop {
            let cell = channel.recv_cell().await?;
            if cell.circ_id != circ_id {
                continue;
            }
            match cell.command {
                CellCommand::CreatedFast => break handshake.complete(&cell.payload)?,
                CellCommand::Destroy => {
                    let reason = cell.payload.first().copied().unwrap_or(0);
                    return Err(TorError::CircuitDestroyed(reason));
                }
                CellCommand::Padding | CellCommand::Vpadding => {}
                other => {
                    return Err(TorError::protocol(format!(
                        "expected CREATED_FAST, got {other:?}"
                    )));
                }
            }
        };

        Ok(Self {
            channel,
            circ_id,
            infos: vec![first_hop],
            hops: vec![Hop {
                crypto,
                delivered: 0,
            }],
            rng,
            relay_early_left: MAX_RELAY_EARLY,
            next_stream_id: 0,
            closed: false,
        })
    }

    pub fn circ_id(&self) -> u32 {
        self.circ_id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed || self.hops.is_empty() {
            return Err(TorError::CircuitNotEstablished);
        }
        Ok(())
    }

    /// Seals `message` for hop `target` and encrypts it through every hop up to it
    async fn send_to_hop(&mut self, target: usize, message: &RelayMessage, early: bool) -> Result<()> {
        self.ensure_open()?;
        let mut payload = message.encode()?;
        self.hops[target].crypto.seal(&mut payload);
        for hop in self.hops[..=target].iter_mut().rev() {
            hop.crypto.encrypt(&mut payload);
        }

        let command = if early && self.relay_early_left > 0 {
            self.relay_early_left -= 1;
            CellCommand::RelayEarly
        } else {
            CellCommand::Relay
        };
        trace!(
            "Sending {:?} on stream {} to hop {}",
            message.command,
            message.stream_id,
            target + 1
        );
        self.channel
            .send_cell(&Cell::new(self.circ_id, command, payload.to_vec()))
            .await
    }

    /// Next recognized relay message and the index of the hop that sent it
    async fn recv_from_hop(&mut self) -> Result<(usize, RelayMessage)> {
        self.ensure_open()?;
        loop {
            let cell = self.channel.recv_cell().await?;
            if cell.circ_id != self.circ_id {
                trace!("Ignoring cell for circuit {:#x}", cell.circ_id);
                continue;
            }
            match cell.command {
                CellCommand::Relay | CellCommand::RelayEarly => {
                    let (hop, message) = self.unwrap_relay(&cell.payload)?;
                    if message.command == RelayCommand::Data {
                        self.account_data(hop).await?;
                    }
                    match message.command {
                        RelayCommand::Drop => continue,
                        RelayCommand::Sendme if message.stream_id == 0 => continue,
                        RelayCommand::Truncated => {
                            let reason = message.data.first().copied().unwrap_or(0);
                            warn!("Circuit truncated after hop {} (reason {})", hop + 1, reason);
                            self.closed = true;
                            return Err(TorError::CircuitDestroyed(reason));
                        }
                        _ => return Ok((hop, message)),
                    }
                }
                CellCommand::Destroy => {
                    let reason = cell.payload.first().copied().unwrap_or(0);
                    warn!("Circuit {:#x} destroyed by relay (reason {})", self.circ_id, reason);
                    self.closed = true;
                    return Err(TorError::CircuitDestroyed(reason));
                }
                CellCommand::Padding | CellCommand::Vpadding => {}
                other => debug!("Ignoring {:?} cell on circuit", other),
            }
        }
    }

    fn unwrap_relay(&mut self, payload: &[u8]) -> Result<(usize, RelayMessage)> {
        let mut body: [u8; CELL_PAYLOAD_LEN] = payload
            .try_into()
            .map_err(|_| TorError::protocol("relay cell with short payload"))?;
        for (index, hop) in self.hops.iter_mut().enumerate() {
            hop.crypto.decrypt(&mut body);
            if hop.crypto.recognize(&body) {
                return Ok((index, RelayMessage::decode(&body)?));
            }
        }
        self.closed = true;
        Err(TorError::protocol("relay cell not recognized by any hop"))
    }

    /// Circuit-level flow control: an authenticated SENDME every window of DATA cells
    async fn account_data(&mut self, hop: usize) -> Result<()> {
        self.hops[hop].delivered += 1;
        if self.hops[hop].delivered % CIRCUIT_SENDME_INCREMENT != 0 {
            return Ok(());
        }
        let digest = self.hops[hop].crypto.sendme_digest();
        let mut data = vec![1u8];
        data.extend_from_slice(&(digest.len() as u16).to_be_bytes());
        data.extend_from_slice(&digest);
        debug!("Sending circuit SENDME to hop {}", hop + 1);
        self.send_to_hop(hop, &RelayMessage::new(RelayCommand::Sendme, 0, data), false)
            .await
    }

    fn push_hop(&mut self, info: HopInfo, crypto: LayerCrypto) {
        self.infos.push(info);
        self.hops.push(Hop {
            crypto,
            delivered: 0,
        });
    }
}

/// EXTEND2 body: link specifiers, then the ntor onionskin
fn extend2_body(target: &ExtendTarget, onionskin: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(128);
    LinkSpecifier::encode_list(&target.link_specifiers, &mut body);
    body.extend_from_slice(&NTOR_HANDSHAKE_TYPE.to_be_bytes());
    body.extend_from_slice(&(onionskin.len() as u16).to_be_bytes());
    body.extend_from_slice(onionskin);
    body
}

#[async_trait]
impl<S> OnionCircuit for TorCircuit<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn hops(&self) -> &[HopInfo] {
        &self.infos
    }

    async fn extend(&mut self, target: &ExtendTarget) -> Result<()> {
        let last = self.hops.len().checked_sub(1).ok_or(TorError::CircuitNotEstablished)?;
        let handshake = NtorHandshake::new(
            self.rng.as_ref(),
            *target.fingerprint.as_bytes(),
            target.ntor_onion_key,
        );
        let body = extend2_body(target, &handshake.onionskin());
        debug!("Sending EXTEND2 for {} through {} hops", target.name, self.hops.len());
        self.send_to_hop(last, &RelayMessage::new(RelayCommand::Extend2, 0, body), true)
            .await?;

        loop {
            let (hop, message) = self.recv_from_hop().await?;
            match message.command {
                RelayCommand::Extended2 if hop == last => {
                    let data = &message.data;
                    if data.len() < 2 {
                        return Err(TorError::protocol("short EXTENDED2"));
                    }
                    let len = u16::from_be_bytes([data[0], data[1]]) as usize;
                    let reply = data
                        .get(2..2 + len)
                        .ok_or_else(|| TorError::protocol("truncated EXTENDED2 reply"))?;
                    let crypto = handshake.complete(reply)?;
                    self.push_hop(HopInfo::from_target(target), crypto);
                    return Ok(());
                }
                other => debug!("Ignoring {:?} from hop {} while extending", other, hop + 1),
            }
        }
    }

    async fn send_relay(&mut self, message: RelayMessage) -> Result<()> {
        let last = self.hops.len().checked_sub(1).ok_or(TorError::CircuitNotEstablished)?;
        self.send_to_hop(last, &message, false).await
    }

    async fn recv_relay(&mut self) -> Result<RelayMessage> {
        let (_, message) = self.recv_from_hop().await?;
        Ok(message)
    }

    fn add_virtual_hop(&mut self, hop: HopInfo, crypto: LayerCrypto) -> Result<()> {
        self.ensure_open()?;
        self.push_hop(hop, crypto);
        Ok(())
    }

    fn allocate_stream_id(&mut self) -> u16 {
        self.next_stream_id = self.next_stream_id.wrapping_add(1).max(1);
        self.next_stream_id
    }

    async fn destroy(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let destroy = Cell::new(self.circ_id, CellCommand::Destroy, vec![DESTROY_REASON_NONE]);
        let sent = self.channel.send_cell(&destroy).await;
        let _ = self.channel.shutdown().await;
        self.hops.clear();
        self.infos.clear();
        sent
    }
}

/// Connects to relays over TLS and creates first hops with CREATE_FAST
pub struct TorConnector {
    rng: Arc<dyn SecureRandom>,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl TorConnector {
    pub fn new(rng: Arc<dyn SecureRandom>, connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            rng,
            connect_timeout,
            io_timeout,
        }
    }
}

#[async_trait]
impl CircuitConnector for TorConnector {
    type Circuit = TorCircuit<LinkStream>;

    async fn connect(&self, first_hop: &OnionRouter) -> Result<Self::Circuit> {
        let addr = first_hop.or_addr();
        let link = connect_relay_link(addr, self.connect_timeout).await?;
        let channel = Channel::handshake(link, addr, self.io_timeout).await?;
        info!(
            "Link to {} up (protocol v{})",
            first_hop,
            channel.link_version()
        );
        TorCircuit::create_fast(channel, self.rng.clone(), HopInfo::from_router(first_hop)).await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeRelay;
    use super::*;
    use crate::crypto::random::testing::SeededRandom;
    use crate::directory::RouterFlags;
    use minitor_common::Fingerprint;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
    use x25519_dalek::{PublicKey, StaticSecret};

    fn peer() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::new(192, 0, 2, 1), 443))
    }

    fn target(id: u8, secret: &StaticSecret) -> ExtendTarget {
        ExtendTarget {
            name: format!("hop{id}"),
            fingerprint: Fingerprint::from_bytes([id; 20]),
            ntor_onion_key: *PublicKey::from(secret).as_bytes(),
            link_specifiers: vec![
                LinkSpecifier::Ipv4(SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, id), 9001)),
                LinkSpecifier::LegacyId(Fingerprint::from_bytes([id; 20])),
            ],
        }
    }

    async fn open(client: tokio::io::DuplexStream) -> TorCircuit<tokio::io::DuplexStream> {
        let channel = Channel::handshake(client, peer(), Duration::from_secs(5))
            .await
            .unwrap();
        let guard = OnionRouter::new(
            Fingerprint::from_bytes([1; 20]),
            "guard",
            Ipv4Addr::new(192, 0, 2, 1),
            443,
            0,
            RouterFlags::GUARD,
        );
        TorCircuit::create_fast(
            channel,
            Arc::new(SeededRandom::new(21)),
            HopInfo::from_router(&guard),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn create_fast_then_extend_twice() {
        let (client, relay) = tokio::io::duplex(1 << 16);
        let relay_task = tokio::spawn(async move {
            let mut relay = FakeRelay::accept(relay).await;
            relay.answer_extend(&StaticSecret::from([2u8; 32])).await;
            relay.answer_extend(&StaticSecret::from([3u8; 32])).await;

            let (hop, message, _) = relay.recv().await;
            assert_eq!(hop, 2);
            assert_eq!(message.command, RelayCommand::Begin);
            relay
                .send(2, RelayMessage::new(RelayCommand::Connected, message.stream_id, vec![]))
                .await;
        });

        let mut circuit = open(client).await;
        assert!(circuit.circ_id() & 0x8000_0000 != 0);
        circuit.extend(&target(2, &StaticSecret::from([2u8; 32]))).await.unwrap();
        circuit.extend(&target(3, &StaticSecret::from([3u8; 32]))).await.unwrap();
        assert_eq!(circuit.hop_count(), 3);

        let stream_id = circuit.allocate_stream_id();
        circuit
            .send_relay(RelayMessage::new(RelayCommand::Begin, stream_id, b"example.com:80\0".to_vec()))
            .await
            .unwrap();
        let reply = circuit.recv_relay().await.unwrap();
        assert_eq!(reply.command, RelayCommand::Connected);
        assert_eq!(reply.stream_id, stream_id);
        relay_task.await.unwrap();
    }

    #[tokio::test]
    async fn extend_with_wrong_onion_key_fails() {
        let (client, relay) = tokio::io::duplex(1 << 16);
        tokio::spawn(async move {
            let mut relay = FakeRelay::accept(relay).await;
            relay.answer_extend(&StaticSecret::from([9u8; 32])).await;
        });

        let mut circuit = open(client).await;
        let result = circuit.extend(&target(2, &StaticSecret::from([2u8; 32]))).await;
        assert!(matches!(result, Err(TorError::Protocol(_))));
        assert_eq!(circuit.hop_count(), 1);
    }

    #[tokio::test]
    async fn destroy_from_relay_closes_circuit() {
        let (client, relay) = tokio::io::duplex(1 << 16);
        tokio::spawn(async move {
            let mut relay = FakeRelay::accept(relay).await;
            let _ = relay.recv().await;
            let circ_id = relay.circ_id;
            relay
                .end
                .send(Cell::new(circ_id, CellCommand::Destroy, vec![5]))
                .await;
        });

        let mut circuit = open(client).await;
        let result = circuit.extend(&target(2, &StaticSecret::from([2u8; 32]))).await;
        assert!(matches!(result, Err(TorError::CircuitDestroyed(5))));
        assert!(circuit.send_relay(RelayMessage::new(RelayCommand::Drop, 0, vec![])).await.is_err());
    }

    #[tokio::test]
    async fn hundredth_data_cell_triggers_authenticated_sendme() {
        let (client, relay) = tokio::io::duplex(1 << 20);
        let relay_task = tokio::spawn(async move {
            let mut relay = FakeRelay::accept(relay).await;
            for _ in 0..CIRCUIT_SENDME_INCREMENT {
                relay
                    .send(0, RelayMessage::new(RelayCommand::Data, 1, vec![0xAB; 100]))
                    .await;
            }
            let (hop, sendme, _) = relay.recv().await;
            assert_eq!(hop, 0);
            assert_eq!(sendme.command, RelayCommand::Sendme);
            assert_eq!(sendme.stream_id, 0);
            assert_eq!(&sendme.data[..3], &[1, 0, 20]);
            assert_eq!(sendme.data.len(), 23);
        });

        let mut circuit = open(client).await;
        for _ in 0..CIRCUIT_SENDME_INCREMENT {
            let message = circuit.recv_relay().await.unwrap();
            assert_eq!(message.command, RelayCommand::Data);
        }
        relay_task.await.unwrap();
    }
}

/// Circuits: the seams between path construction and the relay protocol
///
/// `CircuitBuilder` grows a circuit hop by hop through these traits; the
/// protocol layer provides the real implementations and tests provide
/// in-memory ones.
mod builder;
mod types;

pub use builder::CircuitBuilder;
pub use types::{CircuitState, ExtendTarget, HopInfo, LinkSpecifier};

use crate::directory::OnionRouter;
use crate::protocol::cell::RelayMessage;
use crate::protocol::relay_crypto::LayerCrypto;
use async_trait::async_trait;
use minitor_common::Result;

/// An established circuit of one or more hops
#[async_trait]
pub trait OnionCircuit: Send {
    fn hops(&self) -> &[HopInfo];

    fn hop_count(&self) -> usize {
        self.hops().len()
    }

    /// Extends by one hop; on success the hop count grows by exactly one
    async fn extend(&mut self, target: &ExtendTarget) -> Result<()>;

    /// Sends a relay message to the last hop
    async fn send_relay(&mut self, message: RelayMessage) -> Result<()>;

    /// Next relay message addressed to the client from any hop
    async fn recv_relay(&mut self) -> Result<RelayMessage>;

    /// Adds an end-to-end hop whose keys came from an onion service handshake
    fn add_virtual_hop(&mut self, hop: HopInfo, crypto: LayerCrypto) -> Result<()>;

    /// Fresh, non-zero stream id
    fn allocate_stream_id(&mut self) -> u16;

    /// Tears the circuit down and releases its link
    async fn destroy(&mut self) -> Result<()>;
}

/// Opens a one-hop circuit directly to a relay
#[async_trait]
pub trait CircuitConnector: Send + Sync {
    type Circuit: OnionCircuit + 'static;

    async fn connect(&self, first_hop: &OnionRouter) -> Result<Self::Circuit>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::protocol::cell::RelayCommand;
    use minitor_common::{Fingerprint, TorError};
    use std::collections::{HashSet, VecDeque};
    use std::sync::{Arc, Mutex};

    /// Shared log of what mock circuits were asked to do
    #[derive(Default)]
    pub struct CircuitLog {
        pub connects: Vec<String>,
        pub extends: Vec<String>,
        pub sent: Vec<RelayMessage>,
        pub destroyed: usize,
    }

    /// Computes the relay's answers to a message the client sent
    pub type Responder = Arc<dyn Fn(&RelayMessage) -> Vec<RelayMessage> + Send + Sync>;

    /// In-memory circuit: extends succeed unless the target is marked failing
    pub struct MockCircuit {
        pub hops: Vec<HopInfo>,
        pub fail_extend_to: HashSet<Fingerprint>,
        pub skip_hop_on_extend: bool,
        /// Shared so another circuit's responder can deliver here
        pub replies: Arc<Mutex<VecDeque<RelayMessage>>>,
        pub responder: Option<Responder>,
        pub log: Arc<Mutex<CircuitLog>>,
        next_stream_id: u16,
    }

    impl MockCircuit {
        pub fn new(first: HopInfo, log: Arc<Mutex<CircuitLog>>) -> Self {
            Self {
                hops: vec![first],
                fail_extend_to: HashSet::new(),
                skip_hop_on_extend: false,
                replies: Arc::default(),
                responder: None,
                log,
                next_stream_id: 0,
            }
        }

        /// Queues replies for the next `recv_relay` calls
        pub fn reply(&mut self, command: RelayCommand, stream_id: u16, data: &[u8]) {
            self.replies
                .lock()
                .unwrap()
                .push_back(RelayMessage::new(command, stream_id, data.to_vec()));
        }
    }

    #[async_trait]
    impl OnionCircuit for MockCircuit {
        fn hops(&self) -> &[HopInfo] {
            &self.hops
        }

        async fn extend(&mut self, target: &ExtendTarget) -> Result<()> {
            self.log.lock().unwrap().extends.push(target.name.clone());
            if self.fail_extend_to.contains(&target.fingerprint) {
                return Err(TorError::circuit("extend refused"));
            }
            if !self.skip_hop_on_extend {
                self.hops.push(HopInfo::from_target(target));
            }
            Ok(())
        }

        async fn send_relay(&mut self, message: RelayMessage) -> Result<()> {
            if let Some(responder) = &self.responder {
                let answers = responder(&message);
                self.replies.lock().unwrap().extend(answers);
            }
            self.log.lock().unwrap().sent.push(message);
            Ok(())
        }

        async fn recv_relay(&mut self) -> Result<RelayMessage> {
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| TorError::circuit("mock circuit has no more replies"))
        }

        fn add_virtual_hop(&mut self, hop: HopInfo, _crypto: LayerCrypto) -> Result<()> {
            self.hops.push(hop);
            Ok(())
        }

        fn allocate_stream_id(&mut self) -> u16 {
            self.next_stream_id += 1;
            self.next_stream_id
        }

        async fn destroy(&mut self) -> Result<()> {
            self.log.lock().unwrap().destroyed += 1;
            self.hops.clear();
            Ok(())
        }
    }

    /// Connector handing out `MockCircuit`s
    #[derive(Default)]
    pub struct MockConnector {
        pub log: Arc<Mutex<CircuitLog>>,
        pub fail_extend_to: HashSet<Fingerprint>,
        pub refuse_connect: bool,
        pub responder: Option<Responder>,
    }

    #[async_trait]
    impl CircuitConnector for MockConnector {
        type Circuit = MockCircuit;

        async fn connect(&self, first_hop: &OnionRouter) -> Result<MockCircuit> {
            self.log.lock().unwrap().connects.push(first_hop.name.clone());
            if self.refuse_connect {
                return Err(TorError::network("connection refused"));
            }
            let mut circuit = MockCircuit::new(HopInfo::from_router(first_hop), self.log.clone());
            circuit.fail_extend_to = self.fail_extend_to.clone();
            circuit.responder = self.responder.clone();
            Ok(circuit)
        }
    }
}

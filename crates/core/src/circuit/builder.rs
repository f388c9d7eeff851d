/// Hop-by-hop circuit construction
///
/// 1. The first `extend_to` connects directly to the relay and creates a one-hop circuit
/// 2. Later calls extend through the existing circuit
/// 3. An extend that does not add exactly one verified hop tears the whole circuit down
use super::types::{CircuitState, ExtendTarget};
use super::{CircuitConnector, OnionCircuit};
use crate::directory::{
    Consensus, DescriptorSource, DirectoryFetcher, OnionRouter, RouterFlags, SearchCriteria,
};
use minitor_common::config::circuit::GUARD_OR_PORTS;
use minitor_common::{Fingerprint, Result, TorError};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Owns the client's circuit while it is being grown and used
pub struct CircuitBuilder<C: CircuitConnector> {
    connector: Arc<C>,

    /// `None` while the circuit is empty
    circuit: Option<C::Circuit>,
}

impl<C: CircuitConnector> CircuitBuilder<C> {
    pub fn new(connector: Arc<C>) -> Self {
        Self {
            connector,
            circuit: None,
        }
    }

    pub fn connector(&self) -> &Arc<C> {
        &self.connector
    }

    pub fn state(&self) -> CircuitState {
        match &self.circuit {
            Some(circuit) if circuit.hop_count() > 0 => CircuitState::Established(circuit.hop_count()),
            _ => CircuitState::Empty,
        }
    }

    pub fn hop_count(&self) -> usize {
        self.state().hop_count()
    }

    pub fn circuit(&self) -> Option<&C::Circuit> {
        self.circuit.as_ref()
    }

    pub fn circuit_mut(&mut self) -> Result<&mut C::Circuit> {
        self.circuit.as_mut().ok_or(TorError::CircuitNotEstablished)
    }

    /// Hands the circuit to the caller, leaving the builder empty
    pub fn take_circuit(&mut self) -> Option<C::Circuit> {
        self.circuit.take()
    }

    /// Extend the circuit to `router`
    ///
    /// An empty circuit connects to the router directly; otherwise the
    /// router's descriptor supplies the ntor key for an extend.
    pub async fn extend_to(
        &mut self,
        router: &OnionRouter,
        descriptors: &dyn DescriptorSource,
    ) -> Result<()> {
        if self.circuit.is_none() {
            return self.create_first_hop(router).await;
        }

        let target = match descriptors.server_descriptor(&router.fingerprint).await {
            Ok(descriptor) => ExtendTarget::from_router(router, &descriptor),
            Err(err) => Err(err),
        };
        match target {
            Ok(target) => self.extend_to_target(&target).await,
            Err(err) => {
                warn!("No usable descriptor for {}: {}", router, err);
                self.release().await;
                Err(err)
            }
        }
    }

    /// Extend an established circuit to a fully described relay
    pub async fn extend_to_target(&mut self, target: &ExtendTarget) -> Result<()> {
        let circuit = self.circuit.as_mut().ok_or(TorError::CircuitNotEstablished)?;
        let previous = circuit.hop_count();
        info!("Extending circuit to node {} (hop {})", target.name, previous + 1);

        let result = circuit.extend(target).await;
        let hops = circuit.hop_count();
        match result {
            Ok(()) if hops == previous + 1 => {
                info!("Extended circuit to {} ({} hops)", target.name, hops);
                Ok(())
            }
            Ok(()) => {
                warn!(
                    "Extend to {} left {} hops, expected {}; tearing down circuit",
                    target.name,
                    hops,
                    previous + 1
                );
                self.release().await;
                Err(TorError::circuit(format!(
                    "hop count {hops} after extend, expected {}",
                    previous + 1
                )))
            }
            Err(err) => {
                warn!("Extend to {} failed: {}; tearing down circuit", target.name, err);
                self.release().await;
                Err(err)
            }
        }
    }

    /// Extend to a random relay matching `flags` and `or_ports`
    ///
    /// The chosen relay joins `forbidden` so no relay appears twice in one
    /// circuit. Returns `Ok(false)` without touching the circuit when no
    /// relay matches.
    pub async fn extend_to_random<F: DirectoryFetcher>(
        &mut self,
        consensus: &Consensus<F>,
        forbidden: &mut HashSet<Fingerprint>,
        flags: RouterFlags,
        or_ports: &[u16],
    ) -> Result<bool> {
        let criteria = SearchCriteria::new()
            .with_or_ports(or_ports.iter().copied())
            .with_flags(flags)
            .forbid_all(forbidden.iter());

        let Some(router) = consensus.get_random_onion_router_by_criteria(&criteria) else {
            debug!("No relay matches flags [{}] and OR ports {:?}", flags, or_ports);
            return Ok(false);
        };
        let router = router.clone();
        forbidden.insert(router.fingerprint);
        self.extend_to(&router, consensus).await?;
        Ok(true)
    }

    /// Grows the circuit by `hops` random relays
    ///
    /// An empty circuit starts at a guard on an OR port in
    /// `GUARD_OR_PORTS`; the rest are fast relays, the last one an exit when
    /// `exit` is set. A position nobody can fill releases the circuit.
    pub async fn build_path<F: DirectoryFetcher>(
        &mut self,
        consensus: &Consensus<F>,
        forbidden: &mut HashSet<Fingerprint>,
        hops: usize,
        exit: bool,
    ) -> Result<()> {
        for position in 0..hops {
            let (flags, or_ports): (RouterFlags, &[u16]) = if self.circuit.is_none() {
                (RouterFlags::GUARD, GUARD_OR_PORTS.as_slice())
            } else if exit && position + 1 == hops {
                (RouterFlags::EXIT | RouterFlags::FAST, &[])
            } else {
                (RouterFlags::FAST, &[])
            };

            if !self
                .extend_to_random(consensus, forbidden, flags, or_ports)
                .await?
            {
                warn!("No relay available for hop {} with flags [{}]", position + 1, flags);
                self.release().await;
                return Err(TorError::RouterNotFound(format!(
                    "no relay with flags [{flags}] for hop {}",
                    position + 1
                )));
            }
        }
        Ok(())
    }

    /// Destroys the circuit, if any; the builder is empty afterwards
    pub async fn release(&mut self) {
        if let Some(mut circuit) = self.circuit.take() {
            debug!("Releasing circuit of {} hops", circuit.hop_count());
            if let Err(err) = circuit.destroy().await {
                debug!("Error while destroying circuit: {}", err);
            }
        }
    }

    async fn create_first_hop(&mut self, router: &OnionRouter) -> Result<()> {
        info!("Connecting to node {}", router);
        let circuit = match self.connector.connect(router).await {
            Ok(circuit) => circuit,
            Err(err) => {
                warn!("First hop {} failed: {}", router, err);
                return Err(err);
            }
        };
        let hops = circuit.hop_count();
        self.circuit = Some(circuit);
        if hops != 1 {
            self.release().await;
            return Err(TorError::circuit(format!(
                "first hop produced {hops} hops"
            )));
        }
        info!("First hop created successfully");
        Ok(())
    }
}

//! Probe registry.
//!
//! The [`ProbeFactory`] owns one [`Probe`] per remote peer, builds each with
//! the dialers the local node can run, and is the [`SignalHandler`] both the
//! signaling bus and the relay client deliver to. Any inbound packet both
//! routes to the sender's probe and starts that probe, so the responder side
//! gathers and dials as well.

use crate::agent::AgentBuilder;
use crate::config::ProbeConfig;
use crate::dialer::{DialContext, Dialer, IceDialer, RelayDialer};
use crate::error::{ProbeError, Result};
use crate::packet::{MAX_PACKET_LEN, SignalPacket};
use crate::probe::{OnSuccess, Probe, ProbeOptions};
use async_trait::async_trait;
use meshlink_core::{
    CoreError, PeerDirectory, PeerId, PeerRecord, Shutdown, SignalChannel, SignalHandler, TransportTable,
};
use meshlink_relay::RelayClient;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

/// Builder for [`ProbeFactory`]
pub struct ProbeFactoryBuilder {
    local: PeerId,
    record: PeerRecord,
    directory: Arc<PeerDirectory>,
    signal: Option<Arc<dyn SignalChannel>>,
    agents: Option<Arc<dyn AgentBuilder>>,
    relay: Option<RelayClient>,
    config: ProbeConfig,
    transports: Arc<TransportTable>,
    on_success: Option<OnSuccess>,
    shutdown: Shutdown,
}

impl ProbeFactoryBuilder {
    /// Signaling bus and agent source; enables the ICE dialer
    #[must_use]
    pub fn ice(mut self, signal: Arc<dyn SignalChannel>, agents: Arc<dyn AgentBuilder>) -> Self {
        self.signal = Some(signal);
        self.agents = Some(agents);
        self
    }

    /// Broker session; enables the relay dialer
    #[must_use]
    pub fn relay(mut self, client: RelayClient) -> Self {
        self.relay = Some(client);
        self
    }

    /// Handshake timing and retry policy
    #[must_use]
    pub fn config(mut self, config: ProbeConfig) -> Self {
        self.config = config;
        self
    }

    /// Table receiving connected transports
    #[must_use]
    pub fn transports(mut self, transports: Arc<TransportTable>) -> Self {
        self.transports = transports;
        self
    }

    /// Callback fired for every connected transport
    #[must_use]
    pub fn on_success(mut self, on_success: OnSuccess) -> Self {
        self.on_success = Some(on_success);
        self
    }

    /// Parent cancellation token
    #[must_use]
    pub fn shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Build the factory and subscribe it to every configured channel
    #[must_use]
    pub fn build(self) -> Arc<ProbeFactory> {
        let factory = Arc::new(ProbeFactory {
            local: self.local,
            record: self.record,
            directory: self.directory,
            signal: self.signal,
            agents: self.agents,
            relay: self.relay,
            config: self.config,
            transports: self.transports,
            on_success: self.on_success,
            shutdown: self.shutdown.child(),
            probes: Mutex::new(HashMap::new()),
        });

        let handler: Arc<dyn SignalHandler> = factory.clone();
        if let Some(signal) = &factory.signal {
            signal.subscribe(factory.local, handler.clone());
        }
        if let Some(relay) = &factory.relay {
            relay.set_signal_handler(handler);
            // Inbound `Probe` frames are only read while the pump runs.
            relay.start_pump();
        }
        factory
    }
}

/// Registry of per-peer probes
pub struct ProbeFactory {
    local: PeerId,
    record: PeerRecord,
    directory: Arc<PeerDirectory>,
    signal: Option<Arc<dyn SignalChannel>>,
    agents: Option<Arc<dyn AgentBuilder>>,
    relay: Option<RelayClient>,
    config: ProbeConfig,
    transports: Arc<TransportTable>,
    on_success: Option<OnSuccess>,
    shutdown: Shutdown,
    probes: Mutex<HashMap<PeerId, Probe>>,
}

impl ProbeFactory {
    /// Start building a factory for `local`, advertising `record`
    #[must_use]
    pub fn builder(local: PeerId, record: PeerRecord, directory: Arc<PeerDirectory>) -> ProbeFactoryBuilder {
        ProbeFactoryBuilder {
            local,
            record,
            directory,
            signal: None,
            agents: None,
            relay: None,
            config: ProbeConfig::default(),
            transports: Arc::new(TransportTable::new()),
            on_success: None,
            shutdown: Shutdown::new(),
        }
    }

    /// Local peer
    #[must_use]
    pub fn local(&self) -> PeerId {
        self.local
    }

    /// Shared transport table
    #[must_use]
    pub fn transports(&self) -> &Arc<TransportTable> {
        &self.transports
    }

    /// Shared peer directory
    #[must_use]
    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    /// Existing probe for `peer`
    pub async fn get(&self, peer: &PeerId) -> Option<Probe> {
        self.probes.lock().await.get(peer).cloned()
    }

    /// Number of probes
    pub async fn len(&self) -> usize {
        self.probes.lock().await.len()
    }

    /// Whether no probe exists
    pub async fn is_empty(&self) -> bool {
        self.probes.lock().await.is_empty()
    }

    /// Probe for `peer`, created with every available dialer on first use
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Closed`] after [`ProbeFactory::close`], and a
    /// core error for the local or zero id.
    pub async fn get_or_create(&self, peer: PeerId) -> Result<Probe> {
        if self.shutdown.is_cancelled() {
            return Err(ProbeError::Closed);
        }
        if peer == self.local || peer.is_zero() {
            return Err(ProbeError::Core(CoreError::signal(peer, "cannot probe this peer id")));
        }

        let mut probes = self.probes.lock().await;
        if let Some(probe) = probes.get(&peer) {
            return Ok(probe.clone());
        }

        let probe = Probe::new(self.local, peer, self.dialers(peer), self.probe_options());
        debug!(peer = %peer, dialers = ?probe.kinds(), "probe created");
        probes.insert(peer, probe.clone());
        Ok(probe)
    }

    /// Create (if needed) and start the probe for `peer`
    ///
    /// # Errors
    ///
    /// As [`ProbeFactory::get_or_create`].
    pub async fn probe(&self, peer: PeerId) -> Result<Probe> {
        let probe = self.get_or_create(peer).await?;
        probe.probe();
        Ok(probe)
    }

    /// Decode an inbound signal payload and route it.
    ///
    /// The packet's claimed sender must match the transport-level sender.
    ///
    /// # Errors
    ///
    /// Returns decoding errors, sender mismatches as
    /// [`ProbeError::InvalidOffer`], and the probe's handling error.
    pub async fn handle_packet(&self, from: PeerId, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_PACKET_LEN {
            return Err(ProbeError::Deserialization(format!(
                "signal packet of {} bytes exceeds {MAX_PACKET_LEN}",
                payload.len()
            )));
        }
        let packet = SignalPacket::from_bytes(payload)?;
        if packet.sender != from {
            return Err(ProbeError::InvalidOffer {
                peer: from,
                reason: format!("packet claims sender {}", packet.sender),
            });
        }

        trace!(peer = %from, ty = ?packet.ty, dialer = %packet.dialer, "signal packet");
        let probe = self.get_or_create(from).await?;
        probe.probe();
        probe.handle(&packet).await
    }

    /// Remove and close the probe for `peer`
    pub async fn remove(&self, peer: &PeerId) -> Option<Probe> {
        let probe = self.probes.lock().await.remove(peer)?;
        probe.close().await;
        self.transports.remove_peer(peer);
        Some(probe)
    }

    /// Close every probe; later calls to create probes fail
    pub async fn close(&self) {
        self.shutdown.cancel();
        let probes: Vec<Probe> = self.probes.lock().await.drain().map(|(_, p)| p).collect();
        for probe in &probes {
            probe.close().await;
        }
        info!(local = %self.local, closed = probes.len(), "probe factory closed");
    }

    fn dialers(&self, remote: PeerId) -> Vec<Dialer> {
        let ctx = DialContext {
            local: self.local,
            remote,
            record: self.record.clone(),
            directory: self.directory.clone(),
            config: self.config.clone(),
        };

        let mut dialers = Vec::with_capacity(2);
        if let (Some(signal), Some(agents)) = (&self.signal, &self.agents) {
            dialers.push(Dialer::Ice(Arc::new(IceDialer::new(
                ctx.clone(),
                signal.clone(),
                agents.clone(),
            ))));
        }
        if let Some(relay) = &self.relay {
            dialers.push(Dialer::Relay(Arc::new(RelayDialer::new(ctx, relay.clone()))));
        }
        dialers
    }

    fn probe_options(&self) -> ProbeOptions {
        ProbeOptions {
            config: self.config.clone(),
            transports: self.transports.clone(),
            on_success: self.on_success.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

#[async_trait]
impl SignalHandler for ProbeFactory {
    async fn on_signal(&self, from: PeerId, payload: &[u8]) {
        if let Err(e) = self.handle_packet(from, payload).await {
            warn!(peer = %from, error = %e, "signal packet rejected");
        }
    }
}

impl std::fmt::Debug for ProbeFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeFactory")
            .field("local", &self.local)
            .field("ice", &self.agents.is_some())
            .field("relay", &self.relay.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::DialerKind;
    use crate::probe::ConnectionState;
    use crate::signal::LocalBus;
    use crate::test_support::ScriptedBuilder;
    use meshlink_core::PublicKey;
    use std::time::Duration;

    fn factory(bus: &LocalBus, id: u64, tie_breaker: u64) -> Arc<ProbeFactory> {
        let local = PeerId::from_u64(id);
        let (agents, _) = ScriptedBuilder::new(tie_breaker, 1);
        ProbeFactory::builder(
            local,
            PeerRecord::new(format!("node-{id}"), PublicKey::from_bytes([id as u8; 32])),
            Arc::new(PeerDirectory::new()),
        )
        .ice(Arc::new(bus.channel(local)), Arc::new(agents))
        .config(ProbeConfig {
            syn_interval: Duration::from_millis(20),
            handshake_timeout: Duration::from_millis(500),
            verify_sender_key: false,
            ..Default::default()
        })
        .build()
    }

    #[tokio::test]
    async fn test_get_or_create_reuses() {
        let bus = LocalBus::new();
        let f = factory(&bus, 1, 1);
        let a = f.get_or_create(PeerId::from_u64(2)).await.unwrap();
        let b = f.get_or_create(PeerId::from_u64(2)).await.unwrap();
        assert_eq!(f.len().await, 1);
        assert_eq!(a.kinds(), vec![DialerKind::Ice]);
        a.probe();
        assert_eq!(b.state(), ConnectionState::Checking);
        f.close().await;
    }

    #[tokio::test]
    async fn test_rejects_self_and_zero() {
        let bus = LocalBus::new();
        let f = factory(&bus, 1, 1);
        assert!(f.get_or_create(PeerId::from_u64(1)).await.is_err());
        assert!(f.get_or_create(PeerId::ZERO).await.is_err());
    }

    #[tokio::test]
    async fn test_inbound_syn_creates_responder() {
        let bus = LocalBus::new();
        let responder = factory(&bus, 100, 1);
        let initiator = factory(&bus, 200, 2);

        let probe = initiator.probe(PeerId::from_u64(100)).await.unwrap();
        let mut state = probe.subscribe();
        tokio::time::timeout(Duration::from_secs(3), state.wait_for(|s| *s == ConnectionState::Connected))
            .await
            .unwrap()
            .unwrap();

        let remote = responder.get(&PeerId::from_u64(200)).await.unwrap();
        let mut state = remote.subscribe();
        tokio::time::timeout(Duration::from_secs(3), state.wait_for(|s| *s == ConnectionState::Connected))
            .await
            .unwrap()
            .unwrap();
        assert!(responder.directory().contains(&PeerId::from_u64(200)));
        assert!(initiator.transports().best(&PeerId::from_u64(100)).is_some());
    }

    #[tokio::test]
    async fn test_spoofed_sender_rejected() {
        let bus = LocalBus::new();
        let f = factory(&bus, 1, 1);
        let packet = SignalPacket::syn(PeerId::from_u64(3), DialerKind::Ice).to_bytes().unwrap();
        assert!(matches!(
            f.handle_packet(PeerId::from_u64(2), &packet).await,
            Err(ProbeError::InvalidOffer { .. })
        ));
        assert!(f.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_closes() {
        let bus = LocalBus::new();
        let f = factory(&bus, 1, 1);
        let probe = f.probe(PeerId::from_u64(2)).await.unwrap();
        let removed = f.remove(&PeerId::from_u64(2)).await.unwrap();
        assert_eq!(removed.remote(), probe.remote());
        assert_eq!(probe.state(), ConnectionState::Closed);
        assert!(f.get(&PeerId::from_u64(2)).await.is_none());
    }
}

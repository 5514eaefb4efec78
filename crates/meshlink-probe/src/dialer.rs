//! The two dial strategies raced by a probe.
//!
//! Both run the same handshake ([`Handshake`]) and differ in what travels in
//! the offers and in how the final transport is produced:
//!
//! - [`IceDialer`] trickles one candidate per `OFFER` over the signaling bus
//!   and lets its [`IceAgent`] run connectivity checks.
//! - [`RelayDialer`] sends a single candidate-less `OFFER` through the broker,
//!   answers every remote `OFFER`, and multiplexes the transport over the
//!   broker stream.

use crate::agent::{AgentBuilder, AgentState, Candidate, Credentials, IceAgent};
use crate::config::ProbeConfig;
use crate::error::{ProbeError, Result};
use crate::handshake::Handshake;
use crate::packet::{DialerKind, Offer, PacketType, SignalPacket};
use meshlink_core::{PeerDirectory, PeerId, PeerRecord, Shutdown, SignalChannel, Transport};
use meshlink_relay::RelayClient;
use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{OnceCell, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace};

/// What every dialer toward one peer shares
#[derive(Clone)]
pub struct DialContext {
    /// Local peer
    pub local: PeerId,
    /// Remote peer
    pub remote: PeerId,
    /// Local record advertised in offers
    pub record: PeerRecord,
    /// Directory receiving the remote's record
    pub directory: Arc<PeerDirectory>,
    /// Handshake timing
    pub config: ProbeConfig,
}

impl DialContext {
    fn offer(&self, credentials: &Credentials, tie_breaker: u64, candidate: Option<String>) -> Offer {
        Offer {
            ufrag: credentials.ufrag.clone(),
            pwd: credentials.pwd.clone(),
            tie_breaker,
            candidate,
            record: self.record.clone(),
            public_key: self.record.public_key,
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.handshake_timeout
    }
}

/// NAT-traversal dialer
pub struct IceDialer {
    ctx: DialContext,
    signal: Arc<dyn SignalChannel>,
    agents: Arc<dyn AgentBuilder>,
    handshake: Handshake,
    agent: OnceCell<Arc<dyn IceAgent>>,
    offered: AtomicBool,
}

impl IceDialer {
    /// Dialer signaling over `signal` with agents from `agents`
    #[must_use]
    pub fn new(ctx: DialContext, signal: Arc<dyn SignalChannel>, agents: Arc<dyn AgentBuilder>) -> Self {
        let handshake = Handshake::new(
            ctx.local,
            ctx.remote,
            DialerKind::Ice,
            signal.clone(),
            ctx.directory.clone(),
        )
        .with_sender_key_check(ctx.config.verify_sender_key);
        Self {
            ctx,
            signal,
            agents,
            handshake,
            agent: OnceCell::new(),
            offered: AtomicBool::new(false),
        }
    }

    /// Fresh dialer with the same wiring and no handshake state
    #[must_use]
    pub fn renew(&self) -> Self {
        Self::new(self.ctx.clone(), self.signal.clone(), self.agents.clone())
    }

    async fn agent(&self) -> Result<&Arc<dyn IceAgent>> {
        self.agent
            .get_or_try_init(|| self.agents.build(self.ctx.local, self.ctx.remote))
            .await
    }

    async fn handle(&self, packet: &SignalPacket) -> Result<()> {
        match packet.ty {
            PacketType::Syn => self.handshake.on_syn().await,
            PacketType::Ack => {
                self.handshake.on_ack();
                Ok(())
            }
            PacketType::Offer | PacketType::Answer => {
                let offer = packet.offer.as_ref().ok_or_else(|| ProbeError::InvalidOffer {
                    peer: self.ctx.remote,
                    reason: "offer packet without payload".into(),
                })?;
                self.handshake.on_offer(offer)?;
                if let Some(sdp) = &offer.candidate {
                    let candidate: Candidate = sdp.parse()?;
                    self.agent().await?.add_remote_candidate(candidate);
                }
                Ok(())
            }
        }
    }

    /// Gather and trickle one `OFFER` per candidate. Runs once.
    async fn send_offers(&self, agent: &Arc<dyn IceAgent>) -> Result<()> {
        if self.offered.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let candidates = agent.gather().await?;
        if candidates.is_empty() {
            return Err(ProbeError::NoCandidates);
        }

        let credentials = agent.credentials();
        for candidate in candidates {
            trace!(peer = %self.ctx.remote, candidate = %candidate.to_sdp_string(), "trickling candidate");
            let offer = self
                .ctx
                .offer(&credentials, agent.tie_breaker(), Some(candidate.to_sdp_string()));
            self.handshake
                .send(&SignalPacket::offer(self.ctx.local, DialerKind::Ice, offer))
                .await?;
        }
        Ok(())
    }

    async fn dial(&self, shutdown: &Shutdown) -> Result<Arc<dyn Transport>> {
        let deadline = self.ctx.deadline();
        self.handshake.wait_acked(deadline, shutdown).await?;

        let agent = self.agent().await?.clone();
        self.send_offers(&agent).await?;
        let remote = self.handshake.wait_ready(deadline, shutdown).await?;

        let controlling = match agent.tie_breaker().cmp(&remote.tie_breaker) {
            CmpOrdering::Greater => true,
            CmpOrdering::Less => false,
            CmpOrdering::Equal => self.handshake.is_initiator(),
        };
        let credentials = Credentials {
            ufrag: remote.ufrag,
            pwd: remote.pwd,
        };

        debug!(peer = %self.ctx.remote, controlling, "starting connectivity checks");
        let transport = if controlling {
            agent.dial(&credentials, shutdown).await?
        } else {
            agent.accept(&credentials, shutdown).await?
        };
        info!(
            peer = %self.ctx.remote,
            kind = %transport.kind(),
            remote = %transport.remote_addr(),
            "ice path established"
        );
        Ok(transport)
    }

    async fn close(&self) {
        if let Some(agent) = self.agent.get() {
            agent.close().await;
        }
    }
}

/// Broker relay dialer
pub struct RelayDialer {
    ctx: DialContext,
    client: RelayClient,
    handshake: Handshake,
    credentials: Credentials,
    tie_breaker: u64,
    offered: AtomicBool,
}

impl RelayDialer {
    /// Dialer signaling through the broker `client` is registered with
    #[must_use]
    pub fn new(ctx: DialContext, client: RelayClient) -> Self {
        let handshake = Handshake::new(
            ctx.local,
            ctx.remote,
            DialerKind::Relay,
            Arc::new(client.clone()),
            ctx.directory.clone(),
        )
        .with_sender_key_check(ctx.config.verify_sender_key);
        Self {
            ctx,
            client,
            handshake,
            credentials: Credentials::random(),
            tie_breaker: rand::random(),
            offered: AtomicBool::new(false),
        }
    }

    /// Fresh dialer on the same broker session
    #[must_use]
    pub fn renew(&self) -> Self {
        Self::new(self.ctx.clone(), self.client.clone())
    }

    fn local_offer(&self) -> Offer {
        self.ctx.offer(&self.credentials, self.tie_breaker, None)
    }

    async fn handle(&self, packet: &SignalPacket) -> Result<()> {
        match packet.ty {
            PacketType::Syn => self.handshake.on_syn().await,
            PacketType::Ack => {
                self.handshake.on_ack();
                Ok(())
            }
            PacketType::Offer | PacketType::Answer => {
                let offer = packet.offer.as_ref().ok_or_else(|| ProbeError::InvalidOffer {
                    peer: self.ctx.remote,
                    reason: "offer packet without payload".into(),
                })?;
                self.handshake.on_offer(offer)?;
                if packet.ty == PacketType::Offer {
                    let answer = SignalPacket::answer(self.ctx.local, DialerKind::Relay, self.local_offer());
                    self.handshake.send(&answer).await?;
                }
                Ok(())
            }
        }
    }

    async fn dial(&self, shutdown: &Shutdown) -> Result<Arc<dyn Transport>> {
        let deadline = self.ctx.deadline();
        self.handshake.wait_acked(deadline, shutdown).await?;

        if !self.offered.swap(true, Ordering::SeqCst) {
            let offer = SignalPacket::offer(self.ctx.local, DialerKind::Relay, self.local_offer());
            self.handshake.send(&offer).await?;
        }
        self.handshake.wait_ready(deadline, shutdown).await?;

        if self.client.is_closed() {
            return Err(ProbeError::Relay(meshlink_relay::RelayError::Closed));
        }
        info!(peer = %self.ctx.remote, relay = %self.client.url(), "relay path established");
        Ok(Arc::new(self.client.transport(self.ctx.remote)))
    }
}

/// One of the two dial strategies
#[derive(Clone)]
pub enum Dialer {
    /// NAT traversal
    Ice(Arc<IceDialer>),
    /// Broker relay
    Relay(Arc<RelayDialer>),
}

impl Dialer {
    /// Kind tag carried by this dialer's packets
    #[must_use]
    pub fn kind(&self) -> DialerKind {
        match self {
            Dialer::Ice(_) => DialerKind::Ice,
            Dialer::Relay(_) => DialerKind::Relay,
        }
    }

    /// Handshake state
    #[must_use]
    pub fn handshake(&self) -> &Handshake {
        match self {
            Dialer::Ice(d) => &d.handshake,
            Dialer::Relay(d) => &d.handshake,
        }
    }

    /// Run the `SYN` loop (initiator only).
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::HandshakeTimeout`] or [`ProbeError::Cancelled`].
    pub async fn prepare(&self, shutdown: &Shutdown) -> Result<()> {
        let config = match self {
            Dialer::Ice(d) => &d.ctx.config,
            Dialer::Relay(d) => {
                // Probe frames only surface while something reads the stream.
                d.client.start_pump();
                &d.ctx.config
            }
        };
        self.handshake().run_syn_loop(config, shutdown).await
    }

    /// Apply one inbound packet addressed to this dialer
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::InvalidOffer`] for unusable offers and
    /// signaling errors from replies.
    pub async fn handle(&self, packet: &SignalPacket) -> Result<()> {
        match self {
            Dialer::Ice(d) => d.handle(packet).await,
            Dialer::Relay(d) => d.handle(packet).await,
        }
    }

    /// Wait until ready, then produce a connected transport
    ///
    /// # Errors
    ///
    /// Returns handshake timeouts, agent failures, or [`ProbeError::Cancelled`].
    pub async fn dial(&self, shutdown: &Shutdown) -> Result<Arc<dyn Transport>> {
        match self {
            Dialer::Ice(d) => d.dial(shutdown).await,
            Dialer::Relay(d) => d.dial(shutdown).await,
        }
    }

    /// Fresh dialer of the same kind and wiring
    #[must_use]
    pub fn renew(&self) -> Self {
        match self {
            Dialer::Ice(d) => Dialer::Ice(Arc::new(d.renew())),
            Dialer::Relay(d) => Dialer::Relay(Arc::new(d.renew())),
        }
    }

    /// Agent state updates, for dialers backed by an agent that exists
    #[must_use]
    pub fn agent_state(&self) -> Option<watch::Receiver<AgentState>> {
        match self {
            Dialer::Ice(d) => d.agent.get().map(|a| a.subscribe_state()),
            Dialer::Relay(_) => None,
        }
    }

    /// Release the dialer's resources
    pub async fn close(&self) {
        match self {
            Dialer::Ice(d) => d.close().await,
            Dialer::Relay(_) => {}
        }
    }
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Dialer").field(&self.kind()).field(self.handshake()).finish()
    }
}

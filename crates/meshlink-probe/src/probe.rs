//! Per-peer connection state machine.
//!
//! A [`Probe`] owns the dialers toward one remote peer and runs them
//! independently. Each dialer run reports back through a [`ProbeEvent`]
//! queue consumed by the probe's event loop, which folds per-dialer states
//! into one aggregate [`ConnectionState`], registers connected transports,
//! and schedules retries.
//!
//! ```text
//!            probe()
//!   New ───────────────▶ Checking ──────▶ Connected
//!                           │                 │
//!                           ▼                 ▼
//!                        Failed ◀──────── Disconnected
//!                           │   retry / SYN
//!                           └──────────▶ Checking
//! ```

use crate::agent::AgentState;
use crate::config::ProbeConfig;
use crate::dialer::Dialer;
use crate::error::{ProbeError, Result};
use crate::packet::{DialerKind, PacketType, SignalPacket};
use meshlink_core::{PeerId, Shutdown, Transport, TransportTable};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

/// Connection state of one dialer, or of the probe as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not probed yet
    New,
    /// Handshake or connectivity checks running
    Checking,
    /// A transport is up
    Connected,
    /// A transport was up and went away
    Disconnected,
    /// Gave up
    Failed,
    /// Probe torn down
    Closed,
}

impl ConnectionState {
    /// Fold dialer states: any `Connected` wins, then any `Checking`, then
    /// any `Disconnected`; `Failed` only when every dialer failed.
    #[must_use]
    pub fn aggregate(states: impl IntoIterator<Item = ConnectionState>) -> ConnectionState {
        let states: Vec<ConnectionState> = states.into_iter().collect();
        let any = |s: ConnectionState| states.contains(&s);

        if any(ConnectionState::Connected) {
            ConnectionState::Connected
        } else if any(ConnectionState::Checking) {
            ConnectionState::Checking
        } else if any(ConnectionState::Disconnected) {
            ConnectionState::Disconnected
        } else if !states.is_empty() && states.iter().all(|s| *s == ConnectionState::Failed) {
            ConnectionState::Failed
        } else if any(ConnectionState::Closed) {
            ConnectionState::Closed
        } else {
            ConnectionState::New
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::New => "new",
            ConnectionState::Checking => "checking",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Outcome reported by a dialer run
pub enum ProbeEvent {
    /// Dialer moved to `state`
    StateChanged {
        /// Reporting dialer
        dialer: DialerKind,
        /// New state
        state: ConnectionState,
    },
    /// Dialer produced a live transport
    Connected {
        /// Reporting dialer
        dialer: DialerKind,
        /// The transport
        transport: Arc<dyn Transport>,
    },
    /// Dialer run ended in error
    Failed {
        /// Reporting dialer
        dialer: DialerKind,
        /// Cause
        error: ProbeError,
    },
}

impl ProbeEvent {
    /// Dialer the event concerns
    #[must_use]
    pub fn dialer(&self) -> DialerKind {
        match self {
            ProbeEvent::StateChanged { dialer, .. }
            | ProbeEvent::Connected { dialer, .. }
            | ProbeEvent::Failed { dialer, .. } => *dialer,
        }
    }
}

impl fmt::Debug for ProbeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeEvent::StateChanged { dialer, state } => f
                .debug_struct("StateChanged")
                .field("dialer", dialer)
                .field("state", state)
                .finish(),
            ProbeEvent::Connected { dialer, transport } => f
                .debug_struct("Connected")
                .field("dialer", dialer)
                .field("kind", &transport.kind())
                .field("remote", &transport.remote_addr())
                .finish(),
            ProbeEvent::Failed { dialer, error } => f
                .debug_struct("Failed")
                .field("dialer", dialer)
                .field("error", error)
                .finish(),
        }
    }
}

/// Invoked with the remote id and transport whenever a dialer connects
pub type OnSuccess = Arc<dyn Fn(PeerId, Arc<dyn Transport>) + Send + Sync>;

/// Collaborators and policy for a probe
#[derive(Clone, Default)]
pub struct ProbeOptions {
    /// Timing and retry policy
    pub config: ProbeConfig,
    /// Table receiving connected transports
    pub transports: Arc<TransportTable>,
    /// Success callback
    pub on_success: Option<OnSuccess>,
    /// Parent token; the probe cancels a child of it on close
    pub shutdown: Shutdown,
}

struct Envelope {
    generation: u64,
    event: ProbeEvent,
}

struct Slot {
    dialer: Dialer,
    state: ConnectionState,
    generation: u64,
    retries: u32,
    transport: Option<Arc<dyn Transport>>,
    cancel: Shutdown,
}

struct ProbeInner {
    local: PeerId,
    remote: PeerId,
    config: ProbeConfig,
    slots: Mutex<Vec<Slot>>,
    state: watch::Sender<ConnectionState>,
    events: mpsc::Sender<Envelope>,
    events_rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
    transports: Arc<TransportTable>,
    on_success: Option<OnSuccess>,
    shutdown: Shutdown,
}

/// Connection state machine toward one remote peer
#[derive(Clone)]
pub struct Probe {
    inner: Arc<ProbeInner>,
}

impl Probe {
    /// Probe running `dialers` toward `remote`. Nothing starts until
    /// [`Probe::probe`].
    #[must_use]
    pub fn new(local: PeerId, remote: PeerId, dialers: Vec<Dialer>, options: ProbeOptions) -> Self {
        let shutdown = options.shutdown.child();
        let (events, events_rx) = mpsc::channel(options.config.event_queue.max(1));
        let slots = dialers
            .into_iter()
            .map(|dialer| Slot {
                dialer,
                state: ConnectionState::New,
                generation: 0,
                retries: 0,
                transport: None,
                cancel: shutdown.child(),
            })
            .collect();

        Self {
            inner: Arc::new(ProbeInner {
                local,
                remote,
                config: options.config,
                slots: Mutex::new(slots),
                state: watch::channel(ConnectionState::New).0,
                events,
                events_rx: Mutex::new(Some(events_rx)),
                transports: options.transports,
                on_success: options.on_success,
                shutdown,
            }),
        }
    }

    /// Local peer
    #[must_use]
    pub fn local(&self) -> PeerId {
        self.inner.local
    }

    /// Remote peer
    #[must_use]
    pub fn remote(&self) -> PeerId {
        self.inner.remote
    }

    /// Aggregate state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch the aggregate state
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// State of one dialer, if the probe runs that kind
    #[must_use]
    pub fn dialer_state(&self, kind: DialerKind) -> Option<ConnectionState> {
        self.inner.slots().iter().find(|s| s.dialer.kind() == kind).map(|s| s.state)
    }

    /// Dialer kinds this probe runs
    #[must_use]
    pub fn kinds(&self) -> Vec<DialerKind> {
        self.inner.slots().iter().map(|s| s.dialer.kind()).collect()
    }

    /// Highest-priority connected transport
    #[must_use]
    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.inner
            .slots()
            .iter()
            .filter_map(|s| s.transport.clone())
            .filter(|t| !t.is_closed())
            .max_by_key(|t| t.priority())
    }

    /// Retries consumed by the given dialer since it last connected
    #[must_use]
    pub fn retries(&self, kind: DialerKind) -> Option<u32> {
        self.inner
            .slots()
            .iter()
            .find(|s| s.dialer.kind() == kind)
            .map(|s| s.retries)
    }

    /// `SYN` packets the given dialer has sent
    #[must_use]
    pub fn syn_sent(&self, kind: DialerKind) -> u32 {
        self.inner
            .slots()
            .iter()
            .find(|s| s.dialer.kind() == kind)
            .map_or(0, |s| s.dialer.handshake().syn_sent())
    }

    /// Start every dialer. No-op unless the probe is `New`; returns whether
    /// this call started it. Completion is observed through
    /// [`Probe::subscribe`] and the success callback.
    pub fn probe(&self) -> bool {
        let started = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::New {
                *state = ConnectionState::Checking;
                true
            } else {
                false
            }
        });
        if !started {
            return false;
        }

        info!(peer = %self.inner.remote, dialers = ?self.kinds(), "probing peer");
        self.inner.start_event_loop();

        let runs: Vec<(Dialer, u64, Shutdown)> = self
            .inner
            .slots()
            .iter_mut()
            .map(|slot| {
                slot.state = ConnectionState::Checking;
                (slot.dialer.clone(), slot.generation, slot.cancel.clone())
            })
            .collect();
        for (dialer, generation, cancel) in runs {
            self.inner.spawn_run(dialer, generation, cancel);
        }
        true
    }

    /// Route an inbound packet to the dialer of its kind.
    ///
    /// Packets for a kind this probe does not run are ignored. A `SYN`
    /// reaching a failed or disconnected dialer restarts it first, since it
    /// means the remote began a new attempt.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Closed`] after [`Probe::close`], or the
    /// dialer's own handling error.
    pub async fn handle(&self, packet: &SignalPacket) -> Result<()> {
        if self.state() == ConnectionState::Closed {
            return Err(ProbeError::Closed);
        }

        let found = self
            .inner
            .slots()
            .iter()
            .find(|s| s.dialer.kind() == packet.dialer)
            .map(|s| (s.dialer.clone(), s.state));
        let Some((mut dialer, state)) = found else {
            trace!(peer = %self.inner.remote, dialer = %packet.dialer, "no such dialer, packet ignored");
            return Ok(());
        };

        if packet.ty == PacketType::Syn
            && matches!(state, ConnectionState::Failed | ConnectionState::Disconnected)
        {
            debug!(peer = %self.inner.remote, dialer = %packet.dialer, "remote restarted handshake");
            if let Some(fresh) = self.inner.restart(packet.dialer, None) {
                dialer = fresh;
            }
        }

        dialer.handle(packet).await
    }

    /// Stop every dialer and close connected transports. Idempotent.
    pub async fn close(&self) {
        if self.inner.state.send_replace(ConnectionState::Closed) == ConnectionState::Closed {
            return;
        }
        self.inner.shutdown.cancel();

        let drained: Vec<(Dialer, Option<Arc<dyn Transport>>)> = self
            .inner
            .slots()
            .iter_mut()
            .map(|slot| {
                slot.state = ConnectionState::Closed;
                (slot.dialer.clone(), slot.transport.take())
            })
            .collect();

        for (dialer, transport) in drained {
            if let Some(transport) = transport {
                self.inner.transports.remove(&self.inner.remote, transport.kind());
                if let Err(e) = transport.close().await {
                    debug!(peer = %self.inner.remote, error = %e, "transport close failed");
                }
            }
            dialer.close().await;
        }
        info!(peer = %self.inner.remote, "probe closed");
    }
}

impl fmt::Debug for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Probe")
            .field("local", &self.inner.local)
            .field("remote", &self.inner.remote)
            .field("state", &self.state())
            .finish()
    }
}

impl ProbeInner {
    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn start_event_loop(self: &Arc<Self>) {
        let rx = self
            .events_rx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(mut rx) = rx else {
            return;
        };

        let inner = self.clone();
        tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    biased;
                    () = inner.shutdown.cancelled() => break,
                    envelope = rx.recv() => envelope,
                };
                let Some(envelope) = envelope else {
                    break;
                };
                inner.apply(envelope);
            }
            trace!(peer = %inner.remote, "probe event loop stopped");
        });
    }

    fn spawn_run(self: &Arc<Self>, dialer: Dialer, generation: u64, cancel: Shutdown) {
        let events = self.events.clone();
        let remote = self.remote;
        tokio::spawn(async move {
            let kind = dialer.kind();
            let checking = ProbeEvent::StateChanged {
                dialer: kind,
                state: ConnectionState::Checking,
            };
            if events.send(Envelope { generation, event: checking }).await.is_err() {
                return;
            }

            let event = match run_dialer(&dialer, &cancel).await {
                Ok(transport) => ProbeEvent::Connected {
                    dialer: kind,
                    transport,
                },
                Err(ProbeError::Cancelled) => {
                    debug!(peer = %remote, dialer = %kind, "dial cancelled");
                    return;
                }
                Err(error) => ProbeEvent::Failed { dialer: kind, error },
            };

            if let Err(mpsc::error::SendError(envelope)) = events.send(Envelope { generation, event }).await {
                if let ProbeEvent::Connected { transport, .. } = envelope.event {
                    let _ = transport.close().await;
                }
            }
        });
    }

    fn apply(self: &Arc<Self>, envelope: Envelope) {
        let Envelope { generation, event } = envelope;
        let kind = event.dialer();
        let mut slots = self.slots();
        let Some(slot) = slots.iter_mut().find(|s| s.dialer.kind() == kind) else {
            return;
        };

        if slot.generation != generation || self.shutdown.is_cancelled() {
            trace!(peer = %self.remote, dialer = %kind, generation, "stale probe event");
            if let ProbeEvent::Connected { transport, .. } = event {
                tokio::spawn(async move {
                    let _ = transport.close().await;
                });
            }
            return;
        }

        match event {
            ProbeEvent::StateChanged { state, .. } => {
                trace!(peer = %self.remote, dialer = %kind, %state, "dialer state");
                slot.state = state;
                if state == ConnectionState::Disconnected {
                    warn!(peer = %self.remote, dialer = %kind, "transport lost");
                    if let Some(transport) = slot.transport.take() {
                        self.transports.remove(&self.remote, transport.kind());
                        tokio::spawn(async move {
                            let _ = transport.close().await;
                        });
                    }
                    self.schedule_retry(slot);
                }
            }
            ProbeEvent::Connected { transport, .. } => {
                slot.state = ConnectionState::Connected;
                slot.retries = 0;
                slot.transport = Some(transport.clone());
                let best = self.transports.insert(self.remote, transport.clone());
                info!(
                    peer = %self.remote,
                    dialer = %kind,
                    transport = %transport.kind(),
                    remote = %transport.remote_addr(),
                    best,
                    "peer connected"
                );

                let monitor = slot.dialer.agent_state();
                let cancel = slot.cancel.clone();
                drop(slots);

                if let Some(agent_state) = monitor {
                    self.spawn_monitor(kind, generation, cancel, agent_state);
                }
                if let Some(on_success) = &self.on_success {
                    on_success(self.remote, transport);
                }
                self.recompute();
                return;
            }
            ProbeEvent::Failed { error, .. } => {
                warn!(peer = %self.remote, dialer = %kind, error = %error, "dialer failed");
                slot.state = ConnectionState::Failed;
                if error.should_retry() {
                    self.schedule_retry(slot);
                }
            }
        }

        drop(slots);
        self.recompute();
    }

    fn schedule_retry(self: &Arc<Self>, slot: &mut Slot) {
        let kind = slot.dialer.kind();
        let attempt = slot.retries + 1;
        let Some(delay) = self.config.retry.backoff(attempt) else {
            if self.config.retry.max_retries > 0 {
                warn!(peer = %self.remote, dialer = %kind, retries = slot.retries, "retries exhausted");
            }
            return;
        };
        slot.retries = attempt;

        debug!(peer = %self.remote, dialer = %kind, attempt, ?delay, "retry scheduled");
        let generation = slot.generation;
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = inner.shutdown.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    inner.restart(kind, Some(generation));
                }
            }
        });
    }

    /// Replace the dialer of `kind` with a fresh one and run it.
    ///
    /// With `expected`, only restarts if the slot is still on that
    /// generation. Returns the fresh dialer.
    fn restart(self: &Arc<Self>, kind: DialerKind, expected: Option<u64>) -> Option<Dialer> {
        if self.shutdown.is_cancelled() {
            return None;
        }

        let (old, old_transport, dialer, generation, cancel) = {
            let mut slots = self.slots();
            let slot = slots.iter_mut().find(|s| s.dialer.kind() == kind)?;
            if expected.is_some_and(|g| g != slot.generation) {
                return None;
            }

            slot.cancel.cancel();
            let fresh = slot.dialer.renew();
            let old = std::mem::replace(&mut slot.dialer, fresh);
            slot.generation += 1;
            slot.cancel = self.shutdown.child();
            slot.state = ConnectionState::Checking;
            (
                old,
                slot.transport.take(),
                slot.dialer.clone(),
                slot.generation,
                slot.cancel.clone(),
            )
        };

        info!(peer = %self.remote, dialer = %kind, generation, "restarting dialer");
        if let Some(transport) = &old_transport {
            self.transports.remove(&self.remote, transport.kind());
        }
        tokio::spawn(async move {
            if let Some(transport) = old_transport {
                let _ = transport.close().await;
            }
            old.close().await;
        });

        self.spawn_run(dialer.clone(), generation, cancel);
        self.recompute();
        Some(dialer)
    }

    fn spawn_monitor(
        self: &Arc<Self>,
        kind: DialerKind,
        generation: u64,
        cancel: Shutdown,
        mut agent_state: watch::Receiver<AgentState>,
    ) {
        let events = self.events.clone();
        tokio::spawn(async move {
            let lost = tokio::select! {
                biased;
                () = cancel.cancelled() => false,
                lost = async {
                    agent_state
                        .wait_for(|s| {
                            matches!(s, AgentState::Disconnected | AgentState::Failed | AgentState::Closed)
                        })
                        .await
                        .is_ok()
                } => lost,
            };
            if lost {
                let event = ProbeEvent::StateChanged {
                    dialer: kind,
                    state: ConnectionState::Disconnected,
                };
                let _ = events.send(Envelope { generation, event }).await;
            }
        });
    }

    fn recompute(&self) {
        let aggregate = ConnectionState::aggregate(self.slots().iter().map(|s| s.state));
        let remote = self.remote;
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed || *state == aggregate {
                return false;
            }
            debug!(peer = %remote, from = %state, to = %aggregate, "probe state changed");
            *state = aggregate;
            true
        });
    }
}

async fn run_dialer(dialer: &Dialer, cancel: &Shutdown) -> Result<Arc<dyn Transport>> {
    dialer.prepare(cancel).await?;
    dialer.dial(cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::dialer::{DialContext, IceDialer};
    use crate::signal::LocalBus;
    use crate::test_support::{Script, ScriptedBuilder};
    use async_trait::async_trait;
    use meshlink_core::{PeerDirectory, PeerRecord, PublicKey, SignalChannel, SignalHandler};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Route(Probe);

    #[async_trait]
    impl SignalHandler for Route {
        async fn on_signal(&self, _from: PeerId, payload: &[u8]) {
            let packet = SignalPacket::from_bytes(payload).unwrap();
            self.0.probe();
            let _ = self.0.handle(&packet).await;
        }
    }

    fn config(retry: RetryPolicy) -> ProbeConfig {
        ProbeConfig {
            syn_interval: Duration::from_millis(20),
            handshake_timeout: Duration::from_millis(400),
            retry,
            verify_sender_key: false,
            ..Default::default()
        }
    }

    fn ice_probe(
        bus: &LocalBus,
        local: u64,
        remote: u64,
        tie_breaker: u64,
        retry: RetryPolicy,
        on_success: Option<OnSuccess>,
    ) -> (Probe, Arc<Script>) {
        let ctx = DialContext {
            local: PeerId::from_u64(local),
            remote: PeerId::from_u64(remote),
            record: PeerRecord::new(format!("peer-{local}"), PublicKey::from_bytes([local as u8; 32])),
            directory: Arc::new(PeerDirectory::new()),
            config: config(retry.clone()),
        };
        let (builder, script) = ScriptedBuilder::new(tie_breaker, 1);
        let channel = Arc::new(bus.channel(ctx.local));
        let dialer = Dialer::Ice(Arc::new(IceDialer::new(ctx, channel.clone(), Arc::new(builder))));
        let probe = Probe::new(
            PeerId::from_u64(local),
            PeerId::from_u64(remote),
            vec![dialer],
            ProbeOptions {
                config: config(retry),
                on_success,
                ..Default::default()
            },
        );
        channel.subscribe(PeerId::from_u64(local), Arc::new(Route(probe.clone())));
        (probe, script)
    }

    async fn wait_for(probe: &Probe, target: ConnectionState) {
        let mut rx = probe.subscribe();
        tokio::time::timeout(Duration::from_secs(3), rx.wait_for(|s| *s == target))
            .await
            .unwrap_or_else(|_| panic!("{probe:?} never reached {target}"))
            .unwrap();
    }

    #[test]
    fn test_aggregate() {
        use ConnectionState::*;
        assert_eq!(ConnectionState::aggregate([Failed, Connected]), Connected);
        assert_eq!(ConnectionState::aggregate([Failed, Checking]), Checking);
        assert_eq!(ConnectionState::aggregate([Failed, Disconnected]), Disconnected);
        assert_eq!(ConnectionState::aggregate([Failed, Failed]), Failed);
        assert_eq!(ConnectionState::aggregate([New, New]), New);
        assert_eq!(ConnectionState::aggregate([]), New);
    }

    #[tokio::test]
    async fn test_probe_is_idempotent() {
        let bus = LocalBus::new();
        let (probe, _) = ice_probe(&bus, 100, 200, 1, RetryPolicy::none(), None);
        assert_eq!(probe.state(), ConnectionState::New);
        assert!(probe.probe());
        assert!(!probe.probe());
        assert_eq!(probe.state(), ConnectionState::Checking);
        probe.close().await;
    }

    #[tokio::test]
    async fn test_pair_connects_and_reports() {
        let bus = LocalBus::new();
        let successes = Arc::new(AtomicUsize::new(0));
        let on_success: OnSuccess = {
            let successes = successes.clone();
            Arc::new(move |peer, _transport| {
                assert_eq!(peer, PeerId::from_u64(200));
                successes.fetch_add(1, Ordering::SeqCst);
            })
        };
        let (a, _) = ice_probe(&bus, 100, 200, 3, RetryPolicy::none(), Some(on_success));
        let (b, _) = ice_probe(&bus, 200, 100, 4, RetryPolicy::none(), None);

        a.probe();
        b.probe();
        wait_for(&a, ConnectionState::Connected).await;
        wait_for(&b, ConnectionState::Connected).await;

        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert!(a.transport().is_some());
        assert_eq!(a.dialer_state(DialerKind::Ice), Some(ConnectionState::Connected));
        assert_eq!(a.dialer_state(DialerKind::Relay), None);
        assert_eq!(a.syn_sent(DialerKind::Ice), 0);
        assert!(b.syn_sent(DialerKind::Ice) >= 1);
    }

    #[tokio::test]
    async fn test_failure_without_retry_is_terminal() {
        let bus = LocalBus::new();
        let (a, script_a) = ice_probe(&bus, 100, 200, 3, RetryPolicy::none(), None);
        let (b, script_b) = ice_probe(&bus, 200, 100, 4, RetryPolicy::none(), None);
        script_a.fail_checks.store(true, Ordering::SeqCst);
        script_b.fail_checks.store(true, Ordering::SeqCst);

        a.probe();
        b.probe();
        wait_for(&a, ConnectionState::Failed).await;
        wait_for(&b, ConnectionState::Failed).await;
        assert!(!a.probe());
        assert_eq!(script_a.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_rebuilds_dialer() {
        let bus = LocalBus::new();
        let retry = RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            multiplier: 2.0,
        };
        // Lone initiator: every attempt times out waiting for an ACK.
        let (a, script) = ice_probe(&bus, 200, 100, 3, retry, None);
        a.probe();
        wait_for(&a, ConnectionState::Failed).await;

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(a.state(), ConnectionState::Failed);
        assert_eq!(a.retries(DialerKind::Ice), Some(2));
        // Agents are built after the ACK gate, which never opens.
        assert_eq!(script.builds.load(Ordering::SeqCst), 0);
        assert!(a.syn_sent(DialerKind::Ice) >= 1);
        a.close().await;
    }

    #[tokio::test]
    async fn test_foreign_kind_ignored() {
        let bus = LocalBus::new();
        let (a, _) = ice_probe(&bus, 100, 200, 3, RetryPolicy::none(), None);
        let packet = SignalPacket::syn(PeerId::from_u64(200), DialerKind::Relay);
        a.handle(&packet).await.unwrap();
        assert_eq!(a.state(), ConnectionState::New);
    }

    #[tokio::test]
    async fn test_close() {
        let bus = LocalBus::new();
        let (a, _) = ice_probe(&bus, 100, 200, 3, RetryPolicy::none(), None);
        a.probe();
        a.close().await;
        a.close().await;
        assert_eq!(a.state(), ConnectionState::Closed);
        assert!(!a.probe());
        let packet = SignalPacket::syn(PeerId::from_u64(200), DialerKind::Ice);
        assert!(matches!(a.handle(&packet).await, Err(ProbeError::Closed)));
    }
}

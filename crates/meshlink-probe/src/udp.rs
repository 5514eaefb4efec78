//! ICE-lite agent over a single UDP socket.
//!
//! Candidates are the socket's host address plus any server-reflexive
//! mappings learned from STUN. The controlling side sends keyed connectivity
//! checks to every remote candidate; the first candidate to answer is
//! nominated. The controlled side answers checks that authenticate against
//! its own password and adopts the nominated address.
//!
//! Control messages share the socket with tunnel traffic:
//!
//! ```text
//! [magic "MLCK":4][type:1][txid:12][ulen:1][username:ulen][mac:16]
//! ```
//!
//! `username` is `<controlled ufrag>:<controlling ufrag>` and `mac` is the
//! first 16 bytes of a BLAKE3 keyed hash (key = BLAKE3 of the controlled
//! side's password) over everything before it.

use crate::agent::{AgentBuilder, AgentState, Candidate, CandidateType, Credentials, IceAgent};
use crate::config::AgentConfig;
use crate::error::{ProbeError, Result};
use crate::stun::{self, TransactionId};
use async_trait::async_trait;
use meshlink_core::{CoreError, Endpoint, PeerId, Shutdown, Transport, TransportKind};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

const CONTROL_MAGIC: [u8; 4] = *b"MLCK";
const MAC_LEN: usize = 16;
const MAX_DATAGRAM: usize = 65535;

/// Control message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlType {
    CheckRequest = 1,
    CheckResponse = 2,
    Nominate = 3,
    NominateAck = 4,
}

impl ControlType {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::CheckRequest),
            2 => Some(Self::CheckResponse),
            3 => Some(Self::Nominate),
            4 => Some(Self::NominateAck),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Control {
    ty: ControlType,
    txid: TransactionId,
    username: String,
}

fn mac_key(pwd: &str) -> [u8; 32] {
    *blake3::hash(pwd.as_bytes()).as_bytes()
}

impl Control {
    fn encode(&self, pwd: &str) -> Vec<u8> {
        let user = self.username.as_bytes();
        let ulen = user.len().min(u8::MAX as usize);
        let mut out = Vec::with_capacity(4 + 1 + 12 + 1 + ulen + MAC_LEN);
        out.extend_from_slice(&CONTROL_MAGIC);
        out.push(self.ty as u8);
        out.extend_from_slice(&self.txid);
        out.push(ulen as u8);
        out.extend_from_slice(&user[..ulen]);
        let mac = blake3::keyed_hash(&mac_key(pwd), &out);
        out.extend_from_slice(&mac.as_bytes()[..MAC_LEN]);
        out
    }

    /// Parse and authenticate; `None` if this is not a valid control message
    fn decode(bytes: &[u8], pwd: &str) -> Option<Self> {
        if bytes.len() < 4 + 1 + 12 + 1 + MAC_LEN || bytes[..4] != CONTROL_MAGIC {
            return None;
        }
        let ty = ControlType::from_u8(bytes[4])?;
        let ulen = bytes[17] as usize;
        let body_len = 18 + ulen;
        if bytes.len() != body_len + MAC_LEN {
            return None;
        }

        let expected = blake3::keyed_hash(&mac_key(pwd), &bytes[..body_len]);
        if expected.as_bytes()[..MAC_LEN] != bytes[body_len..] {
            return None;
        }

        let mut txid = [0u8; 12];
        txid.copy_from_slice(&bytes[5..17]);
        let username = std::str::from_utf8(&bytes[18..body_len]).ok()?.to_string();
        Some(Self { ty, txid, username })
    }
}

fn is_control(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[..4] == CONTROL_MAGIC
}

/// Best guess at the address other hosts see for an unspecified bind
async fn primary_ip() -> IpAddr {
    let probe = async {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        // No packet is sent; connect only selects a route.
        socket.connect("192.0.2.1:9").await?;
        Ok::<IpAddr, std::io::Error>(socket.local_addr()?.ip())
    };
    probe
        .await
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

struct AgentInner {
    socket: UdpSocket,
    config: AgentConfig,
    local: Credentials,
    tie_breaker: u64,
    remote: Mutex<Option<Credentials>>,
    remote_candidates: Mutex<Vec<Candidate>>,
    stun_pending: Mutex<HashMap<TransactionId, oneshot::Sender<SocketAddr>>>,
    checks_pending: Mutex<HashMap<TransactionId, SocketAddr>>,
    check_ok: watch::Sender<Option<SocketAddr>>,
    nominate_ack: watch::Sender<bool>,
    nominated: watch::Sender<Option<SocketAddr>>,
    selected: Mutex<Option<SocketAddr>>,
    data_tx: mpsc::Sender<Vec<u8>>,
    data_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    state: watch::Sender<AgentState>,
    shutdown: Shutdown,
}

impl AgentInner {
    fn set_state(&self, state: AgentState) {
        self.state.send_if_modified(|current| {
            if *current == state || *current == AgentState::Closed {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn remote_credentials(&self) -> Option<Credentials> {
        self.remote.lock().ok().and_then(|r| r.clone())
    }

    fn classify(&self, addr: SocketAddr) -> TransportKind {
        let host = self
            .remote_candidates
            .lock()
            .map(|c| c.iter().any(|c| c.address == addr && c.kind == CandidateType::Host))
            .unwrap_or(false);
        if host { TransportKind::Direct } else { TransportKind::Ice }
    }

    async fn send_control(&self, ty: ControlType, txid: TransactionId, username: &str, pwd: &str, to: SocketAddr) {
        let msg = Control {
            ty,
            txid,
            username: username.to_string(),
        };
        if let Err(e) = self.socket.send_to(&msg.encode(pwd), to).await {
            trace!(%to, error = %e, "control send failed");
        }
    }

    /// Handle a control datagram; `false` if it did not authenticate
    async fn on_control(&self, bytes: &[u8], from: SocketAddr) -> bool {
        // Requests and nominations are keyed with our password, responses
        // and acks with the remote's.
        if let Some(msg) = Control::decode(bytes, &self.local.pwd) {
            let expected_prefix = format!("{}:", self.local.ufrag);
            if !msg.username.starts_with(&expected_prefix) {
                debug!(%from, user = %msg.username, "check for unknown ufrag");
                return true;
            }
            match msg.ty {
                ControlType::CheckRequest => {
                    trace!(%from, "answering connectivity check");
                    self.send_control(ControlType::CheckResponse, msg.txid, &msg.username, &self.local.pwd, from)
                        .await;
                }
                ControlType::Nominate => {
                    self.send_control(ControlType::NominateAck, msg.txid, &msg.username, &self.local.pwd, from)
                        .await;
                    self.nominated.send_if_modified(|n| {
                        if n.is_none() {
                            *n = Some(from);
                            true
                        } else {
                            false
                        }
                    });
                }
                _ => {}
            }
            return true;
        }

        let Some(remote) = self.remote_credentials() else {
            return false;
        };
        let Some(msg) = Control::decode(bytes, &remote.pwd) else {
            return false;
        };
        match msg.ty {
            ControlType::CheckResponse => {
                let target = self.checks_pending.lock().ok().and_then(|mut p| p.remove(&msg.txid));
                if let Some(target) = target {
                    self.check_ok.send_if_modified(|ok| {
                        if ok.is_none() {
                            *ok = Some(target);
                            true
                        } else {
                            false
                        }
                    });
                }
            }
            ControlType::NominateAck => {
                self.nominate_ack.send_replace(true);
            }
            _ => {}
        }
        true
    }

    fn on_stun(&self, bytes: &[u8]) {
        match stun::parse_binding_success(bytes) {
            Ok((txid, mapped)) => {
                let waiter = self.stun_pending.lock().ok().and_then(|mut p| p.remove(&txid));
                if let Some(waiter) = waiter {
                    let _ = waiter.send(mapped);
                }
            }
            Err(e) => trace!(error = %e, "ignoring STUN message"),
        }
    }

    fn on_data(&self, bytes: &[u8], from: SocketAddr) {
        let selected = self.selected.lock().ok().and_then(|s| *s);
        if selected != Some(from) {
            trace!(%from, "datagram from unselected address dropped");
            return;
        }
        if self.data_tx.try_send(bytes.to_vec()).is_err() {
            debug!(%from, "receive queue full, dropping datagram");
        }
    }

    async fn recv_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let received = tokio::select! {
                () = self.shutdown.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };
            let (n, from) = match received {
                Ok(r) => r,
                Err(e) => {
                    debug!(error = %e, "udp receive error");
                    continue;
                }
            };
            let datagram = &buf[..n];

            if stun::is_stun(datagram) {
                self.on_stun(datagram);
            } else if is_control(datagram) && self.on_control(datagram, from).await {
                continue;
            } else {
                self.on_data(datagram, from);
            }
        }
        trace!("udp agent receive loop stopped");
    }

    async fn reflexive(&self, server: SocketAddr) -> Result<SocketAddr> {
        let (txid, request) = stun::binding_request();
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.stun_pending.lock() {
            pending.insert(txid, tx);
        }
        self.socket.send_to(&request, server).await?;

        let result = tokio::time::timeout(self.config.stun_timeout, rx).await;
        if let Ok(mut pending) = self.stun_pending.lock() {
            pending.remove(&txid);
        }
        match result {
            Ok(Ok(addr)) => Ok(addr),
            Ok(Err(_)) => Err(ProbeError::Stun("binding waiter dropped".into())),
            Err(_) => Err(ProbeError::Stun(format!("no answer from {server}"))),
        }
    }

    fn transport(self: &Arc<Self>, remote: SocketAddr) -> Result<Arc<dyn Transport>> {
        let rx = self
            .data_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .ok_or_else(|| ProbeError::Agent("transport already taken".into()))?;
        if let Ok(mut selected) = self.selected.lock() {
            *selected = Some(remote);
        }
        let kind = self.classify(remote);
        self.set_state(AgentState::Connected);
        info!(%remote, %kind, "udp path selected");

        Ok(Arc::new(UdpTransport {
            agent: self.clone(),
            remote,
            kind,
            rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
        }))
    }

    fn set_remote(&self, remote: &Credentials) {
        if let Ok(mut slot) = self.remote.lock() {
            *slot = Some(remote.clone());
        }
    }

    fn fail(&self, reason: String) -> ProbeError {
        self.set_state(AgentState::Failed);
        ProbeError::Agent(reason)
    }
}

/// UDP agent
pub struct UdpAgent {
    inner: Arc<AgentInner>,
}

impl UdpAgent {
    /// Bind the socket and start its receive loop
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the socket cannot be bound.
    pub async fn bind(config: AgentConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind).await?;
        let (data_tx, data_rx) = mpsc::channel(config.receive_queue.max(1));
        let (state, _) = watch::channel(AgentState::New);

        let inner = Arc::new(AgentInner {
            socket,
            config,
            local: Credentials::random(),
            tie_breaker: rand::random(),
            remote: Mutex::new(None),
            remote_candidates: Mutex::new(Vec::new()),
            stun_pending: Mutex::new(HashMap::new()),
            checks_pending: Mutex::new(HashMap::new()),
            check_ok: watch::channel(None).0,
            nominate_ack: watch::channel(false).0,
            nominated: watch::channel(None).0,
            selected: Mutex::new(None),
            data_tx,
            data_rx: Mutex::new(Some(data_rx)),
            state,
            shutdown: Shutdown::new(),
        });

        tokio::spawn(inner.clone().recv_loop());
        debug!(addr = ?inner.socket.local_addr().ok(), "udp agent bound");
        Ok(Self { inner })
    }

    /// Socket address
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.socket.local_addr()?)
    }
}

#[async_trait]
impl IceAgent for UdpAgent {
    fn credentials(&self) -> Credentials {
        self.inner.local.clone()
    }

    fn tie_breaker(&self) -> u64 {
        self.inner.tie_breaker
    }

    async fn gather(&self) -> Result<Vec<Candidate>> {
        let base = self.inner.socket.local_addr()?;
        let host_addr = if base.ip().is_unspecified() {
            SocketAddr::new(primary_ip().await, base.port())
        } else {
            base
        };

        let mut candidates = vec![Candidate::host(host_addr)];
        for server in &self.inner.config.stun_servers {
            match self.inner.reflexive(*server).await {
                Ok(mapped) if candidates.iter().all(|c| c.address != mapped) => {
                    debug!(%server, %mapped, "server-reflexive candidate");
                    candidates.push(Candidate::server_reflexive(mapped, host_addr));
                }
                Ok(_) => {}
                Err(e) => debug!(%server, error = %e, "STUN server unusable"),
            }
        }
        Ok(candidates)
    }

    fn add_remote_candidate(&self, candidate: Candidate) {
        if let Ok(mut remote) = self.inner.remote_candidates.lock() {
            if !remote.iter().any(|c| c.address == candidate.address) {
                trace!(addr = %candidate.address, kind = %candidate.kind, "remote candidate added");
                remote.push(candidate);
                remote.sort_by_key(|c| std::cmp::Reverse(c.priority));
            }
        }
    }

    async fn dial(&self, remote: &Credentials, shutdown: &Shutdown) -> Result<Arc<dyn Transport>> {
        let inner = &self.inner;
        inner.set_remote(remote);
        inner.set_state(AgentState::Checking);

        let username = format!("{}:{}", remote.ufrag, inner.local.ufrag);
        let deadline = Instant::now() + inner.config.check_timeout;
        let mut check_ok = inner.check_ok.subscribe();
        let mut ticker = tokio::time::interval(inner.config.check_interval.max(Duration::from_millis(1)));

        let selected = loop {
            if let Some(addr) = *check_ok.borrow_and_update() {
                break addr;
            }
            tokio::select! {
                () = shutdown.cancelled() => return Err(ProbeError::Cancelled),
                () = tokio::time::sleep_until(deadline) => {
                    return Err(inner.fail("no candidate answered connectivity checks".into()));
                }
                _ = check_ok.changed() => continue,
                _ = ticker.tick() => {}
            }

            let targets: Vec<SocketAddr> = inner
                .remote_candidates
                .lock()
                .map(|c| c.iter().map(|c| c.address).collect())
                .unwrap_or_default();
            for target in targets {
                let txid: TransactionId = rand::random();
                if let Ok(mut pending) = inner.checks_pending.lock() {
                    pending.insert(txid, target);
                }
                inner
                    .send_control(ControlType::CheckRequest, txid, &username, &remote.pwd, target)
                    .await;
            }
        };

        let mut acked = inner.nominate_ack.subscribe();
        let nominate_txid: TransactionId = rand::random();
        loop {
            inner
                .send_control(ControlType::Nominate, nominate_txid, &username, &remote.pwd, selected)
                .await;
            if *acked.borrow_and_update() {
                break;
            }
            tokio::select! {
                () = shutdown.cancelled() => return Err(ProbeError::Cancelled),
                () = tokio::time::sleep_until(deadline) => {
                    return Err(inner.fail(format!("nomination of {selected} not acknowledged")));
                }
                _ = acked.changed() => {}
                _ = tokio::time::sleep(inner.config.check_interval) => {}
            }
        }

        inner.transport(selected)
    }

    async fn accept(&self, remote: &Credentials, shutdown: &Shutdown) -> Result<Arc<dyn Transport>> {
        let inner = &self.inner;
        inner.set_remote(remote);
        inner.set_state(AgentState::Checking);

        let mut nominated = inner.nominated.subscribe();
        let deadline = Instant::now() + inner.config.check_timeout;
        let selected = tokio::select! {
            () = shutdown.cancelled() => return Err(ProbeError::Cancelled),
            () = tokio::time::sleep_until(deadline) => {
                return Err(inner.fail("remote never nominated a pair".into()));
            }
            addr = nominated.wait_for(Option::is_some) => addr.map(|a| *a).map_err(|_| ProbeError::Closed)?,
        };
        let Some(selected) = selected else {
            return Err(ProbeError::Closed);
        };
        inner.transport(selected)
    }

    fn subscribe_state(&self) -> watch::Receiver<AgentState> {
        self.inner.state.subscribe()
    }

    async fn close(&self) {
        self.inner.set_state(AgentState::Closed);
        self.inner.shutdown.cancel();
    }
}

impl Drop for UdpAgent {
    fn drop(&mut self) {
        // Transports keep the socket alive through their own reference.
        if self.inner.selected.lock().map(|s| s.is_none()).unwrap_or(true) {
            self.inner.shutdown.cancel();
        }
    }
}

/// Builds a [`UdpAgent`] per remote peer
#[derive(Debug, Clone, Default)]
pub struct UdpAgentBuilder {
    config: AgentConfig,
}

impl UdpAgentBuilder {
    /// Builder binding agents per `config`
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AgentBuilder for UdpAgentBuilder {
    async fn build(&self, local: PeerId, remote: PeerId) -> Result<Arc<dyn IceAgent>> {
        let agent = UdpAgent::bind(self.config.clone()).await?;
        debug!(%local, %remote, addr = ?agent.local_addr().ok(), "agent created");
        Ok(Arc::new(agent))
    }
}

/// Connected UDP path
pub struct UdpTransport {
    agent: Arc<AgentInner>,
    remote: SocketAddr,
    kind: TransportKind,
    rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for UdpTransport {
    async fn write(&self, buf: &[u8]) -> meshlink_core::Result<usize> {
        if self.is_closed() {
            return Err(CoreError::Closed);
        }
        Ok(self.agent.socket.send_to(buf, self.remote).await?)
    }

    async fn read(&self, buf: &mut [u8]) -> meshlink_core::Result<usize> {
        if self.is_closed() {
            return Err(CoreError::Closed);
        }
        let mut rx = self.rx.lock().await;
        let datagram = tokio::select! {
            () = self.agent.shutdown.cancelled() => None,
            datagram = rx.recv() => datagram,
        };
        let datagram = datagram.ok_or(CoreError::Closed)?;
        let n = datagram.len().min(buf.len());
        if n < datagram.len() {
            warn!(len = datagram.len(), cap = buf.len(), "datagram truncated");
        }
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok(n)
    }

    fn remote_addr(&self) -> String {
        self.remote.to_string()
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::Direct(self.remote)
    }

    async fn close(&self) -> meshlink_core::Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.agent.set_state(AgentState::Closed);
            self.agent.shutdown.cancel();
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.agent.shutdown.is_cancelled()
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.agent.shutdown.cancel();
    }
}

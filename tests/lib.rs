//! Shared fixtures for meshlink integration tests
//!
//! Spawns brokers on ephemeral ports, speaks the relay wire format by hand,
//! and provides signaling taps and agents with scripted outcomes.

use async_trait::async_trait;
use meshlink_core::{PeerId, PublicKey, Shutdown, SignalChannel, SignalHandler, Transport};
use meshlink_probe::{
    AgentBuilder, AgentState, Candidate, Credentials, IceAgent, LocalChannel, ProbeError, SignalPacket,
};
use meshlink_relay::frame::{self, FrameHeader};
use meshlink_relay::upgrade::{self, RelayUrl};
use meshlink_relay::{Command, RelayServer, RelayServerConfig, UPGRADE_TOKEN};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;

/// Install a test-writer subscriber once; honors `RUST_LOG`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic key filled with `b`
pub fn key(b: u8) -> PublicKey {
    PublicKey::from_bytes([b; 32])
}

/// Broker on `127.0.0.1:0` with `config`'s other settings, plus its URL
pub async fn spawn_relay(config: RelayServerConfig) -> (Arc<RelayServer>, String) {
    let config = RelayServerConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        ..config
    };
    let server = Arc::new(RelayServer::bind(config).await.expect("bind relay"));
    let url = format!("http://{}/relay", server.local_addr().unwrap());
    server.spawn();
    (server, url)
}

/// Poll `check` until it holds or `within` elapses
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Wait until `server` holds exactly `count` sessions
pub async fn wait_sessions(server: &RelayServer, count: usize, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if server.session_count().await == count {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until `id` is registered with `server`
pub async fn wait_registered(server: &RelayServer, id: &PeerId, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if server.is_registered(id).await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Hand-driven broker connection speaking raw frames
pub struct RawPeer {
    pub id: PeerId,
    pub reader: OwnedReadHalf,
    pub writer: OwnedWriteHalf,
}

impl RawPeer {
    /// Connect and complete the HTTP upgrade without registering
    pub async fn upgraded(url: &str, id: PeerId) -> Self {
        let url: RelayUrl = url.parse().expect("relay url");
        let mut stream = TcpStream::connect(url.authority()).await.expect("connect");
        upgrade::client_upgrade(&mut stream, &url, UPGRADE_TOKEN)
            .await
            .expect("upgrade");
        let (reader, writer) = stream.into_split();
        Self { id, reader, writer }
    }

    /// Connect, upgrade and register with `key`
    pub async fn register(url: &str, key: &PublicKey) -> Self {
        let mut peer = Self::upgraded(url, PeerId::from_public_key(key)).await;
        let header = FrameHeader::new(Command::Register, 32, peer.id, PeerId::ZERO);
        frame::write_frame(&mut peer.writer, &header, key.as_bytes())
            .await
            .expect("register");
        peer
    }

    /// Write one frame from this peer's id
    pub async fn send(&mut self, command: Command, to: PeerId, payload: &[u8]) {
        self.send_as(self.id, command, to, payload).await;
    }

    /// Write one frame claiming `from`
    pub async fn send_as(&mut self, from: PeerId, command: Command, to: PeerId, payload: &[u8]) {
        let header = FrameHeader::new(command, payload.len() as u32, from, to);
        frame::write_frame(&mut self.writer, &header, payload)
            .await
            .expect("write frame");
    }

    /// Next frame, or `None` once the broker closes the stream
    pub async fn recv(&mut self) -> Option<(FrameHeader, Vec<u8>)> {
        let (header, _) = frame::read_header(&mut self.reader, frame::DEFAULT_MAX_PAYLOAD)
            .await
            .ok()??;
        let mut payload = vec![0u8; header.payload_len as usize];
        self.reader.read_exact(&mut payload).await.ok()?;
        Some((header, payload))
    }

    /// [`RawPeer::recv`] bounded by `within`
    pub async fn recv_within(&mut self, within: Duration) -> Option<(FrameHeader, Vec<u8>)> {
        tokio::time::timeout(within, self.recv()).await.ok()?
    }
}

/// Signal channel recording every packet it sends before passing it on
#[derive(Clone)]
pub struct Tap {
    inner: LocalChannel,
    sent: Arc<Mutex<Vec<(PeerId, SignalPacket)>>>,
}

impl Tap {
    pub fn new(inner: LocalChannel) -> Self {
        Self {
            inner,
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Decoded packets sent so far, with their destinations
    pub fn sent(&self) -> Vec<(PeerId, SignalPacket)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl SignalChannel for Tap {
    async fn send(&self, peer: PeerId, payload: Vec<u8>) -> meshlink_core::Result<()> {
        if let Ok(packet) = SignalPacket::from_bytes(&payload) {
            self.sent.lock().unwrap().push((peer, packet));
        }
        self.inner.send(peer, payload).await
    }

    fn subscribe(&self, local: PeerId, handler: Arc<dyn SignalHandler>) {
        self.inner.subscribe(local, handler);
    }
}

/// Agent that gathers one candidate and fails every connectivity check
pub struct FailingAgent {
    state: watch::Sender<AgentState>,
    tie_breaker: u64,
}

#[async_trait]
impl IceAgent for FailingAgent {
    fn credentials(&self) -> Credentials {
        Credentials::random()
    }

    fn tie_breaker(&self) -> u64 {
        self.tie_breaker
    }

    async fn gather(&self) -> meshlink_probe::Result<Vec<Candidate>> {
        Ok(vec![Candidate::host(([192, 0, 2, 1], 9).into())])
    }

    fn add_remote_candidate(&self, _candidate: Candidate) {}

    async fn dial(&self, _remote: &Credentials, _shutdown: &Shutdown) -> meshlink_probe::Result<Arc<dyn Transport>> {
        self.state.send_replace(AgentState::Failed);
        Err(ProbeError::Agent("no candidate pair answered".into()))
    }

    async fn accept(&self, remote: &Credentials, shutdown: &Shutdown) -> meshlink_probe::Result<Arc<dyn Transport>> {
        self.dial(remote, shutdown).await
    }

    fn subscribe_state(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    async fn close(&self) {
        self.state.send_replace(AgentState::Closed);
    }
}

/// Builds [`FailingAgent`]s
#[derive(Default)]
pub struct FailingAgentBuilder;

#[async_trait]
impl AgentBuilder for FailingAgentBuilder {
    async fn build(&self, _local: PeerId, _remote: PeerId) -> meshlink_probe::Result<Arc<dyn IceAgent>> {
        Ok(Arc::new(FailingAgent {
            state: watch::channel(AgentState::New).0,
            tie_breaker: rand::random(),
        }))
    }
}

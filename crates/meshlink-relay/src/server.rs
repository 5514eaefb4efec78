//! Relay broker server.
//!
//! One task per accepted connection. After the upgrade the first frame must be
//! `Register`; from then on the task reads frames and forwards `Probe` and
//! `Forward` payloads to the target's stream, copying in chunks so the slow
//! side's backpressure reaches the sender.

use crate::error::{RelayError, Result};
use crate::frame::{self, Command, FrameHeader, HEADER_LEN};
use crate::upgrade::{self, UPGRADE_TOKEN};
use meshlink_core::{PeerId, PublicKey, Shutdown};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

const COPY_CHUNK: usize = 16 * 1024;

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayServerConfig {
    /// Listen address
    pub listen: SocketAddr,
    /// A session with no frame for this long is closed
    #[serde(rename = "idle_timeout_ms", with = "meshlink_core::duration::millis")]
    pub idle_timeout: Duration,
    /// Maximum concurrently registered peers
    pub max_sessions: usize,
    /// Largest accepted payload
    pub max_payload: u32,
    /// Reject `Register` frames without a public key
    pub require_key: bool,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], crate::DEFAULT_RELAY_PORT)),
            idle_timeout: crate::DEFAULT_IDLE_TIMEOUT,
            max_sessions: 10_000,
            max_payload: frame::DEFAULT_MAX_PAYLOAD,
            require_key: false,
        }
    }
}

/// Live registration
struct Session {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    generation: u64,
    shutdown: Shutdown,
}

/// Registered peers, one live session per id
#[derive(Default)]
struct SessionTable {
    sessions: Mutex<HashMap<PeerId, Session>>,
    next_generation: AtomicU64,
}

impl SessionTable {
    /// Insert a session, pre-empting any previous one for the same id
    async fn register(
        &self,
        id: PeerId,
        writer: OwnedWriteHalf,
        shutdown: Shutdown,
        max_sessions: usize,
    ) -> Result<u64> {
        let mut sessions = self.sessions.lock().await;
        if !sessions.contains_key(&id) && sessions.len() >= max_sessions {
            return Err(RelayError::ServerFull(max_sessions));
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let session = Session {
            writer: Arc::new(Mutex::new(writer)),
            generation,
            shutdown,
        };
        if let Some(old) = sessions.insert(id, session) {
            info!(peer = %id, old = old.generation, new = generation, "session pre-empted by re-registration");
            old.shutdown.cancel();
        }
        Ok(generation)
    }

    /// Remove `id` only if it still belongs to `generation`
    async fn unregister(&self, id: PeerId, generation: u64) {
        let mut sessions = self.sessions.lock().await;
        if sessions.get(&id).is_some_and(|s| s.generation == generation) {
            sessions.remove(&id);
        }
    }

    async fn target(&self, id: &PeerId) -> Option<(Arc<Mutex<OwnedWriteHalf>>, u64, Shutdown)> {
        self.sessions
            .lock()
            .await
            .get(id)
            .map(|s| (s.writer.clone(), s.generation, s.shutdown.clone()))
    }

    async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn contains(&self, id: &PeerId) -> bool {
        self.sessions.lock().await.contains_key(id)
    }
}

struct ServerState {
    config: RelayServerConfig,
    sessions: SessionTable,
}

/// Relay broker
pub struct RelayServer {
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown: Shutdown,
}

impl RelayServer {
    /// Bind the listener from `config.listen`
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the address cannot be bound.
    pub async fn bind(config: RelayServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        info!(addr = %listener.local_addr()?, "relay server listening");
        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                config,
                sessions: SessionTable::default(),
            }),
            shutdown: Shutdown::new(),
        })
    }

    /// Bound address
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Token cancelling the accept loop and every session
    #[must_use]
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Number of registered peers
    pub async fn session_count(&self) -> usize {
        self.state.sessions.len().await
    }

    /// Whether `id` currently has a live session
    pub async fn is_registered(&self, id: &PeerId) -> bool {
        self.state.sessions.contains(id).await
    }

    /// Accept connections until shut down
    ///
    /// # Errors
    ///
    /// Returns an I/O error if accepting fails.
    pub async fn run(&self) -> Result<()> {
        loop {
            let (stream, addr) = tokio::select! {
                () = self.shutdown.cancelled() => {
                    info!("relay server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => accepted?,
            };

            let state = self.state.clone();
            let shutdown = self.shutdown.child();
            tokio::spawn(async move {
                match handle_connection(stream, addr, state, shutdown).await {
                    Ok(()) => debug!(%addr, "relay connection closed"),
                    Err(e) if e.is_fatal() => warn!(%addr, error = %e, "relay connection dropped"),
                    Err(e) => debug!(%addr, error = %e, "relay connection ended"),
                }
            });
        }
    }

    /// Spawn [`RelayServer::run`] on the runtime
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<Result<()>> {
        let server = Arc::clone(self);
        tokio::spawn(async move { server.run().await })
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: Shutdown,
) -> Result<()> {
    let config = &state.config;
    stream.set_nodelay(true)?;

    let path = tokio::time::timeout(
        config.idle_timeout,
        upgrade::accept_upgrade(&mut stream, UPGRADE_TOKEN),
    )
    .await
    .map_err(|_| RelayError::Timeout)??;
    trace!(%addr, %path, "relay upgrade accepted");

    let (mut reader, writer) = stream.into_split();

    let first = tokio::time::timeout(
        config.idle_timeout,
        frame::read_header(&mut reader, config.max_payload),
    )
    .await
    .map_err(|_| RelayError::Timeout)??;
    let Some((header, _)) = first else {
        return Ok(());
    };

    if header.command != Command::Register {
        return Err(RelayError::NotRegistered(header.command.to_string()));
    }
    let id = header.from;
    authenticate(&mut reader, &header, config).await?;

    let session_shutdown = shutdown.child();
    let generation = state
        .sessions
        .register(id, writer, session_shutdown.clone(), config.max_sessions)
        .await?;
    info!(peer = %id, %addr, "peer registered");

    let result = session_loop(&mut reader, id, &state, &session_shutdown).await;

    state.sessions.unregister(id, generation).await;
    info!(peer = %id, %addr, "peer unregistered");
    result
}

/// Check the `Register` payload: empty, or the 32-byte key deriving `from`
async fn authenticate(reader: &mut OwnedReadHalf, header: &FrameHeader, config: &RelayServerConfig) -> Result<()> {
    let idle = config.idle_timeout;
    if header.from.is_zero() {
        frame::drain_within(reader, header.payload_len, idle).await?;
        return Err(RelayError::NotRegistered("Register with zero peer id".into()));
    }

    match header.payload_len {
        0 if !config.require_key => Ok(()),
        32 => {
            let mut key = [0u8; 32];
            tokio::time::timeout(idle, reader.read_exact(&mut key))
                .await
                .map_err(|_| RelayError::Timeout)??;
            if PeerId::from_public_key(&PublicKey::from_bytes(key)) != header.from {
                return Err(RelayError::KeyMismatch(header.from));
            }
            Ok(())
        }
        _ => Err(RelayError::KeyMismatch(header.from)),
    }
}

async fn session_loop(
    reader: &mut OwnedReadHalf,
    id: PeerId,
    state: &ServerState,
    shutdown: &Shutdown,
) -> Result<()> {
    let config = &state.config;
    let idle = config.idle_timeout;
    loop {
        let next = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            next = tokio::time::timeout(idle, frame::read_header(reader, config.max_payload)) => next,
        };

        let (header, raw) = match next {
            Err(_) => {
                info!(peer = %id, timeout = ?idle, "session idle, closing");
                return Err(RelayError::Timeout);
            }
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(e)) => return Err(e),
        };

        let payload = match header.command {
            Command::Ping => {
                trace!(peer = %id, "ping");
                Ok(())
            }
            Command::Forward | Command::Probe if header.from != id => {
                warn!(peer = %id, claimed = %header.from, "spoofed sender, dropping frame");
                frame::drain_within(reader, header.payload_len, idle).await
            }
            Command::Forward | Command::Probe => forward(reader, &header, &raw, state).await,
            Command::Register => {
                debug!(peer = %id, "repeated Register ignored");
                frame::drain_within(reader, header.payload_len, idle).await
            }
            Command::Unknown(cmd) => {
                debug!(peer = %id, cmd, len = header.payload_len, "unknown command drained");
                frame::drain_within(reader, header.payload_len, idle).await
            }
        };

        if let Err(e) = payload {
            if matches!(e, RelayError::Timeout) {
                info!(peer = %id, timeout = ?idle, "sender stalled mid-frame, closing");
            }
            return Err(e);
        }
    }
}

/// Relay one frame to its target, or drain it if the target is absent.
///
/// Errors returned here concern the source stream. Once the header has gone
/// out, the target is closed whenever the full payload cannot follow it:
/// on a failed write, and on a source that ends or stalls mid-payload.
async fn forward(
    reader: &mut OwnedReadHalf,
    header: &FrameHeader,
    raw: &[u8; HEADER_LEN],
    state: &ServerState,
) -> Result<()> {
    let idle = state.config.idle_timeout;
    let Some((writer, generation, target_shutdown)) = state.sessions.target(&header.to).await else {
        trace!(from = %header.from, to = %header.to, len = header.payload_len, "no session for target, draining");
        return frame::drain_within(reader, header.payload_len, idle).await;
    };

    let mut target = writer.lock().await;
    let mut remaining = header.payload_len as usize;
    let mut target_ok = target.write_all(raw).await.is_ok();
    let mut source = Ok(());

    let mut chunk = [0u8; COPY_CHUNK];
    while remaining > 0 {
        let want = remaining.min(COPY_CHUNK);
        let n = match frame::read_within(reader, &mut chunk[..want], idle).await {
            Ok(n) => n,
            Err(e) => {
                source = Err(e);
                break;
            }
        };
        remaining -= n;
        if target_ok && target.write_all(&chunk[..n]).await.is_err() {
            target_ok = false;
        }
    }
    if target_ok && source.is_ok() {
        target_ok = target.flush().await.is_ok();
    }

    if !target_ok || source.is_err() {
        if target_ok {
            warn!(from = %header.from, to = %header.to, remaining, "source failed mid-payload, closing target session");
        } else {
            warn!(to = %header.to, "copy to target failed, closing its session");
        }
        let _ = target.shutdown().await;
        drop(target);
        target_shutdown.cancel();
        state.sessions.unregister(header.to, generation).await;
    }
    source
}

//! Relay broker client.
//!
//! Holds the single persistent stream to a broker. Writes are serialized by a
//! lock. Reads are pull-based: [`RelayClient::receive`] returns one `Forward`
//! packet per call and hands `Probe` payloads to a bounded queue drained by a
//! small worker pool, so signaling never stalls the packet path.
//!
//! `receive` must have one consumer. Used directly it serves a single reader;
//! once the pump started by [`RelayClient::start_pump`] runs, the pump is that
//! reader and routes each packet to the sender's [`RelayTransport`] mailbox,
//! or failing that to the mailbox of an attached [`crate::RelayBind`].

use crate::error::{RelayError, Result};
use crate::frame::{self, Command, FrameHeader};
use crate::pool::BufferPool;
use crate::transport::RelayTransport;
use crate::upgrade::{self, RelayUrl, UPGRADE_TOKEN};
use async_trait::async_trait;
use meshlink_core::{CoreError, PeerId, PublicKey, Shutdown, SignalChannel, SignalHandler};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, trace, warn};

/// Relay client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayClientConfig {
    /// Interval between `Ping` frames
    #[serde(rename = "keepalive_interval_ms", with = "meshlink_core::duration::millis")]
    pub keepalive_interval: Duration,
    /// Bound on TCP connect plus upgrade
    #[serde(rename = "connect_timeout_ms", with = "meshlink_core::duration::millis")]
    pub connect_timeout: Duration,
    /// Workers servicing `Probe` payloads
    pub probe_workers: usize,
    /// Capacity of the `Probe` queue; overflow is dropped
    pub probe_queue: usize,
    /// Packets buffered per relay transport before the pump drops
    pub mailbox_capacity: usize,
    /// Largest accepted payload
    pub max_payload: u32,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: crate::DEFAULT_KEEPALIVE_INTERVAL,
            connect_timeout: crate::DEFAULT_CONNECT_TIMEOUT,
            probe_workers: 4,
            probe_queue: 256,
            mailbox_capacity: 512,
            max_payload: frame::DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// Signaling payload awaiting a worker
struct ProbeTask {
    from: PeerId,
    payload: Vec<u8>,
}

struct Mailbox {
    id: u64,
    tx: mpsc::Sender<Vec<u8>>,
}

/// Catch-all mailbox of an attached bind
struct BindMailbox {
    id: u64,
    tx: mpsc::Sender<(PeerId, Vec<u8>)>,
}

struct ClientInner {
    local: PeerId,
    url: RelayUrl,
    config: RelayClientConfig,
    writer: Mutex<OwnedWriteHalf>,
    reader: Mutex<OwnedReadHalf>,
    probe_tx: mpsc::Sender<ProbeTask>,
    pool: BufferPool,
    handler: RwLock<Option<Arc<dyn SignalHandler>>>,
    mailboxes: std::sync::Mutex<HashMap<PeerId, Mailbox>>,
    bind: std::sync::Mutex<Option<BindMailbox>>,
    next_mailbox: AtomicU64,
    pumping: AtomicBool,
    closed: AtomicBool,
    shutdown: Shutdown,
}

/// Connection to a relay broker
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<ClientInner>,
}

impl RelayClient {
    /// Connect, upgrade, and register as the peer derived from `key`
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Timeout`] if connect or upgrade exceed
    /// `connect_timeout`, [`RelayError::Upgrade`] if the broker refuses, or
    /// an I/O error.
    pub async fn connect(url: &str, key: &PublicKey, config: RelayClientConfig) -> Result<Self> {
        Self::connect_with_shutdown(url, key, config, Shutdown::new()).await
    }

    /// [`RelayClient::connect`] with background tasks tied to `shutdown`
    ///
    /// # Errors
    ///
    /// See [`RelayClient::connect`].
    pub async fn connect_with_shutdown(
        url: &str,
        key: &PublicKey,
        config: RelayClientConfig,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let url: RelayUrl = url.parse()?;
        let local = PeerId::from_public_key(key);

        let mut stream = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect(url.authority()),
        )
        .await
        .map_err(|_| RelayError::Timeout)??;
        stream.set_nodelay(true)?;

        tokio::time::timeout(
            config.connect_timeout,
            upgrade::client_upgrade(&mut stream, &url, UPGRADE_TOKEN),
        )
        .await
        .map_err(|_| RelayError::Timeout)??;

        let (reader, mut writer) = stream.into_split();
        let register = FrameHeader::new(Command::Register, 32, local, PeerId::ZERO);
        frame::write_frame(&mut writer, &register, key.as_bytes()).await?;
        info!(peer = %local, relay = %url, "registered with relay");

        let (probe_tx, probe_rx) = mpsc::channel(config.probe_queue.max(1));
        let workers = config.probe_workers.max(1);

        let client = Self {
            inner: Arc::new(ClientInner {
                local,
                url,
                pool: BufferPool::new(2048, config.probe_queue.max(1)),
                config,
                writer: Mutex::new(writer),
                reader: Mutex::new(reader),
                probe_tx,
                handler: RwLock::new(None),
                mailboxes: std::sync::Mutex::new(HashMap::new()),
                bind: std::sync::Mutex::new(None),
                next_mailbox: AtomicU64::new(0),
                pumping: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                shutdown: shutdown.child(),
            }),
        };

        client.spawn_workers(workers, probe_rx);
        client.spawn_keepalive();
        Ok(client)
    }

    /// Local peer id
    #[must_use]
    pub fn local_id(&self) -> PeerId {
        self.inner.local
    }

    /// Broker URL
    #[must_use]
    pub fn url(&self) -> &RelayUrl {
        &self.inner.url
    }

    /// Whether the connection has been closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Write one frame addressed to `to`
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Closed`] after [`RelayClient::close`], or an
    /// I/O error from the stream.
    pub async fn send(&self, to: PeerId, command: Command, payload: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        let len = u32::try_from(payload.len()).map_err(|_| RelayError::PayloadTooLarge {
            len: u32::MAX,
            max: self.inner.config.max_payload,
        })?;
        if len > self.inner.config.max_payload {
            return Err(RelayError::PayloadTooLarge {
                len,
                max: self.inner.config.max_payload,
            });
        }

        let header = FrameHeader::new(command, len, self.inner.local, to);
        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = frame::write_frame(&mut *writer, &header, payload).await {
            self.inner.closed.store(true, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    /// Read frames until one `Forward` packet lands in `buf`.
    ///
    /// Returns the packet length and its sender. `Probe` payloads met on the
    /// way are queued for the signal handler (dropped if the queue is full);
    /// other commands are drained. Packets larger than `buf` are drained and
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Closed`] when the broker closes the stream.
    pub async fn receive(&self, buf: &mut [u8]) -> Result<(usize, PeerId)> {
        let mut reader = self.inner.reader.lock().await;
        loop {
            let header = match frame::read_header(&mut *reader, self.inner.config.max_payload).await {
                Ok(Some((header, _))) => header,
                Ok(None) => {
                    self.inner.closed.store(true, Ordering::SeqCst);
                    return Err(RelayError::Closed);
                }
                Err(e) => {
                    self.inner.closed.store(true, Ordering::SeqCst);
                    return Err(e);
                }
            };
            let len = header.payload_len as usize;

            match header.command {
                Command::Forward => {
                    if len > buf.len() {
                        warn!(from = %header.from, len, cap = buf.len(), "oversized packet dropped");
                        frame::drain(&mut *reader, header.payload_len)
                            .await
                            .map_err(|e| self.fail(e))?;
                        continue;
                    }
                    reader
                        .read_exact(&mut buf[..len])
                        .await
                        .map_err(|e| self.fail(e.into()))?;
                    return Ok((len, header.from));
                }
                Command::Probe => {
                    let mut payload = self.inner.pool.get(len);
                    reader
                        .read_exact(&mut payload)
                        .await
                        .map_err(|e| self.fail(e.into()))?;
                    self.enqueue_probe(header.from, payload);
                }
                other => {
                    trace!(command = %other, len, "draining frame");
                    frame::drain(&mut *reader, header.payload_len)
                        .await
                        .map_err(|e| self.fail(e))?;
                }
            }
        }
    }

    /// A read broke framing: mark the stream unusable
    fn fail(&self, err: RelayError) -> RelayError {
        self.inner.closed.store(true, Ordering::SeqCst);
        err
    }

    fn enqueue_probe(&self, from: PeerId, payload: Vec<u8>) {
        match self.inner.probe_tx.try_send(ProbeTask { from, payload }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(task)) => {
                warn!(from = %from, "probe queue full, dropping signal");
                self.inner.pool.put(task.payload);
            }
            Err(mpsc::error::TrySendError::Closed(task)) => {
                self.inner.pool.put(task.payload);
            }
        }
    }

    /// Install the handler receiving `Probe` payloads
    pub fn set_signal_handler(&self, handler: Arc<dyn SignalHandler>) {
        if let Ok(mut slot) = self.inner.handler.write() {
            *slot = Some(handler);
        }
    }

    /// Relay transport to `peer`, starting the pump if needed.
    ///
    /// Replaces any previous transport's mailbox for the same peer.
    #[must_use]
    pub fn transport(&self, peer: PeerId) -> RelayTransport {
        let (tx, rx) = mpsc::channel(self.inner.config.mailbox_capacity.max(1));
        let id = self.inner.next_mailbox.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut mailboxes) = self.inner.mailboxes.lock() {
            mailboxes.insert(peer, Mailbox { id, tx });
        }
        self.start_pump();
        RelayTransport::new(self.clone(), peer, id, rx)
    }

    /// Drop `peer`'s mailbox if it is still the one numbered `id`
    pub(crate) fn detach(&self, peer: &PeerId, id: u64) {
        if let Ok(mut mailboxes) = self.inner.mailboxes.lock() {
            if mailboxes.get(peer).is_some_and(|m| m.id == id) {
                mailboxes.remove(peer);
            }
        }
    }

    /// Route packets without a transport mailbox to a new bind mailbox,
    /// replacing any earlier one, and start the pump
    pub(crate) fn attach_bind(&self) -> (u64, mpsc::Receiver<(PeerId, Vec<u8>)>) {
        let (tx, rx) = mpsc::channel(self.inner.config.mailbox_capacity.max(1));
        let id = self.inner.next_mailbox.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut bind) = self.inner.bind.lock() {
            *bind = Some(BindMailbox { id, tx });
        }
        self.start_pump();
        (id, rx)
    }

    pub(crate) fn detach_bind(&self, id: u64) {
        if let Ok(mut bind) = self.inner.bind.lock() {
            if bind.as_ref().is_some_and(|b| b.id == id) {
                *bind = None;
            }
        }
    }

    pub(crate) fn recycle(&self, buf: Vec<u8>) {
        self.inner.pool.put(buf);
    }

    /// Start the background reader feeding transport mailboxes. Idempotent.
    pub fn start_pump(&self) {
        if self.inner.pumping.swap(true, Ordering::SeqCst) {
            return;
        }
        let client = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; crate::MAX_PACKET_SIZE];
            loop {
                let received = tokio::select! {
                    () = shutdown.cancelled() => break,
                    received = client.receive(&mut buf) => received,
                };
                match received {
                    Ok((n, from)) => client.deliver(from, &buf[..n]),
                    Err(e) => {
                        debug!(error = %e, "relay pump stopped");
                        break;
                    }
                }
            }
            client.clear_mailboxes();
        });
    }

    fn deliver(&self, from: PeerId, packet: &[u8]) {
        let sender = match self.inner.mailboxes.lock() {
            Ok(mailboxes) => mailboxes.get(&from).map(|m| m.tx.clone()),
            Err(_) => None,
        };
        let mut copy = self.inner.pool.get(packet.len());
        copy.copy_from_slice(packet);

        if let Some(sender) = sender {
            if let Err(mpsc::error::TrySendError::Full(buf)) = sender.try_send(copy) {
                debug!(from = %from, "relay mailbox full, dropping packet");
                self.inner.pool.put(buf);
            }
            return;
        }

        let bind = match self.inner.bind.lock() {
            Ok(bind) => bind.as_ref().map(|b| b.tx.clone()),
            Err(_) => None,
        };
        let Some(bind) = bind else {
            trace!(from = %from, "no transport for relayed packet");
            self.inner.pool.put(copy);
            return;
        };
        match bind.try_send((from, copy)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full((_, buf))) => {
                debug!(from = %from, "bind mailbox full, dropping packet");
                self.inner.pool.put(buf);
            }
            Err(mpsc::error::TrySendError::Closed((_, buf))) => self.inner.pool.put(buf),
        }
    }

    fn clear_mailboxes(&self) {
        if let Ok(mut mailboxes) = self.inner.mailboxes.lock() {
            mailboxes.clear();
        }
        if let Ok(mut bind) = self.inner.bind.lock() {
            *bind = None;
        }
    }

    fn spawn_workers(&self, workers: usize, rx: mpsc::Receiver<ProbeTask>) {
        let rx = Arc::new(Mutex::new(rx));
        for worker in 0..workers {
            let rx = rx.clone();
            let inner = self.inner.clone();
            let shutdown = self.inner.shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let task = tokio::select! {
                        () = shutdown.cancelled() => break,
                        task = async { rx.lock().await.recv().await } => task,
                    };
                    let Some(task) = task else { break };

                    let handler = inner.handler.read().ok().and_then(|h| h.as_ref().cloned());
                    match handler {
                        Some(handler) => handler.on_signal(task.from, &task.payload).await,
                        None => debug!(worker, from = %task.from, "no signal handler, probe dropped"),
                    }
                    inner.pool.put(task.payload);
                }
                trace!(worker, "probe worker exiting");
            });
        }
    }

    fn spawn_keepalive(&self) {
        let client = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let interval = self.inner.config.keepalive_interval.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = client.send(PeerId::ZERO, Command::Ping, &[]).await {
                    warn!(error = %e, "relay keepalive failed");
                    break;
                }
            }
        });
    }

    /// Stop background tasks and close the stream. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) && self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        let mut writer = self.inner.writer.lock().await;
        let _ = writer.shutdown().await;
        drop(writer);
        self.clear_mailboxes();
        info!(peer = %self.inner.local, "relay client closed");
    }
}

#[async_trait]
impl SignalChannel for RelayClient {
    async fn send(&self, peer: PeerId, payload: Vec<u8>) -> meshlink_core::Result<()> {
        RelayClient::send(self, peer, Command::Probe, &payload)
            .await
            .map_err(|e| CoreError::signal(peer, e))
    }

    fn subscribe(&self, local: PeerId, handler: Arc<dyn SignalHandler>) {
        if local != self.inner.local {
            warn!(local = %local, registered = %self.inner.local, "subscribing for a peer id this relay session does not carry");
        }
        self.set_signal_handler(handler);
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("local", &self.inner.local)
            .field("url", &self.inner.url)
            .field("closed", &self.is_closed())
            .finish()
    }
}

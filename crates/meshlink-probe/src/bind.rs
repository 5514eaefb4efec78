//! Tunnel device bind over every connected transport.

use crate::probe::OnSuccess;
use async_trait::async_trait;
use meshlink_core::{Bind, CoreError, Endpoint, PeerId, Shutdown, Transport, TransportTable};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, trace, warn};

/// Largest packet a reader task accepts from a transport
const READ_BUFFER: usize = 65535;

struct Inbound {
    packet: Vec<u8>,
    endpoint: Endpoint,
}

/// [`Bind`] multiplexing the transports in a [`TransportTable`].
///
/// Each attached transport gets a reader task feeding one shared queue;
/// `receive_batch` drains up to a batch from it. Sends go to the best open
/// transport of the peer owning the destination endpoint.
pub struct TransportBind {
    table: Arc<TransportTable>,
    tx: mpsc::Sender<Inbound>,
    rx: Mutex<mpsc::Receiver<Inbound>>,
    batch: usize,
    shutdown: Shutdown,
}

impl TransportBind {
    /// Bind over `table` delivering up to `batch` packets per call
    #[must_use]
    pub fn new(table: Arc<TransportTable>, batch: usize, shutdown: Shutdown) -> Arc<Self> {
        let batch = batch.max(1);
        let (tx, rx) = mpsc::channel(batch * 16);
        Arc::new(Self {
            table,
            tx,
            rx: Mutex::new(rx),
            batch,
            shutdown,
        })
    }

    /// Start reading `transport` into the shared queue
    pub fn attach(&self, peer: PeerId, transport: Arc<dyn Transport>) {
        let tx = self.tx.clone();
        let shutdown = self.shutdown.clone();
        debug!(%peer, kind = %transport.kind(), remote = %transport.remote_addr(), "transport attached");

        tokio::spawn(async move {
            let endpoint = transport.endpoint();
            let mut buf = vec![0u8; READ_BUFFER];
            loop {
                let read = tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    read = transport.read(&mut buf) => read,
                };
                let n = match read {
                    Ok(n) => n,
                    Err(e) => {
                        debug!(%peer, error = %e, "transport reader stopped");
                        break;
                    }
                };
                let inbound = Inbound {
                    packet: buf[..n].to_vec(),
                    endpoint,
                };
                if tx.send(inbound).await.is_err() {
                    break;
                }
            }
        });
    }

    /// Success callback attaching each new transport to this bind
    #[must_use]
    pub fn on_success(self: &Arc<Self>) -> OnSuccess {
        let bind = self.clone();
        Arc::new(move |peer, transport| bind.attach(peer, transport))
    }

    fn fill(slot: &mut Vec<u8>, inbound: &Inbound) -> usize {
        if slot.len() < inbound.packet.len() {
            warn!(len = inbound.packet.len(), cap = slot.len(), "packet truncated to receive buffer");
        }
        let n = slot.len().min(inbound.packet.len());
        slot[..n].copy_from_slice(&inbound.packet[..n]);
        n
    }
}

#[async_trait]
impl Bind for TransportBind {
    async fn receive_batch(
        &self,
        bufs: &mut [Vec<u8>],
        sizes: &mut [usize],
        endpoints: &mut [Option<Endpoint>],
    ) -> meshlink_core::Result<usize> {
        let limit = bufs.len().min(sizes.len()).min(endpoints.len()).min(self.batch);
        if limit == 0 {
            return Ok(0);
        }

        let mut rx = self.rx.lock().await;
        let first = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => None,
            inbound = rx.recv() => inbound,
        };
        let mut next = first.ok_or(CoreError::Closed)?;

        let mut count = 0;
        loop {
            sizes[count] = Self::fill(&mut bufs[count], &next);
            endpoints[count] = Some(next.endpoint);
            count += 1;
            if count == limit {
                break;
            }
            match rx.try_recv() {
                Ok(inbound) => next = inbound,
                Err(_) => break,
            }
        }
        trace!(count, "batch received");
        Ok(count)
    }

    async fn send(&self, bufs: &[&[u8]], endpoint: &Endpoint) -> meshlink_core::Result<()> {
        let transport = self
            .table
            .peer_for(endpoint)
            .and_then(|peer| self.table.best(&peer))
            .ok_or_else(|| CoreError::UnsupportedEndpoint(endpoint.to_string()))?;
        for buf in bufs {
            transport.write(buf).await?;
        }
        Ok(())
    }

    fn batch_size(&self) -> usize {
        self.batch
    }
}

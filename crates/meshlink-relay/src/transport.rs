//! Relay-backed transport to one peer.

use crate::client::RelayClient;
use crate::frame::Command;
use async_trait::async_trait;
use meshlink_core::{CoreError, Endpoint, PeerId, Transport, TransportKind};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use tracing::warn;

/// Path to a peer multiplexed over the shared broker stream
pub struct RelayTransport {
    client: RelayClient,
    peer: PeerId,
    mailbox: u64,
    inbox: Mutex<mpsc::Receiver<Vec<u8>>>,
    closed: AtomicBool,
}

impl RelayTransport {
    pub(crate) fn new(client: RelayClient, peer: PeerId, mailbox: u64, inbox: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            client,
            peer,
            mailbox,
            inbox: Mutex::new(inbox),
            closed: AtomicBool::new(false),
        }
    }

    /// Remote peer
    #[must_use]
    pub fn peer(&self) -> PeerId {
        self.peer
    }
}

#[async_trait]
impl Transport for RelayTransport {
    async fn write(&self, buf: &[u8]) -> meshlink_core::Result<usize> {
        if self.is_closed() {
            return Err(CoreError::Closed);
        }
        self.client.send(self.peer, Command::Forward, buf).await?;
        Ok(buf.len())
    }

    async fn read(&self, buf: &mut [u8]) -> meshlink_core::Result<usize> {
        if self.is_closed() {
            return Err(CoreError::Closed);
        }
        let mut inbox = self.inbox.lock().await;
        loop {
            let packet = inbox.recv().await.ok_or(CoreError::Closed)?;
            let n = packet.len();
            if n > buf.len() {
                warn!(peer = %self.peer, len = n, cap = buf.len(), "oversized packet dropped");
                self.client.recycle(packet);
                continue;
            }
            buf[..n].copy_from_slice(&packet);
            self.client.recycle(packet);
            return Ok(n);
        }
    }

    fn remote_addr(&self) -> String {
        format!("relay:{}@{}", self.peer, self.client.url().authority())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::Relay(self.peer)
    }

    async fn close(&self) -> meshlink_core::Result<()> {
        // Dropping the mailbox sender ends a pending read.
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.client.detach(&self.peer, self.mailbox);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.client.is_closed()
    }
}

impl std::fmt::Debug for RelayTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayTransport")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

//! Tunnel device bind over a relay client.

use crate::client::RelayClient;
use crate::frame::Command;
use async_trait::async_trait;
use meshlink_core::{Bind, CoreError, Endpoint, PeerId};
use tokio::sync::{Mutex, mpsc};
use tracing::warn;

/// Packets returned by one `receive_batch`
const BATCH: usize = 32;

/// [`Bind`] over a relay client's `Forward` packets.
///
/// Receives through the client's pump, so it coexists with the relay
/// transports a probe factory creates on the same client: packets from a
/// peer with a live [`crate::RelayTransport`] go to that transport, every
/// other packet comes here. Dropping the bind detaches it.
pub struct RelayBind {
    client: RelayClient,
    mailbox: u64,
    inbox: Mutex<mpsc::Receiver<(PeerId, Vec<u8>)>>,
}

impl RelayBind {
    /// Attach to a connected client, starting its pump
    #[must_use]
    pub fn new(client: RelayClient) -> Self {
        let (mailbox, inbox) = client.attach_bind();
        Self {
            client,
            mailbox,
            inbox: Mutex::new(inbox),
        }
    }

    /// Underlying client
    #[must_use]
    pub fn client(&self) -> &RelayClient {
        &self.client
    }

    /// Copy `packet` into the slot, or drop it if the slot is too small
    fn fill(&self, from: PeerId, packet: Vec<u8>, buf: &mut [u8], size: &mut usize, endpoint: &mut Option<Endpoint>) -> bool {
        let fits = packet.len() <= buf.len();
        if fits {
            buf[..packet.len()].copy_from_slice(&packet);
            *size = packet.len();
            *endpoint = Some(Endpoint::Relay(from));
        } else {
            warn!(from = %from, len = packet.len(), cap = buf.len(), "oversized packet dropped");
        }
        self.client.recycle(packet);
        fits
    }
}

#[async_trait]
impl Bind for RelayBind {
    async fn receive_batch(
        &self,
        bufs: &mut [Vec<u8>],
        sizes: &mut [usize],
        endpoints: &mut [Option<Endpoint>],
    ) -> meshlink_core::Result<usize> {
        let slots = bufs.len().min(sizes.len()).min(endpoints.len());
        if slots == 0 {
            return Ok(0);
        }

        let mut inbox = self.inbox.lock().await;
        let mut count = 0;
        // Block for the first packet, then take whatever is already queued.
        while count == 0 {
            let (from, packet) = inbox.recv().await.ok_or(CoreError::Closed)?;
            if self.fill(from, packet, &mut bufs[0], &mut sizes[0], &mut endpoints[0]) {
                count = 1;
            }
        }
        while count < slots {
            let Ok((from, packet)) = inbox.try_recv() else {
                break;
            };
            if self.fill(from, packet, &mut bufs[count], &mut sizes[count], &mut endpoints[count]) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn send(&self, bufs: &[&[u8]], endpoint: &Endpoint) -> meshlink_core::Result<()> {
        let peer = endpoint
            .relay_peer()
            .ok_or_else(|| CoreError::UnsupportedEndpoint(endpoint.to_string()))?;
        for buf in bufs {
            self.client.send(peer, Command::Forward, buf).await?;
        }
        Ok(())
    }

    fn batch_size(&self) -> usize {
        BATCH
    }
}

impl Drop for RelayBind {
    fn drop(&mut self) {
        self.client.detach_bind(self.mailbox);
    }
}

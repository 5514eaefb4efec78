//! SYN/ACK/OFFER bookkeeping shared by both dialer kinds.
//!
//! Only the initiator (larger id string) sends `SYN`. Each side holds two
//! gates: `acked` opens when the responder replies `ACK` (or, on the
//! responder, when it sends one) and `offered` opens on the first remote
//! offer. A dialer may dial once both are open.

use crate::config::ProbeConfig;
use crate::error::{ProbeError, Result};
use crate::gate::Gate;
use crate::packet::{DialerKind, Offer, SignalPacket};
use meshlink_core::{PeerDirectory, PeerId, PublicKey, Shutdown, SignalChannel, Upsert, should_initiate};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Credentials and role data taken from the first remote offer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOffer {
    /// Remote username fragment
    pub ufrag: String,
    /// Remote password
    pub pwd: String,
    /// Remote tie-breaker
    pub tie_breaker: u64,
    /// Remote public key
    pub public_key: PublicKey,
}

/// Handshake state for one dialer toward one peer
pub struct Handshake {
    local: PeerId,
    remote: PeerId,
    kind: DialerKind,
    signal: Arc<dyn SignalChannel>,
    directory: Arc<PeerDirectory>,
    acked: Gate,
    offered: Gate,
    remote_offer: OnceLock<RemoteOffer>,
    syn_sent: AtomicU32,
    verify_sender_key: bool,
}

impl Handshake {
    /// Fresh handshake
    #[must_use]
    pub fn new(
        local: PeerId,
        remote: PeerId,
        kind: DialerKind,
        signal: Arc<dyn SignalChannel>,
        directory: Arc<PeerDirectory>,
    ) -> Self {
        Self {
            local,
            remote,
            kind,
            signal,
            directory,
            acked: Gate::new(),
            offered: Gate::new(),
            remote_offer: OnceLock::new(),
            syn_sent: AtomicU32::new(0),
            verify_sender_key: true,
        }
    }

    /// Whether offers must carry the key the remote id is derived from
    #[must_use]
    pub fn with_sender_key_check(mut self, verify: bool) -> Self {
        self.verify_sender_key = verify;
        self
    }

    /// Whether this side sends `SYN`
    #[must_use]
    pub fn is_initiator(&self) -> bool {
        should_initiate(self.local, self.remote)
    }

    /// Local peer
    #[must_use]
    pub fn local(&self) -> PeerId {
        self.local
    }

    /// Remote peer
    #[must_use]
    pub fn remote(&self) -> PeerId {
        self.remote
    }

    /// `SYN` packets sent so far
    #[must_use]
    pub fn syn_sent(&self) -> u32 {
        self.syn_sent.load(Ordering::Relaxed)
    }

    /// Whether the ack gate is open
    #[must_use]
    pub fn is_acked(&self) -> bool {
        self.acked.is_open()
    }

    /// First remote offer, once received
    #[must_use]
    pub fn remote_offer(&self) -> Option<&RemoteOffer> {
        self.remote_offer.get()
    }

    /// Encode and send a packet to the remote
    ///
    /// # Errors
    ///
    /// Returns encoding or signaling errors.
    pub async fn send(&self, packet: &SignalPacket) -> Result<()> {
        let bytes = packet.to_bytes()?;
        self.signal.send(self.remote, bytes).await?;
        Ok(())
    }

    /// Initiator: send `SYN` every `syn_interval` until `ACK`.
    ///
    /// Returns immediately on the responder. Delivery failures are retried
    /// by the loop itself.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::HandshakeTimeout`] after `handshake_timeout`,
    /// or [`ProbeError::Cancelled`] on shutdown.
    pub async fn run_syn_loop(&self, config: &ProbeConfig, shutdown: &Shutdown) -> Result<()> {
        if !self.is_initiator() {
            return Ok(());
        }

        let deadline = Instant::now() + config.handshake_timeout;
        let syn = SignalPacket::syn(self.local, self.kind);
        loop {
            if self.acked.is_open() {
                return Ok(());
            }
            match self.send(&syn).await {
                Ok(()) => {
                    let n = self.syn_sent.fetch_add(1, Ordering::Relaxed) + 1;
                    trace!(peer = %self.remote, dialer = %self.kind, n, "SYN sent");
                }
                Err(e) => debug!(peer = %self.remote, dialer = %self.kind, error = %e, "SYN delivery failed"),
            }

            tokio::select! {
                biased;
                () = self.acked.wait() => return Ok(()),
                () = shutdown.cancelled() => return Err(ProbeError::Cancelled),
                () = tokio::time::sleep_until(deadline) => return Err(self.timeout(config.handshake_timeout)),
                () = tokio::time::sleep(config.syn_interval) => {}
            }
        }
    }

    /// Responder: reply `ACK` and open the ack gate
    ///
    /// # Errors
    ///
    /// Returns signaling errors from sending the `ACK`; the gate opens anyway.
    pub async fn on_syn(&self) -> Result<()> {
        if self.acked.open() {
            debug!(peer = %self.remote, dialer = %self.kind, "SYN received");
        }
        self.send(&SignalPacket::ack(self.local, self.kind)).await
    }

    /// Initiator: `ACK` received; `true` if this opened the gate
    pub fn on_ack(&self) -> bool {
        let opened = self.acked.open();
        if opened {
            debug!(peer = %self.remote, dialer = %self.kind, "ACK received");
        }
        opened
    }

    /// Record a remote offer.
    ///
    /// The sender's record is upserted into the directory on every offer.
    /// Credentials and tie-breaker are taken from the first offer only.
    /// Returns `true` for that first offer.
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::InvalidOffer`] if the record's key disagrees with
    /// the offer's, if the key does not derive the sender's id (unless that
    /// check is off), or if the directory already holds another key for the
    /// sender.
    pub fn on_offer(&self, offer: &Offer) -> Result<bool> {
        if offer.record.public_key != offer.public_key {
            return Err(ProbeError::InvalidOffer {
                peer: self.remote,
                reason: "record key differs from sender key".into(),
            });
        }
        if self.verify_sender_key && PeerId::from_public_key(&offer.public_key) != self.remote {
            warn!(peer = %self.remote, "offer key does not derive sender id");
            return Err(ProbeError::InvalidOffer {
                peer: self.remote,
                reason: "public key does not derive sender id".into(),
            });
        }

        match self.directory.upsert(self.remote, offer.record.clone()) {
            Ok(Upsert::Inserted) => debug!(peer = %self.remote, "peer learned from offer"),
            Ok(Upsert::Updated) => trace!(peer = %self.remote, "peer record updated from offer"),
            Ok(Upsert::Unchanged) => {}
            Err(e) => {
                warn!(peer = %self.remote, error = %e, "offer rejected");
                return Err(ProbeError::InvalidOffer {
                    peer: self.remote,
                    reason: e.to_string(),
                });
            }
        }

        let first = self
            .remote_offer
            .set(RemoteOffer {
                ufrag: offer.ufrag.clone(),
                pwd: offer.pwd.clone(),
                tie_breaker: offer.tie_breaker,
                public_key: offer.public_key,
            })
            .is_ok();
        if first {
            debug!(peer = %self.remote, dialer = %self.kind, "remote credentials initialized");
        }
        self.offered.open();
        Ok(first)
    }

    /// Wait for the ack gate
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::HandshakeTimeout`] at `deadline` or
    /// [`ProbeError::Cancelled`] on shutdown.
    pub async fn wait_acked(&self, deadline: Instant, shutdown: &Shutdown) -> Result<()> {
        self.wait_gate(&self.acked, deadline, shutdown).await
    }

    /// Wait until both gates are open and return the remote offer
    ///
    /// # Errors
    ///
    /// As [`Handshake::wait_acked`].
    pub async fn wait_ready(&self, deadline: Instant, shutdown: &Shutdown) -> Result<RemoteOffer> {
        self.wait_gate(&self.acked, deadline, shutdown).await?;
        self.wait_gate(&self.offered, deadline, shutdown).await?;
        self.remote_offer.get().cloned().ok_or(ProbeError::Closed)
    }

    async fn wait_gate(&self, gate: &Gate, deadline: Instant, shutdown: &Shutdown) -> Result<()> {
        let started = Instant::now();
        tokio::select! {
            biased;
            () = gate.wait() => Ok(()),
            () = shutdown.cancelled() => Err(ProbeError::Cancelled),
            () = tokio::time::sleep_until(deadline) => Err(self.timeout(started.elapsed())),
        }
    }

    fn timeout(&self, after: Duration) -> ProbeError {
        ProbeError::HandshakeTimeout {
            peer: self.remote,
            after,
        }
    }
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handshake")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("kind", &self.kind)
            .field("acked", &self.acked.is_open())
            .field("offered", &self.offered.is_open())
            .finish()
    }
}

//! Signal packets exchanged during the handshake.
//!
//! A packet is carried as an opaque blob over either the signaling bus (ICE
//! dialer) or the relay `Probe` command (relay dialer). Both dialer kinds may
//! share one channel; the `dialer` field routes the packet on arrival.

use crate::error::{ProbeError, Result};
use bincode::Options;
use meshlink_core::{PeerId, PeerRecord, PublicKey};
use serde::{Deserialize, Serialize};

/// Upper bound on an encoded packet
pub const MAX_PACKET_LEN: usize = 16 * 1024;

/// Handshake step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketType {
    /// Initiator asks the responder to start
    Syn,
    /// Responder acknowledges a `Syn`
    Ack,
    /// Credentials plus at most one candidate
    Offer,
    /// Reply to an `Offer` (relay dialer)
    Answer,
}

/// Dialer a packet belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialerKind {
    /// NAT traversal
    Ice,
    /// Broker relay
    Relay,
}

impl std::fmt::Display for DialerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialerKind::Ice => write!(f, "ice"),
            DialerKind::Relay => write!(f, "relay"),
        }
    }
}

/// Payload of `Offer` and `Answer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    /// Username fragment
    pub ufrag: String,
    /// Password
    pub pwd: String,
    /// Random role tie-breaker
    pub tie_breaker: u64,
    /// One trickled candidate in SDP attribute form, if any
    pub candidate: Option<String>,
    /// Sender's directory record
    pub record: PeerRecord,
    /// Sender's public key
    pub public_key: PublicKey,
}

/// Handshake envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalPacket {
    /// Step
    pub ty: PacketType,
    /// Sending peer
    pub sender: PeerId,
    /// Owning dialer
    pub dialer: DialerKind,
    /// Present for `Offer` and `Answer`
    pub offer: Option<Offer>,
}

impl SignalPacket {
    /// `Syn` from `sender`
    #[must_use]
    pub fn syn(sender: PeerId, dialer: DialerKind) -> Self {
        Self {
            ty: PacketType::Syn,
            sender,
            dialer,
            offer: None,
        }
    }

    /// `Ack` from `sender`
    #[must_use]
    pub fn ack(sender: PeerId, dialer: DialerKind) -> Self {
        Self {
            ty: PacketType::Ack,
            sender,
            dialer,
            offer: None,
        }
    }

    /// `Offer` carrying `offer`
    #[must_use]
    pub fn offer(sender: PeerId, dialer: DialerKind, offer: Offer) -> Self {
        Self {
            ty: PacketType::Offer,
            sender,
            dialer,
            offer: Some(offer),
        }
    }

    /// `Answer` carrying `offer`
    #[must_use]
    pub fn answer(sender: PeerId, dialer: DialerKind, offer: Offer) -> Self {
        Self {
            ty: PacketType::Answer,
            sender,
            dialer,
            offer: Some(offer),
        }
    }

    /// Serialize to bytes
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Serialization`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ProbeError::Serialization(e.to_string()))
    }

    /// Deserialize from bytes
    ///
    /// # Errors
    ///
    /// Returns [`ProbeError::Deserialization`] for oversized or malformed
    /// input, or an `Offer`/`Answer` without payload.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_PACKET_LEN {
            return Err(ProbeError::Deserialization(format!(
                "packet of {} bytes exceeds {MAX_PACKET_LEN}",
                bytes.len()
            )));
        }
        let packet: Self = bincode::options()
            .with_fixint_encoding()
            .allow_trailing_bytes()
            .with_limit(MAX_PACKET_LEN as u64)
            .deserialize(bytes)
            .map_err(|e| ProbeError::Deserialization(e.to_string()))?;

        let needs_offer = matches!(packet.ty, PacketType::Offer | PacketType::Answer);
        if needs_offer != packet.offer.is_some() {
            return Err(ProbeError::Deserialization(format!(
                "{:?} packet with mismatched payload",
                packet.ty
            )));
        }
        Ok(packet)
    }
}

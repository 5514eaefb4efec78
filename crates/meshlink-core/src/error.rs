//! Error types shared by the core model.

use crate::peer::PeerId;
use std::borrow::Cow;
use thiserror::Error;

/// Errors raised by the core model and its trait seams
#[derive(Debug, Error)]
pub enum CoreError {
    /// A different public key already owns this peer id
    #[error("peer id {id} already bound to key {existing}, refusing {offered}")]
    PeerIdCollision {
        /// The contested id
        id: PeerId,
        /// Hex prefix of the key already stored
        existing: String,
        /// Hex prefix of the rejected key
        offered: String,
    },

    /// Endpoint bytes could not be decoded
    #[error("invalid endpoint encoding: {0}")]
    InvalidEndpoint(Cow<'static, str>),

    /// Transport has been closed
    #[error("transport closed")]
    Closed,

    /// The endpoint is not served by this bind/transport
    #[error("unsupported endpoint: {0}")]
    UnsupportedEndpoint(String),

    /// No transport is registered for the destination
    #[error("no transport for {0}")]
    NoTransport(String),

    /// Signaling delivery failed
    #[error("signal delivery to {peer} failed: {reason}")]
    Signal {
        /// Destination peer
        peer: PeerId,
        /// Underlying reason
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Build a signaling error
    #[must_use]
    pub fn signal(peer: PeerId, reason: impl ToString) -> Self {
        CoreError::Signal {
            peer,
            reason: reason.to_string(),
        }
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

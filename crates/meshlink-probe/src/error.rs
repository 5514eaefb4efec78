//! Error types for connection establishment.

use meshlink_core::{CoreError, PeerId};
use meshlink_relay::RelayError;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while probing a peer
#[derive(Debug, Error)]
pub enum ProbeError {
    /// No `ACK` (or no remote offer) before the handshake deadline
    #[error("handshake with {peer} timed out after {after:?}")]
    HandshakeTimeout {
        /// Remote peer
        peer: PeerId,
        /// Elapsed deadline
        after: Duration,
    },

    /// Gathering produced nothing to offer
    #[error("no local candidates gathered")]
    NoCandidates,

    /// Remote offer is unusable
    #[error("invalid offer from {peer}: {reason}")]
    InvalidOffer {
        /// Sender
        peer: PeerId,
        /// What was wrong
        reason: String,
    },

    /// Connectivity checks or agent I/O failed
    #[error("agent failure: {0}")]
    Agent(String),

    /// STUN binding failed
    #[error("STUN error: {0}")]
    Stun(String),

    /// Signal packet could not be encoded
    #[error("packet serialization failed: {0}")]
    Serialization(String),

    /// Signal packet could not be decoded
    #[error("packet deserialization failed: {0}")]
    Deserialization(String),

    /// Owner shut the probe down
    #[error("probe cancelled")]
    Cancelled,

    /// Probe or agent already closed
    #[error("probe closed")]
    Closed,

    /// Core model error (signaling, directory, transport)
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Relay client error
    #[error(transparent)]
    Relay(#[from] RelayError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProbeError {
    /// Failure that may clear up on another attempt
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProbeError::HandshakeTimeout { .. }
                | ProbeError::NoCandidates
                | ProbeError::Agent(_)
                | ProbeError::Stun(_)
                | ProbeError::Core(_)
                | ProbeError::Relay(_)
                | ProbeError::Io(_)
        )
    }

    /// Failure caused by shutdown or bad input rather than the network
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Whether the retry policy should consider this failure
    #[must_use]
    pub fn should_retry(&self) -> bool {
        self.is_transient()
    }
}

/// Result type for probe operations
pub type Result<T> = std::result::Result<T, ProbeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProbeError::HandshakeTimeout {
            peer: PeerId::from_u64(9),
            after: Duration::from_secs(60),
        };
        assert_eq!(err.to_string(), "handshake with 9 timed out after 60s");
    }

    #[test]
    fn test_retry_classification() {
        assert!(ProbeError::NoCandidates.should_retry());
        assert!(ProbeError::Agent("check timeout".into()).is_transient());
        assert!(ProbeError::Cancelled.is_permanent());
        assert!(!ProbeError::Deserialization("eof".into()).should_retry());
    }

    #[test]
    fn test_from_relay_error() {
        let err: ProbeError = RelayError::Closed.into();
        assert!(err.is_transient());
    }
}

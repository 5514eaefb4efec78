//! Relay error types.

use meshlink_core::{CoreError, PeerId};
use thiserror::Error;

/// Relay protocol and transport errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// Frame did not start with the relay magic
    #[error("bad frame magic {0:02x?}")]
    BadMagic([u8; 4]),

    /// Frame carries a protocol version this build does not speak
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    /// Declared payload exceeds the configured limit
    #[error("payload of {len} bytes exceeds limit {max}")]
    PayloadTooLarge {
        /// Declared length
        len: u32,
        /// Configured maximum
        max: u32,
    },

    /// First frame on a connection was not `Register`
    #[error("expected Register as first frame, got {0}")]
    NotRegistered(String),

    /// Register payload does not hash to the claimed id
    #[error("registration key does not derive peer id {0}")]
    KeyMismatch(PeerId),

    /// Server refused the registration
    #[error("relay at capacity ({0} sessions)")]
    ServerFull(usize),

    /// HTTP upgrade handshake failed
    #[error("upgrade failed: {0}")]
    Upgrade(String),

    /// Operation did not finish in time
    #[error("relay operation timed out")]
    Timeout,

    /// Connection closed by the remote side or locally
    #[error("relay connection closed")]
    Closed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Whether the error ends the connection it occurred on
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RelayError::Timeout)
    }
}

impl From<RelayError> for CoreError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Closed => CoreError::Closed,
            RelayError::Io(e) => CoreError::Io(e),
            other => CoreError::Io(std::io::Error::other(other.to_string())),
        }
    }
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RelayError::BadMagic(*b"HTTP");
        assert!(err.to_string().contains("bad frame magic"));

        let err = RelayError::PayloadTooLarge { len: 10, max: 5 };
        assert_eq!(err.to_string(), "payload of 10 bytes exceeds limit 5");
    }

    #[test]
    fn test_fatality() {
        assert!(RelayError::Closed.is_fatal());
        assert!(RelayError::BadMagic([0; 4]).is_fatal());
        assert!(!RelayError::Timeout.is_fatal());
    }

    #[test]
    fn test_into_core_error() {
        let err: CoreError = RelayError::Closed.into();
        assert!(matches!(err, CoreError::Closed));
    }
}

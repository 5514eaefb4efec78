//! Serde helpers for `Duration` fields in configuration files.
//!
//! Durations are written as integer milliseconds:
//!
//! ```toml
//! idle_timeout_ms = 30000
//! ```

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// `#[serde(with = "meshlink_core::duration::millis")]`
pub mod millis {
    use super::*;

    /// Serialize as integer milliseconds
    ///
    /// # Errors
    /// Propagates serializer errors.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialize from integer milliseconds
    ///
    /// # Errors
    /// Propagates deserializer errors.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

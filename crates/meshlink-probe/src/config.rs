//! Probe, retry and agent configuration.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Handshake timing and event plumbing for one probe
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Interval between `SYN` retransmissions
    #[serde(rename = "syn_interval_ms", with = "meshlink_core::duration::millis")]
    pub syn_interval: Duration,
    /// Deadline for the handshake (SYN loop, and waiting for a remote offer)
    #[serde(rename = "handshake_timeout_ms", with = "meshlink_core::duration::millis")]
    pub handshake_timeout: Duration,
    /// Capacity of the per-probe event queue
    pub event_queue: usize,
    /// Behavior after a dialer fails
    pub retry: RetryPolicy,
    /// Reject offers whose key does not derive the sender's id.
    ///
    /// Only meshes with hand-assigned ids turn this off.
    pub verify_sender_key: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            syn_interval: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(60),
            event_queue: 64,
            retry: RetryPolicy::default(),
            verify_sender_key: true,
        }
    }
}

/// Exponential backoff for failed dialers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `0` disables retrying
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(rename = "initial_backoff_ms", with = "meshlink_core::duration::millis")]
    pub initial_backoff: Duration,
    /// Upper bound on any delay
    #[serde(rename = "max_backoff_ms", with = "meshlink_core::duration::millis")]
    pub max_backoff: Duration,
    /// Growth factor between retries
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Never retry
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based), or `None` once exhausted
    #[must_use]
    pub fn backoff(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries {
            return None;
        }
        let factor = self.multiplier.max(1.0).powi(i32::try_from(retry - 1).unwrap_or(i32::MAX));
        let delay = self.initial_backoff.as_secs_f64() * factor;
        Some(Duration::from_secs_f64(delay.min(self.max_backoff.as_secs_f64())))
    }
}

/// Settings for the UDP agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Local socket address (`0.0.0.0:0` picks an ephemeral port)
    pub bind: SocketAddr,
    /// STUN servers queried for server-reflexive candidates
    pub stun_servers: Vec<SocketAddr>,
    /// Per-server STUN response timeout
    #[serde(rename = "stun_timeout_ms", with = "meshlink_core::duration::millis")]
    pub stun_timeout: Duration,
    /// Interval between connectivity check retransmissions
    #[serde(rename = "check_interval_ms", with = "meshlink_core::duration::millis")]
    pub check_interval: Duration,
    /// Give up on connectivity checks after this long
    #[serde(rename = "check_timeout_ms", with = "meshlink_core::duration::millis")]
    pub check_timeout: Duration,
    /// Packets buffered for the transport reader
    pub receive_queue: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 0)),
            stun_servers: Vec::new(),
            stun_timeout: Duration::from_secs(1),
            check_interval: Duration::from_millis(200),
            check_timeout: Duration::from_secs(10),
            receive_queue: 512,
        }
    }
}

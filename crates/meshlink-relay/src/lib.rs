//! # Relay Broker
//!
//! Fallback path for peers that cannot reach each other directly. Each peer
//! keeps one persistent stream to the broker; the broker forwards frames by
//! target peer id without buffering whole payloads.
//!
//! ## Features
//!
//! - HTTP Upgrade bootstrap (`Upgrade: meshlink-relay`)
//! - Fixed 26-byte big-endian frame header
//! - Registration bound to the peer's public key
//! - Signaling passthrough (`Probe`) and packet forwarding (`Forward`)
//! - Idle deadline per session, client keepalive
//!
//! ## Architecture
//!
//! ```text
//!                    ┌─────────────────┐
//!                    │  RelayServer    │
//!                    │ PeerId → stream │
//!                    └────────┬────────┘
//!                             │
//!              ┌──────────────┴──────────────┐
//!              │ Register/Ping/Probe/Forward │
//!              ▼                             ▼
//!       ┌─────────────┐               ┌─────────────┐
//!       │ RelayClient │               │ RelayClient │
//!       │   peer A    │               │   peer B    │
//!       └─────────────┘               └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use meshlink_core::{PeerId, PublicKey};
//! use meshlink_relay::{Command, RelayClient, RelayClientConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let key = PublicKey::from_bytes([7u8; 32]);
//! let client = RelayClient::connect("http://relay.example.com:8080/relay", &key, RelayClientConfig::default()).await?;
//!
//! let peer = PeerId::from_u64(42);
//! client.send(peer, Command::Forward, b"packet").await?;
//!
//! let mut buf = vec![0u8; 2048];
//! let (n, from) = client.receive(&mut buf).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bind;
pub mod client;
pub mod error;
pub mod frame;
pub mod pool;
pub mod server;
pub mod transport;
pub mod upgrade;

pub use bind::RelayBind;
pub use client::{RelayClient, RelayClientConfig};
pub use error::{RelayError, Result};
pub use frame::{Command, FrameHeader, HEADER_LEN};
pub use pool::BufferPool;
pub use server::{RelayServer, RelayServerConfig};
pub use transport::RelayTransport;
pub use upgrade::{RelayUrl, UPGRADE_TOKEN};

/// Default broker port
pub const DEFAULT_RELAY_PORT: u16 = 8080;

/// Largest tunnel packet carried by `Forward`
pub const MAX_PACKET_SIZE: usize = 65535;

/// Client keepalive interval (2 seconds)
pub const DEFAULT_KEEPALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

/// Server read-idle deadline (10 seconds)
pub const DEFAULT_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Client connect + upgrade timeout (10 seconds)
pub const DEFAULT_CONNECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

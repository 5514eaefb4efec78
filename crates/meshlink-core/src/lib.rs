//! # meshlink Core
//!
//! Shared vocabulary for the meshlink connection-establishment engine.
//!
//! This crate provides:
//! - Peer identity (`PeerId` derived from a 32-byte public key)
//! - The peer directory (read-mostly, concurrent lookups)
//! - The endpoint/transport model consumed by the tunnel device
//! - The tunnel device `Bind` batch contract
//! - Signaling seams (`SignalChannel`, `SignalHandler`)
//! - Cooperative cancellation tokens for background tasks
//!
//! ## Example
//!
//! ```rust
//! use meshlink_core::{PeerId, PublicKey, should_initiate};
//!
//! let a = PeerId::from_public_key(&PublicKey::from_bytes([1u8; 32]));
//! let b = PeerId::from_public_key(&PublicKey::from_bytes([2u8; 32]));
//!
//! // Exactly one side sends SYN.
//! assert_ne!(should_initiate(a, b), should_initiate(b, a));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bind;
pub mod duration;
pub mod endpoint;
pub mod error;
pub mod peer;
pub mod shutdown;
pub mod signal;

pub use bind::Bind;
pub use endpoint::{Endpoint, Transport, TransportKind, TransportTable};
pub use error::{CoreError, Result};
pub use peer::{PeerDirectory, PeerId, PeerRecord, PublicKey, Upsert, should_initiate};
pub use shutdown::Shutdown;
pub use signal::{SignalChannel, SignalHandler};

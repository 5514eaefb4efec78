//! # meshlink Probe
//!
//! Connection establishment toward remote peers. One [`Probe`] per peer
//! races a NAT-traversal dialer against a broker relay dialer and hands the
//! first live [`Transport`](meshlink_core::Transport) to the tunnel device.
//!
//! ## Handshake
//!
//! ```text
//!   initiator (larger id string)              responder
//!   ───────────────────────────               ─────────
//!   SYN ──────── every syn_interval ────────▶
//!       ◀────────────────────────────────── ACK
//!   gather                                     gather
//!   OFFER(s) ─────────────────────────────────▶
//!       ◀───────────────────────────── OFFER(s) / ANSWER
//!   dial or accept (tie-breaker)               dial or accept
//! ```
//!
//! Each side dials only once its ack gate is open and a remote offer has
//! arrived. The ICE path trickles one candidate per `OFFER`; the relay path
//! sends a single candidate-less `OFFER` and answers every remote one.
//!
//! ## Example
//!
//! ```rust,no_run
//! use meshlink_core::{PeerDirectory, PeerId, PeerRecord, PublicKey};
//! use meshlink_probe::{AgentConfig, LocalBus, ProbeFactory, UdpAgentBuilder};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let key = PublicKey::from_bytes([1u8; 32]);
//! let local = PeerId::from_public_key(&key);
//! let bus = LocalBus::new();
//!
//! let factory = ProbeFactory::builder(local, PeerRecord::new("node-a", key), Arc::new(PeerDirectory::new()))
//!     .ice(Arc::new(bus.channel(local)), Arc::new(UdpAgentBuilder::new(AgentConfig::default())))
//!     .build();
//!
//! let probe = factory.probe(PeerId::from_u64(42)).await?;
//! let mut state = probe.subscribe();
//! state.changed().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod agent;
pub mod bind;
pub mod config;
pub mod dialer;
pub mod error;
pub mod factory;
pub mod gate;
pub mod handshake;
pub mod packet;
pub mod probe;
pub mod signal;
pub mod stun;
pub mod udp;

#[cfg(test)]
mod test_support;

pub use agent::{AgentBuilder, AgentState, Candidate, CandidateType, Credentials, IceAgent};
pub use bind::TransportBind;
pub use config::{AgentConfig, ProbeConfig, RetryPolicy};
pub use dialer::{DialContext, Dialer, IceDialer, RelayDialer};
pub use error::{ProbeError, Result};
pub use factory::{ProbeFactory, ProbeFactoryBuilder};
pub use handshake::{Handshake, RemoteOffer};
pub use packet::{DialerKind, Offer, PacketType, SignalPacket};
pub use probe::{ConnectionState, OnSuccess, Probe, ProbeEvent, ProbeOptions};
pub use signal::{LocalBus, LocalChannel};
pub use udp::{UdpAgent, UdpAgentBuilder, UdpTransport};

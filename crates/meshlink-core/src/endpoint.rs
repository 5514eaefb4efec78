//! Endpoint and transport model.
//!
//! An [`Endpoint`] says how a packet reaches a peer: a socket address for
//! direct and NAT-traversed paths, or the peer's id for the relay path. A
//! [`Transport`] is a live bidirectional path produced by a dialer.

use crate::error::{CoreError, Result};
use crate::peer::PeerId;
use async_trait::async_trait;
use dashmap::DashMap;
use std::borrow::Cow;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

const TAG_V4: u8 = 0x04;
const TAG_V6: u8 = 0x06;
const TAG_RELAY: u8 = 0x52;

/// Destination of a tunnel packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Reachable at a UDP socket address (direct or NAT-traversed)
    Direct(SocketAddr),
    /// Reachable through the relay broker under this id
    Relay(PeerId),
}

impl Endpoint {
    /// Stable byte form used by the tunnel device for endpoint identity.
    ///
    /// Layout: `[tag][address bytes]` where the tag is `0x04` (IPv4 + port),
    /// `0x06` (IPv6 + port) or `0x52` (relay peer id). Integers are big-endian.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Endpoint::Direct(SocketAddr::V4(addr)) => {
                let mut out = Vec::with_capacity(7);
                out.push(TAG_V4);
                out.extend_from_slice(&addr.ip().octets());
                out.extend_from_slice(&addr.port().to_be_bytes());
                out
            }
            Endpoint::Direct(SocketAddr::V6(addr)) => {
                let mut out = Vec::with_capacity(19);
                out.push(TAG_V6);
                out.extend_from_slice(&addr.ip().octets());
                out.extend_from_slice(&addr.port().to_be_bytes());
                out
            }
            Endpoint::Relay(id) => {
                let mut out = Vec::with_capacity(9);
                out.push(TAG_RELAY);
                out.extend_from_slice(&id.to_be_bytes());
                out
            }
        }
    }

    /// Decode the form produced by [`Endpoint::to_bytes`]
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidEndpoint`] on an unknown tag or bad length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (tag, rest) = bytes
            .split_first()
            .ok_or(CoreError::InvalidEndpoint(Cow::Borrowed("empty")))?;

        match (*tag, rest.len()) {
            (TAG_V4, 6) => {
                let ip = Ipv4Addr::new(rest[0], rest[1], rest[2], rest[3]);
                let port = u16::from_be_bytes([rest[4], rest[5]]);
                Ok(Endpoint::Direct(SocketAddr::new(IpAddr::V4(ip), port)))
            }
            (TAG_V6, 18) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&rest[..16]);
                let port = u16::from_be_bytes([rest[16], rest[17]]);
                Ok(Endpoint::Direct(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(octets)),
                    port,
                )))
            }
            (TAG_RELAY, 8) => {
                let mut id = [0u8; 8];
                id.copy_from_slice(rest);
                Ok(Endpoint::Relay(PeerId::from_be_bytes(id)))
            }
            (tag, len) => Err(CoreError::InvalidEndpoint(Cow::Owned(format!(
                "tag {tag:#04x} with {len} bytes"
            )))),
        }
    }

    /// IP address of a direct endpoint; `None` for relay
    #[must_use]
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Endpoint::Direct(addr) => Some(addr.ip()),
            Endpoint::Relay(_) => None,
        }
    }

    /// Relay peer id, if this is a relay endpoint
    #[must_use]
    pub fn relay_peer(&self) -> Option<PeerId> {
        match self {
            Endpoint::Relay(id) => Some(*id),
            Endpoint::Direct(_) => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Direct(addr) => write!(f, "{addr}"),
            Endpoint::Relay(id) => write!(f, "relay:{id}"),
        }
    }
}

/// How a transport reaches its peer, ranked by preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Direct path to a host candidate
    Direct,
    /// NAT-traversed path (reflexive candidate)
    Ice,
    /// Relayed through the broker
    Relay,
}

impl TransportKind {
    /// Selection priority (higher wins)
    #[must_use]
    pub const fn priority(&self) -> u32 {
        match self {
            TransportKind::Direct => 100,
            TransportKind::Ice => 80,
            TransportKind::Relay => 50,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Direct => write!(f, "direct"),
            TransportKind::Ice => write!(f, "ice"),
            TransportKind::Relay => write!(f, "relay"),
        }
    }
}

/// A connected bidirectional path to one peer.
///
/// Reads and writes carry whole tunnel packets. Implementations must allow a
/// reader and a writer to run concurrently.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one packet
    ///
    /// # Errors
    /// Returns [`CoreError::Closed`] once the transport is closed.
    async fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Receive one packet into `buf`, returning its length.
    ///
    /// A packet larger than `buf` is never returned silently cut: datagram
    /// paths truncate with a warning, stream-framed paths drop it with one.
    ///
    /// # Errors
    /// Returns [`CoreError::Closed`] once the transport is closed.
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Human-readable remote address
    fn remote_addr(&self) -> String;

    /// Path kind
    fn kind(&self) -> TransportKind;

    /// Endpoint the tunnel device should associate with this path
    fn endpoint(&self) -> Endpoint;

    /// Close the transport; later reads and writes fail
    ///
    /// # Errors
    /// Implementation specific; closing twice is not an error.
    async fn close(&self) -> Result<()>;

    /// Whether [`Transport::close`] has run
    fn is_closed(&self) -> bool;

    /// Selection priority
    fn priority(&self) -> u32 {
        self.kind().priority()
    }
}

/// Connected transports per peer, highest priority first.
#[derive(Default)]
pub struct TransportTable {
    peers: DashMap<PeerId, Vec<Arc<dyn Transport>>>,
}

impl TransportTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a transport, replacing any previous one of the same kind.
    ///
    /// Returns `true` if the new transport became the peer's best path.
    pub fn insert(&self, peer: PeerId, transport: Arc<dyn Transport>) -> bool {
        let mut entry = self.peers.entry(peer).or_default();
        let kind = transport.kind();
        entry.retain(|t| t.kind() != kind && !t.is_closed());
        entry.push(transport);
        entry.sort_by_key(|t| std::cmp::Reverse(t.priority()));
        entry.first().is_some_and(|t| t.kind() == kind)
    }

    /// Drop the transport of `kind` for `peer`, returning it.
    ///
    /// The peer's entry goes with its last transport.
    pub fn remove(&self, peer: &PeerId, kind: TransportKind) -> Option<Arc<dyn Transport>> {
        let removed = {
            let mut entry = self.peers.get_mut(peer)?;
            let pos = entry.iter().position(|t| t.kind() == kind)?;
            entry.remove(pos)
        };
        self.peers.remove_if(peer, |_, transports| transports.is_empty());
        Some(removed)
    }

    /// Drop every transport for `peer`
    pub fn remove_peer(&self, peer: &PeerId) -> Vec<Arc<dyn Transport>> {
        self.peers.remove(peer).map(|(_, v)| v).unwrap_or_default()
    }

    /// Highest-priority open transport for `peer`
    #[must_use]
    pub fn best(&self, peer: &PeerId) -> Option<Arc<dyn Transport>> {
        self.peers
            .get(peer)?
            .iter()
            .find(|t| !t.is_closed())
            .cloned()
    }

    /// Peer owning a transport with this endpoint
    #[must_use]
    pub fn peer_for(&self, endpoint: &Endpoint) -> Option<PeerId> {
        self.peers
            .iter()
            .find(|entry| entry.value().iter().any(|t| t.endpoint() == *endpoint))
            .map(|entry| *entry.key())
    }

    /// Number of peers with at least one transport
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

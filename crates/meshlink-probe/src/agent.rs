//! NAT-traversal agent capability.
//!
//! The ICE dialer drives an [`IceAgent`]: gather local candidates, ingest
//! remote ones, then either dial (controlling) or accept (controlled) using the
//! remote credentials. The agent decides whether the resulting path is
//! `Direct` or `Ice`.

use crate::error::{ProbeError, Result};
use async_trait::async_trait;
use meshlink_core::{PeerId, Shutdown, Transport};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;

/// Local or remote ICE credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Username fragment
    pub ufrag: String,
    /// Password
    pub pwd: String,
}

impl Credentials {
    /// Fresh random credentials
    #[must_use]
    pub fn random() -> Self {
        Self {
            ufrag: hex::encode(rand::random::<[u8; 4]>()),
            pwd: hex::encode(rand::random::<[u8; 16]>()),
        }
    }
}

/// Candidate type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateType {
    /// Local interface address
    Host,
    /// Public mapping learned from STUN
    ServerReflexive,
    /// Mapping learned from a connectivity check
    PeerReflexive,
    /// Address on a TURN-style relay
    Relay,
}

impl CandidateType {
    const fn type_preference(self) -> u32 {
        match self {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relay => 0,
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => write!(f, "host"),
            Self::ServerReflexive => write!(f, "srflx"),
            Self::PeerReflexive => write!(f, "prflx"),
            Self::Relay => write!(f, "relay"),
        }
    }
}

impl FromStr for CandidateType {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "host" => Ok(Self::Host),
            "srflx" => Ok(Self::ServerReflexive),
            "prflx" => Ok(Self::PeerReflexive),
            "relay" => Ok(Self::Relay),
            other => Err(ProbeError::Agent(format!("unknown candidate type {other}"))),
        }
    }
}

/// One reachable address of an agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Groups candidates sharing a base
    pub foundation: String,
    /// RFC 8445 priority
    pub priority: u32,
    /// Transport address
    pub address: SocketAddr,
    /// Type
    pub kind: CandidateType,
    /// Base address for reflexive candidates
    pub related: Option<SocketAddr>,
}

impl Candidate {
    /// Host candidate
    #[must_use]
    pub fn host(address: SocketAddr) -> Self {
        Self::new(address, CandidateType::Host, None)
    }

    /// Server-reflexive candidate mapped from `base`
    #[must_use]
    pub fn server_reflexive(address: SocketAddr, base: SocketAddr) -> Self {
        Self::new(address, CandidateType::ServerReflexive, Some(base))
    }

    fn new(address: SocketAddr, kind: CandidateType, related: Option<SocketAddr>) -> Self {
        let digest = blake3::hash(format!("{kind}/{}", address.ip()).as_bytes());
        Self {
            foundation: hex::encode(&digest.as_bytes()[..4]),
            priority: Self::compute_priority(kind, 65535, 1),
            address,
            kind,
            related,
        }
    }

    /// RFC 8445 §5.1.2.1 priority
    fn compute_priority(kind: CandidateType, local_pref: u32, component: u32) -> u32 {
        (kind.type_preference() << 24) + (local_pref << 8) + (256 - component)
    }

    /// SDP attribute form, e.g. `candidate:1a2b3c4d 1 udp 2130706431 10.0.0.2 4000 typ host`
    #[must_use]
    pub fn to_sdp_string(&self) -> String {
        let mut s = format!(
            "candidate:{} 1 udp {} {} {} typ {}",
            self.foundation,
            self.priority,
            self.address.ip(),
            self.address.port(),
            self.kind
        );
        if let Some(related) = self.related {
            s.push_str(&format!(" raddr {} rport {}", related.ip(), related.port()));
        }
        s
    }
}

impl FromStr for Candidate {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = |what: &str| ProbeError::Agent(format!("malformed candidate ({what}): {s}"));

        let body = s.strip_prefix("candidate:").ok_or_else(|| bad("prefix"))?;
        let fields: Vec<&str> = body.split_whitespace().collect();
        if fields.len() < 8 || fields[6] != "typ" {
            return Err(bad("field count"));
        }
        if !fields[2].eq_ignore_ascii_case("udp") {
            return Err(bad("transport"));
        }

        let priority = fields[3].parse().map_err(|_| bad("priority"))?;
        let ip = fields[4].parse().map_err(|_| bad("address"))?;
        let port = fields[5].parse().map_err(|_| bad("port"))?;
        let kind = fields[7].parse()?;

        let related = match fields.get(8..12) {
            Some(["raddr", rip, "rport", rport]) => Some(SocketAddr::new(
                rip.parse().map_err(|_| bad("raddr"))?,
                rport.parse().map_err(|_| bad("rport"))?,
            )),
            _ => None,
        };

        Ok(Self {
            foundation: fields[0].to_string(),
            priority,
            address: SocketAddr::new(ip, port),
            kind,
            related,
        })
    }
}

/// Connectivity state reported by an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Nothing attempted yet
    New,
    /// Connectivity checks in flight
    Checking,
    /// A pair is selected and carrying data
    Connected,
    /// Selected pair stopped answering
    Disconnected,
    /// Checks exhausted
    Failed,
    /// Agent closed
    Closed,
}

/// Local NAT-traversal agent for one remote peer
#[async_trait]
pub trait IceAgent: Send + Sync {
    /// Local credentials advertised in offers
    fn credentials(&self) -> Credentials;

    /// Random value deciding dial vs accept
    fn tie_breaker(&self) -> u64;

    /// Discover local candidates
    ///
    /// # Errors
    /// Returns an error when the agent cannot gather at all; an empty list
    /// is not an error here.
    async fn gather(&self) -> Result<Vec<Candidate>>;

    /// Add a trickled remote candidate
    fn add_remote_candidate(&self, candidate: Candidate);

    /// Run checks as the controlling side and return the selected path
    ///
    /// # Errors
    /// Returns [`ProbeError::Agent`] when checks fail, or
    /// [`ProbeError::Cancelled`] on shutdown.
    async fn dial(&self, remote: &Credentials, shutdown: &Shutdown) -> Result<Arc<dyn Transport>>;

    /// Answer checks as the controlled side and return the nominated path
    ///
    /// # Errors
    /// As [`IceAgent::dial`].
    async fn accept(&self, remote: &Credentials, shutdown: &Shutdown) -> Result<Arc<dyn Transport>>;

    /// State updates
    fn subscribe_state(&self) -> watch::Receiver<AgentState>;

    /// Stop the agent
    async fn close(&self);
}

/// Creates one agent per remote peer
#[async_trait]
pub trait AgentBuilder: Send + Sync {
    /// Build the agent `local` uses toward `remote`
    ///
    /// # Errors
    /// Returns an error if the agent's socket cannot be set up.
    async fn build(&self, local: PeerId, remote: PeerId) -> Result<Arc<dyn IceAgent>>;
}

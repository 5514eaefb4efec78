//! Peer identity and the peer directory.
//!
//! A [`PeerId`] is a compact 64-bit identifier derived from a peer's 32-byte
//! public key. It keys every map in the engine and appears on the relay wire.
//! The [`PeerDirectory`] caches the metadata learned about each peer.

use crate::error::{CoreError, Result};
use blake3::Hasher;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Domain separation for id derivation
const PEER_ID_CONTEXT: &[u8] = b"meshlink-peer-id";

/// A peer's 32-byte public key (tunnel identity key)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Wrap raw key bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a 64-character hex string
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s.trim()).ok()?;
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short hex prefix for logs
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.short())
    }
}

/// Compact peer identifier.
///
/// Derived as the first eight bytes (big-endian) of
/// `BLAKE3(public_key || "meshlink-peer-id")`. Zero is reserved as the
/// "no peer" marker on the relay wire.
///
/// The string form is the decimal rendering of the integer; handshake role
/// resolution compares those strings lexicographically (see [`should_initiate`]).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct PeerId(u64);

impl PeerId {
    /// The "not applicable" id
    pub const ZERO: PeerId = PeerId(0);

    /// Derive the id for a public key
    ///
    /// # Examples
    ///
    /// ```
    /// use meshlink_core::{PeerId, PublicKey};
    ///
    /// let key = PublicKey::from_bytes([42u8; 32]);
    /// assert_eq!(PeerId::from_public_key(&key), PeerId::from_public_key(&key));
    /// ```
    #[must_use]
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(public_key.as_bytes());
        hasher.update(PEER_ID_CONTEXT);
        let hash = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&hash.as_bytes()[..8]);
        Self(u64::from_be_bytes(prefix))
    }

    /// Build an id from its raw integer value
    #[must_use]
    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// Raw integer value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Whether this is the reserved zero id
    #[must_use]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Big-endian wire bytes
    #[must_use]
    pub const fn to_be_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Parse big-endian wire bytes
    #[must_use]
    pub const fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl std::str::FromStr for PeerId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse::<u64>().map(Self)
    }
}

/// Whether `local` sends the handshake SYN to `remote`.
///
/// Compares the decimal string forms lexicographically, so for any two
/// distinct ids exactly one side initiates.
#[must_use]
pub fn should_initiate(local: PeerId, remote: PeerId) -> bool {
    local.to_string() > remote.to_string()
}

/// Metadata cached for a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PeerRecord {
    /// Human-readable name
    pub name: String,
    /// Tunnel public key
    pub public_key: PublicKey,
    /// Allocated tunnel address (e.g. `10.10.0.2/32`)
    pub address: Option<String>,
    /// Comma-separated allowed-IP set
    pub allowed_ips: String,
    /// Relay broker the peer is registered with
    pub relay_url: Option<String>,
    /// Tunnel interface name
    pub interface: String,
}

impl PeerRecord {
    /// Create a record with just a name and key
    #[must_use]
    pub fn new(name: impl Into<String>, public_key: PublicKey) -> Self {
        Self {
            name: name.into(),
            public_key,
            ..Self::default()
        }
    }

    /// The id derived from this record's key
    #[must_use]
    pub fn derived_id(&self) -> PeerId {
        PeerId::from_public_key(&self.public_key)
    }
}

/// Outcome of a directory upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// First sighting of the peer
    Inserted,
    /// Existing record replaced with new metadata
    Updated,
    /// Identical record already present
    Unchanged,
}

/// Read-mostly cache of peer metadata keyed by [`PeerId`].
///
/// Lookups run concurrently; writes to the same id are serialized by the
/// map's per-shard locking. Records are never deleted by the engine itself.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: DashMap<PeerId, PeerRecord>,
}

impl PeerDirectory {
    /// Create an empty directory
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record under the id derived from its key
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PeerIdCollision`] if a different key already
    /// owns the derived id.
    pub fn add(&self, record: PeerRecord) -> Result<PeerId> {
        let id = record.derived_id();
        self.upsert(id, record)?;
        Ok(id)
    }

    /// Insert or update the record for `id`.
    ///
    /// First writer wins: a record whose public key differs from the one
    /// already stored under `id` is rejected rather than overwriting it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PeerIdCollision`] on a conflicting key.
    pub fn upsert(&self, id: PeerId, record: PeerRecord) -> Result<Upsert> {
        match self.peers.entry(id) {
            Entry::Vacant(slot) => {
                tracing::debug!(peer = %id, name = %record.name, "peer added to directory");
                slot.insert(record);
                Ok(Upsert::Inserted)
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get();
                if existing.public_key != record.public_key {
                    tracing::warn!(
                        peer = %id,
                        existing = %existing.public_key.short(),
                        offered = %record.public_key.short(),
                        "peer id collision, keeping first key"
                    );
                    return Err(CoreError::PeerIdCollision {
                        id,
                        existing: existing.public_key.short(),
                        offered: record.public_key.short(),
                    });
                }
                if *existing == record {
                    return Ok(Upsert::Unchanged);
                }
                slot.insert(record);
                Ok(Upsert::Updated)
            }
        }
    }

    /// Look up a record
    #[must_use]
    pub fn get(&self, id: &PeerId) -> Option<PeerRecord> {
        self.peers.get(id).map(|r| r.value().clone())
    }

    /// Find the id owning a public key
    #[must_use]
    pub fn find_by_key(&self, key: &PublicKey) -> Option<PeerId> {
        self.peers
            .iter()
            .find(|entry| entry.value().public_key == *key)
            .map(|entry| *entry.key())
    }

    /// Whether the directory knows `id`
    #[must_use]
    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    /// Remove a record (external lifecycle only)
    pub fn remove(&self, id: &PeerId) -> Option<PeerRecord> {
        self.peers.remove(id).map(|(_, record)| record)
    }

    /// Number of known peers
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the directory is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Snapshot of all known ids
    #[must_use]
    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.iter().map(|entry| *entry.key()).collect()
    }
}

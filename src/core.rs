//! Core crawler types: identifiers, the XOR metric, node records and the
//! transport seam.
//!
//! - **Identity & Hashing**: [`KeyId`], [`derive_key_id`]
//! - **Distance Metrics**: [`Distance`], [`random_key_at_distance`]
//! - **Records**: [`Node`] with version-wins merge semantics
//! - **Transport**: [`DhtTransport`], implemented by [`crate::net::IrohTransport`]
//!   in production and by an in-memory network in tests

use std::fmt;

use async_trait::async_trait;
use iroh_blake3::Hasher;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{ConnectionError, QueryError};

// ============================================================================
// Configuration Constants
// ============================================================================

/// Width of a [`KeyId`] in bytes.
pub const KEY_LEN: usize = 32;

/// Width of a [`KeyId`] in bits, which is also the number of distance rings.
pub const KEY_BITS: usize = KEY_LEN * 8;

// ============================================================================
// Identity & Hashing
// ============================================================================

/// A 256-bit identifier used for distance computation.
///
/// Key ids are derived from a node's public key using BLAKE3, so they are
/// uniformly spread over the identifier space.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(#[serde(with = "hex::serde")] pub [u8; KEY_LEN]);

impl KeyId {
    /// Borrow the raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// XOR distance between two identifiers.
    ///
    /// # Properties
    /// - `a.distance(&a)` is zero
    /// - `a.distance(&b) == b.distance(&a)`
    pub fn distance(&self, other: &KeyId) -> Distance {
        let mut out = [0u8; KEY_LEN];
        for (i, d) in out.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }
}

impl From<[u8; KEY_LEN]> for KeyId {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({:02x}{:02x}{:02x}{:02x}..)", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Derive a stable [`KeyId`] by hashing arbitrary input with BLAKE3.
///
/// ```
/// use iroh_dht_crawler::derive_key_id;
///
/// let id = derive_key_id(b"example-public-key-bytes");
/// assert_eq!(id, derive_key_id(b"example-public-key-bytes"));
/// ```
pub fn derive_key_id(data: &[u8]) -> KeyId {
    let mut hasher = Hasher::new();
    hasher.update(data);
    let digest = hasher.finalize();

    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(digest.as_bytes());
    KeyId(out)
}

// ============================================================================
// Distance Metrics
// ============================================================================

/// XOR distance between two [`KeyId`]s.
///
/// Ordering is that of a 256-bit big-endian unsigned integer. Two distances
/// are only comparable when they were measured from the same reference key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Distance(pub [u8; KEY_LEN]);

impl Distance {
    /// Returns true when both keys were identical.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Number of leading zero bits, `KEY_BITS` for the zero distance.
    pub fn leading_zeros(&self) -> usize {
        for (byte_idx, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                return byte_idx * 8 + byte.leading_zeros() as usize;
            }
        }
        KEY_BITS
    }

    /// The ring this distance falls into.
    ///
    /// Ring `b` holds every distance in `[2^b, 2^(b+1))`, so the index is the
    /// position of the highest set bit and higher rings are farther away. The
    /// zero distance is degenerate and maps to ring 0.
    pub fn bucket_index(&self) -> usize {
        match self.leading_zeros() {
            KEY_BITS => 0,
            lz => KEY_BITS - 1 - lz,
        }
    }
}

/// Generate a key whose distance to `reference` lies in ring `bucket`.
///
/// The distance has bit `bucket` set, every higher bit cleared and every lower
/// bit drawn from `rng`, so the result is uniform over the ring. Rings past the
/// key width are clamped to the farthest ring.
pub fn random_key_at_distance<R: Rng + ?Sized>(
    reference: &KeyId,
    bucket: usize,
    rng: &mut R,
) -> KeyId {
    let bucket = bucket.min(KEY_BITS - 1);
    let byte_idx = KEY_LEN - 1 - bucket / 8;
    let bit = bucket % 8;

    let mut distance = [0u8; KEY_LEN];
    let low_mask = (1u8 << bit) - 1;
    distance[byte_idx] = (1u8 << bit) | (rng.gen::<u8>() & low_mask);
    rng.fill(&mut distance[byte_idx + 1..]);

    let mut out = reference.0;
    for (o, d) in out.iter_mut().zip(distance.iter()) {
        *o ^= d;
    }
    KeyId(out)
}

// ============================================================================
// Node Records
// ============================================================================

/// A DHT participant as advertised by some peer's routing table.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    /// Identifier used for distance computation and deduplication.
    pub id: KeyId,
    /// The node's public key.
    #[serde(with = "hex::serde")]
    pub public_key: [u8; 32],
    /// Transport-specific encoded addresses, most preferred first.
    pub addrs: Vec<String>,
    /// Monotonically increasing record version assigned by the node itself.
    pub version: u32,
}

impl Node {
    /// Build a record whose id is the BLAKE3 digest of `public_key`.
    pub fn from_public_key(public_key: [u8; 32], addrs: Vec<String>, version: u32) -> Self {
        Self {
            id: derive_key_id(&public_key),
            public_key,
            addrs,
            version,
        }
    }

    /// Whether `self` should replace `existing` when both describe the same key.
    ///
    /// Strictly newer versions win; arrival order never matters.
    pub fn supersedes(&self, existing: &Node) -> bool {
        self.version > existing.version
    }

    /// Copy of this record without addresses, used when persisting drain lists.
    pub fn without_addrs(&self) -> Node {
        Node {
            id: self.id,
            public_key: self.public_key,
            addrs: Vec::new(),
            version: self.version,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Transport abstraction consumed by the crawler.
///
/// The crawler only ever opens a session to a peer and then asks it for nodes
/// near synthetic targets. Implementations must bound both calls with their
/// own timeouts; the crawler never waits on them indefinitely.
#[async_trait]
pub trait DhtTransport: Send + Sync + 'static {
    /// Per-peer handle produced by [`open_session`](Self::open_session).
    type Session: Send + Sync + 'static;

    /// Establish a session with `node`.
    async fn open_session(&self, node: &Node) -> Result<Self::Session, ConnectionError>;

    /// Ask the peer behind `session` for up to `count` nodes near `target`.
    async fn find_node(
        &self,
        session: &Self::Session,
        target: KeyId,
        count: usize,
    ) -> Result<Vec<Node>, QueryError>;
}

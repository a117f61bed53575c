//! Shared types and identifiers for Tessera.
//!
//! This crate defines the core vocabulary used across the Tessera workspace:
//! target identity ([`TargetId`]), bucket addressing ([`Bucket`],
//! [`Provider`]), the erasure-coding metadata sidecar ([`EcMetadata`]),
//! wire-level object attributes ([`ObjAttrs`]), rebalance stages
//! ([`Stage`]), configuration ([`RebConfig`]) and the rebalance status
//! report ([`RebStatus`]).

pub mod config;
pub mod stage;
pub mod status;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use config::{EcConf, RebConfig, RebalanceConf, TimeoutConf};
pub use stage::{Stage, StageMark};
pub use status::{RebStats, RebStatsSnapshot, RebStatus};

// ---------------------------------------------------------------------------
// Target identity
// ---------------------------------------------------------------------------

/// Identifier of a storage target (one daemon in the cluster).
///
/// Opaque string assigned at node registration. Ordering is lexicographic
/// and used only for deterministic iteration, never for placement — placement
/// goes through HRW weights.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId(String);

impl TargetId {
    /// Wrap a daemon identifier string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t[{}]", self.0)
    }
}

impl From<&str> for TargetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Buckets
// ---------------------------------------------------------------------------

/// Bucket provider class.
///
/// Native buckets sort before remote ones everywhere a deterministic
/// cluster-wide order is required, so `Ais` must stay the first variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Provider {
    /// Cluster-native bucket.
    Ais,
    /// Bucket backed by an external (cloud) provider.
    Remote,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provider::Ais => f.write_str("ais"),
            Provider::Remote => f.write_str("remote"),
        }
    }
}

/// Bucket identity: name plus provider class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Bucket {
    /// Bucket name, unique within its provider class.
    pub name: String,
    /// Provider class.
    pub provider: Provider,
}

impl Bucket {
    /// A cluster-native bucket.
    pub fn ais(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: Provider::Ais,
        }
    }

    /// A remote-backed bucket.
    pub fn remote(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: Provider::Remote,
        }
    }

    /// Canonical unique name of an object in this bucket.
    ///
    /// Every fragment of the same object maps to the same uname; HRW
    /// placement, ack tables and name locks all key on it.
    pub fn uname(&self, obj_name: &str) -> String {
        format!("{}/{}/{}", self.provider, self.name, obj_name)
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.name)
    }
}

// ---------------------------------------------------------------------------
// EC metadata sidecar
// ---------------------------------------------------------------------------

/// Checksum algorithm name used on fragment attributes.
pub const CKSUM_XXHASH: &str = "xxh64";

/// Metadata sidecar stored next to every erasure-coded fragment.
///
/// The same record travels in repair pushes and in `ec-meta` control
/// responses, serialized as JSON on disk and postcard on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcMetadata {
    /// Size of the full object in bytes.
    pub obj_size: u64,
    /// Number of data slices the object was encoded into.
    pub data_slices: u16,
    /// Number of parity slices.
    pub parity_slices: u16,
    /// Which fragment this record describes: 0 = full object/replica,
    /// 1..=data+parity = data or parity slice.
    pub slice_id: u16,
    /// Content digest of the full object; the version tiebreaker when two
    /// generations of the same object coexist during rebalance.
    pub obj_cksum: String,
    /// Checksum algorithm of `obj_cksum` (normally [`CKSUM_XXHASH`]).
    pub cksum_type: String,
    /// Object version string, opaque to the engine.
    pub obj_version: String,
}

impl EcMetadata {
    /// Total slice count (data + parity), excluding the full object.
    pub fn total_slices(&self) -> u16 {
        self.data_slices + self.parity_slices
    }

    /// True when this record describes a whole-object replica.
    pub fn is_replica(&self) -> bool {
        self.slice_id == 0
    }
}

// ---------------------------------------------------------------------------
// Wire object attributes
// ---------------------------------------------------------------------------

/// Object attributes carried in every transport header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjAttrs {
    /// Payload size in bytes (full object or slice size).
    pub size: u64,
    /// Access time, Unix nanoseconds. Zero when unknown.
    pub atime: i64,
    /// Object version string, empty when unknown.
    pub version: String,
    /// Checksum algorithm of `cksum_value`, empty when no checksum travels.
    pub cksum_type: String,
    /// Hex checksum of the payload.
    pub cksum_value: String,
}

// ---------------------------------------------------------------------------
// Hash helpers
// ---------------------------------------------------------------------------

/// XXH64 digest of `data`, hex-encoded. The wire checksum for fragments.
pub fn xxhash_hex(data: &[u8]) -> String {
    format!("{:016x}", xxhash_rust::xxh64::xxh64(data, 0))
}

/// Stable shard index for a uname, used by sharded tables and locks.
pub fn uname_shard(uname: &str, mask: usize) -> usize {
    (xxhash_rust::xxh3::xxh3_64(uname.as_bytes()) as usize) & mask
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

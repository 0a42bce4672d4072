//! Core type definitions for Obelisk

use anyhow::anyhow;
use blake2::{digest::consts::U32, Blake2b, Digest};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr};

/// A 32-byte block content identifier.
///
/// Serialized as a hex string; ordered and hashable so it can be used as a
/// map key throughout the block oracle.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockHash([u8; 32]);

impl BlockHash {
    #[inline]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive a block hash from raw block bytes (Blake2b-256)
    pub fn digest(raw: &[u8]) -> Self {
        let mut hasher = Blake2b::<U32>::new();
        hasher.update(raw);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl AsRef<[u8]> for BlockHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for BlockHash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "BlockHash({})", hex::encode(self.0))
    }
}

impl FromStr for BlockHash {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let bytes: [u8; 32] =
            bytes.try_into().map_err(|_| anyhow!("block hash must be 32 bytes"))?;
        Ok(Self(bytes))
    }
}

// Serialize/deserialize as hex strings rather than byte arrays
impl Serialize for BlockHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Opaque handle to a block's physical location in the store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockHandle(pub u64);

/// Reference to a block that is either present in the store or absent.
///
/// An `Invalid` location is a sentinel for "not materialized yet" and must
/// never be mistaken for a zero-byte block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BlockLocation {
    Valid(BlockHandle),
    Invalid,
}

impl BlockLocation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid(_))
    }

    pub fn handle(&self) -> Option<BlockHandle> {
        match self {
            Self::Valid(handle) => Some(*handle),
            Self::Invalid => None,
        }
    }
}

impl Default for BlockLocation {
    fn default() -> Self {
        Self::Invalid
    }
}

/// A point on the best chain
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Position {
    /// Block height
    pub height: u64,

    /// Block hash
    pub hash: BlockHash,
}

impl Position {
    pub fn new(height: u64, hash: BlockHash) -> Self {
        Self { height, hash }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.height, self.hash)
    }
}

/// Identity of a component awaiting a block - on the bus this is the
/// requestor's reply topic
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RequestorId(pub String);

impl RequestorId {
    pub fn new(topic: impl Into<String>) -> Self {
        Self(topic.into())
    }

    pub fn topic(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestorId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

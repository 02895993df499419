//! Tree identifiers
//!
//! A partition owns one hash tree per preflist it serves. A preflist is named by
//! an [`IndexN`]: the 160-bit index of its primary partition plus the replication
//! factor. Persisted and compared identifiers always use the fixed 22-byte
//! encoding produced by [`IndexN::encode`].

use crate::error::CoordinatorError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Width of a partition index in bytes (160 bits)
pub const PARTITION_INDEX_LEN: usize = 20;

/// Width of an encoded [`IndexN`] in bytes (176 bits)
pub const INDEX_N_LEN: usize = PARTITION_INDEX_LEN + 2;

/// 160-bit partition index, big-endian
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionIndex([u8; PARTITION_INDEX_LEN]);

impl PartitionIndex {
    pub const fn from_bytes(bytes: [u8; PARTITION_INDEX_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a partition index from a big-endian byte string of at most 20 bytes.
    ///
    /// Shorter inputs are left-padded with zeros.
    pub fn from_be_slice(bytes: &[u8]) -> Result<Self, CoordinatorError> {
        if bytes.len() > PARTITION_INDEX_LEN {
            return Err(CoordinatorError::InvalidIdentifier(format!(
                "partition index is {} bytes, at most {} allowed",
                bytes.len(),
                PARTITION_INDEX_LEN
            )));
        }
        let mut out = [0u8; PARTITION_INDEX_LEN];
        out[PARTITION_INDEX_LEN - bytes.len()..].copy_from_slice(bytes);
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; PARTITION_INDEX_LEN] {
        &self.0
    }

    /// Returns the index as a `u64` when it fits in the low 64 bits.
    pub fn as_u64(&self) -> Option<u64> {
        let (high, low) = self.0.split_at(PARTITION_INDEX_LEN - 8);
        if high.iter().any(|b| *b != 0) {
            return None;
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(low);
        Some(u64::from_be_bytes(buf))
    }
}

impl From<u64> for PartitionIndex {
    fn from(value: u64) -> Self {
        let mut out = [0u8; PARTITION_INDEX_LEN];
        out[PARTITION_INDEX_LEN - 8..].copy_from_slice(&value.to_be_bytes());
        Self(out)
    }
}

impl fmt::Display for PartitionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_u64() {
            Some(value) => write!(f, "{}", value),
            None => write!(f, "{}", hex::encode(self.0)),
        }
    }
}

impl FromStr for PartitionIndex {
    type Err = CoordinatorError;

    /// Accepts a decimal `u64` or a 40-character hex string.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(value) = s.parse::<u64>() {
            return Ok(Self::from(value));
        }
        if s.len() != PARTITION_INDEX_LEN * 2 {
            return Err(CoordinatorError::InvalidIdentifier(format!(
                "partition index '{}' is neither decimal nor 40 hex characters",
                s
            )));
        }
        let bytes = hex::decode(s)
            .map_err(|e| CoordinatorError::InvalidIdentifier(format!("{}: {}", s, e)))?;
        Self::from_be_slice(&bytes)
    }
}

/// Preflist identity: (partition index, replication factor)
///
/// Ordering is by partition index first, then replication factor, which is the
/// same as the lexicographic order of the encoded form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IndexN {
    pub partition: PartitionIndex,
    pub n: u16,
}

impl IndexN {
    /// Identifier for a preflist with replication factor `n`.
    ///
    /// `n` must be at least 1: [`IndexN::decode`] rejects a zero replication
    /// factor, so a zero `n` would not survive an encode/decode round trip. Use
    /// [`IndexN::from_parts`] for unchecked input.
    pub fn new(partition: impl Into<PartitionIndex>, n: u16) -> Self {
        debug_assert!(n > 0, "replication factor must be at least 1");
        Self {
            partition: partition.into(),
            n,
        }
    }

    /// Build an identifier from loosely-typed parts.
    ///
    /// Fails with `InvalidIdentifier` if the partition does not fit 160 bits or the
    /// replication factor is zero or does not fit 16 bits.
    pub fn from_parts(partition: &[u8], n: u64) -> Result<Self, CoordinatorError> {
        let partition = PartitionIndex::from_be_slice(partition)?;
        let n = u16::try_from(n).map_err(|_| {
            CoordinatorError::InvalidIdentifier(format!("replication factor {} exceeds 16 bits", n))
        })?;
        if n == 0 {
            return Err(CoordinatorError::InvalidIdentifier(
                "replication factor must be at least 1".to_string(),
            ));
        }
        Ok(Self { partition, n })
    }

    /// Fixed-width encoding: 160-bit partition index then 16-bit replication factor.
    pub fn encode(&self) -> [u8; INDEX_N_LEN] {
        let mut out = [0u8; INDEX_N_LEN];
        out[..PARTITION_INDEX_LEN].copy_from_slice(self.partition.as_bytes());
        out[PARTITION_INDEX_LEN..].copy_from_slice(&self.n.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CoordinatorError> {
        if bytes.len() != INDEX_N_LEN {
            return Err(CoordinatorError::InvalidIdentifier(format!(
                "encoded tree id is {} bytes, expected {}",
                bytes.len(),
                INDEX_N_LEN
            )));
        }
        let (partition, n) = bytes.split_at(PARTITION_INDEX_LEN);
        let n = u16::from_be_bytes([n[0], n[1]]);
        Self::from_parts(partition, u64::from(n))
    }
}

impl fmt::Display for IndexN {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{},{}}}", self.partition, self.n)
    }
}

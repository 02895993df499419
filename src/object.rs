//! Replica objects and their anti-entropy hashes
//!
//! Two replicas of the same object must hash identically even when their vector
//! clocks list the same entries in different orders, so hashing works on a
//! canonical copy whose clock is sorted.

use crate::error::StorageError;
use crate::types::{Hash, TreeKey};
use blake3::Hasher;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Logical object key: (bucket, key)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub bucket: Vec<u8>,
    pub key: Vec<u8>,
}

impl ObjectKey {
    pub fn new(bucket: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Key bytes stored in the hash tree
    ///
    /// `bucket_len (4 bytes BE) || bucket || key`, so distinct (bucket, key) pairs
    /// never collide.
    pub fn to_tree_key(&self) -> TreeKey {
        let mut out = Vec::with_capacity(4 + self.bucket.len() + self.key.len());
        out.extend_from_slice(&(self.bucket.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.bucket);
        out.extend_from_slice(&self.key);
        out
    }

    /// Inverse of [`ObjectKey::to_tree_key`]
    pub fn from_tree_key(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 4 {
            return None;
        }
        let bucket_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let rest = &bytes[4..];
        if rest.len() < bucket_len {
            return None;
        }
        let (bucket, key) = rest.split_at(bucket_len);
        Some(Self::new(bucket, key))
    }
}

/// One vector clock entry
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VClockEntry {
    pub actor: Vec<u8>,
    pub counter: u64,
    pub timestamp: u64,
}

/// A stored replica of an object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaObject {
    pub vclock: Vec<VClockEntry>,
    pub value: Vec<u8>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ReplicaObject {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            vclock: Vec::new(),
            value: value.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_clock_entry(mut self, actor: impl Into<Vec<u8>>, counter: u64, timestamp: u64) -> Self {
        self.vclock.push(VClockEntry {
            actor: actor.into(),
            counter,
            timestamp,
        });
        self
    }

    /// Copy of this object with its vector clock sorted
    pub fn canonical(&self) -> Self {
        let mut canonical = self.clone();
        canonical.vclock.sort();
        canonical
    }
}

/// Compute the anti-entropy hash of a replica
///
/// Hash = BLAKE3("object" || bincode(canonical object))
pub fn hash_object(object: &ReplicaObject) -> Result<Hash, StorageError> {
    let encoded = bincode::serialize(&object.canonical())?;

    let mut hasher = Hasher::new();

    // Hash type discriminator
    hasher.update(b"object");
    hasher.update(&encoded);

    Ok(*hasher.finalize().as_bytes())
}

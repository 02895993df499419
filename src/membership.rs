//! Cluster membership lookups
//!
//! The coordinator asks membership two questions: which preflist a key belongs
//! to, and which preflists a partition currently serves.

use crate::error::CoordinatorError;
use crate::object::ObjectKey;
use crate::tree_id::{IndexN, PartitionIndex};
use std::collections::{BTreeSet, HashMap};

/// Membership service interface
pub trait Membership: Send + Sync {
    /// Preflist responsible for a key
    fn resolve_index_n(&self, key: &ObjectKey) -> Result<IndexN, CoordinatorError>;

    /// Every preflist the partition is currently part of
    fn responsible_preflists(&self, partition: PartitionIndex) -> Result<Vec<IndexN>, CoordinatorError>;
}

/// Fixed ring of partitions with per-bucket replication factors
///
/// A key's primary partition is chosen by hashing its tree key onto the ring; its
/// preflist is the primary followed by the next `n - 1` partitions, and is named
/// by the primary.
#[derive(Debug, Clone)]
pub struct StaticRing {
    partitions: Vec<PartitionIndex>,
    default_n_val: u16,
    bucket_n_vals: HashMap<Vec<u8>, u16>,
}

impl StaticRing {
    pub fn new(partitions: impl IntoIterator<Item = PartitionIndex>, default_n_val: u16) -> Self {
        let partitions: BTreeSet<PartitionIndex> = partitions.into_iter().collect();
        Self {
            partitions: partitions.into_iter().collect(),
            default_n_val,
            bucket_n_vals: HashMap::new(),
        }
    }

    pub fn with_bucket_n_val(mut self, bucket: impl Into<Vec<u8>>, n_val: u16) -> Self {
        self.bucket_n_vals.insert(bucket.into(), n_val);
        self
    }

    pub fn partitions(&self) -> &[PartitionIndex] {
        &self.partitions
    }

    pub fn n_val(&self, bucket: &[u8]) -> u16 {
        self.bucket_n_vals
            .get(bucket)
            .copied()
            .unwrap_or(self.default_n_val)
    }

    /// Primary partition for a key
    pub fn primary(&self, key: &ObjectKey) -> Result<PartitionIndex, CoordinatorError> {
        if self.partitions.is_empty() {
            return Err(CoordinatorError::Membership("ring has no partitions".to_string()));
        }
        let digest = blake3::hash(&key.to_tree_key());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest.as_bytes()[..8]);
        let position = u64::from_be_bytes(prefix) % self.partitions.len() as u64;
        Ok(self.partitions[position as usize])
    }

    fn n_vals(&self) -> BTreeSet<u16> {
        let mut n_vals: BTreeSet<u16> = self.bucket_n_vals.values().copied().collect();
        n_vals.insert(self.default_n_val);
        n_vals
    }
}

impl Membership for StaticRing {
    fn resolve_index_n(&self, key: &ObjectKey) -> Result<IndexN, CoordinatorError> {
        Ok(IndexN {
            partition: self.primary(key)?,
            n: self.n_val(&key.bucket),
        })
    }

    fn responsible_preflists(&self, partition: PartitionIndex) -> Result<Vec<IndexN>, CoordinatorError> {
        let position = self
            .partitions
            .iter()
            .position(|p| *p == partition)
            .ok_or_else(|| {
                CoordinatorError::Membership(format!("partition {} is not on the ring", partition))
            })?;

        let len = self.partitions.len();
        let mut preflists = BTreeSet::new();
        for n in self.n_vals() {
            // The partition appears in the preflists of itself and its n-1 predecessors
            for back in 0..usize::from(n).min(len) {
                let primary = self.partitions[(position + len - back) % len];
                preflists.insert(IndexN { partition: primary, n });
            }
        }
        Ok(preflists.into_iter().collect())
    }
}

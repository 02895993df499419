//! Partition object fold
//!
//! A full tree build enumerates every object a partition stores. The fold service
//! drives that enumeration; the coordinator supplies the visitor.

use crate::error::CoordinatorError;
use crate::object::{ObjectKey, ReplicaObject};
use crate::tree_id::PartitionIndex;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Visitor invoked once per stored object; an error aborts the fold
pub type FoldVisitor<'a> =
    dyn FnMut(ObjectKey, ReplicaObject) -> Result<(), CoordinatorError> + Send + 'a;

/// Fold service interface
#[async_trait]
pub trait ObjectFold: Send + Sync {
    async fn fold_partition(
        &self,
        partition: PartitionIndex,
        visit: &mut FoldVisitor<'_>,
    ) -> Result<(), CoordinatorError>;
}

/// In-memory object store keyed by partition
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    partitions: RwLock<BTreeMap<PartitionIndex, BTreeMap<ObjectKey, ReplicaObject>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, partition: PartitionIndex, key: ObjectKey, object: ReplicaObject) {
        self.partitions
            .write()
            .entry(partition)
            .or_default()
            .insert(key, object);
    }

    pub fn remove(&self, partition: PartitionIndex, key: &ObjectKey) -> Option<ReplicaObject> {
        self.partitions
            .write()
            .get_mut(&partition)
            .and_then(|objects| objects.remove(key))
    }

    pub fn get(&self, partition: PartitionIndex, key: &ObjectKey) -> Option<ReplicaObject> {
        self.partitions
            .read()
            .get(&partition)
            .and_then(|objects| objects.get(key).cloned())
    }

    pub fn len(&self, partition: PartitionIndex) -> usize {
        self.partitions
            .read()
            .get(&partition)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl ObjectFold for MemoryObjectStore {
    async fn fold_partition(
        &self,
        partition: PartitionIndex,
        visit: &mut FoldVisitor<'_>,
    ) -> Result<(), CoordinatorError> {
        // Visit a snapshot so writers are never blocked behind the fold
        let snapshot = self
            .partitions
            .read()
            .get(&partition)
            .cloned()
            .unwrap_or_default();
        for (key, object) in snapshot {
            visit(key, object)?;
        }
        Ok(())
    }
}

use crate::coordinator::CoordinatorHandle;
use crate::error::CoordinatorError;
use crate::hashtree::RemoteTree;
use crate::tree_id::IndexN;
use crate::types::{Hash, TreeKey};
use async_trait::async_trait;

/// One tree of another coordinator, seen as the far side of a comparison
#[derive(Clone)]
pub struct CoordinatorRemote {
    handle: CoordinatorHandle,
    id: IndexN,
}

impl CoordinatorRemote {
    pub fn new(handle: CoordinatorHandle, id: IndexN) -> Self {
        Self { handle, id }
    }

    pub fn id(&self) -> IndexN {
        self.id
    }
}

#[async_trait]
impl RemoteTree for CoordinatorRemote {
    async fn exchange_bucket(&self, level: u32, bucket: u64) -> Result<Vec<(u64, Hash)>, CoordinatorError> {
        self.handle.exchange_bucket(self.id, level, bucket).await
    }

    async fn exchange_segment(&self, segment: u64) -> Result<Vec<(TreeKey, Hash)>, CoordinatorError> {
        self.handle.exchange_segment(self.id, segment).await
    }
}

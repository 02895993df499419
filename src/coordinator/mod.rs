//! Per-partition hash tree coordinator
//!
//! One [`TreeCoordinator`] runs per storage partition as a single tokio task. It
//! owns one hash tree per preflist the partition serves and serializes tree
//! creation, writes, the exchange lock, builds and expiration. Callers talk to
//! it through a cloneable [`CoordinatorHandle`].
//!
//! Expensive work (full build, rehash, bucket recompute, comparison) runs in
//! detached workers that report back through the same mailbox, so the actor
//! stays responsive while they run.
//!
//! The actor stops when every handle has been dropped. A failed worker stops it
//! with an error, surfaced through the join handle returned by
//! [`TreeCoordinator::spawn`]; restarting is the supervisor's job.

mod actor;
pub mod build;
mod lock;
mod remote;
mod request;

pub use actor::TreeCoordinator;
pub use lock::{Holder, LockType};
pub use remote::CoordinatorRemote;

use crate::config::CoordinatorConfig;
use crate::error::CoordinatorError;
use crate::fold::ObjectFold;
use crate::hashtree::{InsertOptions, KeyDiff, RemoteTree};
use crate::limiter::ConcurrencyLimiter;
use crate::membership::Membership;
use crate::object::{ObjectKey, ReplicaObject};
use crate::tree_id::{IndexN, PartitionIndex};
use crate::types::{Hash, TreeKey};
use chrono::{DateTime, Utc};
use request::{Reply, Request};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Services the coordinator calls out to
#[derive(Clone)]
pub struct Collaborators {
    pub membership: Arc<dyn Membership>,
    pub fold: Arc<dyn ObjectFold>,
    pub limiter: Arc<dyn ConcurrencyLimiter>,
}

/// Where the partition's trees are in their build lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    NotBuilt,
    Building,
    Built,
}

/// Point-in-time view of a coordinator
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub partition: PartitionIndex,
    /// Tracked trees in ascending order; the first is the anchor
    pub trees: Vec<IndexN>,
    pub build_state: BuildState,
    /// Lock type and holder id, if the lock is granted
    pub lock: Option<(LockType, String)>,
    pub built_at: Option<DateTime<Utc>>,
    /// Trees with an update in flight
    pub updating: Vec<IndexN>,
}

impl CoordinatorStatus {
    pub fn is_built(&self) -> bool {
        self.build_state == BuildState::Built
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }
}

impl TreeCoordinator {
    /// Start a coordinator for `partition` with trees for `ids`
    ///
    /// Must be called from within a tokio runtime. Trees are opened before the
    /// task starts, so storage errors surface here rather than from the task.
    pub fn spawn(
        partition: PartitionIndex,
        config: CoordinatorConfig,
        collaborators: Collaborators,
        ids: impl IntoIterator<Item = IndexN>,
    ) -> Result<(CoordinatorHandle, JoinHandle<Result<(), CoordinatorError>>), CoordinatorError> {
        config.validate().map_err(CoordinatorError::Config)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let limiter = Arc::clone(&collaborators.limiter);
        let mut coordinator = TreeCoordinator::new(partition, config, collaborators, tx.downgrade());
        for id in ids {
            coordinator.new_tree(id)?;
        }

        let task = tokio::spawn(coordinator.run(rx));
        let handle = CoordinatorHandle {
            partition,
            mailbox: tx,
            limiter,
        };
        Ok((handle, task))
    }
}

/// Cloneable client for a running [`TreeCoordinator`]
///
/// Every call fails with [`CoordinatorError::Stopped`] once the coordinator task
/// has ended.
#[derive(Clone)]
pub struct CoordinatorHandle {
    partition: PartitionIndex,
    mailbox: mpsc::UnboundedSender<Request>,
    limiter: Arc<dyn ConcurrencyLimiter>,
}

impl CoordinatorHandle {
    pub fn partition(&self) -> PartitionIndex {
        self.partition
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Result<T, CoordinatorError> {
        let (tx, rx) = oneshot::channel();
        self.cast(make(tx))?;
        rx.await.map_err(|_| CoordinatorError::Stopped)?
    }

    fn cast(&self, request: Request) -> Result<(), CoordinatorError> {
        self.mailbox.send(request).map_err(|_| CoordinatorError::Stopped)
    }

    /// Track a tree for `id`, replacing any existing handle
    pub async fn new_tree(&self, id: IndexN) -> Result<(), CoordinatorError> {
        self.call(|reply| Request::NewTree { id, reply }).await
    }

    /// Store `hash` for `key` in tree `id`
    ///
    /// Writes for a preflist the partition does not serve are dropped and still
    /// answer `Ok`.
    pub async fn insert(
        &self,
        id: IndexN,
        key: impl Into<TreeKey>,
        hash: Hash,
        options: InsertOptions,
    ) -> Result<(), CoordinatorError> {
        let key = key.into();
        self.call(|reply| Request::Insert {
            id,
            key,
            hash,
            options,
            reply: Some(reply),
        })
        .await
    }

    /// Like [`insert`](Self::insert) without waiting for the write
    pub fn insert_nowait(
        &self,
        id: IndexN,
        key: impl Into<TreeKey>,
        hash: Hash,
        options: InsertOptions,
    ) -> Result<(), CoordinatorError> {
        self.cast(Request::Insert {
            id,
            key: key.into(),
            hash,
            options,
            reply: None,
        })
    }

    /// Hash a replica object and store it in its preflist's tree
    pub async fn insert_object(&self, key: ObjectKey, object: ReplicaObject) -> Result<(), CoordinatorError> {
        self.call(|reply| Request::InsertObject {
            key,
            object,
            reply: Some(reply),
        })
        .await
    }

    /// Like [`insert_object`](Self::insert_object) without waiting for the write
    pub fn insert_object_nowait(&self, key: ObjectKey, object: ReplicaObject) -> Result<(), CoordinatorError> {
        self.cast(Request::InsertObject {
            key,
            object,
            reply: None,
        })
    }

    pub async fn delete(&self, id: IndexN, key: impl Into<TreeKey>) -> Result<(), CoordinatorError> {
        let key = key.into();
        self.call(|reply| Request::Delete {
            id,
            key,
            reply: Some(reply),
        })
        .await
    }

    /// Take the exchange lock for `holder`
    ///
    /// The lock is released when the holder's liveness token is cancelled.
    pub async fn get_lock(&self, lock_type: LockType, holder: &Holder) -> Result<(), CoordinatorError> {
        let holder = holder.clone();
        self.call(|reply| Request::GetLock {
            lock_type,
            holder,
            reply,
        })
        .await
    }

    /// Admit a remote exchange: limiter permit first, then a remote lock
    pub async fn start_exchange_remote(&self, holder: &Holder) -> Result<(), CoordinatorError> {
        self.limiter.acquire_remote_exchange_permit(holder).await?;
        self.get_lock(LockType::Remote, holder).await
    }

    /// Recompute bucket hashes of tree `id` from its pending writes
    pub async fn update_tree(&self, id: IndexN) -> Result<(), CoordinatorError> {
        self.call(|reply| Request::UpdateTree { id, reply }).await
    }

    /// Start a build if none is in flight
    pub fn build(&self) -> Result<(), CoordinatorError> {
        self.cast(Request::Build)
    }

    /// Expire stale trees, then start a build if needed
    pub fn poke(&self) -> Result<(), CoordinatorError> {
        self.cast(Request::Poke)
    }

    pub async fn exchange_bucket(&self, id: IndexN, level: u32, bucket: u64) -> Result<Vec<(u64, Hash)>, CoordinatorError> {
        self.call(|reply| Request::ExchangeBucket {
            id,
            level,
            bucket,
            reply,
        })
        .await
    }

    pub async fn exchange_segment(&self, id: IndexN, segment: u64) -> Result<Vec<(TreeKey, Hash)>, CoordinatorError> {
        self.call(|reply| Request::ExchangeSegment { id, segment, reply })
            .await
    }

    /// Compare tree `id` against `remote`, collecting every difference
    pub async fn compare(&self, id: IndexN, remote: Arc<dyn RemoteTree>) -> Result<Vec<KeyDiff>, CoordinatorError> {
        self.compare_with(
            id,
            remote,
            |diffs, mut all: Vec<KeyDiff>| {
                all.extend(diffs);
                all
            },
            Vec::new(),
        )
        .await
    }

    /// Compare tree `id` against `remote`, folding each differing segment into `acc`
    ///
    /// The comparison runs in its own task against a snapshot of the tree; the
    /// coordinator keeps serving other requests meanwhile.
    pub async fn compare_with<A, F>(
        &self,
        id: IndexN,
        remote: Arc<dyn RemoteTree>,
        fold: F,
        acc: A,
    ) -> Result<A, CoordinatorError>
    where
        F: FnMut(Vec<KeyDiff>, A) -> A + Send + 'static,
        A: Send + 'static,
    {
        let tree = self.call(|reply| Request::CompareSnapshot { id, reply }).await?;
        tokio::spawn(async move { tree.compare(remote.as_ref(), fold, acc).await })
            .await
            .map_err(|e| CoordinatorError::WorkerFailed(e.to_string()))?
    }

    pub async fn status(&self) -> Result<CoordinatorStatus, CoordinatorError> {
        self.call(|reply| Request::Status { reply }).await
    }
}

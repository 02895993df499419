//! Coordinator mailbox messages

use crate::coordinator::lock::{Holder, LockType};
use crate::coordinator::CoordinatorStatus;
use crate::error::CoordinatorError;
use crate::hashtree::{HashTree, InsertOptions, TreeUpdate};
use crate::object::{ObjectKey, ReplicaObject};
use crate::tree_id::IndexN;
use crate::types::{Hash, TreeKey};
use tokio::sync::oneshot;

pub(crate) type Reply<T> = oneshot::Sender<Result<T, CoordinatorError>>;

/// Everything the actor processes, from callers and from its own workers
pub(crate) enum Request {
    NewTree {
        id: IndexN,
        reply: Reply<()>,
    },
    Insert {
        id: IndexN,
        key: TreeKey,
        hash: Hash,
        options: InsertOptions,
        reply: Option<Reply<()>>,
    },
    InsertObject {
        key: ObjectKey,
        object: ReplicaObject,
        reply: Option<Reply<()>>,
    },
    Delete {
        id: IndexN,
        key: TreeKey,
        reply: Option<Reply<()>>,
    },
    GetLock {
        lock_type: LockType,
        holder: Holder,
        reply: Reply<()>,
    },
    UpdateTree {
        id: IndexN,
        reply: Reply<()>,
    },
    ExchangeBucket {
        id: IndexN,
        level: u32,
        bucket: u64,
        reply: Reply<Vec<(u64, Hash)>>,
    },
    ExchangeSegment {
        id: IndexN,
        segment: u64,
        reply: Reply<Vec<(TreeKey, Hash)>>,
    },
    CompareSnapshot {
        id: IndexN,
        reply: Reply<HashTree>,
    },
    Build,
    Poke,
    Status {
        reply: Reply<CoordinatorStatus>,
    },

    // Worker and watch notifications
    HolderDown {
        grant: u64,
    },
    UpdateDone {
        id: IndexN,
        generation: u64,
        result: Result<TreeUpdate, CoordinatorError>,
        reply: Reply<()>,
    },
    BuildFinished {
        epoch: u64,
        outcome: BuildOutcome,
    },
    BuildFailed {
        epoch: u64,
        failure: BuildFailure,
    },
}

/// What a successful build worker did
#[derive(Debug)]
pub(crate) enum BuildOutcome {
    /// Folded the partition; every insert already went through the mailbox
    Folded,
    /// Recomputed the buckets of the trees it was given
    Rehashed(Vec<(IndexN, TreeUpdate)>),
}

/// Why a build worker gave up
#[derive(Debug)]
pub(crate) enum BuildFailure {
    /// The limiter refused a build permit
    Denied,
    /// Anything else; fatal for the coordinator
    Crashed(CoordinatorError),
}

impl Request {
    /// Tree a request is addressed to, for requests that must wait behind an
    /// in-flight update of that tree
    pub(crate) fn tree_id(&self) -> Option<IndexN> {
        match self {
            Request::Insert { id, .. }
            | Request::Delete { id, .. }
            | Request::UpdateTree { id, .. }
            | Request::ExchangeBucket { id, .. }
            | Request::ExchangeSegment { id, .. }
            | Request::CompareSnapshot { id, .. } => Some(*id),
            _ => None,
        }
    }
}

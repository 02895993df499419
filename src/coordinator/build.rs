//! Build and rehash worker
//!
//! Runs detached from the actor. After winning a build permit it either folds
//! the whole partition into the trees (no built marker yet) or recomputes every
//! tree's buckets from persisted leaves (marker present, e.g. after a restart).
//! A follow-up round for trees registered mid-rehash skips the marker check.
//! The outcome is reported back as `BuildFinished` or `BuildFailed`.

use crate::coordinator::request::{BuildFailure, BuildOutcome, Request};
use crate::error::CoordinatorError;
use crate::fold::ObjectFold;
use crate::hashtree::{HashTree, InsertOptions, TreeUpdate};
use crate::limiter::ConcurrencyLimiter;
use crate::membership::Membership;
use crate::object::{hash_object, ObjectKey, ReplicaObject};
use crate::tree_id::{IndexN, PartitionIndex};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

/// Metadata key of the built marker
pub const BUILT_KEY: &[u8] = b"built";

/// Value written to the built marker
pub const BUILT_VALUE: &[u8] = &[1];

/// Whether a stored marker value means "built"
pub fn is_built_marker(value: Option<&[u8]>) -> bool {
    matches!(value, Some(v) if v.iter().any(|b| *b != 0))
}

/// Everything a build worker needs, captured when the build starts
pub(crate) struct BuildContext {
    pub epoch: u64,
    pub partition: PartitionIndex,
    /// Rehash `trees` without consulting the built marker
    pub rehash_only: bool,
    pub anchor: Option<HashTree>,
    pub trees: Vec<HashTree>,
    pub membership: Arc<dyn Membership>,
    pub fold: Arc<dyn ObjectFold>,
    pub limiter: Arc<dyn ConcurrencyLimiter>,
    pub mailbox: UnboundedSender<Request>,
}

/// Worker entry point; always reports back exactly once
pub(crate) async fn run(ctx: BuildContext) {
    let epoch = ctx.epoch;
    let partition = ctx.partition;
    let mailbox = ctx.mailbox.clone();

    let outcome = AssertUnwindSafe(build_or_rehash(ctx)).catch_unwind().await;
    let message = match outcome {
        Ok(Ok(outcome)) => Request::BuildFinished { epoch, outcome },
        Ok(Err(failure)) => Request::BuildFailed { epoch, failure },
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "build worker panicked".to_string());
            Request::BuildFailed {
                epoch,
                failure: BuildFailure::Crashed(CoordinatorError::WorkerFailed(reason)),
            }
        }
    };

    if mailbox.send(message).is_err() {
        debug!(partition = %partition, epoch, "Coordinator gone before build completed");
    }
}

async fn build_or_rehash(ctx: BuildContext) -> Result<BuildOutcome, BuildFailure> {
    // Held until this function returns
    let _permit = match ctx.limiter.acquire_build_permit().await {
        Ok(permit) => permit,
        Err(e) => {
            warn!(partition = %ctx.partition, error = %e, "Build permit denied");
            return Err(BuildFailure::Denied);
        }
    };

    let built = match &ctx.anchor {
        _ if ctx.rehash_only => true,
        Some(anchor) => {
            let marker = anchor.read_meta(BUILT_KEY).map_err(|e| BuildFailure::Crashed(e.into()))?;
            is_built_marker(marker.as_deref())
        }
        None => false,
    };

    if built {
        rehash_trees(ctx).await.map(BuildOutcome::Rehashed)
    } else {
        fold_partition(ctx).await.map(|()| BuildOutcome::Folded)
    }
}

async fn fold_partition(ctx: BuildContext) -> Result<(), BuildFailure> {
    info!(partition = %ctx.partition, "Starting full hash tree build");

    let membership = Arc::clone(&ctx.membership);
    let mailbox = ctx.mailbox.clone();
    let mut objects = 0u64;
    let mut visit = |key: ObjectKey, object: ReplicaObject| -> Result<(), CoordinatorError> {
        let id = membership.resolve_index_n(&key)?;
        let hash = hash_object(&object)?;
        objects += 1;
        // Never overwrite a key updated while the fold was running
        mailbox
            .send(Request::Insert {
                id,
                key: key.to_tree_key(),
                hash,
                options: InsertOptions::if_missing(),
                reply: None,
            })
            .map_err(|_| CoordinatorError::Stopped)
    };

    ctx.fold
        .fold_partition(ctx.partition, &mut visit)
        .await
        .map_err(|e| {
            BuildFailure::Crashed(match e {
                CoordinatorError::Fold(reason) => CoordinatorError::Fold(reason),
                other => CoordinatorError::Fold(other.to_string()),
            })
        })?;

    info!(partition = %ctx.partition, objects, "Finished folding partition");
    Ok(())
}

async fn rehash_trees(ctx: BuildContext) -> Result<Vec<(IndexN, TreeUpdate)>, BuildFailure> {
    info!(partition = %ctx.partition, trees = ctx.trees.len(), "Rehashing hash trees from disk");

    let trees = ctx.trees;
    let result = tokio::task::spawn_blocking(move || {
        trees
            .iter()
            .map(|tree| tree.rehash().map(|update| (tree.id(), update)))
            .collect::<Result<Vec<_>, _>>()
    })
    .await;

    match result {
        Ok(Ok(updates)) => Ok(updates),
        Ok(Err(e)) => Err(BuildFailure::Crashed(e.into())),
        Err(join) => Err(BuildFailure::Crashed(CoordinatorError::WorkerFailed(
            join.to_string(),
        ))),
    }
}

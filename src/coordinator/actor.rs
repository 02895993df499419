//! Coordinator actor
//!
//! All coordinator state lives in [`TreeCoordinator`] and is touched only by the
//! task running [`TreeCoordinator::run`]. Handlers never await: anything
//! expensive is handed to a worker whose result comes back through the mailbox.

use crate::config::CoordinatorConfig;
use crate::coordinator::build::{self, BuildContext, BUILT_KEY, BUILT_VALUE};
use crate::coordinator::lock::{spawn_liveness_watch, Holder, LockToken, LockType};
use crate::coordinator::request::{BuildFailure, BuildOutcome, Reply, Request};
use crate::coordinator::{BuildState, Collaborators, CoordinatorStatus};
use crate::error::CoordinatorError;
use crate::hashtree::{HashTree, InsertOptions, TreeUpdate};
use crate::object::{hash_object, ObjectKey, ReplicaObject};
use crate::tree_id::{IndexN, PartitionIndex};
use crate::types::{Hash, TreeKey};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tokio::sync::mpsc::{UnboundedReceiver, WeakUnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Build lifecycle
pub(crate) enum BuildStatus {
    NotBuilt,
    Building(JoinHandle<()>),
    Built,
}

/// A leaf change routed to one tree
enum Mutation {
    Insert {
        key: TreeKey,
        hash: Hash,
        options: InsertOptions,
    },
    Delete {
        key: TreeKey,
    },
}

/// Per-partition hash tree coordinator state
pub struct TreeCoordinator {
    partition: PartitionIndex,
    config: CoordinatorConfig,
    collaborators: Collaborators,
    trees: BTreeMap<IndexN, HashTree>,
    db: Option<sled::Db>,
    build_status: BuildStatus,
    build_epoch: u64,
    build_time: Option<(Instant, DateTime<Utc>)>,
    lock: Option<LockToken>,
    next_grant: u64,
    /// Bumped whenever the tree set is discarded
    generation: u64,
    updating: BTreeSet<IndexN>,
    parked: HashMap<IndexN, VecDeque<Request>>,
    mailbox: WeakUnboundedSender<Request>,
}

fn respond<T>(reply: Option<Reply<T>>, result: Result<T, CoordinatorError>) {
    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}

impl TreeCoordinator {
    pub(crate) fn new(
        partition: PartitionIndex,
        config: CoordinatorConfig,
        collaborators: Collaborators,
        mailbox: WeakUnboundedSender<Request>,
    ) -> Self {
        Self {
            partition,
            config,
            collaborators,
            trees: BTreeMap::new(),
            db: None,
            build_status: BuildStatus::NotBuilt,
            build_epoch: 0,
            build_time: None,
            lock: None,
            next_grant: 0,
            generation: 0,
            updating: BTreeSet::new(),
            parked: HashMap::new(),
            mailbox,
        }
    }

    /// Process the mailbox until every handle is gone or a worker crashes
    pub(crate) async fn run(mut self, mut mailbox: UnboundedReceiver<Request>) -> Result<(), CoordinatorError> {
        info!(partition = %self.partition, trees = self.trees.len(), "Hash tree coordinator started");
        while let Some(request) = mailbox.recv().await {
            if let Err(e) = self.dispatch(request) {
                error!(partition = %self.partition, error = %e, "Hash tree coordinator crashed");
                return Err(e);
            }
        }
        info!(partition = %self.partition, "Hash tree coordinator stopped");
        Ok(())
    }

    /// Route a request, parking it if its tree is mid-update
    fn dispatch(&mut self, request: Request) -> Result<(), CoordinatorError> {
        if let Some(id) = request.tree_id() {
            if self.updating.contains(&id) {
                debug!(tree = %id, "Parking request behind in-flight update");
                self.parked.entry(id).or_default().push_back(request);
                return Ok(());
            }
        }
        self.handle(request)
    }

    fn handle(&mut self, request: Request) -> Result<(), CoordinatorError> {
        match request {
            Request::NewTree { id, reply } => {
                let _ = reply.send(self.new_tree(id));
            }
            Request::Insert {
                id,
                key,
                hash,
                options,
                reply,
            } => {
                self.mutate(id, Mutation::Insert { key, hash, options }, reply)?;
            }
            Request::InsertObject { key, object, reply } => {
                self.insert_object(key, object, reply)?;
            }
            Request::Delete { id, key, reply } => {
                self.mutate(id, Mutation::Delete { key }, reply)?;
            }
            Request::GetLock {
                lock_type,
                holder,
                reply,
            } => {
                let _ = reply.send(self.get_lock(lock_type, &holder));
            }
            Request::UpdateTree { id, reply } => self.update_tree(id, reply),
            Request::ExchangeBucket {
                id,
                level,
                bucket,
                reply,
            } => {
                let result = self
                    .tree(&id)
                    .map(|tree| tree.get_bucket(level, bucket));
                let _ = reply.send(result);
            }
            Request::ExchangeSegment { id, segment, reply } => {
                let result = self
                    .tree(&id)
                    .and_then(|tree| Ok(tree.key_hashes(segment)?));
                let _ = reply.send(result);
            }
            Request::CompareSnapshot { id, reply } => {
                let _ = reply.send(self.tree(&id).cloned());
            }
            Request::Build => self.start_build(),
            Request::Poke => self.poke()?,
            Request::Status { reply } => {
                let _ = reply.send(Ok(self.status()));
            }
            Request::HolderDown { grant } => self.holder_down(grant),
            Request::UpdateDone {
                id,
                generation,
                result,
                reply,
            } => self.update_done(id, generation, result, reply)?,
            Request::BuildFinished { epoch, outcome } => self.build_finished(epoch, outcome)?,
            Request::BuildFailed { epoch, failure } => self.build_failed(epoch, failure)?,
        }
        Ok(())
    }

    fn tree(&self, id: &IndexN) -> Result<&HashTree, CoordinatorError> {
        self.trees.get(id).ok_or(CoordinatorError::NotResponsible(*id))
    }

    /// Tree holding the built marker: the lowest tracked id
    fn anchor(&self) -> Option<&HashTree> {
        self.trees.values().next()
    }

    /// Open a tree sharing the partition's storage
    fn open_tree(&mut self, id: IndexN) -> Result<HashTree, CoordinatorError> {
        if let Some(existing) = self.trees.values().next() {
            return Ok(existing.sibling(id)?);
        }
        let db = match &self.db {
            Some(db) => db.clone(),
            None => {
                let db = crate::hashtree::storage::open_db(self.config.partition_root(&self.partition))?;
                self.db = Some(db.clone());
                db
            }
        };
        Ok(HashTree::with_db(db, id, self.config.tree.clone())?)
    }

    pub(crate) fn new_tree(&mut self, id: IndexN) -> Result<(), CoordinatorError> {
        let mut tree = self.open_tree(id)?;
        if matches!(self.build_status, BuildStatus::Building(_)) {
            // Not part of the running build; rehashed in a follow-up round
            tree.track_writes();
        }
        if self.trees.insert(id, tree).is_some() {
            debug!(partition = %self.partition, tree = %id, "Replaced hash tree handle");
        } else {
            debug!(partition = %self.partition, tree = %id, "Registered hash tree");
        }
        Ok(())
    }

    fn insert_object(
        &mut self,
        key: ObjectKey,
        object: ReplicaObject,
        reply: Option<Reply<()>>,
    ) -> Result<(), CoordinatorError> {
        let resolved = self
            .collaborators
            .membership
            .resolve_index_n(&key)
            .and_then(|id| Ok((id, hash_object(&object)?)));
        let (id, hash) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                respond(reply, Err(e));
                return Ok(());
            }
        };
        self.dispatch(Request::Insert {
            id,
            key: key.to_tree_key(),
            hash,
            options: InsertOptions::default(),
            reply,
        })
    }

    fn mutate(&mut self, id: IndexN, mutation: Mutation, reply: Option<Reply<()>>) -> Result<(), CoordinatorError> {
        if !self.trees.contains_key(&id) {
            match self.recover_unexpected_key(id) {
                Ok(true) => {}
                Ok(false) => {
                    respond(reply, Ok(()));
                    return Ok(());
                }
                Err(e) => {
                    respond(reply, Err(e));
                    return Ok(());
                }
            }
        }

        let Some(tree) = self.trees.get_mut(&id) else {
            respond(reply, Err(CoordinatorError::NotResponsible(id)));
            return Ok(());
        };
        let result = match mutation {
            Mutation::Insert { key, hash, options } => tree.insert(&key, hash, options).map(|_| ()),
            Mutation::Delete { key } => tree.delete(&key),
        };
        if let Err(e) = &result {
            error!(partition = %self.partition, tree = %id, error = %e, "Hash tree write failed");
        }
        respond(reply, result.map_err(CoordinatorError::from));
        Ok(())
    }

    /// Handle a mutation for an untracked tree
    ///
    /// Returns `true` when a tree for `id` now exists and the mutation should be
    /// applied, `false` when the mutation is dropped.
    fn recover_unexpected_key(&mut self, id: IndexN) -> Result<bool, CoordinatorError> {
        let responsible = self
            .collaborators
            .membership
            .responsible_preflists(self.partition)?;

        if !responsible.contains(&id) {
            debug!(
                partition = %self.partition,
                tree = %id,
                "Dropping key for a preflist this partition does not serve"
            );
            return Ok(false);
        }

        if matches!(self.build_status, BuildStatus::Built) {
            warn!(
                partition = %self.partition,
                tree = %id,
                "Built hash trees are missing a served preflist; clearing all trees"
            );
            self.clear_trees(responsible)?;
            return Ok(false);
        }

        info!(partition = %self.partition, tree = %id, "Creating hash tree for unexpected key");
        self.new_tree(id)?;
        Ok(true)
    }

    /// Destroy every tree and start over with empty trees for `ids`
    fn clear_trees(&mut self, ids: Vec<IndexN>) -> Result<(), CoordinatorError> {
        if self.db.is_none() {
            self.db = self.trees.values().next().map(|tree| tree.db().clone());
        }
        for (_, tree) in std::mem::take(&mut self.trees) {
            tree.destroy()?;
        }
        self.generation += 1;
        for id in ids {
            self.new_tree(id)?;
        }
        self.build_status = BuildStatus::NotBuilt;
        self.build_time = None;
        info!(
            partition = %self.partition,
            trees = self.trees.len(),
            generation = self.generation,
            "Cleared hash trees"
        );
        Ok(())
    }

    pub(crate) fn get_lock(&mut self, lock_type: LockType, holder: &Holder) -> Result<(), CoordinatorError> {
        if !matches!(self.build_status, BuildStatus::Built) {
            return Err(CoordinatorError::NotBuilt);
        }
        if self.lock.is_some() {
            return Err(CoordinatorError::AlreadyLocked);
        }

        self.next_grant += 1;
        let grant = self.next_grant;
        spawn_liveness_watch(grant, holder, self.mailbox.clone());
        self.lock = Some(LockToken {
            grant,
            holder_id: holder.id().to_string(),
            lock_type,
        });
        info!(
            partition = %self.partition,
            holder = %holder.id(),
            lock_type = %lock_type,
            grant,
            "Hash tree lock granted"
        );
        Ok(())
    }

    fn holder_down(&mut self, grant: u64) {
        match &self.lock {
            Some(token) if token.grant == grant => {
                info!(
                    partition = %self.partition,
                    holder = %token.holder_id,
                    grant,
                    "Releasing hash tree lock"
                );
                self.lock = None;
            }
            _ => debug!(partition = %self.partition, grant, "Ignoring stale lock release"),
        }
    }

    fn update_tree(&mut self, id: IndexN, reply: Reply<()>) {
        let Some(mailbox) = self.mailbox.upgrade() else {
            let _ = reply.send(Err(CoordinatorError::Stopped));
            return;
        };
        let Some(tree) = self.trees.get_mut(&id) else {
            let _ = reply.send(Err(CoordinatorError::NotResponsible(id)));
            return;
        };

        let snapshot = tree.update_snapshot();
        let generation = self.generation;
        debug!(tree = %id, dirty_segments = snapshot.dirty_segments(), "Updating hash tree");
        self.updating.insert(id);

        tokio::spawn(async move {
            let result = match tokio::task::spawn_blocking(move || snapshot.perform()).await {
                Ok(result) => result.map_err(CoordinatorError::from),
                Err(join) => Err(CoordinatorError::WorkerFailed(join.to_string())),
            };
            let _ = mailbox.send(Request::UpdateDone {
                id,
                generation,
                result,
                reply,
            });
        });
    }

    fn update_done(
        &mut self,
        id: IndexN,
        generation: u64,
        result: Result<TreeUpdate, CoordinatorError>,
        reply: Reply<()>,
    ) -> Result<(), CoordinatorError> {
        self.updating.remove(&id);
        let update = match result {
            Ok(update) => update,
            Err(e) => {
                let _ = reply.send(Err(CoordinatorError::WorkerFailed(e.to_string())));
                return Err(e);
            }
        };

        let installed = match self.trees.get_mut(&id) {
            Some(tree) if generation == self.generation => Some(tree.install(update)),
            _ => None,
        };
        match installed {
            Some(true) => {
                debug!(tree = %id, "Hash tree updated");
                let _ = reply.send(Ok(()));
            }
            Some(false) => {
                // A rehash replaced the buckets this update started from
                debug!(tree = %id, "Redoing hash tree update on rehashed buckets");
                self.update_tree(id, reply);
            }
            None => {
                debug!(tree = %id, "Discarding update for a cleared hash tree");
                let _ = reply.send(Err(CoordinatorError::NotResponsible(id)));
            }
        }

        self.replay_parked(id)
    }

    /// Replay requests parked behind an update, stopping if one starts another
    fn replay_parked(&mut self, id: IndexN) -> Result<(), CoordinatorError> {
        while !self.updating.contains(&id) {
            let Some(request) = self.parked.get_mut(&id).and_then(VecDeque::pop_front) else {
                break;
            };
            self.handle(request)?;
        }
        if self.parked.get(&id).is_some_and(VecDeque::is_empty) {
            self.parked.remove(&id);
        }
        Ok(())
    }

    fn poke(&mut self) -> Result<(), CoordinatorError> {
        self.maybe_expire()?;
        self.start_build();
        Ok(())
    }

    fn maybe_expire(&mut self) -> Result<(), CoordinatorError> {
        // Never invalidate trees under an in-flight exchange
        if self.lock.is_some() || !matches!(self.build_status, BuildStatus::Built) {
            return Ok(());
        }
        let Some((built_at, _)) = self.build_time else {
            return Ok(());
        };
        if built_at.elapsed() <= self.config.expire_after() {
            return Ok(());
        }

        info!(partition = %self.partition, "Hash trees expired");
        match self
            .collaborators
            .membership
            .responsible_preflists(self.partition)
        {
            Ok(responsible) => self.clear_trees(responsible),
            Err(e) => {
                warn!(partition = %self.partition, error = %e, "Cannot expire hash trees without membership");
                Ok(())
            }
        }
    }

    fn start_build(&mut self) {
        if !matches!(self.build_status, BuildStatus::NotBuilt) {
            return;
        }
        for tree in self.trees.values_mut() {
            tree.track_writes();
        }
        let trees = self.trees.values().cloned().collect();
        self.spawn_build(trees, false);
    }

    fn spawn_build(&mut self, trees: Vec<HashTree>, rehash_only: bool) {
        let Some(mailbox) = self.mailbox.upgrade() else {
            return;
        };

        self.build_epoch += 1;
        let ctx = BuildContext {
            epoch: self.build_epoch,
            partition: self.partition,
            rehash_only,
            anchor: self.anchor().cloned(),
            trees,
            membership: self.collaborators.membership.clone(),
            fold: self.collaborators.fold.clone(),
            limiter: self.collaborators.limiter.clone(),
            mailbox,
        };
        debug!(
            partition = %self.partition,
            epoch = self.build_epoch,
            rehash_only,
            "Starting build worker"
        );
        self.build_status = BuildStatus::Building(tokio::spawn(build::run(ctx)));
    }

    fn is_current_build(&self, epoch: u64) -> bool {
        epoch == self.build_epoch && matches!(self.build_status, BuildStatus::Building(_))
    }

    fn build_finished(&mut self, epoch: u64, outcome: BuildOutcome) -> Result<(), CoordinatorError> {
        if !self.is_current_build(epoch) {
            debug!(partition = %self.partition, epoch, "Ignoring stale build result");
            return Ok(());
        }

        match outcome {
            BuildOutcome::Folded => {
                for tree in self.trees.values_mut() {
                    tree.stop_tracking();
                }
            }
            BuildOutcome::Rehashed(updates) => {
                for (id, update) in updates {
                    if let Some(tree) = self.trees.get_mut(&id) {
                        tree.install(update);
                    }
                }
                // Trees registered while the rehash ran still need one
                let pending: Vec<HashTree> = self
                    .trees
                    .values()
                    .filter(|tree| tree.is_tracking())
                    .cloned()
                    .collect();
                if !pending.is_empty() {
                    info!(
                        partition = %self.partition,
                        trees = pending.len(),
                        "Rehashing hash trees registered during the build"
                    );
                    self.spawn_build(pending, true);
                    return Ok(());
                }
            }
        }

        if let Some(anchor) = self.anchor() {
            anchor.write_meta(BUILT_KEY, BUILT_VALUE)?;
        }
        self.build_status = BuildStatus::Built;
        self.build_time = Some((Instant::now(), Utc::now()));
        info!(partition = %self.partition, trees = self.trees.len(), "Hash trees built");
        Ok(())
    }

    fn build_failed(&mut self, epoch: u64, failure: BuildFailure) -> Result<(), CoordinatorError> {
        if !self.is_current_build(epoch) {
            debug!(partition = %self.partition, epoch, "Ignoring stale build failure");
            return Ok(());
        }
        self.build_status = BuildStatus::NotBuilt;
        for tree in self.trees.values_mut() {
            tree.stop_tracking();
        }

        match failure {
            BuildFailure::Denied => {
                let delay = self.config.build_retry_delay();
                let mailbox = self.mailbox.clone();
                debug!(partition = %self.partition, delay_ms = delay.as_millis() as u64, "Requeueing poke");
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(mailbox) = mailbox.upgrade() {
                        let _ = mailbox.send(Request::Poke);
                    }
                });
                Ok(())
            }
            BuildFailure::Crashed(e) => Err(e),
        }
    }

    pub(crate) fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            partition: self.partition,
            trees: self.trees.keys().copied().collect(),
            build_state: match self.build_status {
                BuildStatus::NotBuilt => BuildState::NotBuilt,
                BuildStatus::Building(_) => BuildState::Building,
                BuildStatus::Built => BuildState::Built,
            },
            lock: self
                .lock
                .as_ref()
                .map(|token| (token.lock_type, token.holder_id.clone())),
            built_at: self.build_time.map(|(_, at)| at),
            updating: self.updating.iter().copied().collect(),
        }
    }
}

//! Segmented Merkle hash tree
//!
//! Leaves are (key, hash) pairs persisted in sled and grouped into a fixed number
//! of segments. Segment hashes are aggregated by buckets of `width` children over
//! `levels` levels; level 1 holds the single root bucket and level `levels` holds
//! buckets whose children are segments. Bucket state lives in memory and is
//! recomputed either incrementally (dirty segments, via an update snapshot) or
//! entirely from persisted leaves (rehash).

pub mod compare;
pub mod hasher;
pub mod storage;

pub use compare::{KeyDiff, RemoteTree};

use crate::error::StorageError;
use crate::tree_id::IndexN;
use crate::types::{Hash, TreeKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

/// In-memory bucket state: (level, bucket index) -> child index -> child hash
pub type BucketMap = BTreeMap<(u32, u64), BTreeMap<u64, Hash>>;

/// Tree geometry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeOptions {
    /// Number of leaf segments; must be a power of `width`
    #[serde(default = "default_segments")]
    pub segments: u64,

    /// Bucket fan-out
    #[serde(default = "default_width")]
    pub width: u64,
}

fn default_segments() -> u64 {
    1024 * 1024
}

fn default_width() -> u64 {
    1024
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            segments: default_segments(),
            width: default_width(),
        }
    }
}

impl TreeOptions {
    /// Number of bucket levels above the segments
    pub fn levels(&self) -> Result<u32, StorageError> {
        if self.width < 2 {
            return Err(StorageError::InvalidGeometry(format!(
                "width must be at least 2, got {}",
                self.width
            )));
        }
        let mut levels = 0u32;
        let mut span = 1u64;
        while span < self.segments {
            span = span.checked_mul(self.width).ok_or_else(|| {
                StorageError::InvalidGeometry("segment count overflows u64".to_string())
            })?;
            levels += 1;
        }
        if levels == 0 || span != self.segments {
            return Err(StorageError::InvalidGeometry(format!(
                "segments ({}) must be a positive power of width ({})",
                self.segments, self.width
            )));
        }
        Ok(levels)
    }
}

/// Options for a single insert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOptions {
    /// Only insert if the key is not already present
    pub if_missing: bool,
}

impl InsertOptions {
    pub fn if_missing() -> Self {
        Self { if_missing: true }
    }
}

/// Persisted Merkle hash tree for one preflist
#[derive(Clone)]
pub struct HashTree {
    id: IndexN,
    options: TreeOptions,
    levels: u32,
    db: sled::Db,
    leaves: sled::Tree,
    meta: sled::Tree,
    buckets: Arc<BucketMap>,
    dirty: BTreeSet<u64>,
    /// Bumped on every full rehash install; incremental updates must match it
    version: u64,
    /// Segments written since `track_writes`, replayed after the next rehash
    tracked: Option<BTreeSet<u64>>,
}

impl HashTree {
    /// Open a tree in the database at `root`, creating the database if needed
    pub fn open<P: AsRef<Path>>(root: P, id: IndexN, options: TreeOptions) -> Result<Self, StorageError> {
        let db = storage::open_db(root)?;
        Self::with_db(db, id, options)
    }

    /// Open a tree in an already-open database
    ///
    /// Persisted leaves are kept; in-memory buckets start empty until the tree is
    /// rehashed or updated.
    pub fn with_db(db: sled::Db, id: IndexN, options: TreeOptions) -> Result<Self, StorageError> {
        let levels = options.levels()?;
        let leaves = db.open_tree(storage::leaf_tree_name(&id))?;
        let meta = db.open_tree(storage::meta_tree_name(&id))?;
        Ok(Self {
            id,
            options,
            levels,
            db,
            leaves,
            meta,
            buckets: Arc::new(BucketMap::new()),
            dirty: BTreeSet::new(),
            version: 0,
            tracked: None,
        })
    }

    /// Open another tree sharing this tree's database and geometry
    pub fn sibling(&self, id: IndexN) -> Result<Self, StorageError> {
        Self::with_db(self.db.clone(), id, self.options.clone())
    }

    pub fn id(&self) -> IndexN {
        self.id
    }

    pub fn options(&self) -> &TreeOptions {
        &self.options
    }

    pub fn levels(&self) -> u32 {
        self.levels
    }

    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    /// Number of persisted leaves
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Whether leaf changes are pending an update
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn segment_for(&self, key: &[u8]) -> u64 {
        hasher::segment_for_key(key, self.options.segments)
    }

    fn mark_dirty(&mut self, segment: u64) {
        self.dirty.insert(segment);
        if let Some(tracked) = &mut self.tracked {
            tracked.insert(segment);
        }
    }

    /// Remember segments written from now on until a rehash is installed
    ///
    /// A rehash scans leaves concurrently with writes, so it may or may not see
    /// them. Remembered segments are marked dirty again once the rehash lands.
    pub fn track_writes(&mut self) {
        self.tracked = Some(BTreeSet::new());
    }

    pub fn stop_tracking(&mut self) {
        self.tracked = None;
    }

    /// Whether writes are being remembered for a pending rehash
    pub fn is_tracking(&self) -> bool {
        self.tracked.is_some()
    }

    /// Insert a (key, hash) leaf
    ///
    /// Returns `false` when `if_missing` was requested and the key already existed.
    pub fn insert(&mut self, key: &[u8], hash: Hash, options: InsertOptions) -> Result<bool, StorageError> {
        let segment = self.segment_for(key);
        let raw_key = storage::leaf_key(segment, key);
        if options.if_missing {
            let previous = self
                .leaves
                .compare_and_swap(&raw_key, None as Option<&[u8]>, Some(&hash[..]))?;
            if previous.is_err() {
                return Ok(false);
            }
        } else {
            self.leaves.insert(raw_key, &hash[..])?;
        }
        self.mark_dirty(segment);
        Ok(true)
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<(), StorageError> {
        let segment = self.segment_for(key);
        if self.leaves.remove(storage::leaf_key(segment, key))?.is_some() {
            self.mark_dirty(segment);
        }
        Ok(())
    }

    /// Persisted hash for a key
    pub fn get(&self, key: &[u8]) -> Result<Option<Hash>, StorageError> {
        let raw_key = storage::leaf_key(self.segment_for(key), key);
        match self.leaves.get(raw_key)? {
            Some(value) => Ok(Some(storage::decode_hash(&value)?)),
            None => Ok(None),
        }
    }

    /// Take a snapshot for an out-of-band update
    ///
    /// The dirty set moves into the snapshot; changes made after this call mark
    /// segments dirty again and are picked up by the next update.
    pub fn update_snapshot(&mut self) -> UpdateSnapshot {
        UpdateSnapshot {
            base: self.version,
            levels: self.levels,
            width: self.options.width,
            leaves: self.leaves.clone(),
            buckets: Arc::clone(&self.buckets),
            dirty: std::mem::take(&mut self.dirty),
        }
    }

    /// Install recomputed bucket state
    ///
    /// A rehash always installs and re-marks the segments written while it ran.
    /// An incremental update computed against buckets that a rehash has since
    /// replaced is refused: its segments go back to the dirty set and `false` is
    /// returned.
    pub fn install(&mut self, update: TreeUpdate) -> bool {
        match update.base {
            Some(base) if base != self.version => {
                self.dirty.extend(update.segments);
                false
            }
            Some(_) => {
                self.buckets = Arc::new(update.buckets);
                true
            }
            None => {
                self.buckets = Arc::new(update.buckets);
                self.version += 1;
                if let Some(written) = self.tracked.take() {
                    self.dirty.extend(written);
                }
                true
            }
        }
    }

    /// Recompute every bucket from persisted leaves
    pub fn rehash(&self) -> Result<TreeUpdate, StorageError> {
        let mut segments: BTreeMap<u64, Vec<(TreeKey, Hash)>> = BTreeMap::new();
        for item in self.leaves.iter() {
            let (raw_key, value) = item?;
            let (segment, key) = storage::split_leaf_key(&raw_key)?;
            segments
                .entry(segment)
                .or_default()
                .push((key.to_vec(), storage::decode_hash(&value)?));
        }

        let segment_hashes = segments
            .iter()
            .map(|(segment, entries)| (*segment, hasher::hash_segment(entries)))
            .collect();
        let buckets = recompute(BucketMap::new(), segment_hashes, self.levels, self.options.width);
        Ok(TreeUpdate {
            base: None,
            buckets,
            segments: BTreeSet::new(),
        })
    }

    /// Hash of the root bucket, `None` for an empty (or never updated) tree
    pub fn top_hash(&self) -> Option<Hash> {
        self.buckets.get(&(1, 0)).and_then(hasher::hash_bucket)
    }

    /// Children of one bucket as (child index, child hash), ordered by index
    pub fn get_bucket(&self, level: u32, bucket: u64) -> Vec<(u64, Hash)> {
        self.buckets
            .get(&(level, bucket))
            .map(|children| children.iter().map(|(i, h)| (*i, *h)).collect())
            .unwrap_or_default()
    }

    /// Leaf (key, hash) pairs of one segment, ordered by key
    pub fn key_hashes(&self, segment: u64) -> Result<Vec<(TreeKey, Hash)>, StorageError> {
        storage::read_segment(&self.leaves, segment)
    }

    pub fn read_meta(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.meta.get(key)?.map(|v| v.to_vec()))
    }

    pub fn write_meta(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.meta.insert(key, value)?;
        self.meta.flush()?;
        Ok(())
    }

    /// Drop the tree's leaves and metadata from the database
    pub fn destroy(self) -> Result<(), StorageError> {
        self.db.drop_tree(storage::leaf_tree_name(&self.id))?;
        self.db.drop_tree(storage::meta_tree_name(&self.id))?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for HashTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashTree")
            .field("id", &self.id)
            .field("options", &self.options)
            .field("dirty_segments", &self.dirty.len())
            .field("version", &self.version)
            .finish()
    }
}

/// Snapshot handed to an update worker
pub struct UpdateSnapshot {
    base: u64,
    levels: u32,
    width: u64,
    leaves: sled::Tree,
    buckets: Arc<BucketMap>,
    dirty: BTreeSet<u64>,
}

impl UpdateSnapshot {
    pub fn dirty_segments(&self) -> usize {
        self.dirty.len()
    }

    /// Recompute the dirty segments and every bucket above them
    pub fn perform(self) -> Result<TreeUpdate, StorageError> {
        let mut segment_hashes = BTreeMap::new();
        for segment in &self.dirty {
            let entries = storage::read_segment(&self.leaves, *segment)?;
            segment_hashes.insert(*segment, hasher::hash_segment(&entries));
        }
        let buckets = Arc::try_unwrap(self.buckets).unwrap_or_else(|shared| (*shared).clone());
        Ok(TreeUpdate {
            base: Some(self.base),
            buckets: recompute(buckets, segment_hashes, self.levels, self.width),
            segments: self.dirty,
        })
    }
}

/// Recomputed bucket state, ready to install
#[derive(Debug, Clone)]
pub struct TreeUpdate {
    /// Rehash version the update was computed against; `None` for a full rehash
    base: Option<u64>,
    buckets: BucketMap,
    /// Segments an incremental update recomputed
    segments: BTreeSet<u64>,
}

fn set_child(buckets: &mut BucketMap, level: u32, child: u64, width: u64, hash: Option<Hash>) -> u64 {
    let parent = child / width;
    match hash {
        Some(hash) => {
            buckets.entry((level, parent)).or_default().insert(child, hash);
        }
        None => {
            if let Some(children) = buckets.get_mut(&(level, parent)) {
                children.remove(&child);
                if children.is_empty() {
                    buckets.remove(&(level, parent));
                }
            }
        }
    }
    parent
}

/// Propagate changed segment hashes up through every bucket level
fn recompute(
    mut buckets: BucketMap,
    segment_hashes: BTreeMap<u64, Option<Hash>>,
    levels: u32,
    width: u64,
) -> BucketMap {
    let mut changed = BTreeSet::new();
    for (segment, hash) in segment_hashes {
        changed.insert(set_child(&mut buckets, levels, segment, width, hash));
    }

    for level in (1..levels).rev() {
        let mut next = BTreeSet::new();
        for child in changed {
            let hash = buckets
                .get(&(level + 1, child))
                .and_then(hasher::hash_bucket);
            next.insert(set_child(&mut buckets, level, child, width, hash));
        }
        changed = next;
    }

    buckets
}

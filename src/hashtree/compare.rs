//! Tree comparison
//!
//! Comparison descends from the root bucket, following only children whose
//! hashes differ between the two trees, and finishes by diffing the key hashes
//! of every differing segment. Both trees must share geometry and should be
//! freshly updated; the comparison itself never mutates either side.

use crate::error::CoordinatorError;
use crate::hashtree::HashTree;
use crate::types::{Hash, TreeKey};
use async_trait::async_trait;
use std::cmp::Ordering;

/// A key whose state differs between the local and the remote tree
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyDiff {
    /// Present remotely, absent locally
    Missing(TreeKey),
    /// Present locally, absent remotely
    RemoteMissing(TreeKey),
    /// Present on both sides with different hashes
    Different(TreeKey),
}

impl KeyDiff {
    pub fn key(&self) -> &[u8] {
        match self {
            KeyDiff::Missing(k) | KeyDiff::RemoteMissing(k) | KeyDiff::Different(k) => k,
        }
    }
}

/// The far side of a comparison
#[async_trait]
pub trait RemoteTree: Send + Sync {
    async fn exchange_bucket(&self, level: u32, bucket: u64) -> Result<Vec<(u64, Hash)>, CoordinatorError>;

    async fn exchange_segment(&self, segment: u64) -> Result<Vec<(TreeKey, Hash)>, CoordinatorError>;
}

#[async_trait]
impl RemoteTree for HashTree {
    async fn exchange_bucket(&self, level: u32, bucket: u64) -> Result<Vec<(u64, Hash)>, CoordinatorError> {
        Ok(self.get_bucket(level, bucket))
    }

    async fn exchange_segment(&self, segment: u64) -> Result<Vec<(TreeKey, Hash)>, CoordinatorError> {
        Ok(self.key_hashes(segment)?)
    }
}

impl HashTree {
    /// Compare against `remote`, folding each differing segment's diffs into `acc`
    ///
    /// `fold` is called once per segment that yields at least one difference.
    pub async fn compare<A, F>(&self, remote: &dyn RemoteTree, mut fold: F, acc: A) -> Result<A, CoordinatorError>
    where
        F: FnMut(Vec<KeyDiff>, A) -> A + Send,
        A: Send,
    {
        let mut acc = acc;
        let mut frontier = vec![0u64];
        for level in 1..=self.levels() {
            let mut next = Vec::new();
            for bucket in frontier {
                let local = self.get_bucket(level, bucket);
                let theirs = remote.exchange_bucket(level, bucket).await?;
                next.extend(differing_children(&local, &theirs));
            }
            if next.is_empty() {
                return Ok(acc);
            }
            frontier = next;
        }

        // After the last bucket level the frontier holds segment indices
        for segment in frontier {
            let local = self.key_hashes(segment)?;
            let theirs = remote.exchange_segment(segment).await?;
            let diffs = diff_keys(&local, &theirs);
            if !diffs.is_empty() {
                acc = fold(diffs, acc);
            }
        }
        Ok(acc)
    }

    /// Compare against `remote`, collecting every difference
    pub async fn compare_all(&self, remote: &dyn RemoteTree) -> Result<Vec<KeyDiff>, CoordinatorError> {
        self.compare(
            remote,
            |diffs, mut all: Vec<KeyDiff>| {
                all.extend(diffs);
                all
            },
            Vec::new(),
        )
        .await
    }
}

/// Child indices present on one side only or with different hashes
///
/// Both inputs must be sorted by index.
pub fn differing_children(local: &[(u64, Hash)], remote: &[(u64, Hash)]) -> Vec<u64> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < local.len() || j < remote.len() {
        match (local.get(i), remote.get(j)) {
            (Some(l), Some(r)) => match l.0.cmp(&r.0) {
                Ordering::Less => {
                    out.push(l.0);
                    i += 1;
                }
                Ordering::Greater => {
                    out.push(r.0);
                    j += 1;
                }
                Ordering::Equal => {
                    if l.1 != r.1 {
                        out.push(l.0);
                    }
                    i += 1;
                    j += 1;
                }
            },
            (Some(l), None) => {
                out.push(l.0);
                i += 1;
            }
            (None, Some(r)) => {
                out.push(r.0);
                j += 1;
            }
            (None, None) => break,
        }
    }
    out
}

/// Key-level differences between two sorted segment listings
pub fn diff_keys(local: &[(TreeKey, Hash)], remote: &[(TreeKey, Hash)]) -> Vec<KeyDiff> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < local.len() || j < remote.len() {
        match (local.get(i), remote.get(j)) {
            (Some(l), Some(r)) => match l.0.cmp(&r.0) {
                Ordering::Less => {
                    out.push(KeyDiff::RemoteMissing(l.0.clone()));
                    i += 1;
                }
                Ordering::Greater => {
                    out.push(KeyDiff::Missing(r.0.clone()));
                    j += 1;
                }
                Ordering::Equal => {
                    if l.1 != r.1 {
                        out.push(KeyDiff::Different(l.0.clone()));
                    }
                    i += 1;
                    j += 1;
                }
            },
            (Some(l), None) => {
                out.push(KeyDiff::RemoteMissing(l.0.clone()));
                i += 1;
            }
            (None, Some(r)) => {
                out.push(KeyDiff::Missing(r.0.clone()));
                j += 1;
            }
            (None, None) => break,
        }
    }
    out
}

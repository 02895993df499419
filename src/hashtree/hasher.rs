//! Hash computation for segments and buckets using BLAKE3

use crate::types::{Hash, TreeKey};
use blake3::Hasher;
use std::collections::BTreeMap;

/// Segment a key falls into
///
/// Segment = u64_be(BLAKE3(key)[0..8]) mod segments
pub fn segment_for_key(key: &[u8], segments: u64) -> u64 {
    let digest = blake3::hash(key);
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_be_bytes(prefix) % segments
}

/// Compute the hash of one segment from its (key, hash) entries
///
/// SegmentHash = hash("segment" || for each entry: key_len || key || hash)
///
/// Entries must be sorted by key. Returns `None` for an empty segment so that
/// empty segments are absent from their parent bucket.
pub fn hash_segment(entries: &[(TreeKey, Hash)]) -> Option<Hash> {
    if entries.is_empty() {
        return None;
    }

    let mut hasher = Hasher::new();

    // Hash type discriminator
    hasher.update(b"segment");

    for (key, hash) in entries {
        // Key length (8 bytes, big-endian)
        hasher.update(&(key.len() as u64).to_be_bytes());
        hasher.update(key);
        hasher.update(hash);
    }

    Some(*hasher.finalize().as_bytes())
}

/// Compute the hash of a bucket from its children
///
/// BucketHash = hash("bucket" || for each child: index || hash)
pub fn hash_bucket(children: &BTreeMap<u64, Hash>) -> Option<Hash> {
    if children.is_empty() {
        return None;
    }

    let mut hasher = Hasher::new();
    hasher.update(b"bucket");
    for (index, hash) in children {
        hasher.update(&index.to_be_bytes());
        hasher.update(hash);
    }

    Some(*hasher.finalize().as_bytes())
}

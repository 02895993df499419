//! Sled layout for hash tree segments and metadata
//!
//! One sled database per storage root. Every tracked tree owns two sled trees:
//! - `t || IndexN` holds leaves keyed by `segment (8 bytes BE) || key`
//! - `m || IndexN` holds small metadata values such as the built marker

use crate::error::{CoordinatorError, StorageError};
use crate::tree_id::{IndexN, INDEX_N_LEN};
use crate::types::{Hash, TreeKey};
use std::fs;
use std::path::Path;

const LEAF_TREE_PREFIX: u8 = b't';
const META_TREE_PREFIX: u8 = b'm';

/// Open (or create) the sled database at a storage root
pub fn open_db<P: AsRef<Path>>(root: P) -> Result<sled::Db, StorageError> {
    let root = root.as_ref();
    fs::create_dir_all(root).map_err(|e| {
        StorageError::IoError(std::io::Error::new(
            e.kind(),
            format!("Failed to create storage root {:?}: {}", root, e),
        ))
    })?;
    Ok(sled::open(root)?)
}

pub fn leaf_tree_name(id: &IndexN) -> Vec<u8> {
    tree_name(LEAF_TREE_PREFIX, id)
}

pub fn meta_tree_name(id: &IndexN) -> Vec<u8> {
    tree_name(META_TREE_PREFIX, id)
}

fn tree_name(prefix: u8, id: &IndexN) -> Vec<u8> {
    let mut name = Vec::with_capacity(1 + INDEX_N_LEN);
    name.push(prefix);
    name.extend_from_slice(&id.encode());
    name
}

pub fn leaf_key(segment: u64, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + key.len());
    out.extend_from_slice(&segment.to_be_bytes());
    out.extend_from_slice(key);
    out
}

/// Split a raw leaf key into (segment, key)
pub fn split_leaf_key(raw: &[u8]) -> Result<(u64, &[u8]), StorageError> {
    if raw.len() < 8 {
        return Err(StorageError::Codec(format!(
            "leaf key of {} bytes is shorter than its segment prefix",
            raw.len()
        )));
    }
    let (segment, key) = raw.split_at(8);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(segment);
    Ok((u64::from_be_bytes(buf), key))
}

pub fn decode_hash(raw: &[u8]) -> Result<Hash, StorageError> {
    raw.try_into().map_err(|_| {
        StorageError::Codec(format!("leaf hash is {} bytes, expected 32", raw.len()))
    })
}

/// Read every (key, hash) entry of one segment, sorted by key
pub fn read_segment(leaves: &sled::Tree, segment: u64) -> Result<Vec<(TreeKey, Hash)>, StorageError> {
    let mut entries = Vec::new();
    for item in leaves.scan_prefix(segment.to_be_bytes()) {
        let (raw_key, value) = item?;
        let (_, key) = split_leaf_key(&raw_key)?;
        entries.push((key.to_vec(), decode_hash(&value)?));
    }
    Ok(entries)
}

/// List the ids of every tree persisted in a database
///
/// A leaf tree whose name does not decode to an [`IndexN`] is a corrupted store
/// and fails with `InvalidIdentifier`.
pub fn list_tree_ids(db: &sled::Db) -> Result<Vec<IndexN>, CoordinatorError> {
    let mut ids = Vec::new();
    for name in db.tree_names() {
        if name.first() != Some(&LEAF_TREE_PREFIX) {
            continue;
        }
        ids.push(IndexN::decode(&name[1..])?);
    }
    ids.sort();
    Ok(ids)
}

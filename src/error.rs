//! Error types for the partition anti-entropy coordinator.

use crate::tree_id::IndexN;
use thiserror::Error;

/// Hash tree storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Invalid tree geometry: {0}")]
    InvalidGeometry(String),

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Coordinator-level errors
///
/// The first five variants are the error taxonomy surfaced to callers of the
/// coordinator; the rest wrap collaborator and runtime failures.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Not responsible for tree {0}")]
    NotResponsible(IndexN),

    #[error("Hash trees are not built")]
    NotBuilt,

    #[error("Hash trees are already locked")]
    AlreadyLocked,

    #[error("Maximum concurrency reached")]
    MaxConcurrency,

    #[error("Invalid tree identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Membership lookup failed: {0}")]
    Membership(String),

    #[error("Partition fold failed: {0}")]
    Fold(String),

    #[error("Worker failed: {0}")]
    WorkerFailed(String),

    #[error("Coordinator stopped")]
    Stopped,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<config::ConfigError> for CoordinatorError {
    fn from(err: config::ConfigError) -> Self {
        CoordinatorError::Config(err.to_string())
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Codec(err.to_string())
    }
}

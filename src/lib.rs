//! Partition anti-entropy
//!
//! Per-partition Merkle hash trees used to detect divergence between replicas
//! without a full data scan. Each storage partition runs one
//! [`coordinator::TreeCoordinator`], which keeps a hash tree per preflist the
//! partition serves, builds the trees from a fold over stored objects, expires
//! them periodically and serializes exchanges through a single lock.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod fold;
pub mod hashtree;
pub mod limiter;
pub mod logging;
pub mod membership;
pub mod object;
pub mod tree_id;
pub mod types;

//! Integration tests for routing writes to trees
//!
//! Tests cover:
//! - Writes into tracked trees
//! - Stale writes for preflists the partition no longer serves
//! - Lazy tree creation before the first build
//! - Drift recovery once built
//! - Object hashing through membership

use super::test_utils::*;
use aae::coordinator::BuildState;
use aae::error::CoordinatorError;
use aae::fold::MemoryObjectStore;
use aae::hashtree::hasher::segment_for_key;
use aae::hashtree::InsertOptions;
use aae::object::{hash_object, ObjectKey, ReplicaObject};
use tempfile::TempDir;

fn segment(key: &[u8]) -> u64 {
    segment_for_key(key, test_options().segments)
}

#[tokio::test]
async fn test_insert_scenario_owned_and_not_owned() {
    let dir = TempDir::new().unwrap();
    let membership = TestMembership::new().serve(P, vec![id(5, 3)]);
    let coordinator = start(&dir, membership, MemoryObjectStore::new(), vec![id(5, 3)]);
    let handle = &coordinator.handle;

    handle
        .insert(id(5, 3), b"k1".to_vec(), hash(1), InsertOptions::default())
        .await
        .unwrap();
    handle
        .insert(id(9, 3), b"k2".to_vec(), hash(2), InsertOptions::default())
        .await
        .unwrap();

    let status = handle.status().await.unwrap();
    assert_eq!(status.trees, vec![id(5, 3)]);
    let leaves = handle.exchange_segment(id(5, 3), segment(b"k1")).await.unwrap();
    assert_eq!(leaves, vec![(b"k1".to_vec(), hash(1))]);
    assert!(matches!(
        handle.exchange_segment(id(9, 3), segment(b"k2")).await,
        Err(CoordinatorError::NotResponsible(missing)) if missing == id(9, 3)
    ));
}

#[tokio::test]
async fn test_stale_write_after_build_leaves_trees_alone() {
    let dir = TempDir::new().unwrap();
    let membership = TestMembership::new().serve(P, vec![id(5, 3)]);
    let coordinator = start(&dir, membership, MemoryObjectStore::new(), vec![id(5, 3)]);
    let handle = &coordinator.handle;
    let built = build(handle).await;

    handle.delete(id(9, 3), b"k2".to_vec()).await.unwrap();
    let status = handle.status().await.unwrap();
    assert_eq!(status.trees, built.trees);
    assert_eq!(status.build_state, BuildState::Built);
    assert_eq!(status.built_at, built.built_at);
}

#[tokio::test]
async fn test_unexpected_key_creates_tree_before_build() {
    let dir = TempDir::new().unwrap();
    let membership = TestMembership::new().serve(P, vec![id(4, 3), id(5, 3)]);
    let coordinator = start(&dir, membership, MemoryObjectStore::new(), vec![id(5, 3)]);
    let handle = &coordinator.handle;

    handle
        .insert(id(4, 3), b"k1".to_vec(), hash(1), InsertOptions::default())
        .await
        .unwrap();

    let status = handle.status().await.unwrap();
    assert_eq!(status.trees, vec![id(4, 3), id(5, 3)]);
    assert_eq!(status.build_state, BuildState::NotBuilt);
    let leaves = handle.exchange_segment(id(4, 3), segment(b"k1")).await.unwrap();
    assert_eq!(leaves, vec![(b"k1".to_vec(), hash(1))]);
}

#[tokio::test]
async fn test_unexpected_key_after_build_clears_all_trees() {
    let dir = TempDir::new().unwrap();
    let membership = TestMembership::new().serve(P, vec![id(4, 3), id(5, 3)]);
    let coordinator = start(&dir, membership, MemoryObjectStore::new(), vec![id(5, 3)]);
    let handle = &coordinator.handle;

    handle
        .insert(id(5, 3), b"k1".to_vec(), hash(1), InsertOptions::default())
        .await
        .unwrap();
    build(handle).await;

    // Answered Ok: drift is repaired, not reported
    handle
        .insert(id(4, 3), b"k2".to_vec(), hash(2), InsertOptions::default())
        .await
        .unwrap();

    let status = handle.status().await.unwrap();
    assert_eq!(status.build_state, BuildState::NotBuilt);
    assert!(status.built_at.is_none());
    assert_eq!(status.trees, vec![id(4, 3), id(5, 3)]);
    assert!(handle.exchange_segment(id(5, 3), segment(b"k1")).await.unwrap().is_empty());
    assert!(handle.exchange_segment(id(4, 3), segment(b"k2")).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unexpected_key_with_failing_membership_is_reported() {
    let dir = TempDir::new().unwrap();
    // Membership knows nothing about this partition
    let membership = TestMembership::new();
    let coordinator = start(&dir, membership, MemoryObjectStore::new(), vec![id(5, 3)]);

    let result = coordinator
        .handle
        .insert(id(4, 3), b"k1".to_vec(), hash(1), InsertOptions::default())
        .await;
    assert!(matches!(result, Err(CoordinatorError::Membership(_))));
}

#[tokio::test]
async fn test_if_missing_keeps_existing_hash() {
    let dir = TempDir::new().unwrap();
    let membership = TestMembership::new().serve(P, vec![id(5, 3)]);
    let coordinator = start(&dir, membership, MemoryObjectStore::new(), vec![id(5, 3)]);
    let handle = &coordinator.handle;

    handle
        .insert(id(5, 3), b"k1".to_vec(), hash(1), InsertOptions::default())
        .await
        .unwrap();
    handle
        .insert(id(5, 3), b"k1".to_vec(), hash(2), InsertOptions::if_missing())
        .await
        .unwrap();
    handle
        .insert(id(5, 3), b"k3".to_vec(), hash(3), InsertOptions::if_missing())
        .await
        .unwrap();

    let leaves = handle.exchange_segment(id(5, 3), segment(b"k1")).await.unwrap();
    assert!(leaves.contains(&(b"k1".to_vec(), hash(1))));
    let leaves = handle.exchange_segment(id(5, 3), segment(b"k3")).await.unwrap();
    assert!(leaves.contains(&(b"k3".to_vec(), hash(3))));
}

#[tokio::test]
async fn test_delete_removes_key() {
    let dir = TempDir::new().unwrap();
    let membership = TestMembership::new().serve(P, vec![id(5, 3)]);
    let coordinator = start(&dir, membership, MemoryObjectStore::new(), vec![id(5, 3)]);
    let handle = &coordinator.handle;

    handle
        .insert(id(5, 3), b"k1".to_vec(), hash(1), InsertOptions::default())
        .await
        .unwrap();
    handle.delete(id(5, 3), b"k1".to_vec()).await.unwrap();

    assert!(handle.exchange_segment(id(5, 3), segment(b"k1")).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_insert_object_routes_and_hashes() {
    let dir = TempDir::new().unwrap();
    let membership = TestMembership::new()
        .serve(P, vec![id(5, 3)])
        .route("users", id(5, 3));
    let coordinator = start(&dir, membership, MemoryObjectStore::new(), vec![id(5, 3)]);
    let handle = &coordinator.handle;

    let key = ObjectKey::new("users", "alice");
    let object = ReplicaObject::new("v1")
        .with_clock_entry("node-b", 2, 200)
        .with_clock_entry("node-a", 1, 100);
    handle.insert_object(key.clone(), object).await.unwrap();

    // Clock entry order does not change the hash
    let reordered = ReplicaObject::new("v1")
        .with_clock_entry("node-a", 1, 100)
        .with_clock_entry("node-b", 2, 200);
    let tree_key = key.to_tree_key();
    let leaves = handle.exchange_segment(id(5, 3), segment(&tree_key)).await.unwrap();
    assert_eq!(leaves, vec![(tree_key, hash_object(&reordered).unwrap())]);

    assert!(matches!(
        handle
            .insert_object(ObjectKey::new("unrouted", "bob"), ReplicaObject::new("v"))
            .await,
        Err(CoordinatorError::Membership(_))
    ));
}

#[tokio::test]
async fn test_nowait_writes_are_applied_in_order() {
    let dir = TempDir::new().unwrap();
    let membership = TestMembership::new()
        .serve(P, vec![id(5, 3)])
        .route("users", id(5, 3));
    let coordinator = start(&dir, membership, MemoryObjectStore::new(), vec![id(5, 3)]);
    let handle = &coordinator.handle;

    handle
        .insert_nowait(id(5, 3), b"k1".to_vec(), hash(1), InsertOptions::default())
        .unwrap();
    handle
        .insert_nowait(id(5, 3), b"k1".to_vec(), hash(2), InsertOptions::default())
        .unwrap();
    handle
        .insert_object_nowait(ObjectKey::new("users", "carol"), ReplicaObject::new("v"))
        .unwrap();

    // A reply-carrying request is answered after everything sent before it
    let leaves = handle.exchange_segment(id(5, 3), segment(b"k1")).await.unwrap();
    assert!(leaves.contains(&(b"k1".to_vec(), hash(2))));
    let carol = ObjectKey::new("users", "carol").to_tree_key();
    let leaves = handle.exchange_segment(id(5, 3), segment(&carol)).await.unwrap();
    assert!(leaves.iter().any(|(k, _)| *k == carol));
}

#[tokio::test]
async fn test_new_tree_registers_empty_tree() {
    let dir = TempDir::new().unwrap();
    let membership = TestMembership::new().serve(P, vec![id(5, 3)]);
    let coordinator = start(&dir, membership, MemoryObjectStore::new(), vec![]);
    let handle = &coordinator.handle;

    assert!(matches!(
        handle.exchange_bucket(id(5, 3), 1, 0).await,
        Err(CoordinatorError::NotResponsible(_))
    ));
    handle.new_tree(id(5, 3)).await.unwrap();
    assert!(handle.exchange_bucket(id(5, 3), 1, 0).await.unwrap().is_empty());
}

//! Integration tests for the exchange lock
//!
//! Tests cover:
//! - Lock refused before the first build
//! - Mutual exclusion between holders
//! - Release when the holder terminates
//! - Termination signals keyed to the grant, not the holder id
//! - Remote exchanges gated by the limiter

use super::test_utils::*;
use aae::coordinator::{Collaborators, Holder, LockType, TreeCoordinator};
use aae::error::CoordinatorError;
use aae::fold::MemoryObjectStore;
use aae::limiter::SemaphoreLimiter;
use aae::tree_id::PartitionIndex;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn test_lock_scenario_single_preflist() {
    let dir = TempDir::new().unwrap();
    let membership = TestMembership::new().serve(P, vec![id(5, 3)]);
    let coordinator = start(&dir, membership, MemoryObjectStore::new(), vec![id(5, 3)]);
    let handle = &coordinator.handle;

    let a = Holder::new("node-a");
    let b = Holder::new("node-b");

    assert!(matches!(
        handle.get_lock(LockType::Local, &a).await,
        Err(CoordinatorError::NotBuilt)
    ));

    build(handle).await;
    handle.get_lock(LockType::Local, &a).await.unwrap();
    assert!(matches!(
        handle.get_lock(LockType::Local, &b).await,
        Err(CoordinatorError::AlreadyLocked)
    ));

    a.terminate();
    wait_for(handle, "lock release", |s| !s.is_locked()).await;
    handle.get_lock(LockType::Local, &b).await.unwrap();

    let status = handle.status().await.unwrap();
    assert_eq!(status.lock, Some((LockType::Local, "node-b".to_string())));
}

#[tokio::test]
async fn test_concurrent_lock_requests_grant_one() {
    let dir = TempDir::new().unwrap();
    let membership = TestMembership::new().serve(P, vec![id(5, 3)]);
    let coordinator = start(&dir, membership, MemoryObjectStore::new(), vec![id(5, 3)]);
    let handle = &coordinator.handle;
    build(handle).await;

    let holders: Vec<Holder> = (0..16).map(|i| Holder::new(format!("node-{}", i))).collect();
    let results = join_all(
        holders
            .iter()
            .map(|holder| handle.get_lock(LockType::Remote, holder)),
    )
    .await;

    let granted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(granted, 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, CoordinatorError::AlreadyLocked)));
}

#[tokio::test]
async fn test_previous_grant_does_not_release_new_lock() {
    let dir = TempDir::new().unwrap();
    let membership = TestMembership::new().serve(P, vec![id(5, 3)]);
    let coordinator = start(&dir, membership, MemoryObjectStore::new(), vec![id(5, 3)]);
    let handle = &coordinator.handle;
    build(handle).await;

    // Same holder id both times; only the liveness token differs
    let first = Holder::new("node-a");
    handle.get_lock(LockType::Local, &first).await.unwrap();
    first.terminate();
    wait_for(handle, "first release", |s| !s.is_locked()).await;

    let second = Holder::new("node-a");
    handle.get_lock(LockType::Local, &second).await.unwrap();
    first.terminate();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = handle.status().await.unwrap();
    assert!(status.is_locked());
    assert!(matches!(
        handle.get_lock(LockType::Local, &Holder::new("node-b")).await,
        Err(CoordinatorError::AlreadyLocked)
    ));
}

#[tokio::test]
async fn test_lock_for_dead_holder_is_released() {
    let dir = TempDir::new().unwrap();
    let membership = TestMembership::new().serve(P, vec![id(5, 3)]);
    let coordinator = start(&dir, membership, MemoryObjectStore::new(), vec![id(5, 3)]);
    let handle = &coordinator.handle;
    build(handle).await;

    let gone = Holder::new("node-a");
    gone.terminate();
    handle.get_lock(LockType::Local, &gone).await.unwrap();

    wait_for(handle, "release of dead holder", |s| !s.is_locked()).await;
    handle
        .get_lock(LockType::Local, &Holder::new("node-b"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_start_exchange_remote_respects_limiter() {
    let dir = TempDir::new().unwrap();
    let limiter = Arc::new(SemaphoreLimiter::new(2, 1));
    let membership = Arc::new(TestMembership::new().serve(P, vec![id(5, 3)]));
    let collaborators = Collaborators {
        membership,
        fold: Arc::new(MemoryObjectStore::new()),
        limiter: limiter.clone(),
    };
    let (handle, _task) = TreeCoordinator::spawn(
        PartitionIndex::from(P),
        test_config(&dir),
        collaborators,
        vec![id(5, 3)],
    )
    .unwrap();
    build(&handle).await;

    let a = Holder::new("peer-a");
    let b = Holder::new("peer-b");
    handle.start_exchange_remote(&a).await.unwrap();
    assert_eq!(limiter.available_exchanges(), 0);

    assert!(matches!(
        handle.start_exchange_remote(&b).await,
        Err(CoordinatorError::MaxConcurrency)
    ));

    a.terminate();
    wait_for(&handle, "lock release", |s| !s.is_locked()).await;
    for _ in 0..100 {
        if limiter.available_exchanges() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    handle.start_exchange_remote(&b).await.unwrap();
    let status = handle.status().await.unwrap();
    assert_eq!(status.lock, Some((LockType::Remote, "peer-b".to_string())));
}

#[tokio::test]
async fn test_remote_exchange_before_build_is_refused() {
    let dir = TempDir::new().unwrap();
    let membership = TestMembership::new().serve(P, vec![id(5, 3)]);
    let coordinator = start(&dir, membership, MemoryObjectStore::new(), vec![id(5, 3)]);

    assert!(matches!(
        coordinator
            .handle
            .start_exchange_remote(&Holder::new("peer-a"))
            .await,
        Err(CoordinatorError::NotBuilt)
    ));
}

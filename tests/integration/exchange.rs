//! Integration tests for tree updates, exchanges and comparison

use super::test_utils::*;
use aae::coordinator::{CoordinatorRemote, TreeCoordinator};
use aae::error::CoordinatorError;
use aae::fold::MemoryObjectStore;
use aae::hashtree::{InsertOptions, KeyDiff, RemoteTree};
use std::sync::Arc;
use tempfile::TempDir;

async fn fill(handle: &aae::coordinator::CoordinatorHandle, keys: &[(&str, u8)]) {
    for (key, seed) in keys {
        handle
            .insert(id(5, 3), key.as_bytes().to_vec(), hash(*seed), InsertOptions::default())
            .await
            .unwrap();
    }
}

fn pair(left: &TempDir, right: &TempDir) -> (TestCoordinator, TestCoordinator) {
    let local = start(
        left,
        TestMembership::new().serve(P, vec![id(5, 3)]),
        MemoryObjectStore::new(),
        vec![id(5, 3)],
    );
    let remote = start(
        right,
        TestMembership::new().serve(P, vec![id(5, 3)]),
        MemoryObjectStore::new(),
        vec![id(5, 3)],
    );
    (local, remote)
}

#[tokio::test]
async fn test_update_tree_publishes_bucket_hashes() {
    let dir = TempDir::new().unwrap();
    let coordinator = start(
        &dir,
        TestMembership::new().serve(P, vec![id(5, 3)]),
        MemoryObjectStore::new(),
        vec![id(5, 3)],
    );
    let handle = &coordinator.handle;

    fill(handle, &[("k1", 1), ("k2", 2)]).await;
    assert!(handle.exchange_bucket(id(5, 3), 1, 0).await.unwrap().is_empty());

    handle.update_tree(id(5, 3)).await.unwrap();
    let root = handle.exchange_bucket(id(5, 3), 1, 0).await.unwrap();
    assert!(!root.is_empty());

    // No pending writes: updating again changes nothing
    handle.update_tree(id(5, 3)).await.unwrap();
    assert_eq!(handle.exchange_bucket(id(5, 3), 1, 0).await.unwrap(), root);
}

#[tokio::test]
async fn test_requests_wait_for_in_flight_update() {
    let dir = TempDir::new().unwrap();
    let coordinator = start(
        &dir,
        TestMembership::new().serve(P, vec![id(5, 3), id(4, 3)]),
        MemoryObjectStore::new(),
        vec![id(5, 3), id(4, 3)],
    );
    let handle = &coordinator.handle;
    fill(handle, &[("k1", 1), ("k2", 2), ("k3", 3)]).await;

    // Sent in this order; the bucket read must see the finished update
    let (updated, root, other) = tokio::join!(
        handle.update_tree(id(5, 3)),
        handle.exchange_bucket(id(5, 3), 1, 0),
        handle.exchange_bucket(id(4, 3), 1, 0),
    );
    updated.unwrap();
    let root = root.unwrap();
    assert!(!root.is_empty());
    assert!(other.unwrap().is_empty());
    assert_eq!(handle.exchange_bucket(id(5, 3), 1, 0).await.unwrap(), root);
}

#[tokio::test]
async fn test_update_unknown_tree_is_not_responsible() {
    let dir = TempDir::new().unwrap();
    let coordinator = start(
        &dir,
        TestMembership::new().serve(P, vec![id(5, 3)]),
        MemoryObjectStore::new(),
        vec![id(5, 3)],
    );
    let handle = &coordinator.handle;

    assert!(matches!(
        handle.update_tree(id(1, 3)).await,
        Err(CoordinatorError::NotResponsible(_))
    ));
    assert!(matches!(
        handle.exchange_bucket(id(1, 3), 1, 0).await,
        Err(CoordinatorError::NotResponsible(_))
    ));
    assert!(matches!(
        handle.exchange_segment(id(1, 3), 0).await,
        Err(CoordinatorError::NotResponsible(_))
    ));
}

#[tokio::test]
async fn test_compare_two_coordinators() {
    let left = TempDir::new().unwrap();
    let right = TempDir::new().unwrap();
    let (local, remote) = pair(&left, &right);

    fill(&local.handle, &[("same", 1), ("changed", 2), ("only-local", 3)]).await;
    fill(&remote.handle, &[("same", 1), ("changed", 9), ("only-remote", 4)]).await;
    local.handle.update_tree(id(5, 3)).await.unwrap();
    remote.handle.update_tree(id(5, 3)).await.unwrap();

    let peer: Arc<dyn RemoteTree> = Arc::new(CoordinatorRemote::new(remote.handle.clone(), id(5, 3)));
    let mut diffs = local.handle.compare(id(5, 3), peer).await.unwrap();
    diffs.sort();

    assert_eq!(
        diffs,
        vec![
            KeyDiff::Missing(b"only-remote".to_vec()),
            KeyDiff::RemoteMissing(b"only-local".to_vec()),
            KeyDiff::Different(b"changed".to_vec()),
        ]
    );
}

#[tokio::test]
async fn test_compare_identical_trees_is_empty() {
    let left = TempDir::new().unwrap();
    let right = TempDir::new().unwrap();
    let (local, remote) = pair(&left, &right);

    let keys: Vec<(String, u8)> = (0..50).map(|i| (format!("key-{}", i), i as u8)).collect();
    let keys: Vec<(&str, u8)> = keys.iter().map(|(k, s)| (k.as_str(), *s)).collect();
    fill(&local.handle, &keys).await;
    fill(&remote.handle, &keys).await;
    local.handle.update_tree(id(5, 3)).await.unwrap();
    remote.handle.update_tree(id(5, 3)).await.unwrap();

    let peer = Arc::new(CoordinatorRemote::new(remote.handle.clone(), id(5, 3)));
    assert!(local.handle.compare(id(5, 3), peer).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_compare_with_accumulator() {
    let left = TempDir::new().unwrap();
    let right = TempDir::new().unwrap();
    let (local, remote) = pair(&left, &right);

    let keys: Vec<String> = (0..40).map(|i| format!("key-{}", i)).collect();
    for key in &keys {
        local
            .handle
            .insert(id(5, 3), key.as_bytes().to_vec(), hash(1), InsertOptions::default())
            .await
            .unwrap();
    }
    local.handle.update_tree(id(5, 3)).await.unwrap();
    remote.handle.update_tree(id(5, 3)).await.unwrap();

    // Count differences without collecting them
    let peer = Arc::new(CoordinatorRemote::new(remote.handle.clone(), id(5, 3)));
    let (segments, missing) = local
        .handle
        .compare_with(
            id(5, 3),
            peer,
            |diffs, (segments, missing): (usize, usize)| (segments + 1, missing + diffs.len()),
            (0, 0),
        )
        .await
        .unwrap();

    assert_eq!(missing, keys.len());
    assert!(segments > 0 && segments <= keys.len());
}

#[tokio::test]
async fn test_compare_unknown_tree_is_not_responsible() {
    let left = TempDir::new().unwrap();
    let right = TempDir::new().unwrap();
    let (local, remote) = pair(&left, &right);

    let peer = Arc::new(CoordinatorRemote::new(remote.handle.clone(), id(5, 3)));
    assert!(matches!(
        local.handle.compare(id(1, 3), peer).await,
        Err(CoordinatorError::NotResponsible(_))
    ));

    // Missing on the far side surfaces from the remote
    let peer = Arc::new(CoordinatorRemote::new(remote.handle.clone(), id(1, 3)));
    local
        .handle
        .insert(id(5, 3), b"k".to_vec(), hash(1), InsertOptions::default())
        .await
        .unwrap();
    local.handle.update_tree(id(5, 3)).await.unwrap();
    assert!(matches!(
        local.handle.compare(id(5, 3), peer).await,
        Err(CoordinatorError::NotResponsible(_))
    ));
}

#[tokio::test]
async fn test_stopped_coordinator_rejects_requests() {
    let dir = TempDir::new().unwrap();
    let coordinator = start(
        &dir,
        TestMembership::new().serve(P, vec![id(5, 3)]),
        MemoryObjectStore::new(),
        vec![id(5, 3)],
    );
    let handle = coordinator.handle.clone();

    coordinator.task.abort();
    let _ = coordinator.task.await;

    assert!(matches!(handle.status().await, Err(CoordinatorError::Stopped)));
    assert!(matches!(handle.poke(), Err(CoordinatorError::Stopped)));
}

#[tokio::test]
async fn test_coordinator_stops_when_handles_drop() {
    let dir = TempDir::new().unwrap();
    let membership = Arc::new(TestMembership::new().serve(P, vec![id(5, 3)]));
    let collaborators = aae::coordinator::Collaborators {
        membership,
        fold: Arc::new(MemoryObjectStore::new()),
        limiter: Arc::new(aae::limiter::SemaphoreLimiter::default()),
    };
    let (handle, task) = TreeCoordinator::spawn(
        aae::tree_id::PartitionIndex::from(P),
        test_config(&dir),
        collaborators,
        vec![id(5, 3)],
    )
    .unwrap();
    build(&handle).await;

    drop(handle);
    task.await.unwrap().unwrap();
}

//! Checkpoint store and remote mirror properties
//!
//! Exercises the local store and the remote sync adapter together against
//! real directories:
//! - restore only ever sees marked checkpoints
//! - slot allocation is strictly increasing
//! - pushes are idempotent and never advance the pointer on failure

mod common;

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use checkpoint::{CheckpointStore, RemoteSync};
use common::{commit, no_retry, snapshot, FlakyStorage, PRESET};
use storage::{LocalStorage, StorageBackend};
use tempfile::TempDir;
use trainer_core::{slot_name, Error, LatestPointer, COMPLETE_MARKER};

#[tokio::test]
async fn test_restore_skips_unmarked_slots_after_every_commit() -> Result<()> {
    let dir = TempDir::new()?;
    let mut store = CheckpointStore::open(dir.path(), PRESET).await?;

    for index in 0..6u64 {
        // An abandoned slot at the next index must never be returned.
        let mut handle = store.begin_checkpoint(index, index * 10).await?;
        handle.write_file("steps", Bytes::from("partial")).await?;
        drop(handle);
        let latest = store.restore_latest().await?;
        if index == 0 {
            assert!(latest.is_none());
        } else {
            assert_eq!(latest.map(|c| c.index()), Some(index - 1));
        }

        let mut reopened = CheckpointStore::open(dir.path(), PRESET).await?;
        let committed = commit(&mut reopened, index, index * 10).await;
        assert!(committed.path().join(COMPLETE_MARKER).exists());
        store = reopened;

        let latest = store.restore_latest().await?.expect("a complete checkpoint");
        assert_eq!(latest.index(), index);
        assert!(latest.path().join(COMPLETE_MARKER).exists());
    }
    Ok(())
}

#[tokio::test]
async fn test_restore_returns_highest_complete_checkpoint() -> Result<()> {
    let dir = TempDir::new()?;
    let mut store = CheckpointStore::open(dir.path(), PRESET).await?;
    for index in 0..4 {
        commit(&mut store, index, index * 100).await;
    }
    let mut handle = store.begin_checkpoint(4, 400).await?;
    handle.write_file("steps", Bytes::from("400")).await?;
    drop(handle);

    let store = CheckpointStore::open(dir.path(), PRESET).await?;
    let latest = store.restore_latest().await?.expect("checkpoint 3");
    assert_eq!(latest.index(), 3);
    assert_eq!(latest.step(), 300);
    Ok(())
}

#[tokio::test]
async fn test_begin_checkpoint_is_strictly_increasing() -> Result<()> {
    let dir = TempDir::new()?;
    let mut store = CheckpointStore::open(dir.path(), PRESET).await?;
    commit(&mut store, 5, 50).await;

    // A fresh store over the same directory still honors the committed floor.
    let mut store = CheckpointStore::open(dir.path(), PRESET).await?;
    for requested in [0, 3, 5] {
        let err = store.begin_checkpoint(requested, 60).await.unwrap_err();
        assert!(matches!(err, Error::IndexNotIncreasing { floor: 5, .. }));
    }

    let handle = store.begin_checkpoint(6, 60).await?;
    assert_eq!(handle.index(), 6);
    drop(handle);

    // 6 was allocated though never committed.
    let err = store.begin_checkpoint(6, 61).await.unwrap_err();
    assert!(matches!(err, Error::IndexNotIncreasing { requested: 6, floor: 6 }));
    assert_eq!(store.begin_checkpoint(7, 70).await?.index(), 7);
    Ok(())
}

#[tokio::test]
async fn test_push_twice_matches_push_once() -> Result<()> {
    let local = TempDir::new()?;
    let once = TempDir::new()?;
    let twice = TempDir::new()?;
    let mut store = CheckpointStore::open(local.path(), PRESET).await?;
    let checkpoint = commit(&mut store, 2, 20).await;

    let sync_once = RemoteSync::new(Arc::new(LocalStorage::new(once.path())), no_retry());
    sync_once.push(&checkpoint).await?;

    let sync_twice = RemoteSync::new(Arc::new(LocalStorage::new(twice.path())), no_retry());
    sync_twice.push(&checkpoint).await?;
    let second = sync_twice.push(&checkpoint).await?;
    assert_eq!(second.index, 2);

    assert_eq!(snapshot(once.path()).await, snapshot(twice.path()).await);
    Ok(())
}

#[tokio::test]
async fn test_interrupted_push_leaves_pointer_unchanged() -> Result<()> {
    let local = TempDir::new()?;
    let remote = TempDir::new()?;
    let mut store = CheckpointStore::open(local.path(), PRESET).await?;

    let first = commit(&mut store, 0, 0).await;
    let healthy = RemoteSync::new(Arc::new(LocalStorage::new(remote.path())), no_retry());
    healthy.push(&first).await?;

    let mut handle = store.begin_checkpoint(1, 10).await?;
    handle.write_file("steps", Bytes::from("10")).await?;
    handle.write_file("weights", Bytes::from(vec![7u8; 1024])).await?;
    let second = store.commit_checkpoint(handle).await?;

    // One file lands, then the connection drops.
    let flaky = RemoteSync::new(Arc::new(FlakyStorage::new(remote.path(), 1)), no_retry());
    let err = flaky.push(&second).await.unwrap_err();
    assert!(matches!(err, Error::Remote { .. }));

    assert_eq!(
        healthy.latest_pointer().await?,
        Some(LatestPointer { index: 0, step: 0 })
    );
    let mirror = LocalStorage::new(remote.path());
    assert!(
        !mirror
            .exists(&format!("{}/{}", slot_name(1), COMPLETE_MARKER))
            .await?
    );

    // A later healthy push completes the slot and advances the pointer.
    healthy.push(&second).await?;
    assert_eq!(healthy.latest_pointer().await?.map(|p| p.index), Some(1));
    Ok(())
}

#[tokio::test]
async fn test_pull_commits_remote_checkpoint_locally() -> Result<()> {
    let origin = TempDir::new()?;
    let remote = TempDir::new()?;
    let replica = TempDir::new()?;

    let mut source = CheckpointStore::open(origin.path(), PRESET).await?;
    let sync = RemoteSync::new(Arc::new(LocalStorage::new(remote.path())), no_retry());
    for index in 0..3 {
        let checkpoint = commit(&mut source, index, index * 5).await;
        sync.push(&checkpoint).await?;
    }

    let mut target = CheckpointStore::open(replica.path(), PRESET).await?;
    let pulled = sync.pull_latest(&mut target).await?.expect("remote checkpoint");
    assert_eq!((pulled.index(), pulled.step()), (2, 10));

    let restored = CheckpointStore::open(replica.path(), PRESET)
        .await?
        .restore_latest()
        .await?
        .expect("pulled checkpoint committed locally");
    assert_eq!(restored.index(), 2);
    assert_eq!(std::fs::read_to_string(restored.path().join("steps"))?, "10");
    Ok(())
}

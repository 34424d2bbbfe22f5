//! Controller scenarios: cold start, local and remote resume, periodic
//! checkpointing on a simulated clock, and fatal restore conditions.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use checkpoint::{CheckpointHandle, CheckpointStore, RemoteSync};
use common::{commit, config, counter_factory, no_retry, FlakyStorage, PRESET};
use storage::LocalStorage;
use tempfile::TempDir;
use trainer::{
    factory_fn, ManualClock, StopReason, Strategy, TrainingController, TrainingReport,
};
use trainer_core::{Error, RestoreSource, Step, TrainerConfig};

const INTERVAL: Duration = Duration::from_secs(900);
const TICK: Duration = Duration::from_secs(1);

fn mirror(root: &Path) -> Arc<RemoteSync> {
    Arc::new(RemoteSync::new(Arc::new(LocalStorage::new(root)), no_retry()))
}

async fn run(
    cfg: TrainerConfig,
    clock: Arc<ManualClock>,
    finish_at: Option<Step>,
    remote: Option<Arc<RemoteSync>>,
) -> trainer_core::Result<TrainingReport> {
    let store = CheckpointStore::open(&cfg.checkpoint.dir, PRESET).await?;
    let mut controller =
        TrainingController::new(cfg, store, counter_factory(clock.clone(), TICK, finish_at))
            .with_clock(clock);
    if let Some(remote) = remote {
        controller = controller.with_remote(remote);
    }
    controller.run().await
}

#[tokio::test]
async fn test_cold_start_publishes_checkpoint_zero_everywhere() -> Result<()> {
    let local = TempDir::new()?;
    let remote = TempDir::new()?;
    let sync = mirror(remote.path());

    let report = run(
        config(local.path(), INTERVAL),
        Arc::new(ManualClock::new()),
        Some(10),
        Some(sync.clone()),
    )
    .await?;

    assert_eq!(report.restored_from, RestoreSource::Fresh);
    assert_eq!(report.last_checkpoint, Some(0));
    assert_eq!(report.stop_reason, StopReason::Natural);

    let latest = CheckpointStore::open(local.path(), PRESET)
        .await?
        .restore_latest()
        .await?
        .expect("checkpoint 0");
    assert_eq!((latest.index(), latest.step()), (0, 0));
    assert_eq!(sync.latest_pointer().await?.map(|p| p.index), Some(0));
    Ok(())
}

#[tokio::test]
async fn test_empty_local_resumes_from_remote_latest() -> Result<()> {
    let origin = TempDir::new()?;
    let remote = TempDir::new()?;
    let local = TempDir::new()?;
    let sync = mirror(remote.path());

    let mut source = CheckpointStore::open(origin.path(), PRESET).await?;
    for index in [3, 7] {
        let checkpoint = commit(&mut source, index, index * 10).await;
        sync.push(&checkpoint).await?;
    }

    let cfg = config(local.path(), INTERVAL);
    let store = CheckpointStore::open(local.path(), PRESET).await?;
    let clock = Arc::new(ManualClock::new());
    let controller = TrainingController::new(
        cfg,
        store,
        counter_factory(clock.clone(), TICK, Some(75)),
    )
    .with_clock(clock)
    .with_remote(sync.clone());
    controller.checkpoint_requests().request();
    let report = controller.run().await?;

    assert!(matches!(report.restored_from, RestoreSource::Remote { index: 7, .. }));
    assert_eq!(report.final_step, 75);
    // The first checkpoint of the resumed run follows the pulled one.
    assert_eq!(report.checkpoints_written, 1);
    assert_eq!(report.last_checkpoint, Some(8));

    let store = CheckpointStore::open(local.path(), PRESET).await?;
    let latest = store.restore_latest().await?.expect("local checkpoint");
    assert_eq!((latest.index(), latest.step()), (8, 71));
    assert!(store.slot_path(7).exists());
    assert_eq!(sync.latest_pointer().await?.map(|p| p.index), Some(8));
    Ok(())
}

#[tokio::test]
async fn test_local_checkpoint_wins_over_remote() -> Result<()> {
    let local = TempDir::new()?;
    let origin = TempDir::new()?;
    let remote = TempDir::new()?;
    let sync = mirror(remote.path());

    let mut other = CheckpointStore::open(origin.path(), PRESET).await?;
    sync.push(&commit(&mut other, 9, 90).await).await?;
    let mut store = CheckpointStore::open(local.path(), PRESET).await?;
    commit(&mut store, 2, 20).await;

    let report = run(
        config(local.path(), INTERVAL),
        Arc::new(ManualClock::new()),
        Some(25),
        Some(sync),
    )
    .await?;
    assert!(matches!(report.restored_from, RestoreSource::Local { index: 2, .. }));
    assert_eq!(report.final_step, 25);
    Ok(())
}

#[tokio::test]
async fn test_resumed_run_takes_over_a_remote_that_is_ahead() -> Result<()> {
    let local = TempDir::new()?;
    let origin = TempDir::new()?;
    let remote = TempDir::new()?;
    let sync = mirror(remote.path());

    let mut other = CheckpointStore::open(origin.path(), PRESET).await?;
    sync.push(&commit(&mut other, 9, 90).await).await?;
    let mut store = CheckpointStore::open(local.path(), PRESET).await?;
    commit(&mut store, 2, 20).await;

    let report = run(
        config(local.path(), Duration::from_secs(5)),
        Arc::new(ManualClock::new()),
        Some(40),
        Some(sync.clone()),
    )
    .await?;

    assert!(matches!(report.restored_from, RestoreSource::Local { index: 2, .. }));
    assert_eq!(report.last_checkpoint, Some(6));
    let push = report.push.expect("push status");
    assert_eq!(push.last_pushed, Some(6));
    assert!(!push.degraded);
    assert_eq!(
        sync.latest_pointer().await?.map(|p| (p.index, p.step)),
        Some((6, 40))
    );
    Ok(())
}

#[tokio::test]
async fn test_1801_seconds_trigger_exactly_two_checkpoint_cycles() -> Result<()> {
    let local = TempDir::new()?;
    let remote = TempDir::new()?;
    let mut store = CheckpointStore::open(local.path(), PRESET).await?;
    commit(&mut store, 0, 0).await;

    let report = run(
        config(local.path(), INTERVAL),
        Arc::new(ManualClock::new()),
        Some(1801),
        Some(mirror(remote.path())),
    )
    .await?;

    assert_eq!(report.final_step, 1801);
    assert_eq!(report.periodic_checkpoints, 2);
    assert_eq!(report.checkpoints_written, 2);
    assert_eq!(report.push.expect("push status").submitted, 2);

    let steps: Vec<_> = {
        let store = CheckpointStore::open(local.path(), PRESET).await?;
        let mut steps = Vec::new();
        for index in 1..=2 {
            steps.push(std::fs::read_to_string(store.slot_path(index).join("steps"))?);
        }
        steps
    };
    assert_eq!(steps, ["900", "1800"]);
    Ok(())
}

#[tokio::test]
async fn test_unreachable_remote_degrades_without_stopping() -> Result<()> {
    let local = TempDir::new()?;
    let remote = TempDir::new()?;
    let mut cfg = config(local.path(), Duration::from_secs(10));
    cfg.sync.degraded_after = 1;

    let sync = Arc::new(RemoteSync::new(
        Arc::new(FlakyStorage::new(remote.path(), 0)),
        no_retry(),
    ));
    let report = run(cfg, Arc::new(ManualClock::new()), Some(30), Some(sync)).await?;

    assert_eq!(report.stop_reason, StopReason::Natural);
    assert_eq!(report.last_checkpoint, Some(3));
    let push = report.push.expect("push status");
    assert_eq!(push.succeeded, 0);
    assert!(push.failed >= 1);
    assert!(push.degraded);
    assert!(push.last_pushed.is_none());
    Ok(())
}

#[tokio::test]
async fn test_checkpoint_index_beyond_step_is_fatal() -> Result<()> {
    let local = TempDir::new()?;
    let mut store = CheckpointStore::open(local.path(), PRESET).await?;
    commit(&mut store, 5, 3).await;

    let err = run(config(local.path(), INTERVAL), Arc::new(ManualClock::new()), Some(10), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CheckpointCorrupted { index: 5, .. }));
    assert_eq!(err.exit_code(), 4);
    Ok(())
}

#[tokio::test]
async fn test_restored_step_mismatch_is_fatal() -> Result<()> {
    let local = TempDir::new()?;
    let mut store = CheckpointStore::open(local.path(), PRESET).await?;
    let mut handle = store.begin_checkpoint(1, 50).await?;
    handle.write_file("steps", Bytes::from("40")).await?;
    store.commit_checkpoint(handle).await?;

    let err = run(config(local.path(), INTERVAL), Arc::new(ManualClock::new()), Some(60), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::StepMismatch { index: 1, recorded: 50, actual: 40 }
    ));
    Ok(())
}

#[tokio::test]
async fn test_marker_without_files_is_fatal() -> Result<()> {
    let local = TempDir::new()?;
    let mut store = CheckpointStore::open(local.path(), PRESET).await?;
    let checkpoint = commit(&mut store, 0, 0).await;
    std::fs::remove_file(checkpoint.path().join("steps"))?;

    let err = run(config(local.path(), INTERVAL), Arc::new(ManualClock::new()), Some(5), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::CheckpointCorrupted { index: 0, .. }));
    Ok(())
}

struct Failing;

#[async_trait]
impl Strategy for Failing {
    fn total_steps(&self) -> Step {
        0
    }

    async fn step_improve(&mut self) -> trainer_core::Result<()> {
        Err(Error::Internal {
            message: "diverged".to_string(),
        })
    }

    async fn export_state(&self, handle: &mut CheckpointHandle) -> trainer_core::Result<()> {
        handle.write_file("steps", Bytes::from("0")).await?;
        Ok(())
    }

    fn natural_stop(&self) -> bool {
        false
    }
}

#[tokio::test]
async fn test_step_failure_is_fatal() -> Result<()> {
    let local = TempDir::new()?;
    let store = CheckpointStore::open(local.path(), PRESET).await?;
    let err = TrainingController::new(
        config(local.path(), INTERVAL),
        store,
        factory_fn(|_| Ok(Box::new(Failing) as Box<dyn Strategy>)),
    )
    .run()
    .await
    .unwrap_err();

    assert!(matches!(err, Error::Strategy { step: 0, .. }));
    assert_eq!(err.exit_code(), 5);
    Ok(())
}

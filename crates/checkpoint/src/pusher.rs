//! Background push worker
//!
//! Pushes run on a spawned task so upload latency never blocks the training
//! loop. The worker holds a single-slot mailbox: submitting while a job is
//! still queued replaces it (latest wins), and at most one push is in flight.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use trainer_core::{Checkpoint, CheckpointIndex};

use crate::store::AuxiliaryArtifact;
use crate::sync::RemoteSync;

/// One request for the push worker
#[derive(Debug, Clone)]
pub struct PushJob {
    /// Committed checkpoint to mirror
    pub checkpoint: Checkpoint,

    /// Artifact to export after the push, if any
    pub auxiliary: Option<AuxiliaryArtifact>,
}

/// Counters describing the worker's progress
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushStatus {
    /// Jobs handed to the worker
    pub submitted: u64,

    /// Jobs replaced by a newer submission before they started
    pub superseded: u64,

    /// Pushes that completed
    pub succeeded: u64,

    /// Pushes that failed after exhausting retries
    pub failed: u64,

    /// Failures since the last success
    pub consecutive_failures: u32,

    /// Checkpoint named by the remote pointer after the last successful push
    pub last_pushed: Option<CheckpointIndex>,

    /// Auxiliary exports that failed
    pub exports_failed: u64,

    /// Remote durability is degraded (too many consecutive failures)
    pub degraded: bool,
}

struct Shared {
    slot: Mutex<Option<PushJob>>,
    notify: Notify,
    closed: AtomicBool,
    status: RwLock<PushStatus>,
}

/// Handle to the background push task
pub struct PushWorker {
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl PushWorker {
    /// Spawn the worker on the current Tokio runtime
    pub fn spawn(sync: Arc<RemoteSync>, degraded_after: u32) -> Self {
        let shared = Arc::new(Shared {
            slot: Mutex::new(None),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            status: RwLock::new(PushStatus::default()),
        });

        let task = tokio::spawn(Self::worker_loop(
            sync,
            shared.clone(),
            degraded_after.max(1),
        ));

        Self { shared, task }
    }

    /// Queue a push; never waits for the upload
    pub fn submit(&self, job: PushJob) {
        let index = job.checkpoint.index();
        let replaced = self.shared.slot.lock().replace(job);

        {
            let mut status = self.shared.status.write();
            status.submitted += 1;
            if replaced.is_some() {
                status.superseded += 1;
            }
        }

        if let Some(old) = replaced {
            debug!(
                superseded = old.checkpoint.index(),
                index, "Queued push superseded by a newer checkpoint"
            );
        }
        self.shared.notify.notify_one();
    }

    /// Snapshot of the worker's counters
    pub fn status(&self) -> PushStatus {
        self.shared.status.read().clone()
    }

    /// Stop accepting work and wait for the queued and in-flight push
    ///
    /// If the drain exceeds `timeout` the task is aborted and the push is
    /// left to the next run (the pointer was not advanced for it).
    pub async fn shutdown(self, timeout: Duration) -> PushStatus {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();

        let mut task = self.task;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(())) => debug!("Push worker drained"),
            Ok(Err(e)) => error!(error = %e, "Push worker task failed"),
            Err(_) => {
                task.abort();
                warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "Push worker did not drain in time; in-flight push abandoned"
                );
            }
        }

        let status = self.shared.status.read().clone();
        status
    }

    async fn worker_loop(sync: Arc<RemoteSync>, shared: Arc<Shared>, degraded_after: u32) {
        info!(remote = %sync.describe(), "Push worker started");

        loop {
            let job = shared.slot.lock().take();
            match job {
                Some(job) => Self::run_job(&sync, &shared, degraded_after, job).await,
                None if shared.closed.load(Ordering::SeqCst) => break,
                None => shared.notify.notified().await,
            }
        }

        info!("Push worker stopped");
    }

    async fn run_job(sync: &RemoteSync, shared: &Shared, degraded_after: u32, job: PushJob) {
        let index = job.checkpoint.index();

        match sync.push(&job.checkpoint).await {
            Ok(outcome) => {
                let mut status = shared.status.write();
                status.succeeded += 1;
                status.consecutive_failures = 0;
                if status.degraded {
                    info!(index, "Remote durability restored");
                }
                status.degraded = false;
                status.last_pushed = Some(outcome.index);
            }
            Err(e) => {
                let mut status = shared.status.write();
                status.failed += 1;
                status.consecutive_failures += 1;
                if status.consecutive_failures >= degraded_after {
                    status.degraded = true;
                    warn!(
                        index,
                        consecutive_failures = status.consecutive_failures,
                        last_pushed = ?status.last_pushed,
                        error = %e,
                        "Remote durability degraded: pushes keep failing, training continues"
                    );
                } else {
                    warn!(
                        index,
                        error = %e,
                        "Push failed; the next scheduled sync will push again"
                    );
                }
            }
        }

        if let Some(artifact) = &job.auxiliary {
            if let Err(e) = sync.export_auxiliary(&job.checkpoint, artifact).await {
                shared.status.write().exports_failed += 1;
                warn!(index, artifact = %artifact.name, error = %e, "Auxiliary export failed");
            }
        }
    }
}

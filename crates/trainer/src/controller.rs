//! Training controller
//!
//! Owns the strategy for the lifetime of a run and sequences:
//! 1. **Init**: restore from the local store, else pull the remote latest,
//!    else start fresh and publish checkpoint 0
//! 2. **Running**: one `step_improve` per iteration, polling the stop
//!    predicate before each step
//! 3. **Checkpointing**: at step boundaries when the interval has elapsed or
//!    a checkpoint was requested; the push is handed to the background worker
//! 4. **Stopped**: drain the push worker and report

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use checkpoint::{CheckpointStore, PushJob, PushStatus, PushWorker, RemoteSync};
use tracing::{debug, info, warn};
use trainer_core::{Checkpoint, CheckpointIndex, Error, Result, RestoreSource, Step, TrainerConfig};

use crate::clock::{Clock, SystemClock};
use crate::remote;
use crate::stop::{NeverStop, StopPredicate};
use crate::strategy::{Strategy, StrategyFactory, StrategyRegistry};

/// Lifecycle of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControllerState {
    Init,
    Running,
    Checkpointing,
    Stopped,
}

/// Why the loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The stop predicate fired
    External,
    /// The strategy finished on its own
    Natural,
    /// The configured step limit was reached
    MaxSteps,
}

/// Handle for asking the controller to checkpoint at the next step boundary
#[derive(Debug, Clone, Default)]
pub struct CheckpointRequest(Arc<AtomicBool>);

impl CheckpointRequest {
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Summary of a finished run
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub stop_reason: StopReason,
    pub final_step: Step,
    pub restored_from: RestoreSource,
    /// Checkpoints published during this run, the initial one included
    pub checkpoints_written: u64,
    /// Checkpoints triggered by the save interval
    pub periodic_checkpoints: u64,
    pub last_checkpoint: Option<CheckpointIndex>,
    /// Push worker counters; `None` when no remote mirror is configured
    pub push: Option<PushStatus>,
}

/// Mutable state of one run
struct Session {
    strategy: Box<dyn Strategy>,
    restored_from: RestoreSource,
    next_index: CheckpointIndex,
    last_checkpoint: Option<CheckpointIndex>,
    last_checkpoint_at: Duration,
    checkpoints_written: u64,
    periodic_checkpoints: u64,
}

/// Drives a strategy with checkpointing and remote sync
pub struct TrainingController {
    config: TrainerConfig,
    store: CheckpointStore,
    factory: Arc<dyn StrategyFactory>,
    remote: Option<Arc<RemoteSync>>,
    stop: Arc<dyn StopPredicate>,
    clock: Arc<dyn Clock>,
    requests: CheckpointRequest,
    state: ControllerState,
}

impl TrainingController {
    /// Controller over an opened store with no remote mirror
    pub fn new(
        config: TrainerConfig,
        store: CheckpointStore,
        factory: Arc<dyn StrategyFactory>,
    ) -> Self {
        Self {
            config,
            store,
            factory,
            remote: None,
            stop: Arc::new(NeverStop),
            clock: Arc::new(SystemClock::new()),
            requests: CheckpointRequest::default(),
            state: ControllerState::Init,
        }
    }

    /// Resolve the preset, open the local store and connect the mirror
    pub async fn from_config(config: TrainerConfig, registry: &StrategyRegistry) -> Result<Self> {
        config.validate()?;
        let factory = registry.get(&config.preset)?;
        let store = CheckpointStore::open(&config.checkpoint.dir, config.preset.clone()).await?;
        let remote = remote::connect(&config).await?;

        let mut controller = Self::new(config, store, factory);
        controller.remote = remote;
        Ok(controller)
    }

    pub fn with_remote(mut self, remote: Arc<RemoteSync>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_stop(mut self, stop: Arc<dyn StopPredicate>) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Handle for requesting a checkpoint from outside the loop
    pub fn checkpoint_requests(&self) -> CheckpointRequest {
        self.requests.clone()
    }

    /// Run until the stop predicate fires or the strategy finishes
    ///
    /// Fatal errors are returned after the push worker has been drained.
    pub async fn run(mut self) -> Result<TrainingReport> {
        let pusher = self
            .remote
            .clone()
            .map(|sync| PushWorker::spawn(sync, self.config.sync.degraded_after));

        let outcome = self.drive(pusher.as_ref()).await;
        self.transition(ControllerState::Stopped);

        let push = match pusher {
            Some(worker) => Some(worker.shutdown(self.config.sync.drain_timeout).await),
            None => None,
        };

        let (session, stop_reason) = outcome?;
        let report = TrainingReport {
            stop_reason,
            final_step: session.strategy.total_steps(),
            restored_from: session.restored_from,
            checkpoints_written: session.checkpoints_written,
            periodic_checkpoints: session.periodic_checkpoints,
            last_checkpoint: session.last_checkpoint,
            push,
        };
        info!(
            reason = ?report.stop_reason,
            final_step = report.final_step,
            checkpoints = report.checkpoints_written,
            last_checkpoint = ?report.last_checkpoint,
            "Training stopped"
        );
        Ok(report)
    }

    async fn drive(&mut self, pusher: Option<&PushWorker>) -> Result<(Session, StopReason)> {
        let mut session = self.init(pusher).await?;
        self.transition(ControllerState::Running);
        let reason = self.train(&mut session, pusher).await?;
        Ok((session, reason))
    }

    async fn init(&mut self, pusher: Option<&PushWorker>) -> Result<Session> {
        let mut restored = self.store.restore_latest().await?;
        let mut restored_from = restored
            .as_ref()
            .map(|c| RestoreSource::Local {
                index: c.index(),
                path: c.path.clone(),
            })
            .unwrap_or(RestoreSource::Fresh);

        if let (Some(local), Some(remote)) = (&restored, &self.remote) {
            Self::warn_on_divergence(remote, local).await;
        }

        if restored.is_none() {
            if let Some(remote) = &self.remote {
                info!(remote = %remote.describe(), "No local checkpoint; checking remote mirror");
                restored = remote.pull_latest(&mut self.store).await?;
                if let Some(checkpoint) = &restored {
                    restored_from = RestoreSource::Remote {
                        index: checkpoint.index(),
                        path: checkpoint.path.clone(),
                    };
                }
            }
        }

        let strategy = self.factory.create(restored_from.restore_path()).await?;

        let mut session = Session {
            strategy,
            restored_from,
            next_index: 0,
            last_checkpoint: None,
            last_checkpoint_at: self.clock.elapsed(),
            checkpoints_written: 0,
            periodic_checkpoints: 0,
        };

        match restored {
            Some(checkpoint) => {
                self.verify_restored(&checkpoint, session.strategy.as_ref())?;
                info!(
                    index = checkpoint.index(),
                    step = checkpoint.step(),
                    source = ?session.restored_from,
                    "Resuming from checkpoint"
                );
                session.next_index = checkpoint.index() + 1;
                session.last_checkpoint = Some(checkpoint.index());
            }
            None => {
                info!(preset = %self.config.preset, "Starting fresh");
                // Checkpoint 0 already covers a request made before the run.
                self.requests.take();
                self.checkpoint(&mut session, pusher).await?;
                session.last_checkpoint_at = self.clock.elapsed();
            }
        }

        Ok(session)
    }

    /// The next push overwrites the remote pointer, so a remote that is
    /// ahead of the local checkpoint is about to lose its latest.
    async fn warn_on_divergence(remote: &RemoteSync, local: &Checkpoint) {
        match remote.latest_pointer().await {
            Ok(Some(pointer)) if pointer.index > local.index() => warn!(
                local_index = local.index(),
                remote_index = pointer.index,
                remote_step = pointer.step,
                remote = %remote.describe(),
                "Remote mirror is ahead of the local checkpoint; the next push will replace its latest pointer"
            ),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Could not read the remote pointer"),
        }
    }

    /// Reject a restored checkpoint that cannot belong to this run
    fn verify_restored(&self, checkpoint: &Checkpoint, strategy: &dyn Strategy) -> Result<()> {
        let index = checkpoint.index();

        if checkpoint.manifest.strategy != self.config.preset {
            return Err(Error::CheckpointCorrupted {
                index,
                reason: format!(
                    "written by strategy {} but preset {} is configured",
                    checkpoint.manifest.strategy, self.config.preset
                ),
            });
        }

        // At most one checkpoint is published per step.
        if index > checkpoint.step() {
            return Err(Error::CheckpointCorrupted {
                index,
                reason: format!("index exceeds its recorded step {}", checkpoint.step()),
            });
        }

        let actual = strategy.total_steps();
        if actual != checkpoint.step() {
            return Err(Error::StepMismatch {
                index,
                recorded: checkpoint.step(),
                actual,
            });
        }
        Ok(())
    }

    async fn train(
        &mut self,
        session: &mut Session,
        pusher: Option<&PushWorker>,
    ) -> Result<StopReason> {
        let interval = self.config.checkpoint.interval;

        loop {
            if self.stop.should_stop() {
                return Ok(StopReason::External);
            }
            if session.strategy.natural_stop() {
                return Ok(StopReason::Natural);
            }
            if let Some(max) = self.config.max_steps {
                if session.strategy.total_steps() >= max {
                    return Ok(StopReason::MaxSteps);
                }
            }

            let step = session.strategy.total_steps();
            session
                .strategy
                .step_improve()
                .await
                .map_err(|e| match e {
                    e @ Error::Strategy { .. } => e,
                    other => Error::Strategy {
                        step,
                        message: other.to_string(),
                    },
                })?;

            let now = self.clock.elapsed();
            let periodic = now.saturating_sub(session.last_checkpoint_at) >= interval;
            let requested = self.requests.take();
            if periodic || requested {
                debug!(periodic, requested, "Checkpoint due");
                self.checkpoint(session, pusher).await?;
                session.last_checkpoint_at = now;
                if periodic {
                    session.periodic_checkpoints += 1;
                }
            }
        }
    }

    /// Publish the strategy's current state and hand it to the push worker
    async fn checkpoint(&mut self, session: &mut Session, pusher: Option<&PushWorker>) -> Result<()> {
        self.transition(ControllerState::Checkpointing);

        let index = session.next_index;
        let step = session.strategy.total_steps();
        let mut handle = self.store.begin_checkpoint(index, step).await?;
        session.strategy.export_state(&mut handle).await?;
        let mut checkpoint = self.store.commit_checkpoint(handle).await?;

        let auxiliary = if self.config.export_auxiliary {
            match session.strategy.export_auxiliary().await {
                Ok(Some(artifact)) => {
                    self.store.write_auxiliary(&mut checkpoint, &artifact).await?;
                    Some(artifact)
                }
                Ok(None) => None,
                Err(e) => {
                    warn!(index, error = %e, "Auxiliary export failed; checkpoint kept");
                    None
                }
            }
        } else {
            None
        };

        let removed = self.store.prune(self.config.checkpoint.keep_count).await?;
        if !removed.is_empty() {
            debug!(?removed, "Pruned old checkpoints");
        }

        if let Some(worker) = pusher {
            worker.submit(PushJob {
                checkpoint,
                auxiliary,
            });
        }

        session.next_index = index + 1;
        session.last_checkpoint = Some(index);
        session.checkpoints_written += 1;

        self.transition(ControllerState::Running);
        Ok(())
    }

    fn transition(&mut self, next: ControllerState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Controller state change");
            self.state = next;
        }
    }
}

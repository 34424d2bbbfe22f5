//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use checkpoint::{CheckpointHandle, CheckpointStore};
use storage::{LocalStorage, StorageBackend};
use trainer::{factory_fn, ManualClock, Strategy, StrategyFactory};
use trainer_core::config::RetryConfig;
use trainer_core::{Checkpoint, Error, Result, Step, TrainerConfig};

pub const PRESET: &str = "counter";
pub const STATE_FILE: &str = "steps";

/// Backend that fails every write after the first `allowed` succeed
pub struct FlakyStorage {
    inner: LocalStorage,
    allowed: usize,
    writes: AtomicUsize,
}

impl FlakyStorage {
    pub fn new(root: &Path, allowed: usize) -> Self {
        Self {
            inner: LocalStorage::new(root),
            allowed,
            writes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl StorageBackend for FlakyStorage {
    async fn read(&self, path: &str) -> Result<Bytes> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        if self.writes.fetch_add(1, Ordering::SeqCst) >= self.allowed {
            return Err(Error::Remote {
                message: format!("connection reset while writing {}", path),
            });
        }
        self.inner.write(path, data).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.inner.delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.inner.exists(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix).await
    }

    fn describe(&self) -> String {
        format!("flaky+{}", self.inner.describe())
    }
}

/// Single attempt, no sleeping
pub fn no_retry() -> RetryConfig {
    RetryConfig {
        max_retries: 1,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(1),
        backoff_multiplier: 1.0,
        jitter: false,
    }
}

/// Strategy whose state is its step count; each step advances the clock
pub struct Counter {
    steps: Step,
    clock: Arc<ManualClock>,
    per_step: Duration,
    finish_at: Option<Step>,
}

#[async_trait]
impl Strategy for Counter {
    fn total_steps(&self) -> Step {
        self.steps
    }

    async fn step_improve(&mut self) -> Result<()> {
        self.steps += 1;
        self.clock.advance(self.per_step);
        Ok(())
    }

    async fn export_state(&self, handle: &mut CheckpointHandle) -> Result<()> {
        handle
            .write_file(STATE_FILE, Bytes::from(self.steps.to_string()))
            .await?;
        Ok(())
    }

    fn natural_stop(&self) -> bool {
        self.finish_at.is_some_and(|n| self.steps >= n)
    }
}

pub fn counter_factory(
    clock: Arc<ManualClock>,
    per_step: Duration,
    finish_at: Option<Step>,
) -> Arc<dyn StrategyFactory> {
    factory_fn(move |restore: Option<&Path>| {
        let steps = match restore {
            Some(dir) => std::fs::read_to_string(dir.join(STATE_FILE))?
                .trim()
                .parse()
                .map_err(|e| Error::Serialization(format!("bad step count: {}", e)))?,
            None => 0,
        };
        Ok(Box::new(Counter {
            steps,
            clock: clock.clone(),
            per_step,
            finish_at,
        }) as Box<dyn Strategy>)
    })
}

pub fn config(dir: &Path, interval: Duration) -> TrainerConfig {
    let mut config = TrainerConfig::default();
    config.preset = PRESET.to_string();
    config.checkpoint.dir = dir.to_path_buf();
    config.checkpoint.interval = interval;
    config.checkpoint.keep_count = 1000;
    config.sync.retry = no_retry();
    config
}

/// Commit a counter checkpoint at `index` recording `step`
pub async fn commit(store: &mut CheckpointStore, index: u64, step: Step) -> Checkpoint {
    let mut handle = store.begin_checkpoint(index, step).await.unwrap();
    handle
        .write_file(STATE_FILE, Bytes::from(step.to_string()))
        .await
        .unwrap();
    store.commit_checkpoint(handle).await.unwrap()
}

/// Every key under `root` with its contents, sorted by key
pub async fn snapshot(root: &Path) -> Vec<(String, Bytes)> {
    let storage = LocalStorage::new(root);
    let mut out = Vec::new();
    for key in storage.list("").await.unwrap() {
        let data = storage.read(&key).await.unwrap();
        out.push((key, data));
    }
    out
}

//! Stochastic hill climbing over a fixed quadratic objective
//!
//! Small enough to run anywhere, but it exercises the whole checkpoint
//! contract: binary state that must restore bit-exactly, a derived policy
//! artifact, and a natural stopping condition.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use checkpoint::{AuxiliaryArtifact, CheckpointHandle};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use trainer_core::{Error, Result, Step};

use crate::strategy::{Strategy, StrategyFactory};

pub const PRESET_NAME: &str = "hill_climb";

/// File holding the serialized climber inside a checkpoint slot
pub const STATE_FILE: &str = "state.bin";

/// Name of the exported policy artifact
pub const POLICY_FILE: &str = "policy.json";

/// Tunables for a fresh climb
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HillClimbParams {
    /// Seed for the target and for every step's proposal
    pub seed: u64,

    /// Number of parameters being optimized
    pub dimensions: usize,

    /// Initial proposal scale
    pub step_size: f64,

    /// Stop once the loss falls below this
    pub tolerance: f64,
}

impl Default for HillClimbParams {
    fn default() -> Self {
        Self {
            seed: 42,
            dimensions: 16,
            step_size: 0.5,
            tolerance: 1e-6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct ClimbState {
    steps: Step,
    params: Vec<f64>,
    target: Vec<f64>,
    loss: f64,
    step_size: f64,
}

#[derive(Serialize)]
struct Policy<'a> {
    steps: Step,
    loss: f64,
    params: &'a [f64],
}

/// Hill climbing strategy
#[derive(Debug)]
pub struct HillClimb {
    params: HillClimbParams,
    state: ClimbState,
}

impl HillClimb {
    /// Start from the origin with a seeded random target
    pub fn fresh(params: HillClimbParams) -> Self {
        let mut rng = StdRng::seed_from_u64(params.seed);
        let target: Vec<f64> = (0..params.dimensions)
            .map(|_| rng.gen_range(-1.0..1.0))
            .collect();
        let start = vec![0.0; params.dimensions];
        let state = ClimbState {
            steps: 0,
            loss: loss(&start, &target),
            params: start,
            target,
            step_size: params.step_size,
        };
        Self { params, state }
    }

    /// Rebuild from a checkpoint slot written by [`Strategy::export_state`]
    pub async fn restore(params: HillClimbParams, dir: &Path) -> Result<Self> {
        let path = dir.join(STATE_FILE);
        let data = tokio::fs::read(&path).await.map_err(|e| Error::LocalStorage {
            message: format!("Failed to read {}: {}", path.display(), e),
        })?;
        let state: ClimbState = bincode::deserialize(&data)
            .map_err(|e| Error::Serialization(format!("{}: {}", path.display(), e)))?;
        info!(steps = state.steps, loss = state.loss, "Hill climb state restored");
        Ok(Self { params, state })
    }

    /// Current objective value
    pub fn loss(&self) -> f64 {
        self.state.loss
    }
}

fn loss(params: &[f64], target: &[f64]) -> f64 {
    params
        .iter()
        .zip(target)
        .map(|(p, t)| (p - t) * (p - t))
        .sum()
}

#[async_trait]
impl Strategy for HillClimb {
    fn total_steps(&self) -> Step {
        self.state.steps
    }

    async fn step_improve(&mut self) -> Result<()> {
        // Seeding per step keeps a restored run on the same trajectory.
        let mut rng = StdRng::seed_from_u64(self.params.seed ^ self.state.steps.rotate_left(17));
        let scale = self.state.step_size;
        let candidate: Vec<f64> = self
            .state
            .params
            .iter()
            .map(|p| p + rng.gen_range(-scale..=scale))
            .collect();

        let candidate_loss = loss(&candidate, &self.state.target);
        if candidate_loss < self.state.loss {
            self.state.params = candidate;
            self.state.loss = candidate_loss;
            self.state.step_size = (scale * 1.1).min(self.params.step_size);
        } else {
            self.state.step_size = (scale * 0.98).max(f64::EPSILON);
        }

        self.state.steps += 1;
        if self.state.steps % 10_000 == 0 {
            debug!(steps = self.state.steps, loss = self.state.loss, "Hill climb progress");
        }
        Ok(())
    }

    async fn export_state(&self, handle: &mut CheckpointHandle) -> Result<()> {
        let data = bincode::serialize(&self.state)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        handle.write_file(STATE_FILE, Bytes::from(data)).await?;
        Ok(())
    }

    async fn export_auxiliary(&self) -> Result<Option<AuxiliaryArtifact>> {
        let policy = Policy {
            steps: self.state.steps,
            loss: self.state.loss,
            params: &self.state.params,
        };
        Ok(Some(AuxiliaryArtifact {
            name: POLICY_FILE.to_string(),
            data: Bytes::from(serde_json::to_vec_pretty(&policy)?),
        }))
    }

    fn natural_stop(&self) -> bool {
        self.state.loss < self.params.tolerance
    }
}

/// Factory registered as `hill_climb`
#[derive(Debug, Clone, Default)]
pub struct HillClimbFactory {
    pub params: HillClimbParams,
}

#[async_trait]
impl StrategyFactory for HillClimbFactory {
    async fn create(&self, restore_path: Option<&Path>) -> Result<Box<dyn Strategy>> {
        let strategy = match restore_path {
            Some(dir) => HillClimb::restore(self.params.clone(), dir).await?,
            None => HillClimb::fresh(self.params.clone()),
        };
        Ok(Box::new(strategy))
    }
}

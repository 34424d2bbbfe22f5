//! Strategy contract and the name-keyed registry of factories

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use checkpoint::{AuxiliaryArtifact, CheckpointHandle};
use trainer_core::{Error, Result, Step};

/// A training strategy driven by the controller
///
/// The controller owns the strategy exclusively; none of these methods are
/// called concurrently.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Number of improvement steps performed so far (restored state included)
    fn total_steps(&self) -> Step;

    /// Perform one unit of improvement
    async fn step_improve(&mut self) -> Result<()>;

    /// Serialize the full restorable state into a checkpoint slot
    async fn export_state(&self, handle: &mut CheckpointHandle) -> Result<()>;

    /// Derived artifact (e.g. a frozen policy) published next to a checkpoint
    async fn export_auxiliary(&self) -> Result<Option<AuxiliaryArtifact>> {
        Ok(None)
    }

    /// True once the strategy has finished on its own
    fn natural_stop(&self) -> bool;
}

/// Builds a strategy, either fresh or from a checkpoint directory
#[async_trait]
pub trait StrategyFactory: Send + Sync {
    async fn create(&self, restore_path: Option<&Path>) -> Result<Box<dyn Strategy>>;
}

/// Factory backed by a synchronous closure
struct FnFactory<F>(F);

#[async_trait]
impl<F> StrategyFactory for FnFactory<F>
where
    F: Fn(Option<&Path>) -> Result<Box<dyn Strategy>> + Send + Sync,
{
    async fn create(&self, restore_path: Option<&Path>) -> Result<Box<dyn Strategy>> {
        (self.0)(restore_path)
    }
}

/// Wrap a closure as a [`StrategyFactory`]
pub fn factory_fn<F>(f: F) -> Arc<dyn StrategyFactory>
where
    F: Fn(Option<&Path>) -> Result<Box<dyn Strategy>> + Send + Sync + 'static,
{
    Arc::new(FnFactory(f))
}

/// Named strategy factories, resolved once at startup
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    factories: BTreeMap<String, Arc<dyn StrategyFactory>>,
}

impl StrategyRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the presets shipped with this crate
    pub fn with_builtin_presets() -> Self {
        let mut registry = Self::new();
        crate::presets::register_builtin(&mut registry);
        registry
    }

    /// Add or replace a factory
    pub fn register(&mut self, name: impl Into<String>, factory: Arc<dyn StrategyFactory>) {
        self.factories.insert(name.into(), factory);
    }

    /// Look up a factory by preset name
    pub fn get(&self, name: &str) -> Result<Arc<dyn StrategyFactory>> {
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownStrategy {
                name: name.to_string(),
                registered: self.names().join(", "),
            })
    }

    /// Registered preset names, sorted
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

//! Strategies shipped with the driver

pub mod hill_climb;

use crate::strategy::StrategyRegistry;

pub use hill_climb::{HillClimb, HillClimbFactory, HillClimbParams};

/// Register every built-in preset under its name
pub fn register_builtin(registry: &mut StrategyRegistry) {
    registry.register(
        hill_climb::PRESET_NAME,
        std::sync::Arc::new(HillClimbFactory::default()),
    );
}

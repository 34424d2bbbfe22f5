//! Training driver
//!
//! Drives a registered [`Strategy`] through its improvement loop, publishing
//! checkpoints locally at step boundaries and mirroring them to a remote
//! object store in the background:
//! - **Strategies**: looked up by name in a [`StrategyRegistry`]
//! - **Controller**: restore, run, checkpoint and stop ([`TrainingController`])
//! - **Capabilities**: stop predicate and clock are injected, never global

pub mod cli;
pub mod clock;
pub mod controller;
pub mod presets;
pub mod remote;
pub mod stop;
pub mod strategy;

pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::{CheckpointRequest, StopReason, TrainingController, TrainingReport};
pub use stop::{NeverStop, StopFlag, StopPredicate};
pub use strategy::{factory_fn, Strategy, StrategyFactory, StrategyRegistry};

//! Trainer Core - Foundation for the checkpointing training driver
//!
//! Provides the shared checkpoint types, the error taxonomy and the
//! configuration tree used by the storage, checkpoint and trainer crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::TrainerConfig;
pub use error::{Error, Result};
pub use types::*;

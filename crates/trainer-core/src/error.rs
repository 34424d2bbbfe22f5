//! Error types for the training driver

use thiserror::Error;

use crate::types::{CheckpointIndex, Step};

/// Result type alias using the driver Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the training driver
#[derive(Error, Debug)]
pub enum Error {
    // Local checkpoint store errors
    #[error("Local storage failure: {message}")]
    LocalStorage { message: String },

    #[error("Checkpoint {index} is corrupted: {reason}")]
    CheckpointCorrupted { index: CheckpointIndex, reason: String },

    #[error("Checkpoint index must increase: requested {requested}, but {floor} is already allocated")]
    IndexNotIncreasing {
        requested: CheckpointIndex,
        floor: CheckpointIndex,
    },

    #[error("No complete checkpoint found: {reason}")]
    NoCompleteCheckpoint { reason: String },

    #[error("Restored checkpoint {index} records step {recorded} but the strategy reports step {actual}")]
    StepMismatch {
        index: CheckpointIndex,
        recorded: Step,
        actual: Step,
    },

    // Remote mirror errors
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Remote store error: {message}")]
    Remote { message: String },

    #[error("Storage path not found: {path}")]
    StoragePathNotFound { path: String },

    // Strategy errors
    #[error("Strategy step failed at step {step}: {message}")]
    Strategy { step: Step, message: String },

    #[error("Unknown strategy preset: {name} (registered: {registered})")]
    UnknownStrategy { name: String, registered: String },

    // Configuration errors
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Returns true if this error is a transient remote failure worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Storage { .. } | Error::Remote { .. })
    }

    /// Returns true if this error must terminate the process
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::LocalStorage { .. }
                | Error::CheckpointCorrupted { .. }
                | Error::IndexNotIncreasing { .. }
                | Error::StepMismatch { .. }
                | Error::NoCompleteCheckpoint { .. }
                | Error::Strategy { .. }
                | Error::UnknownStrategy { .. }
                | Error::InvalidConfig { .. }
                | Error::Internal { .. }
        )
    }

    /// Process exit code reported for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::InvalidConfig { .. } | Error::UnknownStrategy { .. } => 2,
            Error::LocalStorage { .. } | Error::Io(_) => 3,
            Error::CheckpointCorrupted { .. }
            | Error::IndexNotIncreasing { .. }
            | Error::StepMismatch { .. }
            | Error::NoCompleteCheckpoint { .. } => 4,
            Error::Strategy { .. } => 5,
            _ => 1,
        }
    }

    /// Reclassify a backend error raised against the local checkpoint directory
    ///
    /// Local disk is required infrastructure, so anything that is not already
    /// an invariant violation becomes a fatal `LocalStorage` error.
    pub fn into_local(self) -> Self {
        match self {
            e @ (Error::LocalStorage { .. }
            | Error::CheckpointCorrupted { .. }
            | Error::IndexNotIncreasing { .. }
            | Error::NoCompleteCheckpoint { .. }) => e,
            other => Error::LocalStorage {
                message: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

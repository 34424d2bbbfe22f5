//! Core type definitions for checkpoints and the remote mirror

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Checkpoint index and improvement step counters
pub type CheckpointIndex = u64;
pub type Step = u64;

/// Completeness marker written last into every checkpoint slot
pub const COMPLETE_MARKER: &str = ".complete";

/// Remote key holding the latest pointer, relative to the mirror prefix
pub const LATEST_POINTER_KEY: &str = "latest.json";

/// Subdirectory for auxiliary artifacts (never listed in the manifest)
pub const EXPORT_DIR: &str = "export";

/// Width of the zero-padded slot directory name
const SLOT_NAME_WIDTH: usize = 10;

/// Directory name for a checkpoint slot
pub fn slot_name(index: CheckpointIndex) -> String {
    format!("{:0width$}", index, width = SLOT_NAME_WIDTH)
}

/// Parse a slot directory name back into its index
///
/// Only all-digit names are accepted, so temp files and unrelated
/// directories are never mistaken for slots.
pub fn parse_slot_name(name: &str) -> Option<CheckpointIndex> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// One state file recorded in a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// File name relative to the slot directory
    pub name: String,

    /// Size in bytes at commit time
    pub size_bytes: u64,
}

/// Contents of the completeness marker
///
/// The marker doubles as the manifest: it lists every state file of the
/// checkpoint, so a restore can verify the slot before adopting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    /// Checkpoint index (must match the slot directory)
    pub index: CheckpointIndex,

    /// Strategy step counter at the time of the checkpoint
    pub step: Step,

    /// Timestamp when the checkpoint was committed
    pub created_at: DateTime<Utc>,

    /// Name of the strategy that produced the state
    pub strategy: String,

    /// State files, sorted by name
    pub files: Vec<ManifestEntry>,
}

impl CheckpointManifest {
    /// Serialize to the on-disk marker representation
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse a marker, attributing failures to the given checkpoint index
    pub fn from_bytes(index: CheckpointIndex, data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::CheckpointCorrupted {
            index,
            reason: format!("completeness marker is not a valid manifest: {}", e),
        })
    }

    /// Total size of the listed state files
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size_bytes).sum()
    }
}

/// Remote latest pointer
///
/// Holds no wall-clock fields so that re-pushing the same checkpoint writes
/// byte-identical content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestPointer {
    /// Index of the most recent fully uploaded checkpoint
    pub index: CheckpointIndex,

    /// Step recorded by that checkpoint
    pub step: Step,
}

impl LatestPointer {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::Serialization(format!(
            "remote latest pointer is unreadable: {}",
            e
        )))
    }
}

/// A committed checkpoint in the local Checkpoint Set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Slot directory on local disk
    pub path: PathBuf,

    /// Verified manifest read from the completeness marker
    pub manifest: CheckpointManifest,

    /// Auxiliary artifact written next to the state, if any
    pub auxiliary: Option<PathBuf>,
}

impl Checkpoint {
    pub fn index(&self) -> CheckpointIndex {
        self.manifest.index
    }

    pub fn step(&self) -> Step {
        self.manifest.step
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.manifest.created_at
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pointer value that names this checkpoint
    pub fn pointer(&self) -> LatestPointer {
        LatestPointer {
            index: self.index(),
            step: self.step(),
        }
    }
}

/// Where the current session's state came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreSource {
    /// No checkpoint was found; the strategy started fresh
    Fresh,

    /// Restored from a complete local checkpoint
    Local { index: CheckpointIndex, path: PathBuf },

    /// Pulled from the remote mirror and committed locally first
    Remote { index: CheckpointIndex, path: PathBuf },
}

impl RestoreSource {
    /// Local path the strategy should restore from
    pub fn restore_path(&self) -> Option<&Path> {
        match self {
            RestoreSource::Fresh => None,
            RestoreSource::Local { path, .. } | RestoreSource::Remote { path, .. } => Some(path),
        }
    }
}

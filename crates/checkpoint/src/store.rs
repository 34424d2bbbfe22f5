//! Local checkpoint store
//!
//! Every checkpoint lives in its own slot directory named after its index.
//! State files are written first; the completeness marker (a JSON manifest)
//! is written last, and only a slot with a valid marker is ever restored.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use storage::{LocalStorage, StorageBackend};
use tracing::{debug, info, warn};
use trainer_core::{
    parse_slot_name, slot_name, Checkpoint, CheckpointIndex, CheckpointManifest, Error,
    ManifestEntry, Result, Step, COMPLETE_MARKER, EXPORT_DIR,
};

/// A derived, servable form of a checkpoint's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxiliaryArtifact {
    /// File name inside the checkpoint's export directory
    pub name: String,

    /// Artifact content
    pub data: Bytes,
}

/// What a directory scan found for one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotScan {
    index: CheckpointIndex,
    has_marker: bool,
}

/// Durable local representation of the Checkpoint Set
#[derive(Debug)]
pub struct CheckpointStore {
    /// Backend rooted at the checkpoint directory
    storage: LocalStorage,

    /// Strategy name recorded in new manifests
    strategy: String,

    /// Highest index handed out by `begin_checkpoint` in this process
    last_allocated: Option<CheckpointIndex>,
}

impl CheckpointStore {
    /// Open (creating if needed) the checkpoint directory
    pub async fn open(dir: impl AsRef<Path>, strategy: impl Into<String>) -> Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::LocalStorage {
                message: format!("Failed to create checkpoint directory {}: {}", dir.display(), e),
            })?;

        Ok(Self {
            storage: LocalStorage::new(dir),
            strategy: strategy.into(),
            last_allocated: None,
        })
    }

    /// Checkpoint directory
    pub fn dir(&self) -> &Path {
        self.storage.base_path()
    }

    /// Path of the slot directory for `index`
    pub fn slot_path(&self, index: CheckpointIndex) -> PathBuf {
        self.dir().join(slot_name(index))
    }

    /// Return the highest-index complete checkpoint, if any
    ///
    /// Slots without a marker are skipped. A slot whose marker exists but does
    /// not match its contents is corruption and fails the restore.
    pub async fn restore_latest(&self) -> Result<Option<Checkpoint>> {
        let slots = self.scan().await?;

        if let Some(slot) = slots.iter().rev().find(|s| s.has_marker) {
            let checkpoint = self.verify(slot.index).await?;
            let skipped = slots
                .iter()
                .filter(|s| !s.has_marker && s.index > slot.index)
                .count();
            if skipped > 0 {
                warn!(
                    index = slot.index,
                    skipped, "Ignoring newer incomplete checkpoint slots"
                );
            }
            info!(
                index = checkpoint.index(),
                step = checkpoint.step(),
                path = %checkpoint.path.display(),
                "Found latest complete checkpoint"
            );
            return Ok(Some(checkpoint));
        }

        if !slots.is_empty() {
            warn!(
                dir = %self.dir().display(),
                incomplete = slots.len(),
                "No complete checkpoint found though directory non-empty"
            );
        }
        Ok(None)
    }

    /// Allocate a new slot for checkpoint `index` at `step`
    ///
    /// `index` must be greater than every committed index on disk and every
    /// index already allocated by this store. A leftover incomplete slot at
    /// `index` is discarded first.
    pub async fn begin_checkpoint(
        &mut self,
        index: CheckpointIndex,
        step: Step,
    ) -> Result<CheckpointHandle> {
        let slots = self.scan().await?;
        let committed = slots.iter().filter(|s| s.has_marker).map(|s| s.index).max();
        let floor = committed.max(self.last_allocated);

        if let Some(floor) = floor {
            if index <= floor {
                return Err(Error::IndexNotIncreasing {
                    requested: index,
                    floor,
                });
            }
        }

        let prefix = slot_prefix(index);
        if slots.iter().any(|s| s.index == index) {
            warn!(index, "Discarding incomplete slot left by an interrupted write");
            self.storage
                .delete_prefix(&prefix)
                .await
                .map_err(Error::into_local)?;
        }

        let path = self.slot_path(index);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| Error::LocalStorage {
                message: format!("Failed to create slot {}: {}", path.display(), e),
            })?;

        self.last_allocated = Some(index);
        debug!(index, step, "Allocated checkpoint slot");

        Ok(CheckpointHandle {
            index,
            step,
            strategy: self.strategy.clone(),
            created_at: None,
            path,
            prefix,
            storage: self.storage.clone(),
            files: BTreeMap::new(),
        })
    }

    /// Publish a checkpoint by writing its completeness marker
    pub async fn commit_checkpoint(&self, handle: CheckpointHandle) -> Result<Checkpoint> {
        let manifest = CheckpointManifest {
            index: handle.index,
            step: handle.step,
            created_at: handle.created_at.unwrap_or_else(Utc::now),
            strategy: handle.strategy,
            files: handle
                .files
                .into_iter()
                .map(|(name, size_bytes)| ManifestEntry { name, size_bytes })
                .collect(),
        };

        let marker = format!("{}{}", handle.prefix, COMPLETE_MARKER);
        self.storage
            .write(&marker, Bytes::from(manifest.to_bytes()?))
            .await
            .map_err(Error::into_local)?;
        sync_dir(&handle.path).await?;

        info!(
            index = manifest.index,
            step = manifest.step,
            files = manifest.files.len(),
            size_bytes = manifest.total_bytes(),
            "Checkpoint committed"
        );

        Ok(Checkpoint {
            path: handle.path,
            manifest,
            auxiliary: None,
        })
    }

    /// Write an auxiliary artifact into a committed checkpoint's export directory
    pub async fn write_auxiliary(
        &self,
        checkpoint: &mut Checkpoint,
        artifact: &AuxiliaryArtifact,
    ) -> Result<()> {
        validate_file_name(checkpoint.index(), &artifact.name)?;
        let key = format!(
            "{}{}/{}",
            slot_prefix(checkpoint.index()),
            EXPORT_DIR,
            artifact.name
        );
        self.storage
            .write(&key, artifact.data.clone())
            .await
            .map_err(Error::into_local)?;

        let path = checkpoint.path.join(EXPORT_DIR).join(&artifact.name);
        debug!(index = checkpoint.index(), path = %path.display(), "Auxiliary artifact written");
        checkpoint.auxiliary = Some(path);
        Ok(())
    }

    /// Delete complete checkpoints beyond `keep_count` and stale incomplete slots
    ///
    /// The newest complete checkpoint is never removed. Returns the removed indices.
    pub async fn prune(&self, keep_count: usize) -> Result<Vec<CheckpointIndex>> {
        let slots = self.scan().await?;
        let complete: Vec<_> = slots.iter().filter(|s| s.has_marker).map(|s| s.index).collect();
        let Some(&newest) = complete.last() else {
            return Ok(Vec::new());
        };

        let keep = keep_count.max(1);
        let mut doomed: BTreeSet<CheckpointIndex> = complete
            .iter()
            .take(complete.len().saturating_sub(keep))
            .copied()
            .collect();
        doomed.extend(
            slots
                .iter()
                .filter(|s| !s.has_marker && s.index < newest)
                .map(|s| s.index),
        );

        for index in &doomed {
            self.storage
                .delete_prefix(&slot_prefix(*index))
                .await
                .map_err(Error::into_local)?;
        }

        if !doomed.is_empty() {
            debug!(removed = ?doomed, keep, "Pruned old checkpoint slots");
        }
        Ok(doomed.into_iter().collect())
    }

    /// Read a committed checkpoint's marker and check it against the slot
    async fn verify(&self, index: CheckpointIndex) -> Result<Checkpoint> {
        let prefix = slot_prefix(index);
        let raw = self
            .storage
            .read(&format!("{}{}", prefix, COMPLETE_MARKER))
            .await
            .map_err(Error::into_local)?;
        let manifest = CheckpointManifest::from_bytes(index, &raw)?;

        if manifest.index != index {
            return Err(Error::CheckpointCorrupted {
                index,
                reason: format!(
                    "completeness marker records index {} but lives in slot {}",
                    manifest.index,
                    slot_name(index)
                ),
            });
        }

        let path = self.slot_path(index);
        for entry in &manifest.files {
            validate_file_name(index, &entry.name)?;
            let file = path.join(&entry.name);
            let size = match tokio::fs::metadata(&file).await {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Error::CheckpointCorrupted {
                        index,
                        reason: format!("marker lists file {} which is missing", entry.name),
                    });
                }
                Err(e) => {
                    return Err(Error::LocalStorage {
                        message: format!("Failed to stat {}: {}", file.display(), e),
                    });
                }
            };
            if size != entry.size_bytes {
                return Err(Error::CheckpointCorrupted {
                    index,
                    reason: format!(
                        "file {} is {} bytes but the marker records {}",
                        entry.name, size, entry.size_bytes
                    ),
                });
            }
        }

        let export_dir = path.join(EXPORT_DIR);
        let auxiliary = first_file_in(&export_dir).await;

        Ok(Checkpoint {
            path,
            manifest,
            auxiliary,
        })
    }

    /// Group the directory's files by slot, ascending by index
    async fn scan(&self) -> Result<Vec<SlotScan>> {
        let keys = self.storage.list("").await.map_err(Error::into_local)?;
        let mut slots: BTreeMap<CheckpointIndex, bool> = BTreeMap::new();

        for key in keys {
            let Some((dir, rest)) = key.split_once('/') else {
                continue;
            };
            let Some(index) = parse_slot_name(dir) else {
                continue;
            };
            let has_marker = slots.entry(index).or_insert(false);
            if rest == COMPLETE_MARKER {
                *has_marker = true;
            }
        }

        // Empty slot directories hold no files but still occupy an index.
        let mut entries = tokio::fs::read_dir(self.dir())
            .await
            .map_err(|e| Error::LocalStorage {
                message: format!("Failed to scan {}: {}", self.dir().display(), e),
            })?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| Error::LocalStorage {
            message: format!("Failed to scan {}: {}", self.dir().display(), e),
        })? {
            if let Some(index) = parse_slot_name(&entry.file_name().to_string_lossy()) {
                slots.entry(index).or_insert(false);
            }
        }

        Ok(slots
            .into_iter()
            .map(|(index, has_marker)| SlotScan { index, has_marker })
            .collect())
    }
}

/// Writable slot returned by [`CheckpointStore::begin_checkpoint`]
#[derive(Debug)]
pub struct CheckpointHandle {
    index: CheckpointIndex,
    step: Step,
    strategy: String,
    created_at: Option<DateTime<Utc>>,
    path: PathBuf,
    prefix: String,
    storage: LocalStorage,
    files: BTreeMap<String, u64>,
}

impl CheckpointHandle {
    pub fn index(&self) -> CheckpointIndex {
        self.index
    }

    pub fn step(&self) -> Step {
        self.step
    }

    /// Slot directory being written
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one state file into the slot
    ///
    /// Writing the same name twice replaces the earlier content.
    pub async fn write_file(&mut self, name: &str, data: Bytes) -> Result<u64> {
        validate_file_name(self.index, name)?;
        let size = self
            .storage
            .write(&format!("{}{}", self.prefix, name), data)
            .await
            .map_err(Error::into_local)?;
        self.files.insert(name.to_string(), size);
        Ok(size)
    }

    /// Keep provenance from a manifest produced elsewhere (remote pull)
    pub(crate) fn adopt(&mut self, manifest: &CheckpointManifest) {
        self.strategy = manifest.strategy.clone();
        self.created_at = Some(manifest.created_at);
    }
}

fn slot_prefix(index: CheckpointIndex) -> String {
    format!("{}/", slot_name(index))
}

/// State files are flat names inside the slot; the marker name is reserved
fn validate_file_name(index: CheckpointIndex, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != COMPLETE_MARKER
        && name != EXPORT_DIR
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\');
    if valid {
        Ok(())
    } else {
        Err(Error::CheckpointCorrupted {
            index,
            reason: format!("invalid checkpoint file name {:?}", name),
        })
    }
}

/// Make a directory entry durable after its files were renamed into place
async fn sync_dir(path: &Path) -> Result<()> {
    let dir = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::LocalStorage {
            message: format!("Failed to open {} for sync: {}", path.display(), e),
        })?;
    dir.sync_all().await.map_err(|e| Error::LocalStorage {
        message: format!("Failed to sync {}: {}", path.display(), e),
    })
}

async fn first_file_in(dir: &Path) -> Option<PathBuf> {
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            return Some(entry.path());
        }
    }
    None
}

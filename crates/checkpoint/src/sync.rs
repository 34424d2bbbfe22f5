//! Remote mirror of the local Checkpoint Set
//!
//! The mirror reuses the local slot layout under the backend's prefix and adds
//! a `latest.json` pointer. The pointer is only written after every file and
//! the marker of a checkpoint are confirmed remotely, so an interrupted push
//! leaves the previous latest authoritative. The last completed push names
//! the latest checkpoint, whatever its index.

use std::sync::Arc;

use bytes::Bytes;
use storage::{with_retry, StorageBackend};
use tracing::{debug, info, instrument};
use trainer_core::config::RetryConfig;
use trainer_core::{
    parse_slot_name, slot_name, Checkpoint, CheckpointIndex, CheckpointManifest, Error,
    LatestPointer, Result, COMPLETE_MARKER, EXPORT_DIR, LATEST_POINTER_KEY,
};

use crate::store::{AuxiliaryArtifact, CheckpointStore};

/// Result of a successful push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    /// Checkpoint that was uploaded
    pub index: CheckpointIndex,

    /// Bytes uploaded, marker included
    pub bytes: u64,
}

/// Uploads and downloads checkpoints to and from an object store
pub struct RemoteSync {
    backend: Arc<dyn StorageBackend>,
    retry: RetryConfig,
}

impl RemoteSync {
    pub fn new(backend: Arc<dyn StorageBackend>, retry: RetryConfig) -> Self {
        Self { backend, retry }
    }

    /// Where the mirror lives, for logs
    pub fn describe(&self) -> String {
        self.backend.describe()
    }

    /// Read the remote latest pointer, if one has been written
    pub async fn latest_pointer(&self) -> Result<Option<LatestPointer>> {
        match self.read(LATEST_POINTER_KEY).await {
            Ok(raw) => Ok(Some(LatestPointer::from_bytes(&raw)?)),
            Err(Error::StoragePathNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Upload every file of a committed checkpoint, then advance the pointer
    ///
    /// Re-pushing the same checkpoint writes identical objects. The pointer
    /// is overwritten unconditionally once the upload is complete.
    #[instrument(skip(self, checkpoint), fields(index = checkpoint.index(), step = checkpoint.step()))]
    pub async fn push(&self, checkpoint: &Checkpoint) -> Result<PushOutcome> {
        let index = checkpoint.index();
        let prefix = slot_name(index);
        let mut bytes = 0;

        for entry in &checkpoint.manifest.files {
            let data = read_local(&checkpoint.path.join(&entry.name)).await?;
            bytes += self.write(&format!("{}/{}", prefix, entry.name), data).await?;
        }

        // The marker goes up byte-for-byte so consumers can verify it the same way.
        let marker = read_local(&checkpoint.path.join(COMPLETE_MARKER)).await?;
        bytes += self
            .write(&format!("{}/{}", prefix, COMPLETE_MARKER), marker)
            .await?;

        let pointer = checkpoint.pointer();
        self.write(LATEST_POINTER_KEY, Bytes::from(pointer.to_bytes()?))
            .await?;

        info!(index, bytes, remote = %self.describe(), "Checkpoint pushed");

        Ok(PushOutcome { index, bytes })
    }

    /// Download the remote latest checkpoint into `store` and commit it
    ///
    /// Returns `None` when the mirror holds no complete checkpoint.
    #[instrument(skip(self, store))]
    pub async fn pull_latest(&self, store: &mut CheckpointStore) -> Result<Option<Checkpoint>> {
        let Some(index) = self.resolve_latest().await? else {
            info!(remote = %self.describe(), "Remote mirror holds no checkpoint");
            return Ok(None);
        };

        let prefix = slot_name(index);
        let raw = match self.read(&format!("{}/{}", prefix, COMPLETE_MARKER)).await {
            Ok(raw) => raw,
            Err(Error::StoragePathNotFound { .. }) => {
                return Err(Error::NoCompleteCheckpoint {
                    reason: format!(
                        "remote pointer names checkpoint {} but its completeness marker is missing",
                        index
                    ),
                });
            }
            Err(e) => return Err(e),
        };
        let manifest = CheckpointManifest::from_bytes(index, &raw)?;
        if manifest.index != index {
            return Err(Error::CheckpointCorrupted {
                index,
                reason: format!(
                    "remote marker records index {} but lives under {}",
                    manifest.index, prefix
                ),
            });
        }

        let mut handle = store.begin_checkpoint(index, manifest.step).await?;
        handle.adopt(&manifest);

        for entry in &manifest.files {
            let data = match self.read(&format!("{}/{}", prefix, entry.name)).await {
                Ok(data) => data,
                Err(Error::StoragePathNotFound { .. }) => {
                    return Err(Error::CheckpointCorrupted {
                        index,
                        reason: format!("remote marker lists file {} which is missing", entry.name),
                    });
                }
                Err(e) => return Err(e),
            };
            if data.len() as u64 != entry.size_bytes {
                return Err(Error::CheckpointCorrupted {
                    index,
                    reason: format!(
                        "remote file {} is {} bytes but the marker records {}",
                        entry.name,
                        data.len(),
                        entry.size_bytes
                    ),
                });
            }
            handle.write_file(&entry.name, data).await?;
        }

        let checkpoint = store.commit_checkpoint(handle).await?;
        info!(
            index,
            step = checkpoint.step(),
            remote = %self.describe(),
            "Pulled remote checkpoint into local store"
        );
        Ok(Some(checkpoint))
    }

    /// Upload a derived artifact next to a pushed checkpoint
    #[instrument(skip(self, checkpoint, artifact), fields(index = checkpoint.index(), artifact = %artifact.name))]
    pub async fn export_auxiliary(
        &self,
        checkpoint: &Checkpoint,
        artifact: &AuxiliaryArtifact,
    ) -> Result<u64> {
        let key = format!(
            "{}/{}/{}",
            slot_name(checkpoint.index()),
            EXPORT_DIR,
            artifact.name
        );
        let bytes = self.write(&key, artifact.data.clone()).await?;
        info!(bytes, "Auxiliary artifact exported");
        Ok(bytes)
    }

    /// Index named by the pointer, or the highest marked slot when no pointer exists
    async fn resolve_latest(&self) -> Result<Option<CheckpointIndex>> {
        if let Some(pointer) = self.latest_pointer().await? {
            return Ok(Some(pointer.index));
        }

        let keys = with_retry(&self.retry, "list", || self.backend.list("")).await?;
        let latest = keys
            .iter()
            .filter_map(|key| key.split_once('/'))
            .filter(|(_, rest)| *rest == COMPLETE_MARKER)
            .filter_map(|(dir, _)| parse_slot_name(dir))
            .max();
        if let Some(index) = latest {
            debug!(index, "No remote pointer; resolved latest by listing");
        }
        Ok(latest)
    }

    async fn read(&self, key: &str) -> Result<Bytes> {
        with_retry(&self.retry, "read", || self.backend.read(key)).await
    }

    async fn write(&self, key: &str, data: Bytes) -> Result<u64> {
        with_retry(&self.retry, "write", || self.backend.write(key, data.clone())).await
    }
}

async fn read_local(path: &std::path::Path) -> Result<Bytes> {
    tokio::fs::read(path)
        .await
        .map(Bytes::from)
        .map_err(|e| Error::LocalStorage {
            message: format!("Failed to read {} for upload: {}", path.display(), e),
        })
}

//! Remote mirror selection from configuration

use std::sync::Arc;

use checkpoint::RemoteSync;
use storage::{LocalStorage, StorageBackend};
use tracing::{info, warn};
use trainer_core::{Result, TrainerConfig};

/// Connect the configured mirror, if any
///
/// A `file://` endpoint selects a directory mirror (bucket optional);
/// otherwise a bucket selects S3. With neither the driver runs local-only.
pub async fn connect(config: &TrainerConfig) -> Result<Option<Arc<RemoteSync>>> {
    let remote = &config.remote;

    let backend: Arc<dyn StorageBackend> = if let Some(root) = remote.file_root() {
        let mut base = root;
        if let Some(bucket) = &remote.bucket {
            base.push(bucket);
        }
        if !remote.prefix.is_empty() {
            base.push(remote.prefix.trim_matches('/'));
        }
        Arc::new(LocalStorage::new(base))
    } else if remote.bucket.is_some() {
        s3_backend(config).await?
    } else {
        warn!("No remote bucket configured; checkpoints stay on local disk only");
        return Ok(None);
    };

    let sync = RemoteSync::new(backend, config.sync.retry.clone());
    info!(remote = %sync.describe(), "Remote mirror configured");
    Ok(Some(Arc::new(sync)))
}

#[cfg(feature = "s3")]
async fn s3_backend(config: &TrainerConfig) -> Result<Arc<dyn StorageBackend>> {
    let s3 = storage::S3Config::from_remote(&config.remote)?;
    Ok(Arc::new(storage::S3Storage::with_config(s3).await))
}

#[cfg(not(feature = "s3"))]
async fn s3_backend(_config: &TrainerConfig) -> Result<Arc<dyn StorageBackend>> {
    Err(trainer_core::Error::InvalidConfig {
        message: "a remote bucket is configured but this build has no s3 support".to_string(),
    })
}

//! Storage backend trait definition
//!
//! Keys are `/`-separated paths relative to the backend root (a directory
//! for [`LocalStorage`](crate::LocalStorage), a bucket prefix for S3).

use async_trait::async_trait;
use bytes::Bytes;
use trainer_core::Result;

/// Async trait for object-store style backends
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read the object stored at `path`
    ///
    /// # Errors
    /// `StoragePathNotFound` if nothing is stored there
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Write `data` to `path`, replacing any previous object
    ///
    /// A reader never observes a partially written object: local writes go
    /// through a temp file and rename, S3 objects appear on completion.
    ///
    /// # Returns
    /// Number of bytes written
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Delete the object at `path`
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if an object exists at `path`
    async fn exists(&self, path: &str) -> Result<bool>;

    /// List all object keys starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete every object under `prefix`
    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        for key in self.list(prefix).await? {
            self.delete(&key).await?;
        }
        Ok(())
    }

    /// Human-readable location for log fields
    fn describe(&self) -> String;
}

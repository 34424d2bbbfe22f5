//! Local filesystem storage backend
//!
//! Provides async file I/O with atomic writes to prevent partial/corrupt files.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use trainer_core::{Error, Result};
use uuid::Uuid;

use crate::StorageBackend;

/// Suffix of in-flight temp files; they never appear in listings
const TEMP_SUFFIX: &str = ".tmp";

/// Local filesystem storage backend
///
/// Stores objects as files under a root directory with support for:
/// - Atomic writes (write to a hidden .tmp sibling, fsync, then rename)
/// - Automatic directory creation
/// - Recursive listing with `/`-separated keys
#[derive(Debug, Clone)]
pub struct LocalStorage {
    /// Root directory for all keys
    base_path: PathBuf,
}

impl LocalStorage {
    /// Create a new LocalStorage rooted at `base_path`
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    /// Get the base path
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a key to a path under the root, rejecting escapes
    pub fn resolve_path(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(Error::Storage {
                message: format!("key {:?} escapes the storage root", path),
            });
        }
        Ok(self.base_path.join(relative))
    }

    /// Generate a unique temporary sibling for `full_path`
    fn temp_path(full_path: &Path) -> PathBuf {
        let temp_name = format!(
            ".{}.{}{}",
            full_path.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4(),
            TEMP_SUFFIX
        );
        full_path.with_file_name(temp_name)
    }

    fn is_temp_file(name: &str) -> bool {
        name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
    }

    /// Turn an absolute file path back into a `/`-separated key
    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.base_path).ok()?;
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    #[instrument(skip(self), fields(backend = "local"))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        let full_path = self.resolve_path(path)?;
        debug!(?full_path, "Reading file");

        match fs::read(&full_path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::StoragePathNotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(Error::Storage {
                message: format!("Failed to read {}: {}", path, e),
            }),
        }
    }

    #[instrument(skip(self, data), fields(backend = "local", size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let full_path = self.resolve_path(path)?;
        let temp_path = Self::temp_path(&full_path);
        let size = data.len() as u64;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage {
                    message: format!("Failed to create directory {:?}: {}", parent, e),
                })?;
        }

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::Storage {
                message: format!("Failed to create temp file {:?}: {}", temp_path, e),
            })?;

        let written = async {
            file.write_all(&data).await?;
            file.sync_all().await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Error::Storage {
                message: format!("Failed to write {}: {}", path, e),
            });
        }

        fs::rename(&temp_path, &full_path)
            .await
            .map_err(|e| Error::Storage {
                message: format!("Failed to rename {:?} to {:?}: {}", temp_path, full_path, e),
            })?;

        debug!(?full_path, size, "File written atomically");
        Ok(size)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path)?;

        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::StoragePathNotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(Error::Storage {
                message: format!("Failed to delete {}: {}", path, e),
            }),
        }
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.resolve_path(path)?;
        Ok(fs::metadata(&full_path).await.is_ok())
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut results = Vec::new();
        if fs::metadata(&self.base_path).await.is_err() {
            return Ok(results);
        }

        let mut stack = vec![self.base_path.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = fs::read_dir(&dir).await.map_err(|e| Error::Storage {
                message: format!("Failed to list {:?}: {}", dir, e),
            })?;

            while let Some(entry) = entries.next_entry().await.map_err(|e| Error::Storage {
                message: format!("Failed to list {:?}: {}", dir, e),
            })? {
                let entry_path = entry.path();
                let file_type = entry.file_type().await.map_err(|e| Error::Storage {
                    message: format!("Failed to stat {:?}: {}", entry_path, e),
                })?;

                if file_type.is_dir() {
                    stack.push(entry_path);
                } else if file_type.is_file() {
                    if Self::is_temp_file(&entry.file_name().to_string_lossy()) {
                        continue;
                    }
                    if let Some(key) = self.key_for(&entry_path) {
                        if key.starts_with(prefix) {
                            results.push(key);
                        }
                    }
                }
            }
        }

        results.sort();
        debug!(count = results.len(), "Found files");
        Ok(results)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let trimmed = prefix.trim_end_matches('/');
        let full_path = self.resolve_path(trimmed)?;

        // A directory prefix is removed wholesale so no empty slot dirs linger.
        if !trimmed.is_empty() && fs::metadata(&full_path).await.map(|m| m.is_dir()).unwrap_or(false) {
            return fs::remove_dir_all(&full_path)
                .await
                .map_err(|e| Error::Storage {
                    message: format!("Failed to remove {:?}: {}", full_path, e),
                });
        }

        for key in self.list(prefix).await? {
            self.delete(&key).await?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("file://{}", self.base_path.display())
    }
}

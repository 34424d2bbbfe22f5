//! Storage - Object-store backends for the checkpoint mirror
//!
//! Provides async storage operations with support for:
//! - Local filesystem (default feature), used for the checkpoint directory
//!   and for directory-backed mirrors
//! - Amazon S3 / S3-compatible storage (with `s3` feature)
//! - Bounded exponential-backoff retries for transient failures
//!
//! # Example
//!
//! ```no_run
//! use storage::{StorageBackend, LocalStorage};
//! use bytes::Bytes;
//!
//! # async fn example() -> trainer_core::Result<()> {
//! let storage = LocalStorage::new("/tmp/mirror");
//! storage.write("0000000001/state.bin", Bytes::from(vec![1, 2, 3])).await?;
//! let data = storage.read("0000000001/state.bin").await?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod local;
pub mod retry;

#[cfg(feature = "s3")]
mod s3;

pub use backend::StorageBackend;
pub use local::LocalStorage;
pub use retry::with_retry;

#[cfg(feature = "s3")]
pub use s3::{S3Config, S3Storage};

//! Driver configuration types

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Main driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Registered strategy preset to train
    pub preset: String,

    /// Stop after this many total steps (None: run until natural stop)
    pub max_steps: Option<u64>,

    /// Also produce the auxiliary (servable) artifact for each checkpoint
    pub export_auxiliary: bool,

    /// Local checkpoint settings
    pub checkpoint: CheckpointConfig,

    /// Remote mirror settings
    pub remote: RemoteConfig,

    /// Push worker settings
    pub sync: SyncConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            preset: "hill_climb".to_string(),
            max_steps: None,
            export_auxiliary: true,
            checkpoint: CheckpointConfig::default(),
            remote: RemoteConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl TrainerConfig {
    /// Load a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| Error::InvalidConfig {
            message: format!("cannot read config file {}: {}", path.display(), e),
        })?;
        serde_json::from_str(&raw).map_err(|e| Error::InvalidConfig {
            message: format!("cannot parse config file {}: {}", path.display(), e),
        })
    }

    /// Reject settings the controller cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.preset.trim().is_empty() {
            return Err(invalid("preset name must not be empty"));
        }
        if self.checkpoint.interval.is_zero() {
            return Err(invalid("checkpoint interval must be greater than zero"));
        }
        if self.checkpoint.keep_count == 0 {
            return Err(invalid("keep_count must be at least 1"));
        }
        if let Some(bucket) = &self.remote.bucket {
            if bucket.trim().is_empty() {
                return Err(invalid("remote bucket must not be an empty string"));
            }
        }
        if self.sync.retry.max_retries == 0 {
            return Err(invalid("retry.max_retries must be at least 1"));
        }
        if self.sync.retry.backoff_multiplier < 1.0 {
            return Err(invalid("retry.backoff_multiplier must be >= 1.0"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> Error {
    Error::InvalidConfig {
        message: message.to_string(),
    }
}

/// Local checkpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Directory holding one slot per checkpoint index
    pub dir: PathBuf,

    /// Minimum time between periodic checkpoints
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Number of complete checkpoints to keep locally
    pub keep_count: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./checkpoint"),
            interval: Duration::from_secs(900),
            keep_count: 5,
        }
    }
}

/// Remote mirror configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Bucket name; no bucket means the driver runs local-only
    pub bucket: Option<String>,

    /// Prefix under which the mirror lives
    pub prefix: String,

    /// Region of the bucket
    pub region: String,

    /// Custom endpoint (MinIO, LocalStack, or `file://` for a directory mirror)
    pub endpoint_url: Option<String>,

    /// Force path-style addressing (required for MinIO)
    pub force_path_style: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            prefix: String::new(),
            region: "us-west-2".to_string(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl RemoteConfig {
    /// Directory root when the endpoint is a `file://` URL
    pub fn file_root(&self) -> Option<PathBuf> {
        self.endpoint_url
            .as_deref()
            .and_then(|url| url.strip_prefix("file://"))
            .map(PathBuf::from)
    }
}

/// Push worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Retry policy for individual remote operations
    pub retry: RetryConfig,

    /// How long shutdown waits for an in-flight push
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,

    /// Consecutive failed pushes before durability is reported as degraded
    pub degraded_after: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            drain_timeout: Duration::from_secs(60),
            degraded_after: 3,
        }
    }
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts per operation
    pub max_retries: u32,

    /// Initial delay before first retry
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Add jitter to prevent thundering herd
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Backoff delay before the retry following `attempt` (0-based), without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Duration serialization helper for human-readable formats
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

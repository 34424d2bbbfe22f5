//! Command-line surface
//!
//! Every flag falls back to an environment variable, so the driver can be
//! configured entirely from the environment. Flags override `--config`,
//! which overrides the built-in defaults.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use trainer_core::{Result, TrainerConfig};

#[derive(Parser, Debug, Clone)]
#[command(name = "trainer", version, about = "Single-node training driver with checkpoint sync")]
pub struct Cli {
    /// Strategy preset to train [default: hill_climb]
    #[arg(long, env = "TRAINER_PRESET")]
    pub preset: Option<String>,

    /// Local checkpoint directory [default: ./checkpoint]
    #[arg(short = 'c', long, env = "LOCAL_MODEL_DIRECTORY")]
    pub local_model_directory: Option<PathBuf>,

    /// Bucket for the remote mirror; unset means local-only
    #[arg(long, env = "MODEL_S3_BUCKET")]
    pub model_s3_bucket: Option<String>,

    /// Key prefix inside the bucket
    #[arg(long, env = "MODEL_S3_PREFIX")]
    pub model_s3_prefix: Option<String>,

    /// Region of the bucket [default: us-west-2]
    #[arg(long, env = "AWS_REGION")]
    pub aws_region: Option<String>,

    /// Custom endpoint (MinIO, LocalStack, or file:///path for a directory mirror)
    #[arg(long, env = "S3_ENDPOINT_URL")]
    pub s3_endpoint_url: Option<String>,

    /// Seconds between periodic checkpoints [default: 900]
    #[arg(long, env = "CHECKPOINT_SAVE_SECS")]
    pub checkpoint_save_secs: Option<u64>,

    /// Export the strategy's auxiliary artifact with each checkpoint [default: true]
    #[arg(long, env = "SAVE_FROZEN_GRAPH")]
    pub save_frozen_graph: Option<bool>,

    /// Complete checkpoints kept on local disk [default: 5]
    #[arg(long, env = "KEEP_CHECKPOINTS")]
    pub keep_checkpoints: Option<usize>,

    /// Stop after this many total steps
    #[arg(long, env = "MAX_STEPS")]
    pub max_steps: Option<u64>,

    /// JSON configuration file
    #[arg(long, env = "TRAINER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,
}

impl Cli {
    /// Merge flags over the config file (or defaults) and validate
    pub fn into_config(self) -> Result<TrainerConfig> {
        let mut config = match &self.config {
            Some(path) => TrainerConfig::from_json_file(path)?,
            None => TrainerConfig::default(),
        };

        if let Some(preset) = self.preset {
            config.preset = preset;
        }
        if let Some(dir) = self.local_model_directory {
            config.checkpoint.dir = dir;
        }
        if let Some(bucket) = self.model_s3_bucket {
            config.remote.bucket = Some(bucket);
        }
        if let Some(prefix) = self.model_s3_prefix {
            config.remote.prefix = prefix;
        }
        if let Some(region) = self.aws_region {
            config.remote.region = region;
        }
        if let Some(endpoint) = self.s3_endpoint_url {
            config.remote.force_path_style = !endpoint.starts_with("file://");
            config.remote.endpoint_url = Some(endpoint);
        }
        if let Some(secs) = self.checkpoint_save_secs {
            config.checkpoint.interval = Duration::from_secs(secs);
        }
        if let Some(export) = self.save_frozen_graph {
            config.export_auxiliary = export;
        }
        if let Some(keep) = self.keep_checkpoints {
            config.checkpoint.keep_count = keep;
        }
        if let Some(max_steps) = self.max_steps {
            config.max_steps = Some(max_steps);
        }

        config.validate()?;
        Ok(config)
    }
}

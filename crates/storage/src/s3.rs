//! S3 storage backend
//!
//! Provides async S3-compatible storage with:
//! - Multipart uploads for large checkpoint files
//! - A key prefix so one bucket can hold many training runs
//! - Custom endpoint support (for MinIO, LocalStack, etc.)
//!
//! Retries are not performed here; callers wrap operations in
//! [`with_retry`](crate::with_retry) with their own policy.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::Builder as S3ConfigBuilder,
    primitives::ByteStream,
    types::{CompletedMultipartUpload, CompletedPart},
    Client,
};
use bytes::Bytes;
use tracing::{debug, instrument, warn};
use trainer_core::config::RemoteConfig;
use trainer_core::{Error, Result};

use crate::StorageBackend;

/// Threshold for switching to multipart upload (8 MB)
const MULTIPART_THRESHOLD: usize = 8 * 1024 * 1024;

/// Part size for multipart uploads (S3 requires at least 5 MB)
const MULTIPART_PART_SIZE: usize = 8 * 1024 * 1024;

/// S3-compatible storage backend
#[derive(Debug, Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
    prefix: String,
}

/// Configuration for S3Storage
#[derive(Debug, Clone)]
pub struct S3Config {
    /// S3 bucket name
    pub bucket: String,
    /// Prefix for all keys (e.g., "run-42")
    pub prefix: String,
    /// Optional custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// AWS region
    pub region: String,
    /// Force path-style addressing (required for MinIO)
    pub force_path_style: bool,
}

impl S3Config {
    /// Build from the driver's remote settings
    pub fn from_remote(remote: &RemoteConfig) -> Result<Self> {
        let bucket = remote.bucket.clone().ok_or_else(|| Error::InvalidConfig {
            message: "an S3 mirror needs a bucket".to_string(),
        })?;
        Ok(Self {
            bucket,
            prefix: remote.prefix.clone(),
            endpoint_url: remote.endpoint_url.clone(),
            region: remote.region.clone(),
            force_path_style: remote.force_path_style,
        })
    }
}

impl S3Storage {
    /// Create a new S3Storage
    ///
    /// Credentials come from the default AWS provider chain (environment,
    /// profile, instance role).
    pub async fn with_config(config: S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        if let Some(endpoint) = &config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Self {
            client: Client::from_conf(s3_config_builder.build()),
            bucket: config.bucket,
            prefix: normalize_prefix(&config.prefix),
        }
    }

    /// Full object key for a relative path
    fn s3_key(&self, path: &str) -> String {
        join_key(&self.prefix, path)
    }

    /// Perform multipart upload for large files
    async fn multipart_upload(&self, key: &str, data: Bytes) -> Result<u64> {
        let size = data.len() as u64;

        let create_result = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| remote(format!("Failed to initiate multipart upload for {}: {}", key, e)))?;

        let upload_id = create_result
            .upload_id()
            .ok_or_else(|| remote(format!("No upload_id returned for {}", key)))?
            .to_string();

        debug!(key, %upload_id, size, "Started multipart upload");

        let mut completed_parts = Vec::new();
        for (i, chunk) in data.chunks(MULTIPART_PART_SIZE).enumerate() {
            let part_number = i as i32 + 1;
            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await;

            let uploaded = match uploaded {
                Ok(output) => output,
                Err(e) => {
                    self.abort_multipart_upload(key, &upload_id).await;
                    return Err(remote(format!("Failed to upload part {} of {}: {}", part_number, key, e)));
                }
            };

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(uploaded.e_tag().map(String::from))
                    .build(),
            );
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(|e| remote(format!("Failed to complete multipart upload for {}: {}", key, e)))?;

        debug!(key, size, "Completed multipart upload");
        Ok(size)
    }

    /// Abort a multipart upload so no orphaned parts accrue storage cost
    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await;
        if let Err(e) = result {
            warn!(key, upload_id, error = %e, "Failed to abort multipart upload");
        }
    }
}

fn remote(message: String) -> Error {
    Error::Remote { message }
}

fn normalize_prefix(prefix: &str) -> String {
    prefix.trim_matches('/').to_string()
}

fn join_key(prefix: &str, path: &str) -> String {
    if prefix.is_empty() {
        path.to_string()
    } else {
        format!("{}/{}", prefix, path)
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        let key = self.s3_key(path);

        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                let missing = e
                    .as_service_error()
                    .map(|se| se.is_no_such_key())
                    .unwrap_or(false);
                if missing {
                    Error::StoragePathNotFound {
                        path: path.to_string(),
                    }
                } else {
                    remote(format!("S3 get_object {} failed: {}", key, e))
                }
            })?;

        let bytes = result
            .body
            .collect()
            .await
            .map_err(|e| remote(format!("Failed to read S3 body for {}: {}", key, e)))?;

        Ok(bytes.into_bytes())
    }

    #[instrument(skip(self, data), fields(backend = "s3", bucket = %self.bucket, size = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let key = self.s3_key(path);
        let size = data.len();

        if size > MULTIPART_THRESHOLD {
            return self.multipart_upload(&key, data).await;
        }

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| remote(format!("S3 put_object {} failed: {}", key, e)))?;

        Ok(size as u64)
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn delete(&self, path: &str) -> Result<()> {
        let key = self.s3_key(path);

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| remote(format!("S3 delete_object {} failed: {}", key, e)))?;

        Ok(())
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn exists(&self, path: &str) -> Result<bool> {
        let key = self.s3_key(path);

        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let not_found = e
                    .as_service_error()
                    .map(|se| se.is_not_found())
                    .unwrap_or(false);
                if not_found {
                    Ok(false)
                } else {
                    Err(remote(format!("S3 head_object {} failed: {}", key, e)))
                }
            }
        }
    }

    #[instrument(skip(self), fields(backend = "s3", bucket = %self.bucket))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let s3_prefix = self.s3_key(prefix);
        let strip = if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        };

        let mut results = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&s3_prefix);

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| remote(format!("S3 list_objects {} failed: {}", s3_prefix, e)))?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    results.push(key.strip_prefix(&strip).unwrap_or(key).to_string());
                }
            }

            if response.is_truncated() == Some(true) {
                continuation_token = response.next_continuation_token().map(String::from);
            } else {
                break;
            }
        }

        results.sort();
        debug!(count = results.len(), "Found S3 objects");
        Ok(results)
    }

    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }
}

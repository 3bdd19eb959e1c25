//! Artifact storage using S3/MinIO or the local filesystem
//!
//! Source videos are downloaded from the bucket named by the task descriptor;
//! artifacts are uploaded to the configured output bucket and handed out as
//! time-limited signed URLs.

use crate::{StorageError, StorageResult};
use aws_sdk_s3::{
    config::{Credentials, Region},
    presigning::PresigningConfig,
    primitives::ByteStream,
    Client,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// S3/MinIO configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// Output bucket for artifacts
    pub bucket: String,

    /// AWS region (e.g., "us-west-2") or "us-east-1" for `MinIO`
    pub region: String,

    /// S3 endpoint (custom for `MinIO`, empty for AWS S3)
    pub endpoint: Option<String>,

    /// AWS access key ID
    pub access_key_id: String,

    /// AWS secret access key
    pub secret_access_key: String,

    /// Path prefix for all uploaded objects (e.g., "video-track/")
    pub prefix: String,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: std::env::var("S3_BUCKET").unwrap_or_else(|_| "video-track".to_string()),
            region: std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            endpoint: std::env::var("S3_ENDPOINT").ok(),
            access_key_id: std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_default(),
            secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default(),
            prefix: String::new(),
        }
    }
}

/// Artifact storage trait
#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Upload a local file to `key` in the output bucket; returns the stored key
    async fn upload(&self, local_path: &Path, key: &str, content_type: &str)
        -> StorageResult<String>;

    /// Download `key` from `bucket` into `local_path`
    async fn download(&self, bucket: &str, key: &str, local_path: &Path) -> StorageResult<()>;

    /// Time-limited GET URL for an uploaded artifact
    async fn sign(&self, key: &str, expiry: Duration) -> StorageResult<String>;

    /// Time-limited PUT URL so a client can upload a source video directly
    async fn sign_upload(&self, key: &str, expiry: Duration) -> StorageResult<String>;

    /// Output bucket name
    fn bucket(&self) -> &str;
}

/// S3/MinIO artifact storage implementation
pub struct S3ArtifactStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3ArtifactStore {
    /// Create a new S3 artifact store client
    pub async fn new(config: S3Config) -> StorageResult<Self> {
        if config.bucket.is_empty() {
            return Err(StorageError::InvalidConfig("S3 bucket is empty".to_string()));
        }

        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "video-track-storage",
        );

        let region = Region::new(config.region.clone());

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(region)
            .behavior_version_latest();

        // Set custom endpoint for MinIO
        if let Some(endpoint) = config.endpoint {
            s3_config_builder = s3_config_builder
                .endpoint_url(endpoint)
                .force_path_style(true); // Required for MinIO
        }

        let client = Client::from_conf(s3_config_builder.build());

        Ok(Self {
            client,
            bucket: config.bucket,
            prefix: config.prefix,
        })
    }

    /// Combine prefix with key
    fn full_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    fn presigning(expiry: Duration) -> StorageResult<PresigningConfig> {
        PresigningConfig::expires_in(expiry).map_err(|e| StorageError::SigningError(e.to_string()))
    }
}

#[async_trait::async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn upload(
        &self,
        local_path: &Path,
        key: &str,
        content_type: &str,
    ) -> StorageResult<String> {
        let full_key = self.full_key(key);
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| StorageError::S3Error(e.to_string()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .content_type(content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| StorageError::S3Error(e.to_string()))?;

        debug!("Uploaded {} to s3://{}/{}", local_path.display(), self.bucket, full_key);
        Ok(full_key)
    }

    async fn download(&self, bucket: &str, key: &str, local_path: &Path) -> StorageResult<()> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.to_string().contains("NoSuchKey") {
                    StorageError::NotFound(format!("s3://{bucket}/{key}"))
                } else {
                    StorageError::S3Error(e.to_string())
                }
            })?;

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut reader = response.body.into_async_read();
        let mut file = tokio::fs::File::create(local_path).await?;
        let bytes = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;

        debug!("Downloaded {} bytes from s3://{}/{}", bytes, bucket, key);
        Ok(())
    }

    async fn sign(&self, key: &str, expiry: Duration) -> StorageResult<String> {
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .presigned(Self::presigning(expiry)?)
            .await
            .map_err(|e| StorageError::SigningError(e.to_string()))?;

        Ok(request.uri().to_string())
    }

    async fn sign_upload(&self, key: &str, expiry: Duration) -> StorageResult<String> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .presigned(Self::presigning(expiry)?)
            .await
            .map_err(|e| StorageError::SigningError(e.to_string()))?;

        Ok(request.uri().to_string())
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// Artifact store backed by a directory tree (`<root>/<bucket>/<key>`)
///
/// Used for local runs without object storage; signed URLs are `file://`
/// URLs carrying the expiry as a query parameter.
pub struct LocalArtifactStore {
    root: PathBuf,
    bucket: String,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            bucket: bucket.into(),
        }
    }

    /// Filesystem path of an object
    #[must_use]
    pub fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key.trim_start_matches('/'))
    }

    fn file_url(path: &Path, expiry: Duration) -> String {
        let expires = chrono::Utc::now().timestamp() + expiry.as_secs() as i64;
        format!("file://{}?expires={}", path.display(), expires)
    }
}

#[async_trait::async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn upload(
        &self,
        local_path: &Path,
        key: &str,
        _content_type: &str,
    ) -> StorageResult<String> {
        let target = self.object_path(&self.bucket, key);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local_path, &target).await?;
        Ok(key.to_string())
    }

    async fn download(&self, bucket: &str, key: &str, local_path: &Path) -> StorageResult<()> {
        let source = self.object_path(bucket, key);
        if !tokio::fs::try_exists(&source).await? {
            return Err(StorageError::NotFound(source.display().to_string()));
        }
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source, local_path).await?;
        Ok(())
    }

    async fn sign(&self, key: &str, expiry: Duration) -> StorageResult<String> {
        let path = self.object_path(&self.bucket, key);
        if !tokio::fs::try_exists(&path).await? {
            return Err(StorageError::NotFound(path.display().to_string()));
        }
        Ok(Self::file_url(&path, expiry))
    }

    async fn sign_upload(&self, key: &str, expiry: Duration) -> StorageResult<String> {
        Ok(Self::file_url(&self.object_path(&self.bucket, key), expiry))
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}

//! Storage layer for the video tracking pipeline
//!
//! Two shared collaborators live here:
//! - **Artifact store** (S3/MinIO or local filesystem): source video download,
//!   artifact upload, time-limited signed URLs
//! - **Status recorder** (`PostgreSQL` or in-memory): one status record per task
//!
//! Both are used behind trait objects so that workers share a single handle.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use video_track_storage::{ArtifactStore, S3ArtifactStore, StorageConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StorageConfig::default();
//!     let store = S3ArtifactStore::new(config.s3).await?;
//!
//!     let key = store
//!         .upload("/tmp/report.csv".as_ref(), "T1/output/report.csv", "text/csv")
//!         .await?;
//!     let url = store.sign(&key, Duration::from_secs(3600)).await?;
//!     println!("{url}");
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub mod object_storage;
pub mod status_storage;

pub use object_storage::{ArtifactStore, LocalArtifactStore, S3ArtifactStore, S3Config};
pub use status_storage::{
    InMemoryStatusRecorder, PostgresConfig, PostgresStatusRecorder, StatusRecorder,
};

/// Storage layer errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("S3 error: {0}")]
    S3Error(String),

    #[error("PostgreSQL error: {0}")]
    PostgresError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Signing error: {0}")]
    SigningError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Which artifact store backend to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactBackend {
    S3,
    Local,
}

/// Which status recorder backend to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusBackend {
    Postgres,
    Memory,
}

/// Complete storage configuration for all backends
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub artifact_backend: ArtifactBackend,

    pub status_backend: StatusBackend,

    /// S3/MinIO configuration for artifacts
    pub s3: S3Config,

    /// Root directory of the local artifact store
    pub local_root: PathBuf,

    /// `PostgreSQL` configuration for task status
    pub postgres: PostgresConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let artifact_backend = match std::env::var("ARTIFACT_BACKEND").as_deref() {
            Ok("local") => ArtifactBackend::Local,
            _ => ArtifactBackend::S3,
        };
        let status_backend = match std::env::var("STATUS_BACKEND").as_deref() {
            Ok("memory") => StatusBackend::Memory,
            _ => StatusBackend::Postgres,
        };

        Self {
            artifact_backend,
            status_backend,
            s3: S3Config::default(),
            local_root: std::env::var("LOCAL_ARTIFACT_ROOT")
                .map_or_else(|_| std::env::temp_dir().join("video-track-artifacts"), PathBuf::from),
            postgres: PostgresConfig::default(),
        }
    }
}

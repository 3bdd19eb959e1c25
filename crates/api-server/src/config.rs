//! Service configuration
//!
//! Every section defaults from environment variables. A YAML file named by
//! `VIDEO_TRACK_CONFIG` overrides whatever it sets.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use video_track_detection::DetectorConfig;
use video_track_intake::QueueConfig;
use video_track_pipeline::PipelineConfig;
use video_track_storage::StorageConfig;

/// Environment variable naming the YAML config file
pub const CONFIG_ENV: &str = "VIDEO_TRACK_CONFIG";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// HTTP listener and socket transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,

    /// Descriptors buffered between transports and the dispatcher
    pub intake_buffer: usize,

    /// Lifetime of presigned upload URLs
    pub presign_ttl_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: std::env::var("API_SERVER_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            intake_buffer: 64,
            presign_ttl_secs: 900,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn presign_ttl(&self) -> Duration {
        Duration::from_secs(self.presign_ttl_secs)
    }
}

/// Complete configuration of the server binary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub detector: DetectorConfig,
    pub pipeline: PipelineConfig,
    pub queue: QueueConfig,
}

impl ServiceConfig {
    /// Environment defaults, overridden by the file in `VIDEO_TRACK_CONFIG`
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => Self::from_file(Path::new(&path)),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }
}

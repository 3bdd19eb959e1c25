//! Intake transports feeding the pipeline
//!
//! Every transport decodes the same JSON task descriptor and pushes it into
//! a `tokio::sync::mpsc` channel consumed by the pipeline's intake loop.
//! This crate holds the pull-based queue transport; the socket transport
//! lives with the HTTP server.

pub mod backoff;
pub mod sqs;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use video_track_common::{PipelineError, TaskDescriptor};

pub use backoff::Backoff;
pub use sqs::SqsQueuePoller;

/// Intake errors
#[derive(Error, Debug)]
pub enum IntakeError {
    #[error("Queue transport error: {0}")]
    Transport(String),

    #[error("Malformed task message: {0}")]
    Malformed(String),

    #[error("Invalid queue configuration: {0}")]
    InvalidConfig(String),

    #[error("Intake channel closed")]
    ChannelClosed,
}

/// Result type for intake operations
pub type IntakeResult<T> = Result<T, IntakeError>;

impl From<IntakeError> for PipelineError {
    fn from(err: IntakeError) -> Self {
        match err {
            IntakeError::Malformed(message) => PipelineError::MalformedDescriptor(message),
            other => PipelineError::Transport(other.to_string()),
        }
    }
}

/// Decode and validate one transport message body
pub fn parse_descriptor(body: &str) -> IntakeResult<TaskDescriptor> {
    let descriptor: TaskDescriptor =
        serde_json::from_str(body).map_err(|e| IntakeError::Malformed(e.to_string()))?;
    descriptor
        .validate()
        .map_err(|e| IntakeError::Malformed(e.to_string()))?;
    Ok(descriptor)
}

/// Queue transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue to poll; the queue transport is disabled when unset
    pub queue_url: Option<String>,

    pub region: String,

    /// Custom endpoint (LocalStack, ElasticMQ)
    pub endpoint: Option<String>,

    /// Long-poll wait per receive call
    pub wait_time_secs: i32,

    /// Messages per receive call
    pub max_messages: i32,

    /// First retry delay after a failed receive
    pub initial_backoff_ms: u64,

    /// Retry delay ceiling
    pub max_backoff_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_url: std::env::var("SQS_QUEUE_URL").ok(),
            region: std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            endpoint: std::env::var("SQS_ENDPOINT").ok(),
            wait_time_secs: 10,
            max_messages: 1,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

impl QueueConfig {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.queue_url.as_deref().is_some_and(|url| !url.is_empty())
    }
}

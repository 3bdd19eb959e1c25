//! API request and response types

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use video_track_common::{ProgressEvent, TaskDescriptor};

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Tasks currently being processed
    pub active_tasks: usize,
}

/// Request for a presigned upload URL
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignRequest {
    pub file_name: String,
}

/// Where and how the client uploads its source video
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresignResponse {
    pub url: String,
    pub bucket: String,
    pub key: String,
}

/// Start processing an uploaded video
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTaskRequest {
    pub bucket: String,
    pub key: String,
    #[serde(default)]
    pub module_name: Option<String>,
    #[serde(default)]
    pub class_filter: BTreeSet<String>,
}

impl StartTaskRequest {
    /// Descriptor handed to the dispatcher under a fresh task id
    #[must_use]
    pub fn into_descriptor(self, task_id: String) -> TaskDescriptor {
        TaskDescriptor {
            task_id,
            source_bucket: self.bucket,
            source_key: self.key,
            module_name: self.module_name,
            class_filter: self.class_filter,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTaskResponse {
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModulesResponse {
    pub modules: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassesResponse {
    pub module: String,
    pub classes: Vec<String>,
}

/// Envelope of WebSocket frames in both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum SocketMessage {
    /// Client to server: start a task
    Task(TaskDescriptor),
    /// Server to client: progress of any task
    Progress(ProgressEvent),
}

/// Upload key for a client file name: `uploads/{uuid}_{name}`
///
/// Only the last path segment of the name is kept.
#[must_use]
pub fn upload_key(upload_id: &str, file_name: &str) -> Option<String> {
    let name = file_name
        .rsplit(['/', '\\'])
        .next()
        .map(str::trim)
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")?;
    Some(format!("uploads/{upload_id}_{name}"))
}

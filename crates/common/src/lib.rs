//! Common types shared by the video tracking pipeline crates
//!
//! Holds the task descriptor accepted by intake transports, the persisted
//! task status record, per-frame detections, the result summary and the
//! progress event pushed to clients, plus the pipeline error taxonomy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Malformed task descriptor: {0}")]
    MalformedDescriptor(String),

    #[error("Task {0} is already being processed")]
    DuplicateTask(String),

    #[error("Unknown detection module: {0}")]
    UnknownModule(String),

    #[error("Processing failed for task {task_id} during {stage}: {message}")]
    Processing {
        task_id: String,
        stage: ProcessingStage,
        message: String,
    },

    #[error("Finalization failed for task {task_id} during {stage}: {message}")]
    Finalization {
        task_id: String,
        stage: ProcessingStage,
        message: String,
    },

    #[error("Intake transport error: {0}")]
    Transport(String),
}

impl PipelineError {
    /// Build a processing error for a task and stage
    pub fn processing(task_id: &str, stage: ProcessingStage, message: impl fmt::Display) -> Self {
        Self::Processing {
            task_id: task_id.to_string(),
            stage,
            message: message.to_string(),
        }
    }

    /// Build a finalization error for a task and stage
    pub fn finalization(task_id: &str, stage: ProcessingStage, message: impl fmt::Display) -> Self {
        Self::Finalization {
            task_id: task_id.to_string(),
            stage,
            message: message.to_string(),
        }
    }

    /// Stage the error happened in, if it came out of a pipeline run
    #[must_use]
    pub fn stage(&self) -> Option<ProcessingStage> {
        match self {
            Self::Processing { stage, .. } | Self::Finalization { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Where in a task's run an error was raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    Download,
    Probe,
    Decode,
    Detect,
    Encode,
    Remux,
    Upload,
    Report,
    Sign,
    Timeout,
}

impl ProcessingStage {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Probe => "probe",
            Self::Decode => "decode",
            Self::Detect => "detect",
            Self::Encode => "encode",
            Self::Remux => "remux",
            Self::Upload => "upload",
            Self::Report => "report",
            Self::Sign => "sign",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A unit of work delivered by an intake transport
///
/// Queue bodies and socket payloads share this schema. Missing fields
/// deserialize to empty values so that [`TaskDescriptor::validate`] can
/// reject them instead of the transport failing to parse.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    #[serde(rename = "taskId", alias = "task_id", default)]
    pub task_id: String,

    #[serde(rename = "bucket", alias = "sourceBucket", default)]
    pub source_bucket: String,

    #[serde(rename = "key", alias = "sourceKey", default)]
    pub source_key: String,

    #[serde(
        rename = "moduleName",
        alias = "module_name",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub module_name: Option<String>,

    /// Class labels to keep; empty accepts every class
    #[serde(rename = "classFilter", alias = "class_filter", default)]
    pub class_filter: BTreeSet<String>,
}

impl TaskDescriptor {
    pub fn new(
        task_id: impl Into<String>,
        source_bucket: impl Into<String>,
        source_key: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            source_bucket: source_bucket.into(),
            source_key: source_key.into(),
            module_name: None,
            class_filter: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_module(mut self, module_name: impl Into<String>) -> Self {
        self.module_name = Some(module_name.into());
        self
    }

    #[must_use]
    pub fn with_classes<I, S>(mut self, classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.class_filter = classes.into_iter().map(Into::into).collect();
        self
    }

    /// Check the fields every transport must supply
    pub fn validate(&self) -> Result<()> {
        let mut missing = Vec::with_capacity(3);
        if self.task_id.trim().is_empty() {
            missing.push("taskId");
        }
        if self.source_bucket.trim().is_empty() {
            missing.push("bucket");
        }
        if self.source_key.trim().is_empty() {
            missing.push("key");
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::MalformedDescriptor(format!(
                "missing {}",
                missing.join(", ")
            )))
        }
    }

    /// Whether detections of this class should be tracked
    #[must_use]
    pub fn accepts_class(&self, class_label: &str) -> bool {
        self.class_filter.is_empty() || self.class_filter.contains(class_label)
    }

    /// File name of the source object (last path segment of the key)
    #[must_use]
    pub fn source_file_name(&self) -> &str {
        self.source_key
            .rsplit('/')
            .find(|segment| !segment.is_empty())
            .unwrap_or("input.mp4")
    }
}

/// Remote keys of the artifacts produced for a task
pub mod keys {
    /// Annotated output video
    #[must_use]
    pub fn output_video(task_id: &str) -> String {
        format!("{task_id}/output/processed_video.mp4")
    }

    /// Clip of a single track
    #[must_use]
    pub fn clip(task_id: &str, track_id: u32) -> String {
        format!("{task_id}/output/clips/{track_id}.mp4")
    }

    /// CSV report
    #[must_use]
    pub fn report(task_id: &str) -> String {
        format!("{task_id}/output/report.csv")
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    Processing,
    Complete,
    Error,
}

impl TaskState {
    /// `Complete` and `Error` allow no further transitions
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Processing => "Processing",
            Self::Complete => "Complete",
            Self::Error => "Error",
        }
    }

    /// Parse the stored representation
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Pending" => Some(Self::Pending),
            "Processing" => Some(Self::Processing),
            "Complete" => Some(Self::Complete),
            "Error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted status record of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub task_id: String,
    pub status: TaskState,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_video_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TaskStatus {
    /// Fresh record for a task that has been requested but not dispatched
    pub fn pending(task_id: impl Into<String>, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskState::Pending,
            progress: 0,
            bucket: Some(bucket.into()),
            key: Some(key.into()),
            result_video_key: None,
            report_key: None,
            error_message: None,
            updated_at: Utc::now(),
        }
    }

    /// Empty record used when a patch targets an unknown task
    pub fn empty(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskState::Pending,
            progress: 0,
            bucket: None,
            key: None,
            result_video_key: None,
            report_key: None,
            error_message: None,
            updated_at: Utc::now(),
        }
    }

    /// Overwrite the fields set in `patch`
    pub fn apply(&mut self, patch: &StatusPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(progress) = patch.progress {
            self.progress = progress;
        }
        if let Some(key) = &patch.result_video_key {
            self.result_video_key = Some(key.clone());
        }
        if let Some(key) = &patch.report_key {
            self.report_key = Some(key.clone());
        }
        if let Some(message) = &patch.error_message {
            self.error_message = Some(message.clone());
        }
        self.updated_at = Utc::now();
    }
}

/// Partial update of a status record; `None` leaves a field untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusPatch {
    pub status: Option<TaskState>,
    pub progress: Option<u8>,
    pub result_video_key: Option<String>,
    pub report_key: Option<String>,
    pub error_message: Option<String>,
}

impl StatusPatch {
    #[must_use]
    pub fn processing() -> Self {
        Self {
            status: Some(TaskState::Processing),
            progress: Some(0),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress.min(100)),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn complete(result_video_key: Option<String>, report_key: String) -> Self {
        Self {
            status: Some(TaskState::Complete),
            progress: Some(100),
            result_video_key,
            report_key: Some(report_key),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Some(TaskState::Error),
            error_message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Bounding box with normalized coordinates (0-1)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// X coordinate of top-left corner (normalized 0-1)
    pub x: f32,
    /// Y coordinate of top-left corner (normalized 0-1)
    pub y: f32,
    /// Width of box (normalized 0-1)
    pub width: f32,
    /// Height of box (normalized 0-1)
    pub height: f32,
}

impl BoundingBox {
    #[must_use]
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    #[must_use]
    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    #[must_use]
    #[inline]
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Intersection over Union with another box
    #[must_use]
    #[inline]
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    /// Convert to pixel coordinates `(x, y, width, height)` clamped to the frame
    #[must_use]
    pub fn to_pixels(&self, frame_width: u32, frame_height: u32) -> (u32, u32, u32, u32) {
        let fw = frame_width as f32;
        let fh = frame_height as f32;
        let x = (self.x.clamp(0.0, 1.0) * fw) as u32;
        let y = (self.y.clamp(0.0, 1.0) * fh) as u32;
        let right = ((self.x + self.width).clamp(0.0, 1.0) * fw) as u32;
        let bottom = ((self.y + self.height).clamp(0.0, 1.0) * fh) as u32;
        (x, y, right.saturating_sub(x), bottom.saturating_sub(y))
    }
}

/// One object reported by the detection engine for one frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    /// Identity kept by the engine across consecutive frames
    pub track_id: u32,
    pub class_label: String,
    /// Confidence score (0-1)
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// Entry of the summary's per-track list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackSummary {
    #[serde(rename = "trackId")]
    pub track_id: u32,
    #[serde(rename = "classname")]
    pub class_label: String,
}

/// Result of a successful task, built once at finalization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResultSummary {
    pub task_id: String,
    /// Absent when the input had no frames to render
    pub video_url: Option<String>,
    pub report_url: String,
    pub per_track: Vec<TrackSummary>,
}

/// Event pushed to progress listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub task_id: String,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Vec<TrackSummary>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProgressEvent {
    /// Intermediate progress update
    pub fn progress(task_id: impl Into<String>, progress: u8) -> Self {
        Self {
            task_id: task_id.into(),
            progress: progress.min(100),
            status: None,
            video_url: None,
            report_url: None,
            summary: None,
            message: None,
        }
    }

    /// Terminal success event
    #[must_use]
    pub fn complete(summary: &TaskResultSummary) -> Self {
        Self {
            task_id: summary.task_id.clone(),
            progress: 100,
            status: Some(TaskState::Complete),
            video_url: summary.video_url.clone(),
            report_url: Some(summary.report_url.clone()),
            summary: Some(summary.per_track.clone()),
            message: None,
        }
    }

    /// Terminal error event
    pub fn failed(task_id: impl Into<String>, progress: u8, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            progress: progress.min(100),
            status: Some(TaskState::Error),
            video_url: None,
            report_url: None,
            summary: None,
            message: Some(message.into()),
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_some_and(|s| s.is_terminal())
    }
}

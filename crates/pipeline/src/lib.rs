//! Task processing pipeline
//!
//! [`PipelineService`] takes task descriptors from any intake transport and
//! runs each accepted task on a bounded worker pool:
//!
//! 1. download the source video
//! 2. [`FramePipeline`]: decode, detect, track in a [`TrackRegistry`],
//!    annotate and encode the output video and per-track clips
//! 3. [`ArtifactFinalizer`]: remux, upload, write the CSV report, sign URLs
//! 4. record the terminal status, then publish the terminal progress event
//!
//! At most one run per task id is in flight at any time.

pub mod dispatcher;
pub mod finalizer;
pub mod frame_pipeline;
pub mod progress;
pub mod registry;
pub mod report;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub use dispatcher::PipelineService;
pub use finalizer::{ArtifactFinalizer, FinalizedArtifacts};
pub use frame_pipeline::{FinalFrameStats, FramePipeline};
pub use progress::{BroadcastProgressChannel, ProgressChannel, ProgressThrottle};
pub use registry::{FrameContext, TrackOccurrence, TrackRegistry};
pub use report::{write_report, REPORT_HEADER};

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Worker pool, timeout and progress settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Tasks processed concurrently; further tasks wait for a slot
    pub max_concurrent_tasks: usize,

    /// Wall-clock limit for one task, download to upload
    pub task_timeout_secs: u64,

    /// Smallest progress increase worth publishing
    pub progress_min_step: u8,

    /// Smallest gap between two published progress events
    pub progress_min_interval_ms: u64,

    /// Also write intermediate progress to the status store
    pub persist_progress: bool,

    /// Lifetime of signed artifact URLs
    pub signed_url_ttl_secs: u64,

    /// Parent of the per-task working directories
    pub work_dir: PathBuf,

    /// TrueType font for labels; the bundled font when unset
    pub font_path: Option<PathBuf>,

    /// Events buffered per progress listener before the oldest are dropped
    pub progress_buffer: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: env_or("MAX_CONCURRENT_TASKS", 4),
            task_timeout_secs: env_or("TASK_TIMEOUT_SECS", 3600),
            progress_min_step: 1,
            progress_min_interval_ms: 250,
            persist_progress: env_or("PERSIST_PROGRESS", false),
            signed_url_ttl_secs: env_or("SIGNED_URL_TTL_SECS", 3600),
            work_dir: std::env::var("WORK_DIR")
                .map_or_else(|_| std::env::temp_dir().join("video-track"), PathBuf::from),
            font_path: std::env::var("FONT_PATH").ok().map(PathBuf::from),
            progress_buffer: 256,
        }
    }
}

impl PipelineConfig {
    #[must_use]
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    #[must_use]
    pub fn signed_url_ttl(&self) -> Duration {
        Duration::from_secs(self.signed_url_ttl_secs)
    }

    #[must_use]
    pub fn progress_min_interval(&self) -> Duration {
        Duration::from_millis(self.progress_min_interval_ms)
    }
}

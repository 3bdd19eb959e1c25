//! Turns a finished frame loop into published artifacts
//!
//! Runs once per successful frame loop, after every writer is closed. The
//! steps are strictly ordered: remux, upload video and clips, write and
//! upload the report, sign, assemble the summary. The first failure aborts
//! finalization and no summary is produced.

use crate::frame_pipeline::FinalFrameStats;
use crate::registry::TrackOccurrence;
use crate::report::write_report;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use video_track_common::{
    keys, PipelineError, ProcessingStage, Result, TaskDescriptor, TaskResultSummary, TrackSummary,
};
use video_track_storage::ArtifactStore;
use video_track_video::VideoBackend;

const VIDEO_CONTENT_TYPE: &str = "video/mp4";
const REPORT_CONTENT_TYPE: &str = "text/csv";

/// Outcome of a successful finalization
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedArtifacts {
    pub summary: TaskResultSummary,
    /// Logical key of the uploaded video, absent for zero-frame input
    pub video_key: Option<String>,
    pub report_key: String,
}

/// Remuxes, uploads and signs a task's outputs
pub struct ArtifactFinalizer {
    store: Arc<dyn ArtifactStore>,
    backend: Arc<dyn VideoBackend>,
    signed_url_ttl: Duration,
}

impl ArtifactFinalizer {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        backend: Arc<dyn VideoBackend>,
        signed_url_ttl: Duration,
    ) -> Self {
        Self {
            store,
            backend,
            signed_url_ttl,
        }
    }

    pub async fn finalize(
        &self,
        descriptor: &TaskDescriptor,
        occurrences: &[TrackOccurrence],
        stats: &FinalFrameStats,
        work_dir: &Path,
    ) -> Result<FinalizedArtifacts> {
        let task_id = descriptor.task_id.as_str();
        let publish_dir = work_dir.join("publish");
        let clip_dir = publish_dir.join("clips");
        tokio::fs::create_dir_all(&clip_dir)
            .await
            .map_err(|e| PipelineError::finalization(task_id, ProcessingStage::Remux, e))?;

        let reportable: Vec<&TrackOccurrence> =
            occurrences.iter().filter(|o| o.is_reportable()).collect();

        // 1. main video
        let video = match &stats.output_video {
            Some(encoded) => {
                let remuxed = publish_dir.join("processed_video.mp4");
                self.remux(task_id, encoded.clone(), remuxed.clone()).await?;
                Some(remuxed)
            }
            None => None,
        };

        // 2. clips of reportable tracks
        let mut clips = Vec::with_capacity(reportable.len());
        for occurrence in &reportable {
            let Some(encoded) = stats.clips.get(&occurrence.track_id) else {
                continue;
            };
            let remuxed = clip_dir.join(format!("{}.mp4", occurrence.track_id));
            self.remux(task_id, encoded.clone(), remuxed.clone()).await?;
            clips.push((occurrence.track_id, remuxed));
        }

        // 3. main video upload
        let video_key = match &video {
            Some(path) => {
                let key = keys::output_video(task_id);
                self.upload(task_id, path, &key, VIDEO_CONTENT_TYPE).await?;
                Some(key)
            }
            None => None,
        };

        // 4. clip uploads
        for (track_id, path) in &clips {
            self.upload(task_id, path, &keys::clip(task_id, *track_id), VIDEO_CONTENT_TYPE)
                .await?;
        }

        // 5. report
        let report_path = publish_dir.join("report.csv");
        let rows = Self::write_report_file(&report_path, &reportable)
            .map_err(|e| PipelineError::finalization(task_id, ProcessingStage::Report, e))?;
        let report_key = keys::report(task_id);
        self.upload(task_id, &report_path, &report_key, REPORT_CONTENT_TYPE)
            .await?;
        debug!("Task {}: report has {} rows", task_id, rows);

        // 6. signed URLs for video and report
        let video_url = match &video_key {
            Some(key) => Some(self.sign(task_id, key).await?),
            None => None,
        };
        let report_url = self.sign(task_id, &report_key).await?;

        // 7. summary
        let summary = TaskResultSummary {
            task_id: task_id.to_string(),
            video_url,
            report_url,
            per_track: reportable
                .iter()
                .map(|o| TrackSummary {
                    track_id: o.track_id,
                    class_label: o.class_label.clone(),
                })
                .collect(),
        };

        info!(
            "Task {}: published video={} clips={} report rows={}",
            task_id,
            video_key.is_some(),
            clips.len(),
            rows
        );

        Ok(FinalizedArtifacts {
            summary,
            video_key,
            report_key,
        })
    }

    async fn remux(&self, task_id: &str, input: PathBuf, output: PathBuf) -> Result<()> {
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || backend.remux(&input, &output))
            .await
            .map_err(|e| PipelineError::finalization(task_id, ProcessingStage::Remux, e))?
            .map_err(|e| PipelineError::finalization(task_id, ProcessingStage::Remux, e))
    }

    async fn upload(&self, task_id: &str, path: &Path, key: &str, content_type: &str) -> Result<()> {
        self.store
            .upload(path, key, content_type)
            .await
            .map_err(|e| PipelineError::finalization(task_id, ProcessingStage::Upload, e))?;
        Ok(())
    }

    async fn sign(&self, task_id: &str, key: &str) -> Result<String> {
        self.store
            .sign(key, self.signed_url_ttl)
            .await
            .map_err(|e| PipelineError::finalization(task_id, ProcessingStage::Sign, e))
    }

    fn write_report_file(path: &Path, occurrences: &[&TrackOccurrence]) -> std::io::Result<usize> {
        let file = std::fs::File::create(path)?;
        write_report(std::io::BufWriter::new(file), occurrences.iter().copied())
            .map_err(std::io::Error::other)
    }
}

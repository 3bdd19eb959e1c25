//! Per-task frame loop: decode, detect, track, annotate, encode
//!
//! Runs on a blocking thread. Frames are processed strictly in order; the
//! cancel flag is checked before every frame so a timed-out task stops at
//! the next frame boundary.

use crate::registry::{FrameContext, TrackRegistry};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use video_track_common::{PipelineError, ProcessingStage, Result, TaskDescriptor};
use video_track_detection::DetectionCapability;
use video_track_video::{Annotator, FrameSink, VideoBackend, VideoError};

/// File name of the annotated video before remuxing
const OUTPUT_FILE: &str = "annotated.mp4";

/// What a completed frame loop leaves behind for finalization
#[derive(Debug, Clone, PartialEq)]
pub struct FinalFrameStats {
    /// Frame count reported by the probe
    pub total_frames: u64,
    pub processed_frames: u64,
    /// Distinct tracks that passed the class filter
    pub total_objects: usize,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// Closed annotated video, absent when no frame was decoded
    pub output_video: Option<PathBuf>,
    /// Closed clip per track id
    pub clips: BTreeMap<u32, PathBuf>,
}

/// Open encoders of one run
#[derive(Default)]
struct Writers {
    main: Option<Box<dyn FrameSink>>,
    clips: BTreeMap<u32, Box<dyn FrameSink>>,
}

impl Writers {
    /// Close every writer, discarding the rest after the first failure
    fn finish_all(self) -> std::result::Result<(), VideoError> {
        let mut first_error = None;

        let sinks = self.main.into_iter().chain(self.clips.into_values());
        for sink in sinks {
            if first_error.is_some() {
                sink.abort();
                continue;
            }
            if let Err(e) = sink.finish() {
                first_error = Some(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    fn abort_all(self) {
        if let Some(main) = self.main {
            main.abort();
        }
        for sink in self.clips.into_values() {
            sink.abort();
        }
    }
}

/// Drives one task's frames through detection and encoding
#[derive(Clone)]
pub struct FramePipeline {
    backend: Arc<dyn VideoBackend>,
    annotator: Arc<Annotator>,
}

impl FramePipeline {
    pub fn new(backend: Arc<dyn VideoBackend>, annotator: Arc<Annotator>) -> Self {
        Self { backend, annotator }
    }

    /// Process every frame of `input`
    ///
    /// Occurrences accumulate in `registry`. Encoded files are written under
    /// `work_dir/output` and the registry's clip directory. `on_progress`
    /// receives `floor(processed / total * 100)` capped at 99 while frames
    /// remain, then exactly one 100 once the loop has finished.
    ///
    /// On error every open writer is aborted and its partial file removed.
    #[allow(clippy::too_many_arguments)]
    pub fn run(
        &self,
        descriptor: &TaskDescriptor,
        input: &Path,
        work_dir: &Path,
        detector: &mut dyn DetectionCapability,
        registry: &mut TrackRegistry,
        cancel: &AtomicBool,
        on_progress: &mut dyn FnMut(u8),
    ) -> Result<FinalFrameStats> {
        let task_id = descriptor.task_id.as_str();
        let started = Instant::now();

        let probe = self
            .backend
            .probe(input)
            .map_err(|e| PipelineError::processing(task_id, ProcessingStage::Probe, e))?;

        info!(
            "Task {}: {}x{} @ {:.2} fps, {} frames",
            task_id, probe.width, probe.height, probe.fps, probe.total_frames
        );

        let output_dir = work_dir.join("output");
        std::fs::create_dir_all(&output_dir)
            .and_then(|()| std::fs::create_dir_all(registry.clip_dir()))
            .map_err(|e| PipelineError::processing(task_id, ProcessingStage::Encode, e))?;

        let mut stats = FinalFrameStats {
            total_frames: probe.total_frames,
            processed_frames: 0,
            total_objects: 0,
            fps: probe.fps,
            width: probe.width,
            height: probe.height,
            output_video: None,
            clips: BTreeMap::new(),
        };

        let mut writers = Writers::default();
        let output_path = output_dir.join(OUTPUT_FILE);

        let outcome = self.process_frames(
            descriptor,
            input,
            &output_path,
            &probe,
            detector,
            registry,
            cancel,
            on_progress,
            &mut writers,
            &mut stats,
        );

        if let Err(e) = outcome {
            warn!(
                "Task {}: frame loop aborted after {} frames: {}",
                task_id, stats.processed_frames, e
            );
            writers.abort_all();
            return Err(e);
        }

        writers
            .finish_all()
            .map_err(|e| PipelineError::processing(task_id, ProcessingStage::Encode, e))?;

        on_progress(100);
        stats.total_objects = registry.len();

        info!(
            "Task {}: processed {} frames, {} tracks in {:.2}s",
            task_id,
            stats.processed_frames,
            stats.total_objects,
            started.elapsed().as_secs_f64()
        );

        Ok(stats)
    }

    #[allow(clippy::too_many_arguments)]
    fn process_frames(
        &self,
        descriptor: &TaskDescriptor,
        input: &Path,
        output_path: &Path,
        probe: &video_track_video::VideoProbe,
        detector: &mut dyn DetectionCapability,
        registry: &mut TrackRegistry,
        cancel: &AtomicBool,
        on_progress: &mut dyn FnMut(u8),
        writers: &mut Writers,
        stats: &mut FinalFrameStats,
    ) -> Result<()> {
        let task_id = descriptor.task_id.as_str();
        let encode_err = |e: VideoError| PipelineError::processing(task_id, ProcessingStage::Encode, e);

        let mut source = self
            .backend
            .open_source(input, probe)
            .map_err(|e| PipelineError::processing(task_id, ProcessingStage::Decode, e))?;

        let mut frame_index = 0u64;
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(PipelineError::processing(
                    task_id,
                    ProcessingStage::Timeout,
                    format!("task timed out at frame {frame_index}"),
                ));
            }

            let Some(mut frame) = source
                .next_frame()
                .map_err(|e| PipelineError::processing(task_id, ProcessingStage::Decode, e))?
            else {
                break;
            };

            if writers.main.is_none() {
                let sink = self
                    .backend
                    .open_sink(output_path, frame.width(), frame.height(), probe.fps)
                    .map_err(encode_err)?;
                writers.main = Some(sink);
                stats.output_video = Some(output_path.to_path_buf());
            }

            let context = FrameContext::new(frame_index, probe.fps);
            let detections = detector.detect(&frame, frame_index).map_err(|e| {
                PipelineError::processing(task_id, ProcessingStage::Detect, e)
            })?;

            let mut seen_in_frame = Vec::new();
            for detection in detections
                .iter()
                .filter(|d| descriptor.accepts_class(&d.class_label))
            {
                let (occurrence, created) =
                    registry.upsert(detection.track_id, detection, context);

                if created {
                    debug!(
                        "Task {}: new track #{} ({}) at frame {}",
                        task_id, detection.track_id, detection.class_label, frame_index
                    );
                    let clip_path = occurrence.clip_path.clone();
                    let sink = self
                        .backend
                        .open_sink(&clip_path, frame.width(), frame.height(), probe.fps)
                        .map_err(encode_err)?;
                    writers.clips.insert(detection.track_id, sink);
                    stats.clips.insert(detection.track_id, clip_path);
                }

                self.annotator.draw_detection(&mut frame, detection);
                if !seen_in_frame.contains(&detection.track_id) {
                    seen_in_frame.push(detection.track_id);
                }
            }

            self.annotator.draw_total(&mut frame, registry.len());

            for track_id in &seen_in_frame {
                if let Some(sink) = writers.clips.get_mut(track_id) {
                    sink.write_frame(&frame).map_err(encode_err)?;
                }
            }
            if let Some(main) = writers.main.as_mut() {
                main.write_frame(&frame).map_err(encode_err)?;
            }

            frame_index += 1;
            stats.processed_frames = frame_index;
            on_progress(frame_progress(frame_index, probe.total_frames));
        }

        Ok(())
    }
}

/// `floor(processed / total * 100)`, held below 100 until the loop ends
fn frame_progress(processed: u64, total: u64) -> u8 {
    let total = total.max(processed).max(1);
    let percent = processed.saturating_mul(100) / total;
    percent.min(99) as u8
}

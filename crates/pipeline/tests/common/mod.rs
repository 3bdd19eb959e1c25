//! In-process fakes for pipeline integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use video_track_common::{BoundingBox, Detection, ProgressEvent, TaskState};
use video_track_detection::{DetectionCapability, DetectionError, DetectionResult, DetectorFactory};
use video_track_pipeline::{PipelineConfig, PipelineService, ProgressChannel};
use video_track_storage::{
    ArtifactStore, InMemoryStatusRecorder, StorageError, StorageResult,
};
use video_track_video::{
    Annotator, FrameSink, FrameSource, VideoBackend, VideoError, VideoProbe, VideoResult,
};

/// Backend producing black frames and recording what gets encoded
pub struct SyntheticBackend {
    pub frames: u64,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub sinks: Arc<Mutex<Vec<SinkRecord>>>,
}

#[derive(Debug, Clone)]
pub struct SinkRecord {
    pub path: PathBuf,
    pub frames: usize,
    pub finished: bool,
}

impl SyntheticBackend {
    pub fn new(frames: u64, fps: f64) -> Self {
        Self {
            frames,
            width: 64,
            height: 48,
            fps,
            sinks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn records(&self) -> Vec<SinkRecord> {
        self.sinks.lock().unwrap().clone()
    }
}

struct SyntheticSource {
    remaining: u64,
    width: u32,
    height: u32,
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> VideoResult<Option<RgbImage>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        Ok(Some(RgbImage::new(self.width, self.height)))
    }
}

struct RecordingSink {
    path: PathBuf,
    frames: usize,
    log: Arc<Mutex<Vec<SinkRecord>>>,
}

impl RecordingSink {
    fn record(&self, finished: bool) {
        self.log.lock().unwrap().push(SinkRecord {
            path: self.path.clone(),
            frames: self.frames,
            finished,
        });
    }
}

impl FrameSink for RecordingSink {
    fn write_frame(&mut self, _frame: &RgbImage) -> VideoResult<()> {
        self.frames += 1;
        Ok(())
    }

    fn finish(self: Box<Self>) -> VideoResult<()> {
        std::fs::write(&self.path, format!("frames={}", self.frames))?;
        self.record(true);
        Ok(())
    }

    fn abort(self: Box<Self>) {
        self.record(false);
    }
}

impl VideoBackend for SyntheticBackend {
    fn probe(&self, path: &Path) -> VideoResult<VideoProbe> {
        if !path.exists() {
            return Err(VideoError::Probe(format!("{} missing", path.display())));
        }
        Ok(VideoProbe {
            width: self.width,
            height: self.height,
            fps: self.fps,
            total_frames: self.frames,
            duration_secs: self.frames as f64 / self.fps,
        })
    }

    fn open_source(&self, _path: &Path, probe: &VideoProbe) -> VideoResult<Box<dyn FrameSource>> {
        Ok(Box::new(SyntheticSource {
            remaining: probe.total_frames,
            width: probe.width,
            height: probe.height,
        }))
    }

    fn open_sink(
        &self,
        path: &Path,
        _width: u32,
        _height: u32,
        _fps: f64,
    ) -> VideoResult<Box<dyn FrameSink>> {
        Ok(Box::new(RecordingSink {
            path: path.to_path_buf(),
            frames: 0,
            log: Arc::clone(&self.sinks),
        }))
    }

    fn remux(&self, input: &Path, output: &Path) -> VideoResult<()> {
        std::fs::copy(input, output)?;
        Ok(())
    }
}

pub type Script = Arc<dyn Fn(u64) -> DetectionResult<Vec<Detection>> + Send + Sync>;

/// Factory whose detectors follow a per-frame script
pub struct ScriptedFactory {
    pub modules: Vec<String>,
    pub script: Script,
    pub frame_delay: Duration,
    pub live: Arc<AtomicUsize>,
    pub peak: Arc<AtomicUsize>,
}

impl ScriptedFactory {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(u64) -> DetectionResult<Vec<Detection>> + Send + Sync + 'static,
    {
        Self {
            modules: vec!["logo".to_string()],
            script: Arc::new(script),
            frame_delay: Duration::ZERO,
            live: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, frame_delay: Duration) -> Self {
        self.frame_delay = frame_delay;
        self
    }
}

struct ScriptedDetector {
    script: Script,
    frame_delay: Duration,
    live: Arc<AtomicUsize>,
}

impl Drop for ScriptedDetector {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DetectionCapability for ScriptedDetector {
    fn detect(&mut self, _frame: &RgbImage, frame_index: u64) -> DetectionResult<Vec<Detection>> {
        if !self.frame_delay.is_zero() {
            std::thread::sleep(self.frame_delay);
        }
        (self.script)(frame_index)
    }
}

impl DetectorFactory for ScriptedFactory {
    fn modules(&self) -> Vec<String> {
        self.modules.clone()
    }

    fn resolve(&self, module_name: Option<&str>) -> Option<String> {
        match module_name {
            Some(name) => self.modules.iter().find(|m| *m == name).cloned(),
            None => self.modules.first().cloned(),
        }
    }

    fn class_names(&self, module: &str) -> Option<Vec<String>> {
        self.resolve(Some(module)).map(|_| vec!["logo".to_string()])
    }

    fn create(&self, module: &str) -> DetectionResult<Box<dyn DetectionCapability>> {
        if self.resolve(Some(module)).is_none() {
            return Err(DetectionError::UnknownModule(module.to_string()));
        }
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(ScriptedDetector {
            script: Arc::clone(&self.script),
            frame_delay: self.frame_delay,
            live: Arc::clone(&self.live),
        }))
    }
}

pub fn detection(track_id: u32, class_label: &str, confidence: f32) -> Detection {
    Detection {
        track_id,
        class_label: class_label.to_string(),
        confidence,
        bbox: BoundingBox::new(0.25, 0.25, 0.25, 0.25),
    }
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub key: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// Artifact store keeping uploads in memory
#[derive(Default)]
pub struct RecordingStore {
    pub uploads: Mutex<Vec<Upload>>,
    pub fail_uploads: AtomicBool,
}

impl RecordingStore {
    pub fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn upload_keys(&self) -> Vec<String> {
        self.uploads().into_iter().map(|u| u.key).collect()
    }

    pub fn content(&self, key: &str) -> Option<String> {
        self.uploads()
            .into_iter()
            .find(|u| u.key == key)
            .map(|u| String::from_utf8_lossy(&u.content).into_owned())
    }
}

#[async_trait]
impl ArtifactStore for RecordingStore {
    async fn upload(&self, local_path: &Path, key: &str, content_type: &str) -> StorageResult<String> {
        if self.fail_uploads.load(Ordering::Relaxed) {
            return Err(StorageError::S3Error("upload rejected".to_string()));
        }
        let content = tokio::fs::read(local_path).await?;
        self.uploads.lock().unwrap().push(Upload {
            key: key.to_string(),
            content_type: content_type.to_string(),
            content,
        });
        Ok(key.to_string())
    }

    async fn download(&self, _bucket: &str, key: &str, local_path: &Path) -> StorageResult<()> {
        if key.contains("missing") {
            return Err(StorageError::NotFound(key.to_string()));
        }
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_path, b"source video").await?;
        Ok(())
    }

    async fn sign(&self, key: &str, _expiry: Duration) -> StorageResult<String> {
        Ok(format!("https://signed.example/{key}"))
    }

    async fn sign_upload(&self, key: &str, _expiry: Duration) -> StorageResult<String> {
        Ok(format!("https://signed.example/upload/{key}"))
    }

    fn bucket(&self) -> &str {
        "test-bucket"
    }
}

/// Progress channel remembering every event
#[derive(Default)]
pub struct CollectingProgress {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingProgress {
    pub fn events_for(&self, task_id: &str) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect()
    }

    pub fn terminal_events(&self, task_id: &str) -> Vec<ProgressEvent> {
        self.events_for(task_id)
            .into_iter()
            .filter(ProgressEvent::is_terminal)
            .collect()
    }

    pub fn errors(&self, task_id: &str) -> usize {
        self.events_for(task_id)
            .iter()
            .filter(|e| e.status == Some(TaskState::Error))
            .count()
    }
}

impl ProgressChannel for CollectingProgress {
    fn publish(&self, event: ProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// A service wired to in-memory collaborators
pub struct Harness {
    pub service: PipelineService,
    pub store: Arc<RecordingStore>,
    pub recorder: Arc<InMemoryStatusRecorder>,
    pub progress: Arc<CollectingProgress>,
    pub backend: Arc<SyntheticBackend>,
    pub work_dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(backend: SyntheticBackend, factory: ScriptedFactory) -> Self {
        Self::with_config(backend, factory, |_| {})
    }

    pub fn with_config(
        backend: SyntheticBackend,
        factory: ScriptedFactory,
        configure: impl FnOnce(&mut PipelineConfig),
    ) -> Self {
        let work_dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig {
            max_concurrent_tasks: 2,
            task_timeout_secs: 60,
            progress_min_step: 1,
            progress_min_interval_ms: 0,
            persist_progress: false,
            signed_url_ttl_secs: 600,
            work_dir: work_dir.path().to_path_buf(),
            font_path: None,
            progress_buffer: 16,
        };
        configure(&mut config);

        let store = Arc::new(RecordingStore::default());
        let recorder = Arc::new(InMemoryStatusRecorder::new());
        let progress = Arc::new(CollectingProgress::default());
        let backend = Arc::new(backend);

        let service = PipelineService::new(
            config,
            store.clone(),
            recorder.clone(),
            progress.clone(),
            Arc::new(factory),
            backend.clone(),
            Arc::new(Annotator::new(None).unwrap()),
        );

        Self {
            service,
            store,
            recorder,
            progress,
            backend,
            work_dir,
        }
    }
}

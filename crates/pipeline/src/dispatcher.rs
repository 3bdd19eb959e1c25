//! Task dispatch: admission, worker pool, timeout and terminal handling
//!
//! `submit` validates a descriptor, registers its task id in the active set
//! and hands the run to a worker. It never waits for the run itself. Each run
//! holds a worker permit for its whole lifetime and keeps its task id
//! registered until the terminal status is recorded and the terminal event
//! published. A run that times out inside the frame loop is marked `Error` at
//! the deadline; its task id stays registered until the abandoned loop exits.

use crate::finalizer::{ArtifactFinalizer, FinalizedArtifacts};
use crate::frame_pipeline::FramePipeline;
use crate::progress::{ProgressChannel, ProgressThrottle};
use crate::registry::TrackRegistry;
use crate::PipelineConfig;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};
use video_track_common::{
    PipelineError, ProcessingStage, ProgressEvent, Result, StatusPatch, TaskDescriptor,
    TaskStatus,
};
use video_track_detection::DetectorFactory;
use video_track_storage::{ArtifactStore, StatusRecorder};
use video_track_video::{Annotator, VideoBackend};

/// Entry point of the pipeline, shared by every intake transport
#[derive(Clone)]
pub struct PipelineService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    config: PipelineConfig,
    store: Arc<dyn ArtifactStore>,
    recorder: Arc<dyn StatusRecorder>,
    progress: Arc<dyn ProgressChannel>,
    detectors: Arc<dyn DetectorFactory>,
    frames: FramePipeline,
    finalizer: ArtifactFinalizer,
    workers: Arc<Semaphore>,
    active: Mutex<HashSet<String>>,
}

/// Keeps a task id in the active set until dropped
struct ActiveTask {
    inner: Arc<ServiceInner>,
    task_id: String,
}

impl Drop for ActiveTask {
    fn drop(&mut self) {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.task_id);
    }
}

/// Progress outlets of one run, closed before its terminal status is written
struct ProgressGate {
    closed: bool,
    persist: Option<watch::Sender<u8>>,
}

fn close_gate(gate: &Mutex<ProgressGate>) {
    let mut gate = gate.lock().unwrap_or_else(PoisonError::into_inner);
    gate.closed = true;
    // Dropping the sender ends the persister
    gate.persist = None;
}

/// Throttled progress publication from inside the frame loop
struct ProgressReporter {
    task_id: String,
    throttle: ProgressThrottle,
    channel: Arc<dyn ProgressChannel>,
    last: Arc<AtomicU8>,
    gate: Arc<Mutex<ProgressGate>>,
}

impl ProgressReporter {
    fn offer(&mut self, progress: u8) {
        let Some(value) = self.throttle.offer(progress) else {
            return;
        };
        let gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if gate.closed {
            return;
        }
        self.last.store(value, Ordering::Relaxed);
        self.channel
            .publish(ProgressEvent::progress(self.task_id.as_str(), value));
        if let Some(persist) = &gate.persist {
            persist.send_replace(value);
        }
    }
}

impl PipelineService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn ArtifactStore>,
        recorder: Arc<dyn StatusRecorder>,
        progress: Arc<dyn ProgressChannel>,
        detectors: Arc<dyn DetectorFactory>,
        backend: Arc<dyn VideoBackend>,
        annotator: Arc<Annotator>,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1)));
        let frames = FramePipeline::new(Arc::clone(&backend), annotator);
        let finalizer = ArtifactFinalizer::new(Arc::clone(&store), backend, config.signed_url_ttl());

        info!(
            "Pipeline service ready: {} workers, {}s task timeout",
            config.max_concurrent_tasks.max(1),
            config.task_timeout_secs
        );

        Self {
            inner: Arc::new(ServiceInner {
                config,
                store,
                recorder,
                progress,
                detectors,
                frames,
                finalizer,
                workers,
                active: Mutex::new(HashSet::new()),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.inner.store
    }

    #[must_use]
    pub fn recorder(&self) -> &Arc<dyn StatusRecorder> {
        &self.inner.recorder
    }

    #[must_use]
    pub fn detectors(&self) -> &Arc<dyn DetectorFactory> {
        &self.inner.detectors
    }

    /// Task ids with a run in flight, sorted
    #[must_use]
    pub fn active_tasks(&self) -> Vec<String> {
        let active = self
            .inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = active.iter().cloned().collect();
        ids.sort();
        ids
    }

    #[must_use]
    pub fn is_active(&self, task_id: &str) -> bool {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(task_id)
    }

    fn register(&self, task_id: &str) -> Option<ActiveTask> {
        let mut active = self
            .inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !active.insert(task_id.to_string()) {
            return None;
        }
        Some(ActiveTask {
            inner: Arc::clone(&self.inner),
            task_id: task_id.to_string(),
        })
    }

    /// Accept a task and start its run in the background
    ///
    /// Rejections are logged here; the returned error is informational for
    /// the caller. An unknown module is also recorded as a failed task.
    pub async fn submit(&self, descriptor: TaskDescriptor) -> Result<JoinHandle<()>> {
        if let Err(e) = descriptor.validate() {
            warn!("Dropping task descriptor: {}", e);
            return Err(e);
        }

        let task_id = descriptor.task_id.clone();
        let Some(guard) = self.register(&task_id) else {
            warn!("Task {} is already in flight, descriptor rejected", task_id);
            return Err(PipelineError::DuplicateTask(task_id));
        };

        let existing = match self.inner.recorder.get(&task_id).await {
            Ok(existing) => existing,
            Err(e) => {
                warn!("Task {}: status lookup failed: {}", task_id, e);
                None
            }
        };
        if let Some(status) = &existing {
            if status.status.is_terminal() {
                warn!(
                    "Task {} already finished with status {}, descriptor rejected",
                    task_id, status.status
                );
                return Err(PipelineError::DuplicateTask(task_id));
            }
        }

        let Some(module) = self
            .inner
            .detectors
            .resolve(descriptor.module_name.as_deref())
        else {
            let requested = descriptor
                .module_name
                .clone()
                .unwrap_or_else(|| "<default>".to_string());
            let err = PipelineError::UnknownModule(requested);
            warn!("Task {}: {}", task_id, err);
            if existing.is_none() {
                self.create_record(&descriptor).await;
            }
            self.record_failure(&task_id, 0, &err.to_string()).await;
            return Err(err);
        };

        if existing.is_none() {
            self.create_record(&descriptor).await;
        }
        if let Err(e) = self
            .inner
            .recorder
            .update(&task_id, &StatusPatch::processing())
            .await
        {
            warn!("Task {}: failed to record Processing status: {}", task_id, e);
        }
        self.inner
            .progress
            .publish(ProgressEvent::progress(task_id.as_str(), 0));

        info!(
            "Task {} accepted: s3://{}/{} module={} classes={:?}",
            task_id, descriptor.source_bucket, descriptor.source_key, module, descriptor.class_filter
        );

        let service = self.clone();
        Ok(tokio::spawn(async move {
            let permit = match Arc::clone(&service.inner.workers).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Task {}: worker pool closed: {}", descriptor.task_id, e);
                    return;
                }
            };
            service.process(descriptor, module, guard).await;
            drop(permit);
        }))
    }

    /// Feed every descriptor from `intake` into [`Self::submit`]
    ///
    /// Returns when all senders are gone. Never waits for a run.
    pub async fn run_intake(self, mut intake: mpsc::Receiver<TaskDescriptor>) {
        info!("Task intake started");
        while let Some(descriptor) = intake.recv().await {
            // Rejections are logged by submit
            let _ = self.submit(descriptor).await;
        }
        info!("Task intake closed");
    }

    async fn create_record(&self, descriptor: &TaskDescriptor) {
        let status = TaskStatus::pending(
            descriptor.task_id.as_str(),
            descriptor.source_bucket.as_str(),
            descriptor.source_key.as_str(),
        );
        if let Err(e) = self.inner.recorder.create(&status).await {
            warn!("Task {}: failed to create status record: {}", descriptor.task_id, e);
        }
    }

    /// Record `Error` with `message`, then publish the terminal error event
    async fn record_failure(&self, task_id: &str, progress: u8, message: &str) {
        if let Err(e) = self
            .inner
            .recorder
            .update(task_id, &StatusPatch::error(message))
            .await
        {
            error!("Task {}: failed to record Error status: {}", task_id, e);
        }
        self.inner
            .progress
            .publish(ProgressEvent::failed(task_id, progress, message));
    }

    /// One full run, ending with the terminal status and event
    async fn process(&self, descriptor: TaskDescriptor, module: String, guard: ActiveTask) {
        let task_id = descriptor.task_id.clone();
        let config = &self.inner.config;
        let deadline = Instant::now() + config.task_timeout();
        let last_progress = Arc::new(AtomicU8::new(0));
        let mut guard = Some(guard);

        let (persist, persister) = if config.persist_progress {
            let (sender, handle) = self.spawn_progress_persister(&task_id);
            (Some(sender), Some(handle))
        } else {
            (None, None)
        };
        let gate = Arc::new(Mutex::new(ProgressGate {
            closed: false,
            persist,
        }));

        let reporter = ProgressReporter {
            task_id: task_id.clone(),
            throttle: ProgressThrottle::new(
                0,
                config.progress_min_step,
                config.progress_min_interval(),
            ),
            channel: Arc::clone(&self.inner.progress),
            last: Arc::clone(&last_progress),
            gate: Arc::clone(&gate),
        };

        let outcome = self
            .run_task(&descriptor, module, deadline, reporter, &mut guard)
            .await;

        // Stale progress must not follow the terminal status or event
        close_gate(&gate);
        if let Some(persister) = persister {
            if let Err(e) = persister.await {
                warn!("Task {}: progress persister failed: {}", task_id, e);
            }
        }

        match outcome {
            Ok(artifacts) => self.record_success(&task_id, artifacts, &last_progress).await,
            Err(e) => {
                error!("Task {} failed: {}", task_id, e);
                self.record_failure(&task_id, last_progress.load(Ordering::Relaxed), &e.to_string())
                    .await;
            }
        }
        drop(guard);
    }

    async fn record_success(&self, task_id: &str, artifacts: FinalizedArtifacts, last_progress: &AtomicU8) {
        let patch = StatusPatch::complete(artifacts.video_key.clone(), artifacts.report_key.clone());
        if let Err(e) = self.inner.recorder.update(task_id, &patch).await {
            let message = format!("failed to record completion: {e}");
            error!("Task {}: {}", task_id, message);
            self.record_failure(task_id, last_progress.load(Ordering::Relaxed), &message)
                .await;
            return;
        }

        info!(
            "Task {} complete: {} tracks reported",
            task_id,
            artifacts.summary.per_track.len()
        );
        self.inner
            .progress
            .publish(ProgressEvent::complete(&artifacts.summary));
    }

    fn spawn_progress_persister(&self, task_id: &str) -> (watch::Sender<u8>, JoinHandle<()>) {
        let (sender, mut receiver) = watch::channel(0u8);
        let recorder = Arc::clone(&self.inner.recorder);
        let task_id = task_id.to_string();

        let handle = tokio::spawn(async move {
            while receiver.changed().await.is_ok() {
                let progress = *receiver.borrow_and_update();
                if let Err(e) = recorder
                    .update(&task_id, &StatusPatch::progress(progress))
                    .await
                {
                    debug!("Task {}: progress write failed: {}", task_id, e);
                }
            }
        });

        (sender, handle)
    }

    async fn run_task(
        &self,
        descriptor: &TaskDescriptor,
        module: String,
        deadline: Instant,
        reporter: ProgressReporter,
        guard: &mut Option<ActiveTask>,
    ) -> Result<FinalizedArtifacts> {
        let task_id = descriptor.task_id.as_str();
        let config = &self.inner.config;
        let timed_out = |during: &str| {
            PipelineError::processing(
                task_id,
                ProcessingStage::Timeout,
                format!(
                    "task exceeded {}s timeout during {during}",
                    config.task_timeout_secs
                ),
            )
        };
        let download_err = |e: std::io::Error| PipelineError::processing(task_id, ProcessingStage::Download, e);

        tokio::fs::create_dir_all(&config.work_dir)
            .await
            .map_err(download_err)?;
        let work_dir = tempfile::Builder::new()
            .prefix("task-")
            .tempdir_in(&config.work_dir)
            .map_err(download_err)?;
        debug!("Task {}: working in {}", task_id, work_dir.path().display());

        let input = work_dir
            .path()
            .join("input")
            .join(descriptor.source_file_name());
        timeout_at(
            deadline,
            self.inner
                .store
                .download(&descriptor.source_bucket, &descriptor.source_key, &input),
        )
        .await
        .map_err(|_| timed_out("download"))?
        .map_err(|e| PipelineError::processing(task_id, ProcessingStage::Download, e))?;

        let cancel = Arc::new(AtomicBool::new(false));
        let frames = self.inner.frames.clone();
        let detectors = Arc::clone(&self.inner.detectors);
        let blocking_descriptor = descriptor.clone();
        let blocking_work_dir = work_dir.path().to_path_buf();
        let blocking_cancel = Arc::clone(&cancel);
        let registry = TrackRegistry::new(task_id, work_dir.path().join("clips"));

        let mut frame_loop = tokio::task::spawn_blocking(move || {
            let mut registry = registry;
            let mut reporter = reporter;
            let task_id = blocking_descriptor.task_id.as_str();

            let result = detectors
                .create(&module)
                .map_err(|e| PipelineError::processing(task_id, ProcessingStage::Detect, e))
                .and_then(|mut detector| {
                    frames.run(
                        &blocking_descriptor,
                        &input,
                        &blocking_work_dir,
                        detector.as_mut(),
                        &mut registry,
                        &blocking_cancel,
                        &mut |progress| reporter.offer(progress),
                    )
                });
            (registry, result)
        });

        let joined = timeout_at(deadline, &mut frame_loop).await;
        let (registry, frame_result) = match joined {
            Ok(joined) => joined.map_err(|e| {
                PipelineError::processing(task_id, ProcessingStage::Decode, format!("frame loop panicked: {e}"))
            })?,
            Err(_) => {
                cancel.store(true, Ordering::Relaxed);
                let abandoned = guard.take();
                let owner = task_id.to_string();
                // The loop stops at its next frame check; it aborts its writers
                // before the work dir goes away
                tokio::spawn(async move {
                    if let Err(e) = frame_loop.await {
                        warn!("Task {}: abandoned frame loop panicked: {}", owner, e);
                    }
                    drop(work_dir);
                    drop(abandoned);
                    debug!("Task {}: abandoned frame loop exited", owner);
                });
                return Err(timed_out("frame processing"));
            }
        };
        let stats = frame_result?;

        let occurrences = registry.into_occurrences();
        timeout_at(
            deadline,
            self.inner
                .finalizer
                .finalize(descriptor, &occurrences, &stats, work_dir.path()),
        )
        .await
        .map_err(|_| timed_out("finalization"))?
    }
}

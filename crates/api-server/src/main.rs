//! Video tracking server binary
//!
//! Wires the storage backends, detection modules and ffmpeg backend into a
//! pipeline service, then runs the dispatcher intake loop, the optional SQS
//! poller and the HTTP/WebSocket server.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use video_track_api_server::{start_server, ApiState, ServiceConfig};
use video_track_detection::{DetectorFactory, OnnxModelFactory};
use video_track_intake::SqsQueuePoller;
use video_track_pipeline::{BroadcastProgressChannel, PipelineService};
use video_track_storage::{
    ArtifactBackend, ArtifactStore, InMemoryStatusRecorder, LocalArtifactStore,
    PostgresStatusRecorder, S3ArtifactStore, StatusBackend, StatusRecorder, StorageConfig,
};
use video_track_video::{Annotator, FfmpegBackend};

async fn build_store(config: &StorageConfig) -> Result<Arc<dyn ArtifactStore>> {
    Ok(match config.artifact_backend {
        ArtifactBackend::S3 => Arc::new(
            S3ArtifactStore::new(config.s3.clone())
                .await
                .context("Failed to create S3 artifact store")?,
        ),
        ArtifactBackend::Local => {
            info!("Using local artifact store at {}", config.local_root.display());
            Arc::new(LocalArtifactStore::new(
                config.local_root.clone(),
                config.s3.bucket.clone(),
            ))
        }
    })
}

async fn build_recorder(config: &StorageConfig) -> Result<Arc<dyn StatusRecorder>> {
    Ok(match config.status_backend {
        StatusBackend::Postgres => Arc::new(
            PostgresStatusRecorder::new(config.postgres.clone())
                .await
                .context("Failed to connect to PostgreSQL")?,
        ),
        StatusBackend::Memory => {
            warn!("Task status is kept in memory and lost on restart");
            Arc::new(InMemoryStatusRecorder::new())
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "video_track=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServiceConfig::load().context("Failed to load configuration")?;

    let store = build_store(&config.storage).await?;
    let recorder = build_recorder(&config.storage).await?;

    let detectors = Arc::new(OnnxModelFactory::new(config.detector.clone()));
    let modules = detectors.modules();
    if modules.is_empty() {
        warn!(
            "No detection modules found in {}",
            config.detector.model_dir.display()
        );
    } else {
        info!("Detection modules: {}", modules.join(", "));
    }

    if !FfmpegBackend::is_available() {
        warn!("ffmpeg/ffprobe not found on PATH, tasks will fail");
    }
    let annotator = Annotator::new(config.pipeline.font_path.as_deref())
        .context("Failed to load label font")?;

    let progress = BroadcastProgressChannel::new(config.pipeline.progress_buffer);
    let service = PipelineService::new(
        config.pipeline.clone(),
        store,
        recorder,
        Arc::new(progress.clone()),
        detectors,
        Arc::new(FfmpegBackend::new()),
        Arc::new(annotator),
    );

    let (intake, intake_rx) = mpsc::channel(config.server.intake_buffer.max(1));
    tokio::spawn(service.clone().run_intake(intake_rx));

    if config.queue.is_enabled() {
        let poller = SqsQueuePoller::new(config.queue.clone())
            .await
            .context("Failed to create SQS poller")?;
        let sender = intake.clone();
        tokio::spawn(async move {
            if let Err(e) = poller.run(sender).await {
                error!("SQS poller stopped: {}", e);
            }
        });
    }

    let state = ApiState {
        service,
        progress,
        intake,
        presign_ttl: config.server.presign_ttl(),
    };

    info!("Starting video tracking server");
    start_server(&config.server.bind_addr, state)
        .await
        .context("API server failed")?;

    Ok(())
}

//! HTTP API tests against a server on an ephemeral port
//!
//! The intake channel is drained by the test itself, so no task is processed.

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use video_track_api_server::{serve, ApiState};
use video_track_common::TaskDescriptor;
use video_track_detection::{DetectorConfig, OnnxModelFactory};
use video_track_pipeline::{BroadcastProgressChannel, PipelineConfig, PipelineService};
use video_track_storage::{InMemoryStatusRecorder, LocalArtifactStore};
use video_track_video::{Annotator, FfmpegBackend};

struct TestServer {
    base_url: String,
    intake: mpsc::Receiver<TaskDescriptor>,
    _dirs: Vec<tempfile::TempDir>,
}

async fn start() -> TestServer {
    let artifacts = tempfile::tempdir().unwrap();
    let models = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();

    std::fs::write(models.path().join("logo.onnx"), b"not a real model").unwrap();
    std::fs::write(models.path().join("logo.yaml"), "names: [logo, text]\n").unwrap();

    let detectors = OnnxModelFactory::new(DetectorConfig {
        model_dir: models.path().to_path_buf(),
        default_module: None,
        ..Default::default()
    });
    let pipeline_config = PipelineConfig {
        work_dir: work.path().to_path_buf(),
        font_path: None,
        ..Default::default()
    };

    let progress = BroadcastProgressChannel::new(16);
    let service = PipelineService::new(
        pipeline_config,
        Arc::new(LocalArtifactStore::new(artifacts.path(), "test-bucket")),
        Arc::new(InMemoryStatusRecorder::new()),
        Arc::new(progress.clone()),
        Arc::new(detectors),
        Arc::new(FfmpegBackend::new()),
        Arc::new(Annotator::new(None).unwrap()),
    );

    let (sender, receiver) = mpsc::channel(8);
    let state = ApiState {
        service,
        progress,
        intake: sender,
        presign_ttl: Duration::from_secs(300),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        serve(listener, state).await.unwrap();
    });

    TestServer {
        base_url: format!("http://{addr}"),
        intake: receiver,
        _dirs: vec![artifacts, models, work],
    }
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = start().await;
    let response = reqwest::get(format!("{}/health", server.base_url))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
    assert_eq!(json["active_tasks"], 0);
}

#[tokio::test]
async fn test_presign_upload() {
    let server = start().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/api/v1/uploads/presign", server.base_url))
        .json(&serde_json::json!({"fileName": "holiday.mp4"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let json: serde_json::Value = response.json().await.unwrap();
    let key = json["key"].as_str().unwrap();
    assert!(key.starts_with("uploads/"));
    assert!(key.ends_with("_holiday.mp4"));
    assert_eq!(json["bucket"], "test-bucket");
    assert!(json["url"].as_str().unwrap().starts_with("file://"));

    let response = client
        .post(format!("{}/api/v1/uploads/presign", server.base_url))
        .json(&serde_json::json!({"fileName": ""}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_start_task_and_poll_status() {
    let mut server = start().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/api/v1/tasks", server.base_url))
        .json(&serde_json::json!({
            "bucket": "test-bucket",
            "key": "uploads/abc_holiday.mp4",
            "moduleName": "logo",
            "classFilter": ["logo"]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    let json: serde_json::Value = response.json().await.unwrap();
    let task_id = json["taskId"].as_str().unwrap().to_string();

    let descriptor = server.intake.recv().await.unwrap();
    assert_eq!(descriptor.task_id, task_id);
    assert_eq!(descriptor.source_key, "uploads/abc_holiday.mp4");
    assert_eq!(descriptor.module_name.as_deref(), Some("logo"));
    assert!(descriptor.accepts_class("logo"));
    assert!(!descriptor.accepts_class("text"));

    let response = reqwest::get(format!("{}/api/v1/tasks/{}", server.base_url, task_id))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let status: serde_json::Value = response.json().await.unwrap();
    assert_eq!(status["taskId"], task_id.as_str());
    assert_eq!(status["status"], "Pending");
    assert_eq!(status["progress"], 0);
    assert_eq!(status["bucket"], "test-bucket");
}

#[tokio::test]
async fn test_start_task_requires_key() {
    let server = start().await;
    let response = reqwest::Client::new()
        .post(format!("{}/api/v1/tasks", server.base_url))
        .json(&serde_json::json!({"bucket": "test-bucket", "key": ""}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_unknown_task_status() {
    let server = start().await;
    let response = reqwest::get(format!("{}/api/v1/tasks/does-not-exist", server.base_url))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_module_discovery() {
    let server = start().await;

    let json: serde_json::Value = reqwest::get(format!("{}/api/v1/modules", server.base_url))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(json["modules"], serde_json::json!(["logo.onnx"]));

    let json: serde_json::Value =
        reqwest::get(format!("{}/api/v1/modules/logo/classes", server.base_url))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
    assert_eq!(json["module"], "logo.onnx");
    assert_eq!(json["classes"], serde_json::json!(["logo", "text"]));

    let response = reqwest::get(format!("{}/api/v1/modules/faces/classes", server.base_url))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

//! Socket transport against a live server: task frames in, progress frames out

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use video_track_api_server::{serve, ApiState};
use video_track_common::{ProgressEvent, TaskDescriptor};
use video_track_detection::{DetectorConfig, OnnxModelFactory};
use video_track_pipeline::{BroadcastProgressChannel, PipelineConfig, PipelineService, ProgressChannel};
use video_track_storage::{InMemoryStatusRecorder, LocalArtifactStore};
use video_track_video::{Annotator, FfmpegBackend};

struct TestServer {
    addr: std::net::SocketAddr,
    progress: BroadcastProgressChannel,
    intake: mpsc::Receiver<TaskDescriptor>,
    _dirs: Vec<tempfile::TempDir>,
}

async fn start() -> TestServer {
    let artifacts = tempfile::tempdir().unwrap();
    let models = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();

    let progress = BroadcastProgressChannel::new(16);
    let service = PipelineService::new(
        PipelineConfig {
            work_dir: work.path().to_path_buf(),
            font_path: None,
            ..Default::default()
        },
        Arc::new(LocalArtifactStore::new(artifacts.path(), "test-bucket")),
        Arc::new(InMemoryStatusRecorder::new()),
        Arc::new(progress.clone()),
        Arc::new(OnnxModelFactory::new(DetectorConfig {
            model_dir: models.path().to_path_buf(),
            default_module: None,
            ..Default::default()
        })),
        Arc::new(FfmpegBackend::new()),
        Arc::new(Annotator::new(None).unwrap()),
    );

    let (sender, receiver) = mpsc::channel(8);
    let state = ApiState {
        service,
        progress: progress.clone(),
        intake: sender,
        presign_ttl: Duration::from_secs(300),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        serve(listener, state).await.unwrap();
    });

    TestServer {
        addr,
        progress,
        intake: receiver,
        _dirs: vec![artifacts, models, work],
    }
}

#[tokio::test]
async fn test_socket_task_in_progress_out() {
    let mut server = start().await;
    let (mut ws, _) = connect_async(format!("ws://{}/ws", server.addr))
        .await
        .unwrap();

    let frame = serde_json::json!({
        "event": "task",
        "data": {
            "taskId": "S1",
            "bucket": "uploads",
            "key": "S1/input/clip.mp4",
            "moduleName": "logo",
            "classFilter": ["logo"]
        }
    });
    ws.send(Message::Text(frame.to_string())).await.unwrap();

    let descriptor = timeout(Duration::from_secs(5), server.intake.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(descriptor.task_id, "S1");
    assert_eq!(descriptor.source_bucket, "uploads");
    assert_eq!(descriptor.source_key, "S1/input/clip.mp4");
    assert_eq!(descriptor.module_name.as_deref(), Some("logo"));
    assert!(descriptor.accepts_class("logo"));

    // The handler subscribed before reading the task frame
    server.progress.publish(ProgressEvent::progress("S1", 42));

    let text = loop {
        let message = timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Text(text) = message {
            break text;
        }
    };
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(json["event"], "progress");
    assert_eq!(json["data"]["taskId"], "S1");
    assert_eq!(json["data"]["progress"], 42);
}

#[tokio::test]
async fn test_malformed_socket_frame_ignored() {
    let mut server = start().await;
    let (mut ws, _) = connect_async(format!("ws://{}/ws", server.addr))
        .await
        .unwrap();

    ws.send(Message::Text("not json".to_string())).await.unwrap();
    let frame = serde_json::json!({
        "event": "task",
        "data": {"taskId": "S2", "bucket": "uploads", "key": "S2/input/clip.mp4"}
    });
    ws.send(Message::Text(frame.to_string())).await.unwrap();

    // The bad frame is skipped and the connection stays usable
    let descriptor = timeout(Duration::from_secs(5), server.intake.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(descriptor.task_id, "S2");
}

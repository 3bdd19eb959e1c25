//! Integration tests for storage backends
//!
//! These tests require live instances of `MinIO` and `PostgreSQL`.
//! Start services with: `docker-compose up -d`
//!
//! Run tests with: `cargo test --package video-track-storage --test storage_integration_test -- --ignored --nocapture`

use std::time::Duration;
use video_track_common::{StatusPatch, TaskState, TaskStatus};
use video_track_storage::*;

/// Check if `MinIO` is available
async fn is_minio_available() -> bool {
    tokio::net::TcpStream::connect("127.0.0.1:9000")
        .await
        .is_ok()
}

/// Check if `PostgreSQL` is available
async fn is_postgres_available() -> bool {
    tokio::net::TcpStream::connect("127.0.0.1:5432")
        .await
        .is_ok()
}

fn minio_config() -> S3Config {
    S3Config {
        bucket: "video-track".to_string(),
        region: "us-east-1".to_string(),
        endpoint: Some("http://localhost:9000".to_string()),
        access_key_id: "minioadmin".to_string(),
        secret_access_key: "minioadmin".to_string(),
        prefix: String::new(),
    }
}

#[tokio::test]
#[ignore] // Requires MinIO running on localhost:9000 with bucket video-track
async fn test_minio_upload_download_sign() {
    if !is_minio_available().await {
        eprintln!("MinIO not available on 127.0.0.1:9000, skipping");
        return;
    }

    let store = S3ArtifactStore::new(minio_config())
        .await
        .expect("Failed to create S3 client");

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("report.csv");
    tokio::fs::write(&local, b"TrackId,StartTime\n").await.unwrap();

    let key = store
        .upload(&local, "it-test/output/report.csv", "text/csv")
        .await
        .expect("Failed to upload");
    assert_eq!(key, "it-test/output/report.csv");

    let copy = dir.path().join("copy.csv");
    store
        .download("video-track", &key, &copy)
        .await
        .expect("Failed to download");
    assert_eq!(tokio::fs::read(&copy).await.unwrap(), b"TrackId,StartTime\n");

    let url = store
        .sign(&key, Duration::from_secs(300))
        .await
        .expect("Failed to sign");
    assert!(url.contains("X-Amz-Signature"));
}

#[tokio::test]
#[ignore] // Requires PostgreSQL running on localhost:5432
async fn test_postgres_status_lifecycle() {
    if !is_postgres_available().await {
        eprintln!("PostgreSQL not available on 127.0.0.1:5432, skipping");
        return;
    }

    let recorder = PostgresStatusRecorder::new(PostgresConfig::default())
        .await
        .expect("Failed to connect to PostgreSQL");

    let task_id = format!("it-{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0));
    recorder
        .create(&TaskStatus::pending(&task_id, "in", "uploads/a.mp4"))
        .await
        .unwrap();
    recorder
        .update(&task_id, &StatusPatch::processing())
        .await
        .unwrap();
    recorder
        .update(
            &task_id,
            &StatusPatch::complete(
                Some(format!("{task_id}/output/processed_video.mp4")),
                format!("{task_id}/output/report.csv"),
            ),
        )
        .await
        .unwrap();

    let status = recorder.get(&task_id).await.unwrap().unwrap();
    assert_eq!(status.status, TaskState::Complete);
    assert_eq!(status.progress, 100);
    assert_eq!(status.bucket.as_deref(), Some("in"));
}

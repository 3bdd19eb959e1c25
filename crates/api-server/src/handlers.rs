//! HTTP request handlers for API endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tracing::{error, info, warn};
use uuid::Uuid;
use video_track_common::TaskStatus;
use video_track_detection::DetectorFactory as _;
use video_track_storage::{ArtifactStore as _, StatusRecorder as _};

use crate::{
    types::{
        upload_key, ClassesResponse, HealthResponse, ModulesResponse, PresignRequest,
        PresignResponse, StartTaskRequest, StartTaskResponse,
    },
    ApiState,
};

/// Health check endpoint
pub async fn health_check(State(state): State<ApiState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_tasks: state.service.active_tasks().len(),
    })
}

/// Presigned PUT URL for uploading a source video
pub async fn presign_upload(
    State(state): State<ApiState>,
    Json(request): Json<PresignRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let upload_id = Uuid::new_v4().to_string();
    let key = upload_key(&upload_id, &request.file_name).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            format!("Invalid file name: {:?}", request.file_name),
        )
    })?;

    let store = state.service.store();
    let url = store
        .sign_upload(&key, state.presign_ttl)
        .await
        .map_err(|e| {
            error!("Failed to presign upload for {}: {}", key, e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        })?;

    info!("Presigned upload {}", key);
    Ok(Json(PresignResponse {
        url,
        bucket: store.bucket().to_string(),
        key,
    }))
}

/// Create a task for an uploaded video and queue it for processing
pub async fn start_task(
    State(state): State<ApiState>,
    Json(request): Json<StartTaskRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if request.bucket.trim().is_empty() || request.key.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "bucket and key are required".to_string(),
        ));
    }

    let task_id = Uuid::new_v4().to_string();
    let status = TaskStatus::pending(task_id.as_str(), request.bucket.as_str(), request.key.as_str());
    state.service.recorder().create(&status).await.map_err(|e| {
        error!("Failed to create status for task {}: {}", task_id, e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;

    let descriptor = request.into_descriptor(task_id.clone());
    state.intake.send(descriptor).await.map_err(|_| {
        warn!("Intake closed, task {} not queued", task_id);
        (
            StatusCode::SERVICE_UNAVAILABLE,
            "Task intake is shutting down".to_string(),
        )
    })?;

    info!("Task {} queued", task_id);
    Ok((StatusCode::ACCEPTED, Json(StartTaskResponse { task_id })))
}

/// Current status record of a task
pub async fn get_task_status(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    match state.service.recorder().get(&task_id).await {
        Ok(Some(status)) => Ok(Json(status)),
        Ok(None) => Err((StatusCode::NOT_FOUND, format!("Task not found: {task_id}"))),
        Err(e) => {
            error!("Failed to read status of task {}: {}", task_id, e);
            Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

/// Available detection modules
pub async fn list_modules(
    State(state): State<ApiState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let modules = state.service.detectors().modules();
    if modules.is_empty() {
        return Err((
            StatusCode::NOT_FOUND,
            "No detection modules installed".to_string(),
        ));
    }
    Ok(Json(ModulesResponse { modules }))
}

/// Class names a detection module can report
pub async fn list_module_classes(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let detectors = state.service.detectors();
    let module = detectors
        .resolve(Some(name.as_str()))
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Unknown module: {name}")))?;
    let classes = detectors
        .class_names(&module)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("No classes for module: {name}")))?;

    Ok(Json(ClassesResponse { module, classes }))
}

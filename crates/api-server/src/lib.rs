//! HTTP and WebSocket front end of the video tracking service
//!
//! - `POST /api/v1/uploads/presign`: presigned upload URL for a source video
//! - `POST /api/v1/tasks`: start processing an uploaded video
//! - `GET /api/v1/tasks/{task_id}`: status record of a task
//! - `GET /api/v1/modules`, `GET /api/v1/modules/{name}/classes`: detection modules
//! - `GET /ws`: socket transport for tasks and live progress

pub mod config;
mod handlers;
mod types;
mod ws;

use axum::{
    routing::{get, post},
    Router,
};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use video_track_common::TaskDescriptor;
use video_track_pipeline::{BroadcastProgressChannel, PipelineService};

pub use config::{ConfigError, ServerConfig, ServiceConfig};
pub use handlers::*;
pub use types::*;
pub use ws::ws_handler;

/// State shared across handlers
#[derive(Clone)]
pub struct ApiState {
    pub service: PipelineService,
    /// Fan-out of the service's progress events
    pub progress: BroadcastProgressChannel,
    /// Sending half of the dispatcher's intake channel
    pub intake: mpsc::Sender<TaskDescriptor>,
    pub presign_ttl: Duration,
}

/// Build the API router with all endpoints
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Uploads and tasks
        .route("/api/v1/uploads/presign", post(presign_upload))
        .route("/api/v1/tasks", post(start_task))
        .route("/api/v1/tasks/{task_id}", get(get_task_status))
        // Detection modules
        .route("/api/v1/modules", get(list_modules))
        .route("/api/v1/modules/{name}/classes", get(list_module_classes))
        // Socket transport
        .route("/ws", get(ws_handler))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve on an already bound listener
pub async fn serve(listener: TcpListener, state: ApiState) -> Result<(), std::io::Error> {
    let app = build_router(state);
    axum::serve(listener, app).await
}

/// Start the API server
pub async fn start_server(addr: &str, state: ApiState) -> Result<(), std::io::Error> {
    tracing::info!("Starting API server on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state).await
}

//! WebSocket transport
//!
//! Inbound `{"event":"task","data":...}` frames go into the intake channel.
//! Every progress event of every task is pushed to every connected client
//! as `{"event":"progress","data":...}`.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::{types::SocketMessage, ApiState};

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ApiState) {
    let (mut outbound, mut inbound) = socket.split();
    let mut events = state.progress.subscribe();
    info!("WebSocket client connected");

    let mut forward = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Slow WebSocket client skipped {} progress events", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            let text = match serde_json::to_string(&SocketMessage::Progress(event)) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Cannot encode progress event: {}", e);
                    continue;
                }
            };
            if outbound.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let intake = state.intake.clone();
    let mut receive = tokio::spawn(async move {
        while let Some(Ok(message)) = inbound.next().await {
            match message {
                Message::Text(text) => match serde_json::from_str::<SocketMessage>(text.as_str()) {
                    Ok(SocketMessage::Task(descriptor)) => {
                        debug!("Socket task {}", descriptor.task_id);
                        if intake.send(descriptor).await.is_err() {
                            warn!("Intake closed, dropping socket task");
                            break;
                        }
                    }
                    Ok(SocketMessage::Progress(_)) => {
                        debug!("Ignoring progress frame from client");
                    }
                    Err(e) => warn!("Ignoring malformed socket frame: {}", e),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Either side ending closes the connection
    tokio::select! {
        _ = &mut forward => receive.abort(),
        _ = &mut receive => forward.abort(),
    }
    info!("WebSocket client disconnected");
}

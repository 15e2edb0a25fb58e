// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
//! Session broker daemon for shared virtual tabletops.
//!
//! One axum process hosts many sessions. Each session is a broker task
//! owning its clients and authoritative table state; the HTTP layer only
//! upgrades sockets, routes frames, and serves observability endpoints.

pub mod broker;
pub mod legacy;
pub mod manager;
pub mod presign;
pub mod protocol;

pub use broker::{BrokerTiming, SessionBroker, SessionCommand, SessionHandle, SessionStats};
pub use legacy::serve_legacy_tcp;
pub use manager::ConnectionManager;
pub use presign::{BlobPresigner, LocalPresigner, PresignedDownload, PresignedUpload};
pub use protocol::{ClientIdentity, HandlerOutput, PlayerInfo, ServerProtocol, SessionAsset};

use axum::{
    Json, Router,
    extract::{Path as AxPath, Query, State, WebSocketUpgrade, ws},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tavern_protocol::{generate_client_id, now_epoch};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Shared state behind the axum router.
pub struct AppState {
    /// Session registry.
    pub manager: ConnectionManager,
    /// Seconds since epoch at process start.
    pub started_at: f64,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

/// Build the axum router with the WebSocket endpoint and observability routes.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(cmd_health))
        .route("/stats", get(cmd_stats))
        .route("/stats/{session_code}", get(cmd_session_stats))
        .route("/ws/game/{session_code}", get(ws_game))
        .with_state(state)
}

async fn cmd_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "tavern-server",
        "protocol_version": tavern_protocol::PROTOCOL_VERSION,
        "uptime_secs": (now_epoch() - state.started_at) as u64,
    }))
}

async fn cmd_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sessions = state.manager.all_stats().await;
    Json(json!({
        "total_sessions": sessions.len(),
        "sessions": sessions,
    }))
}

async fn cmd_session_stats(
    AxPath(session_code): AxPath<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<SessionStats>, ApiError> {
    let handle = state
        .manager
        .existing_session(&session_code)
        .await
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "session not found"))?;
    let stats = handle
        .stats()
        .await
        .ok_or_else(|| ApiError::new(StatusCode::GONE, "session shut down"))?;
    Ok(Json(stats))
}

/// Join parameters carried on the upgrade request.
///
/// The HTTP gateway in front of this service authenticates the user and
/// forwards the identity; a missing identity degrades to a guest.
#[derive(Debug, Deserialize)]
struct JoinParams {
    client_id: Option<String>,
    user_id: Option<String>,
    username: Option<String>,
}

async fn ws_game(
    ws: WebSocketUpgrade,
    AxPath(session_code): AxPath<String>,
    Query(params): Query<JoinParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, session_code, params, socket))
}

async fn handle_socket(
    state: Arc<AppState>,
    session_code: String,
    params: JoinParams,
    socket: ws::WebSocket,
) {
    let client_id = params.client_id.unwrap_or_else(generate_client_id);
    let user_id = params.user_id.unwrap_or_else(|| "0".to_string());
    let username = params.username.unwrap_or_else(|| "guest".to_string());
    info!(session = %session_code, client = %client_id, user = %username, "socket connected");

    let session = state.manager.session(&session_code).await;
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    if !session
        .send(SessionCommand::Join {
            client_id: client_id.clone(),
            user_id,
            username,
            outbound: outbound_tx,
        })
        .await
    {
        return;
    }

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            frame = outbound_rx.recv() => match frame {
                Some(text) => {
                    if sink.send(ws::Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                // The broker dropped this client (kick, ban, reap).
                None => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(ws::Message::Text(text))) => {
                    if !session
                        .send(SessionCommand::Frame {
                            client_id: client_id.clone(),
                            text: text.to_string(),
                        })
                        .await
                    {
                        break;
                    }
                }
                Some(Ok(ws::Message::Close(_))) | None => break,
                Some(Ok(other)) => debug!(?other, "ignoring non-text frame"),
                Some(Err(e)) => {
                    debug!(error = %e, "socket read error");
                    break;
                }
            },
        }
    }

    let _ = session
        .send(SessionCommand::Leave {
            client_id: client_id.clone(),
        })
        .await;
    info!(session = %session_code, client = %client_id, "socket closed");
}

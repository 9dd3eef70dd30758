//! Worker connection upgrade.
//!
//! # Data Flow
//! ```text
//! Worker ── GET /websocket (x-server-id) ──→ upgrade_handler
//!     → SessionDirectory::get_or_spawn(worker id)
//!     → session::transport::serve_socket (frames ⇄ session actor)
//! ```
//!
//! # Design Decisions
//! - The worker id header is mandatory; the connection is not authenticated
//! - A new connection for a known worker id replaces the old one

use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};

use crate::http::server::AppState;
use crate::protocol::SERVER_ID_HEADER;
use crate::session::transport::serve_socket;

pub async fn upgrade_handler(State(state): State<AppState>, headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    let Some(worker_id) = headers
        .get(SERVER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    else {
        tracing::warn!("Upgrade request without worker id");
        return (StatusCode::BAD_REQUEST, "missing x-server-id header").into_response();
    };

    tracing::info!(worker_id = %worker_id, "Worker connecting");
    let handle = state.sessions.get_or_spawn(worker_id);
    ws.on_upgrade(move |socket| serve_socket(handle, socket))
}

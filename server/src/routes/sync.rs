//! Sync endpoint routes.

use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::handlers::handle_websocket_connection;
use crate::AppState;

/// Query parameters of the upgrade request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQuery {
    pub session_id: Option<String>,
}

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/sync", get(websocket_handler))
}

/// GET /sync?sessionId=... - Upgrade to the sync WebSocket.
async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<SyncQuery>,
) -> Result<Response> {
    let session_id = query
        .session_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::BadRequest("sessionId is required".to_string()))?;

    Ok(ws.on_upgrade(move |socket| handle_websocket_connection(socket, state, session_id)))
}

//! Read-only view of the documents the server holds.

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::AppState;

/// Collection summary.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionResponse {
    pub name: String,
    pub server_cursor: u64,
    pub deltas: usize,
    pub document: serde_json::Value,
}

/// Create collection routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/collections", get(list_collections))
        .route("/collections/{name}", get(get_collection))
}

/// GET /collections - Names of all synced collections.
async fn list_collections(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.sync.lock().await.collections())
}

/// GET /collections/{name} - Materialized document of one collection.
async fn get_collection(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<CollectionResponse>> {
    let sync = state.sync.lock().await;
    let store = sync.persistence();

    let not_found = || AppError::NotFound(format!("collection {}", name));
    let document = store.document(&name).ok_or_else(not_found)??;
    let server_cursor = store.cursor(&name).ok_or_else(not_found)?;

    Ok(Json(CollectionResponse {
        name: name.clone(),
        server_cursor,
        deltas: store.log_len(&name),
        document: document.to_json().unwrap_or(serde_json::Value::Null),
    }))
}

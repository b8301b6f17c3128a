//! Integration tests for the HTTP surface of the sync server.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use converge_engine::{ClientMessage, Delta, DeltaEnvelope, Timestamp};
use converge_server::{app, AppState, Config};
use serde_json::{json, Value};
use tower::ServiceExt;

/// Test helper to send a GET request through the router.
async fn get(state: &AppState, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app(state.clone())
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

async fn get_json(state: &AppState, uri: &str) -> (StatusCode, Value) {
    let (status, body) = get(state, uri).await;
    (status, serde_json::from_slice(&body).unwrap())
}

fn envelope(delta: Delta) -> DeltaEnvelope {
    DeltaEnvelope::new("device-1", delta)
}

async fn seed(state: &AppState) {
    let deltas = vec![
        envelope(Delta::set(
            Timestamp::new(1706745600000, 0, "device-1"),
            vec![],
            "title",
            json!("Buy milk"),
        )),
        envelope(Delta::set_value(
            Timestamp::new(1706745600001, 0, "device-1"),
            vec![],
            "tags",
            json!(["errand"]),
        )),
    ];
    let mut sync = state.sync.lock().await;
    let ack = sync
        .on_message("session-1", ClientMessage::sync("todos", None, deltas))
        .unwrap();
    assert!(ack.is_some());
}

#[cfg(test)]
mod http_tests {
    use super::*;

    #[tokio::test]
    async fn test_health_check() {
        let state = AppState::new(Config::default());

        let (status, body) = get_json(&state, "/health").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert_eq!(body["connections"], 0);
        assert_eq!(body["sessions"], 0);
    }

    #[tokio::test]
    async fn test_root() {
        let state = AppState::new(Config::default());

        let (status, body) = get(&state, "/").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"Converge Sync Server");
    }

    #[tokio::test]
    async fn test_unknown_collection_is_not_found() {
        let state = AppState::new(Config::default());

        let (status, body) = get_json(&state, "/collections/nope").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "collection nope");
    }
}

#[cfg(test)]
mod collection_tests {
    use super::*;

    #[tokio::test]
    async fn test_collection_document() {
        let state = AppState::new(Config::default());
        seed(&state).await;

        let (status, body) = get_json(&state, "/collections/todos").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "name": "todos",
                "serverCursor": 2,
                "deltas": 2,
                "document": {"title": "Buy milk", "tags": ["errand"]}
            })
        );
    }

    #[tokio::test]
    async fn test_collection_list() {
        let state = AppState::new(Config::default());
        seed(&state).await;
        {
            let mut sync = state.sync.lock().await;
            sync.on_message("session-2", ClientMessage::sync("notes", None, vec![]))
                .unwrap();
        }

        let (status, body) = get_json(&state, "/collections").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!(["notes", "todos"]));
    }

    #[tokio::test]
    async fn test_collection_without_deltas_is_not_found() {
        let state = AppState::new(Config::default());
        {
            let mut sync = state.sync.lock().await;
            sync.on_message("session-1", ClientMessage::sync("notes", None, vec![]))
                .unwrap();
        }

        let (status, _) = get(&state, "/collections/notes").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

//! Converge Server - reference sync server for local-first data sync.
//!
//! Clients open a WebSocket on `/sync?sessionId=...` and exchange frames of
//! protocol messages. Deltas are kept in an in-memory log per collection and
//! reconciled by `converge-engine`.

pub mod compaction;
pub mod config;
pub mod error;
pub mod handlers;
pub mod persistence;
pub mod routes;
pub mod websocket;

use std::sync::Arc;

use axum::Router;
use converge_engine::SyncServer;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::{Config, ConfigError};
pub use error::AppError;
pub use persistence::MemoryPersistence;
pub use websocket::ConnectionManager;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Protocol state; one frame is handled at a time.
    pub sync: Arc<Mutex<SyncServer<MemoryPersistence>>>,
    pub config: Arc<Config>,
    pub conn_manager: Arc<ConnectionManager>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            sync: Arc::new(Mutex::new(SyncServer::new(MemoryPersistence::new()))),
            config: Arc::new(config),
            conn_manager: ConnectionManager::new_shared(),
        }
    }
}

/// Build the application router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

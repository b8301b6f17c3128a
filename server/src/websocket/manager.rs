//! WebSocket connection manager.
//!
//! Tracks active WebSocket connections per session so that frames produced
//! by the sync server can be pushed to every socket a session has open.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

/// Sender for encoded frames.
pub type FrameSender = mpsc::UnboundedSender<String>;

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    /// Unique identifier for this connection
    pub id: String,
    /// Sync session the client announced on upgrade
    pub session_id: String,
    /// Channel to send frames to this connection
    pub sender: FrameSender,
}

/// Manages active WebSocket connections.
///
/// Thread-safe and can be shared across handlers via `Arc`.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    /// All active connections, keyed by connection ID.
    connections: DashMap<String, Connection>,
    /// Index of connections by session for efficient lookup.
    by_session: DashMap<String, Vec<String>>,
}

impl ConnectionManager {
    /// Create a new connection manager.
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            by_session: DashMap::new(),
        }
    }

    /// Create a new connection manager wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection.
    ///
    /// Returns the connection ID.
    pub fn register(&self, session_id: String, sender: FrameSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();

        let connection = Connection {
            id: conn_id.clone(),
            session_id: session_id.clone(),
            sender,
        };

        self.connections.insert(conn_id.clone(), connection);
        self.by_session
            .entry(session_id.clone())
            .or_default()
            .push(conn_id.clone());

        tracing::info!(conn_id = %conn_id, session_id = %session_id, "WebSocket connection registered");

        conn_id
    }

    /// Unregister a connection.
    pub fn unregister(&self, conn_id: &str) {
        if let Some((_, conn)) = self.connections.remove(conn_id) {
            if let Some(mut conn_ids) = self.by_session.get_mut(&conn.session_id) {
                conn_ids.retain(|id| id != conn_id);
                if conn_ids.is_empty() {
                    drop(conn_ids);
                    self.by_session.remove(&conn.session_id);
                }
            }

            tracing::info!(conn_id = %conn_id, session_id = %conn.session_id, "WebSocket connection unregistered");
        }
    }

    /// Send a frame to a specific connection.
    pub fn send_to(&self, conn_id: &str, frame: String) -> bool {
        match self.connections.get(conn_id) {
            Some(conn) => conn.sender.send(frame).is_ok(),
            None => false,
        }
    }

    /// Send a frame to every connection of a session.
    ///
    /// Returns the number of connections that received it.
    pub fn send_to_session(&self, session_id: &str, frame: &str) -> usize {
        let Some(conn_ids) = self.by_session.get(session_id).map(|ids| ids.clone()) else {
            return 0;
        };

        conn_ids
            .iter()
            .filter(|id| self.send_to(id, frame.to_string()))
            .count()
    }

    /// Sessions with at least one live connection.
    pub fn sessions(&self) -> Vec<String> {
        self.by_session
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Get the number of sessions connected.
    pub fn session_count(&self) -> usize {
        self.by_session.len()
    }
}

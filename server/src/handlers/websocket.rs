//! WebSocket handler for real-time sync.
//!
//! Every inbound frame is decoded into protocol messages and run through the
//! shared [`SyncServer`](converge_engine::SyncServer). Acks go back to the
//! sender, then every connected session gets the deltas it has not seen.

use axum::extract::ws::{Message, WebSocket};
use converge_engine::{decode_frame, encode_frame, ClientMessage, ServerMessage, SyncServer};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::persistence::MemoryPersistence;
use crate::websocket::ConnectionManager;
use crate::AppState;

/// Handle an established WebSocket connection.
///
/// This function:
/// 1. Registers the connection with the manager
/// 2. Spawns a task to forward outgoing frames
/// 3. Processes incoming frames in a loop
/// 4. Cleans up on disconnect
pub async fn handle_websocket_connection(socket: WebSocket, state: AppState, session_id: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let conn_id = state.conn_manager.register(session_id.clone(), tx);

    tracing::info!(
        conn_id = %conn_id,
        session_id = %session_id,
        "WebSocket client connected"
    );

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = ws_sender.send(Message::Text(frame.into())).await {
                tracing::warn!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                process_frame(text.as_str(), &state, &conn_id, &session_id).await;
            }
            Ok(Message::Binary(_)) => {
                tracing::warn!("Binary messages not supported");
            }
            Ok(Message::Ping(data)) => {
                tracing::trace!("Received ping: {} bytes", data.len());
            }
            Ok(Message::Pong(_)) => {
                tracing::trace!("Received pong");
            }
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    state.conn_manager.unregister(&conn_id);
    send_task.abort();

    tracing::info!(
        conn_id = %conn_id,
        session_id = %session_id,
        active_connections = state.conn_manager.connection_count(),
        "WebSocket client disconnected"
    );
}

/// Run one inbound frame through the sync server.
async fn process_frame(text: &str, state: &AppState, conn_id: &str, session_id: &str) {
    let messages: Vec<ClientMessage> = match decode_frame(text) {
        Ok(messages) => messages,
        Err(e) => {
            tracing::warn!(conn_id = %conn_id, "Dropping malformed frame: {}", e);
            return;
        }
    };

    let mut sync = state.sync.lock().await;

    let mut acks = Vec::new();
    for message in messages {
        let collection = message.collection().to_string();
        match sync.on_message(session_id, message) {
            Ok(Some(ack)) => acks.push(ack),
            Ok(None) => {}
            Err(e) => {
                tracing::error!(
                    session_id = %session_id,
                    collection = %collection,
                    "Failed to handle sync message: {}",
                    e
                );
            }
        }
    }

    if !acks.is_empty() {
        if let Some(frame) = encode(&acks) {
            state.conn_manager.send_to(conn_id, frame);
        }
    }

    push_pending(&sync, &state.conn_manager);
}

/// Send every connected session the deltas it has not seen yet.
fn push_pending(sync: &SyncServer<MemoryPersistence>, conn_manager: &ConnectionManager) {
    for session in conn_manager.sessions() {
        let messages = match sync.get_messages(&session) {
            Ok(messages) => messages,
            Err(e) => {
                tracing::error!(session_id = %session, "Failed to collect deltas: {}", e);
                continue;
            }
        };
        if messages.is_empty() {
            continue;
        }

        if let Some(frame) = encode(&messages) {
            let sent = conn_manager.send_to_session(&session, &frame);
            tracing::debug!(
                session_id = %session,
                messages = messages.len(),
                connections = sent,
                "Pushed deltas to session"
            );
        }
    }
}

fn encode(messages: &[ServerMessage]) -> Option<String> {
    match encode_frame(messages) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::error!("Failed to serialize WebSocket message: {}", e);
            None
        }
    }
}

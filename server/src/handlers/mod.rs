//! Request handlers for sync operations.

mod websocket;

pub use websocket::handle_websocket_connection;

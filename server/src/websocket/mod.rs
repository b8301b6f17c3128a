//! WebSocket connection tracking.
//!
//! Clients connect with their session id; the manager lets the sync handler
//! push frames to every socket a session has open.

mod manager;

pub use manager::{Connection, ConnectionManager, FrameSender};

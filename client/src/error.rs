//! Error types for the sync client.

use thiserror::Error;

/// Failure to open or use a server connection.
///
/// Never surfaced to callers of the coordinator; it only drives the
/// connection status and the reconnect loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
}

/// Errors returned by the client API.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Engine(#[from] converge_engine::Error),

    /// Raised by durable [`ClientStore`](crate::ClientStore) backends.
    #[error("store error: {0}")]
    Store(String),

    #[error("no container at path {0:?}")]
    PathNotFound(Vec<String>),
}

pub type Result<T> = std::result::Result<T, Error>;

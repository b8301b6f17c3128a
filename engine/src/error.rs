//! Error types for the Converge engine.
//!
//! Merge conflicts are not errors: every conflict is resolved
//! deterministically by the value model and never surfaces here.

use crate::NodeId;
use thiserror::Error;

/// All possible errors from the Converge engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Clock errors
    #[error("logical counter overflow at physical time {physical} on node {node}")]
    ClockOverflow { physical: u64, node: NodeId },

    #[error("clock drift too large: remote is {drift}ms ahead, max {max}ms")]
    ClockDrift { drift: u64, max: u64 },

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("invalid sort key: {0}")]
    InvalidSortKey(String),

    #[error("invalid delta: {0}")]
    InvalidDelta(String),

    // Protocol errors
    #[error("protocol invariant violated: {0}")]
    ProtocolInvariantViolation(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

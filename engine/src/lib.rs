//! # Converge Engine
//!
//! A deterministic CRDT and sync engine for local-first applications.
//!
//! This crate holds the core of Converge: a hybrid logical clock, a nested
//! CRDT document model, a delta engine and the server side of the sync
//! protocol. Every function is pure with respect to its inputs; wall-clock
//! time is always passed in by the caller.
//!
//! ## Design Principles
//!
//! - **No IO**: Engine has no knowledge of files, network, or platform
//! - **Deterministic**: Same inputs always produce same outputs
//! - **Convergent**: Replicas that saw the same deltas hold the same document,
//!   whatever order the deltas arrived in
//!
//! ## Core Concepts
//!
//! ### Timestamps
//!
//! [`Hlc`] issues [`Timestamp`]s that are totally ordered across nodes and
//! pack into strings whose byte order is the timestamp order.
//!
//! ### Values
//!
//! A document is a [`Value`] tree of scalars, maps and sequences. Maps
//! merge key by key and sequences item by item, so containers created
//! concurrently at the same path keep both sides; [`Value::merge`] is a
//! join. Sequence items are ordered by [`SortKey`]s.
//!
//! ### Deltas
//!
//! Changes travel as [`Delta`]s addressed by path. [`apply_delta`] merges a
//! delta into a document, [`diff`] computes the deltas between two
//! documents and [`compact`] folds an old log down to one delta per target.
//!
//! ### Protocol
//!
//! [`ClientMessage`] and [`ServerMessage`] are the wire messages;
//! [`SyncServer`] holds per-session cursors over a [`Persistence`] backend.
//!
//! ## Quick Start
//!
//! ```rust
//! use converge_engine::{apply_delta, resolve_path, Delta, Hlc, Value};
//! use serde_json::json;
//!
//! let mut clock = Hlc::new("device_1", 1706745600000);
//!
//! // Create a todo with an empty tag list
//! let stamp = clock.now(1706745600000).unwrap();
//! let create = Delta::set_value(stamp, vec![], "todo", json!({"title": "draft", "tags": []}));
//! let doc = apply_delta(Value::create_empty(), &create).unwrap();
//!
//! // Append a tag
//! let tags = resolve_path(&doc, &["todo", "tags"]).unwrap();
//! let stamp = clock.now(1706745600001).unwrap();
//! let insert = Delta::insert(stamp, tags, None, None, json!("urgent")).unwrap();
//! let doc = apply_delta(doc, &insert).unwrap();
//!
//! assert_eq!(
//!     doc.to_json(),
//!     Some(json!({"todo": {"title": "draft", "tags": ["urgent"]}}))
//! );
//! ```

pub mod clock;
pub mod delta;
pub mod error;
pub mod protocol;
pub mod sort_key;
pub mod value;

// Re-export main types at crate root
pub use clock::{Hlc, SharedClock, Timestamp};
pub use delta::{
    apply_delta, compact, diff, merge_deltas, resolve_path, ContainerKind, Delta, DeltaEnvelope,
    DeltaTarget, Operation, PathSegment,
};
pub use error::{Error, Result};
pub use protocol::{
    decode_frame, encode_frame, ClientMessage, Cursor, DeltaBatch, Frame, Persistence,
    ServerMessage, SessionRecord, SyncServer,
};
pub use sort_key::SortKey;
pub use value::{Leaf, MapNode, Node, SequenceNode, Value};

/// Type aliases for clarity
pub type CollectionName = String;
pub type NodeId = String;

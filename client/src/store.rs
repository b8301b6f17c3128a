//! Durable client state shared by every context on a device.
//!
//! Documents are CRDT states, so writes merge into what is stored rather
//! than replace it. Two contexts saving concurrently never lose each
//! other's changes.

use crate::error::Result;
use converge_engine::{CollectionName, Cursor, DeltaEnvelope, Timestamp, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Device-wide storage for documents, pending deltas, cursors and the clock.
///
/// Backends report their own failures as [`Error::Store`](crate::Error::Store).
pub trait ClientStore: Send + Sync {
    /// Last timestamp issued or received on this device.
    fn load_clock(&self) -> Result<Option<Timestamp>>;
    fn save_clock(&self, stamp: &Timestamp) -> Result<()>;

    /// Current document for a collection; an empty root if never written.
    fn document(&self, collection: &str) -> Result<Value>;
    /// Merge `value` into the stored document and return the result.
    fn merge_document(&self, collection: &str, value: Value) -> Result<Value>;

    /// Local deltas the server has not acknowledged, oldest first.
    fn pending(&self, collection: &str) -> Result<Vec<DeltaEnvelope>>;
    fn add_pending(&self, collection: &str, deltas: Vec<DeltaEnvelope>) -> Result<()>;
    /// Drop pending deltas stamped at or before `stamp`; returns how many.
    fn ack(&self, collection: &str, stamp: &Timestamp) -> Result<usize>;

    fn cursor(&self, collection: &str) -> Result<Option<Cursor>>;
    fn set_cursor(&self, collection: &str, cursor: Cursor) -> Result<()>;

    /// Every collection with a document, pending deltas or a cursor.
    fn collections(&self) -> Result<Vec<CollectionName>>;
}

#[derive(Debug, Default)]
struct MemoryState {
    clock: Option<Timestamp>,
    documents: BTreeMap<CollectionName, Value>,
    pending: BTreeMap<CollectionName, Vec<DeltaEnvelope>>,
    cursors: BTreeMap<CollectionName, Cursor>,
}

/// In-process [`ClientStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ClientStore for MemoryStore {
    fn load_clock(&self) -> Result<Option<Timestamp>> {
        Ok(self.lock().clock.clone())
    }

    fn save_clock(&self, stamp: &Timestamp) -> Result<()> {
        let mut state = self.lock();
        if state.clock.as_ref().map_or(true, |c| c < stamp) {
            state.clock = Some(stamp.clone());
        }
        Ok(())
    }

    fn document(&self, collection: &str) -> Result<Value> {
        Ok(self
            .lock()
            .documents
            .get(collection)
            .cloned()
            .unwrap_or_else(Value::create_empty))
    }

    fn merge_document(&self, collection: &str, value: Value) -> Result<Value> {
        let mut state = self.lock();
        let doc = state
            .documents
            .entry(collection.to_string())
            .or_insert_with(Value::create_empty);
        doc.merge_from(value);
        Ok(doc.clone())
    }

    fn pending(&self, collection: &str) -> Result<Vec<DeltaEnvelope>> {
        Ok(self.lock().pending.get(collection).cloned().unwrap_or_default())
    }

    fn add_pending(&self, collection: &str, deltas: Vec<DeltaEnvelope>) -> Result<()> {
        self.lock()
            .pending
            .entry(collection.to_string())
            .or_default()
            .extend(deltas);
        Ok(())
    }

    fn ack(&self, collection: &str, stamp: &Timestamp) -> Result<usize> {
        let mut state = self.lock();
        let Some(pending) = state.pending.get_mut(collection) else {
            return Ok(0);
        };
        let before = pending.len();
        pending.retain(|env| env.delta.stamp > *stamp);
        Ok(before - pending.len())
    }

    fn cursor(&self, collection: &str) -> Result<Option<Cursor>> {
        Ok(self.lock().cursors.get(collection).copied())
    }

    fn set_cursor(&self, collection: &str, cursor: Cursor) -> Result<()> {
        self.lock().cursors.insert(collection.to_string(), cursor);
        Ok(())
    }

    fn collections(&self) -> Result<Vec<CollectionName>> {
        let state = self.lock();
        let names: BTreeSet<CollectionName> = state
            .documents
            .keys()
            .chain(state.pending.keys())
            .chain(state.cursors.keys())
            .cloned()
            .collect();
        Ok(names.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_engine::Delta;
    use serde_json::json;

    fn envelope(physical: u64) -> DeltaEnvelope {
        DeltaEnvelope::new(
            "n",
            Delta::set(Timestamp::new(physical, 0, "n"), vec![], "k", json!(physical)),
        )
    }

    #[test]
    fn ack_drops_everything_up_to_stamp() {
        let store = MemoryStore::new();
        store
            .add_pending("tasks", vec![envelope(1), envelope(2), envelope(3)])
            .unwrap();

        let dropped = store.ack("tasks", &Timestamp::new(2, 0, "n")).unwrap();
        assert_eq!(dropped, 2);
        let left = store.pending("tasks").unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].delta.stamp.physical, 3);
        assert_eq!(store.ack("other", &Timestamp::new(9, 0, "n")).unwrap(), 0);
    }

    #[test]
    fn documents_merge_instead_of_overwrite() {
        let store = MemoryStore::new();
        let a = converge_engine::apply_delta(Value::create_empty(), &envelope(1).delta).unwrap();
        let b = converge_engine::apply_delta(
            Value::create_empty(),
            &Delta::set(Timestamp::new(1, 0, "m"), vec![], "other", json!(true)),
        )
        .unwrap();

        store.merge_document("tasks", a).unwrap();
        let merged = store.merge_document("tasks", b).unwrap();
        assert_eq!(merged.to_json(), Some(json!({"k": 1, "other": true})));
        assert_eq!(store.document("tasks").unwrap(), merged);
        assert_eq!(store.document("missing").unwrap(), Value::create_empty());
    }

    #[test]
    fn clock_only_moves_forward() {
        let store = MemoryStore::new();
        store.save_clock(&Timestamp::new(5, 0, "n")).unwrap();
        store.save_clock(&Timestamp::new(3, 0, "n")).unwrap();
        assert_eq!(store.load_clock().unwrap(), Some(Timestamp::new(5, 0, "n")));
    }

    #[test]
    fn collections_are_collected_from_all_state() {
        let store = MemoryStore::new();
        store.set_cursor("b", 4).unwrap();
        store.add_pending("a", vec![envelope(1)]).unwrap();
        store.merge_document("c", Value::create_empty()).unwrap();
        assert_eq!(store.collections().unwrap(), vec!["a", "b", "c"]);
    }
}

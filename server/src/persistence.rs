//! In-memory delta log backing the sync server.
//!
//! Every collection keeps an append-only log. Each entry gets a sequence
//! number when it is appended and the highest number handed out is the
//! collection's cursor. Compaction folds old entries but never reuses or
//! lowers a sequence number, so cursors held by clients stay meaningful.

use std::collections::{BTreeMap, HashMap};

use converge_engine::{
    apply_delta, compact, Cursor, Delta, DeltaBatch, DeltaEnvelope, DeltaTarget, Error,
    Persistence, Value,
};

/// One stored delta.
#[derive(Debug, Clone)]
struct LogEntry {
    seq: Cursor,
    /// Session that pushed it; `None` once folded from several sessions.
    session: Option<String>,
    envelope: DeltaEnvelope,
}

#[derive(Debug, Default)]
struct CollectionLog {
    entries: Vec<LogEntry>,
    next_seq: Cursor,
}

impl CollectionLog {
    fn cursor(&self) -> Cursor {
        self.next_seq
    }
}

/// `Persistence` keeping every collection log in memory.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    logs: HashMap<String, CollectionLog>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries for a collection.
    pub fn log_len(&self, collection: &str) -> usize {
        self.logs
            .get(collection)
            .map(|log| log.entries.len())
            .unwrap_or(0)
    }

    /// Current cursor of a collection, `None` if nothing was ever stored.
    pub fn cursor(&self, collection: &str) -> Option<Cursor> {
        self.logs.get(collection).map(CollectionLog::cursor)
    }

    /// Rebuild the document a collection's log describes.
    pub fn document(&self, collection: &str) -> Option<converge_engine::Result<Value>> {
        let log = self.logs.get(collection)?;
        Some(
            log.entries
                .iter()
                .try_fold(Value::create_empty(), |doc, entry| {
                    apply_delta(doc, &entry.envelope.delta)
                }),
        )
    }
}

impl Persistence for MemoryPersistence {
    fn deltas_since(
        &self,
        collection: &str,
        last_seen: Option<Cursor>,
        session: &str,
    ) -> converge_engine::Result<Option<DeltaBatch>> {
        let Some(log) = self.logs.get(collection) else {
            return Ok(None);
        };
        let from = last_seen.unwrap_or(0);
        if log.cursor() <= from {
            return Ok(None);
        }

        let deltas: Vec<DeltaEnvelope> = log
            .entries
            .iter()
            .filter(|entry| entry.seq > from)
            .filter(|entry| entry.session.as_deref() != Some(session))
            .map(|entry| entry.envelope.clone())
            .collect();
        if deltas.is_empty() {
            return Ok(None);
        }

        Ok(Some(DeltaBatch {
            deltas,
            cursor: Some(log.cursor()),
        }))
    }

    fn add_deltas(
        &mut self,
        collection: &str,
        session: &str,
        deltas: Vec<DeltaEnvelope>,
    ) -> converge_engine::Result<()> {
        // Reject the batch before touching the log
        for envelope in &deltas {
            envelope.delta.to_fragment()?;
        }

        let log = self.logs.entry(collection.to_string()).or_default();
        for envelope in deltas {
            log.next_seq += 1;
            log.entries.push(LogEntry {
                seq: log.next_seq,
                session: Some(session.to_string()),
                envelope,
            });
        }
        Ok(())
    }

    fn compact(
        &mut self,
        collection: &str,
        cutoff: u64,
        merge: &dyn Fn(&Delta, &Delta) -> Delta,
    ) -> converge_engine::Result<()> {
        let Some(log) = self.logs.get_mut(collection) else {
            return Ok(());
        };

        let (old, recent): (Vec<LogEntry>, Vec<LogEntry>) = log
            .entries
            .drain(..)
            .partition(|entry| entry.envelope.delta.stamp.physical < cutoff);

        // Folded entries take the highest sequence of their group
        let mut groups: BTreeMap<DeltaTarget, (Cursor, Option<String>)> = BTreeMap::new();
        for entry in &old {
            let target = entry.envelope.delta.target();
            match groups.get_mut(&target) {
                Some((seq, session)) => {
                    *seq = (*seq).max(entry.seq);
                    if *session != entry.session {
                        *session = None;
                    }
                }
                None => {
                    groups.insert(target, (entry.seq, entry.session.clone()));
                }
            }
        }

        let envelopes = old.into_iter().map(|entry| entry.envelope).collect();
        let mut entries = Vec::with_capacity(groups.len() + recent.len());
        for envelope in compact(envelopes, cutoff, merge) {
            let Some((seq, session)) = groups.get(&envelope.delta.target()).cloned() else {
                return Err(Error::Persistence(format!(
                    "compaction of {} produced an unknown target",
                    collection
                )));
            };
            entries.push(LogEntry {
                seq,
                session,
                envelope,
            });
        }
        entries.extend(recent);
        entries.sort_by_key(|entry| entry.seq);
        log.entries = entries;
        Ok(())
    }
}

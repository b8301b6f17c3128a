//! Sync protocol between clients and a server.
//!
//! Clients send their pending deltas and the last server cursor they saw
//! for a collection; the server stores the deltas, acknowledges them and
//! later pushes every delta the client has not seen yet. The server side is
//! plain state ([`SyncServer`]) over a [`Persistence`] backend, with no
//! transport or global state of its own.

use crate::{error::Result, merge_deltas, CollectionName, Delta, DeltaEnvelope, Error, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Opaque position in a collection's server-side delta log.
pub type Cursor = u64;

/// Message from a client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Sync {
        collection: CollectionName,
        server_cursor: Option<Cursor>,
        deltas: Vec<DeltaEnvelope>,
    },
}

/// Message from the server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Deltas the client has not seen, with the cursor to report next time.
    #[serde(rename_all = "camelCase")]
    Sync {
        collection: CollectionName,
        server_cursor: Cursor,
        deltas: Vec<DeltaEnvelope>,
    },
    /// Every client delta stamped at or before `delta_stamp` is stored.
    #[serde(rename_all = "camelCase")]
    Ack {
        collection: CollectionName,
        delta_stamp: Timestamp,
    },
}

impl ClientMessage {
    pub fn sync(
        collection: impl Into<CollectionName>,
        server_cursor: Option<Cursor>,
        deltas: Vec<DeltaEnvelope>,
    ) -> Self {
        ClientMessage::Sync {
            collection: collection.into(),
            server_cursor,
            deltas,
        }
    }

    pub fn collection(&self) -> &str {
        match self {
            ClientMessage::Sync { collection, .. } => collection,
        }
    }
}

impl ServerMessage {
    pub fn collection(&self) -> &str {
        match self {
            ServerMessage::Sync { collection, .. } | ServerMessage::Ack { collection, .. } => {
                collection
            }
        }
    }
}

/// One transport frame: a single message or a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame<M> {
    Batch(Vec<M>),
    Single(M),
}

impl<M> Frame<M> {
    pub fn into_messages(self) -> Vec<M> {
        match self {
            Frame::Batch(messages) => messages,
            Frame::Single(message) => vec![message],
        }
    }
}

/// Decode a frame holding either one message or an array of messages.
pub fn decode_frame<M: DeserializeOwned>(text: &str) -> serde_json::Result<Vec<M>> {
    serde_json::from_str::<Frame<M>>(text).map(Frame::into_messages)
}

/// Encode messages as a single array frame.
pub fn encode_frame<M: Serialize>(messages: &[M]) -> serde_json::Result<String> {
    serde_json::to_string(messages)
}

/// New deltas for a collection and the cursor that covers them.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeltaBatch {
    pub deltas: Vec<DeltaEnvelope>,
    pub cursor: Option<Cursor>,
}

/// Storage backend for the server's delta logs.
pub trait Persistence {
    /// Deltas added after `last_seen` that did not come from `session`.
    ///
    /// `None` means there is nothing new to report.
    fn deltas_since(
        &self,
        collection: &str,
        last_seen: Option<Cursor>,
        session: &str,
    ) -> Result<Option<DeltaBatch>>;

    /// Append deltas sent by `session`.
    fn add_deltas(
        &mut self,
        collection: &str,
        session: &str,
        deltas: Vec<DeltaEnvelope>,
    ) -> Result<()>;

    /// Fold deltas older than `cutoff` (physical ms) with `merge`.
    fn compact(
        &mut self,
        collection: &str,
        cutoff: u64,
        merge: &dyn Fn(&Delta, &Delta) -> Delta,
    ) -> Result<()>;
}

/// What the server remembers about one client session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    /// Last cursor reported per collection; `None` means "from the start".
    pub collections: BTreeMap<CollectionName, Option<Cursor>>,
}

impl SessionRecord {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            collections: BTreeMap::new(),
        }
    }
}

/// Server-side protocol state.
#[derive(Debug)]
pub struct SyncServer<P> {
    persistence: P,
    sessions: HashMap<String, SessionRecord>,
}

impl<P: Persistence> SyncServer<P> {
    pub fn new(persistence: P) -> Self {
        Self {
            persistence,
            sessions: HashMap::new(),
        }
    }

    /// Handle one client message, returning the reply for the sender.
    pub fn on_message(
        &mut self,
        session: &str,
        message: ClientMessage,
    ) -> Result<Option<ServerMessage>> {
        let ClientMessage::Sync {
            collection,
            server_cursor,
            deltas,
        } = message;

        // The reported cursor always replaces the stored one, null included
        self.sessions
            .entry(session.to_string())
            .or_insert_with(|| SessionRecord::new(session))
            .collections
            .insert(collection.clone(), server_cursor);

        let Some(max_stamp) = deltas.iter().map(|env| env.delta.stamp.clone()).max() else {
            return Ok(None);
        };

        self.persistence.add_deltas(&collection, session, deltas)?;

        Ok(Some(ServerMessage::Ack {
            collection,
            delta_stamp: max_stamp,
        }))
    }

    /// Messages to push to `session`: one `Sync` per known collection with
    /// deltas the session has not seen.
    pub fn get_messages(&self, session: &str) -> Result<Vec<ServerMessage>> {
        let Some(record) = self.sessions.get(session) else {
            return Ok(Vec::new());
        };

        let mut messages = Vec::new();
        for (collection, last_seen) in &record.collections {
            let Some(batch) = self
                .persistence
                .deltas_since(collection, *last_seen, session)?
            else {
                continue;
            };
            if batch.deltas.is_empty() {
                continue;
            }
            let Some(cursor) = batch.cursor else {
                return Err(Error::ProtocolInvariantViolation(format!(
                    "{} deltas for {} without a cursor",
                    batch.deltas.len(),
                    collection
                )));
            };
            messages.push(ServerMessage::Sync {
                collection: collection.clone(),
                server_cursor: cursor,
                deltas: batch.deltas,
            });
        }
        Ok(messages)
    }

    /// Compact a collection's log with [`merge_deltas`].
    pub fn compact(&mut self, collection: &str, cutoff: u64) -> Result<()> {
        self.persistence.compact(collection, cutoff, &merge_deltas)
    }

    pub fn session(&self, session: &str) -> Option<&SessionRecord> {
        self.sessions.get(session)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SessionRecord> {
        self.sessions.values()
    }

    /// Collections any session has synced.
    pub fn collections(&self) -> Vec<CollectionName> {
        let mut names: Vec<_> = self
            .sessions
            .values()
            .flat_map(|record| record.collections.keys().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn persistence(&self) -> &P {
        &self.persistence
    }

    pub fn persistence_mut(&mut self) -> &mut P {
        &mut self.persistence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Log per collection; cursor is the log length.
    #[derive(Default)]
    struct LogPersistence {
        logs: HashMap<String, Vec<(String, DeltaEnvelope)>>,
        drop_cursor: bool,
    }

    impl Persistence for LogPersistence {
        fn deltas_since(
            &self,
            collection: &str,
            last_seen: Option<Cursor>,
            session: &str,
        ) -> Result<Option<DeltaBatch>> {
            let Some(log) = self.logs.get(collection) else {
                return Ok(None);
            };
            let start = last_seen.unwrap_or(0) as usize;
            let deltas = log
                .iter()
                .skip(start)
                .filter(|(from, _)| from != session)
                .map(|(_, env)| env.clone())
                .collect();
            let cursor = (!self.drop_cursor).then_some(log.len() as Cursor);
            Ok(Some(DeltaBatch { deltas, cursor }))
        }

        fn add_deltas(
            &mut self,
            collection: &str,
            session: &str,
            deltas: Vec<DeltaEnvelope>,
        ) -> Result<()> {
            let log = self.logs.entry(collection.to_string()).or_default();
            log.extend(deltas.into_iter().map(|env| (session.to_string(), env)));
            Ok(())
        }

        fn compact(
            &mut self,
            collection: &str,
            cutoff: u64,
            merge: &dyn Fn(&Delta, &Delta) -> Delta,
        ) -> Result<()> {
            if let Some(log) = self.logs.get_mut(collection) {
                let envelopes = log.drain(..).map(|(_, env)| env).collect();
                *log = crate::compact(envelopes, cutoff, merge)
                    .into_iter()
                    .map(|env| (String::new(), env))
                    .collect();
            }
            Ok(())
        }
    }

    fn envelope(physical: u64, node: &str, key: &str) -> DeltaEnvelope {
        DeltaEnvelope::new(
            node,
            Delta::set(Timestamp::new(physical, 0, node), vec![], key, json!(physical)),
        )
    }

    #[test]
    fn sync_with_deltas_is_acked_with_max_stamp() {
        let mut server = SyncServer::new(LogPersistence::default());
        let message = ClientMessage::sync(
            "tasks",
            None,
            vec![envelope(5, "n1", "a"), envelope(9, "n1", "b")],
        );

        let reply = server.on_message("s1", message).unwrap();
        assert_eq!(
            reply,
            Some(ServerMessage::Ack {
                collection: "tasks".into(),
                delta_stamp: Timestamp::new(9, 0, "n1"),
            })
        );

        let record = server.session("s1").unwrap();
        assert_eq!(record.collections.get("tasks"), Some(&None));
        assert_eq!(server.persistence().logs["tasks"].len(), 2);
    }

    #[test]
    fn sync_without_deltas_is_not_acked() {
        let mut server = SyncServer::new(LogPersistence::default());
        let reply = server
            .on_message("s1", ClientMessage::sync("tasks", Some(3), vec![]))
            .unwrap();
        assert_eq!(reply, None);
        assert_eq!(server.session("s1").unwrap().collections["tasks"], Some(3));
    }

    #[test]
    fn cursor_is_overwritten_even_with_null() {
        let mut server = SyncServer::new(LogPersistence::default());
        server
            .on_message("s1", ClientMessage::sync("tasks", Some(4), vec![]))
            .unwrap();
        server
            .on_message("s1", ClientMessage::sync("tasks", None, vec![]))
            .unwrap();
        assert_eq!(server.session("s1").unwrap().collections["tasks"], None);
    }

    #[test]
    fn other_sessions_receive_new_deltas() {
        let mut server = SyncServer::new(LogPersistence::default());
        server
            .on_message("reader", ClientMessage::sync("tasks", None, vec![]))
            .unwrap();
        server
            .on_message(
                "writer",
                ClientMessage::sync("tasks", None, vec![envelope(1, "w", "a")]),
            )
            .unwrap();

        let messages = server.get_messages("reader").unwrap();
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            ServerMessage::Sync {
                collection,
                server_cursor,
                deltas,
            } => {
                assert_eq!(collection, "tasks");
                assert_eq!(*server_cursor, 1);
                assert_eq!(deltas.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }

        // Own deltas are never echoed back
        assert!(server.get_messages("writer").unwrap().is_empty());
        assert!(server.get_messages("unknown").unwrap().is_empty());
    }

    #[test]
    fn deltas_without_cursor_violate_protocol() {
        let mut server = SyncServer::new(LogPersistence {
            drop_cursor: true,
            ..Default::default()
        });
        server
            .on_message("reader", ClientMessage::sync("tasks", None, vec![]))
            .unwrap();
        server
            .on_message(
                "writer",
                ClientMessage::sync("tasks", None, vec![envelope(1, "w", "a")]),
            )
            .unwrap();

        assert!(matches!(
            server.get_messages("reader"),
            Err(Error::ProtocolInvariantViolation(_))
        ));
    }

    #[test]
    fn compact_goes_through_persistence() {
        let mut server = SyncServer::new(LogPersistence::default());
        let deltas = vec![
            envelope(1, "w", "a"),
            envelope(2, "w", "a"),
            envelope(3, "w", "a"),
        ];
        server
            .on_message("writer", ClientMessage::sync("tasks", None, deltas))
            .unwrap();
        server.compact("tasks", 10).unwrap();
        assert_eq!(server.persistence().logs["tasks"].len(), 1);
        assert_eq!(server.collections(), vec!["tasks".to_string()]);
    }

    #[test]
    fn wire_format_uses_camel_case() {
        let message = ClientMessage::sync("tasks", Some(2), vec![envelope(1, "n", "a")]);
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "sync");
        assert_eq!(value["serverCursor"], 2);
        assert_eq!(value["deltas"][0]["node"], "n");
        assert!(value["deltas"][0]["delta"]["stamp"].is_string());

        let ack = ServerMessage::Ack {
            collection: "tasks".into(),
            delta_stamp: Timestamp::new(1, 0, "n"),
        };
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"type": "ack", "collection": "tasks", "deltaStamp": "000000000000001:00000:n"})
        );
    }

    #[test]
    fn frames_decode_single_and_batch() {
        let single = r#"{"type":"sync","collection":"c","serverCursor":null,"deltas":[]}"#;
        let batch = format!("[{single},{single}]");
        assert_eq!(decode_frame::<ClientMessage>(single).unwrap().len(), 1);
        assert_eq!(decode_frame::<ClientMessage>(&batch).unwrap().len(), 2);
        assert!(decode_frame::<ClientMessage>("{\"type\":\"nope\"}").is_err());

        let encoded = encode_frame(&[ClientMessage::sync("c", None, vec![])]).unwrap();
        assert!(encoded.starts_with('['));
    }
}

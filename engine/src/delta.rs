//! Deltas: self-contained, addressable changes to a document.
//!
//! A delta names the containers on its path by key *and* identity stamp,
//! so it can be turned into a minimal document fragment without any prior
//! history. Applying a delta is merging that fragment into the document,
//! which inherits the join properties of [`Value::merge`]: applying the
//! same delta twice is a no-op and application order does not matter.

use crate::value::{MapNode, Node, SequenceNode};
use crate::{error::Result, Error, NodeId, SortKey, Timestamp, Value};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// Kind of container a path segment steps into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContainerKind {
    Map,
    Sequence,
}

/// One step of a delta path: child `key` of the current container, which
/// must be a `kind` container created at `stamp`.
///
/// Inside a sequence, `key` is the item's sort key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathSegment {
    pub key: String,
    pub stamp: Timestamp,
    pub kind: ContainerKind,
}

impl PathSegment {
    pub fn new(key: impl Into<String>, stamp: Timestamp, kind: ContainerKind) -> Self {
        Self {
            key: key.into(),
            stamp,
            kind,
        }
    }
}

/// The change a delta makes to its target container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Operation {
    /// Set a map key to a primitive stamped with the delta stamp.
    SetScalar {
        key: String,
        value: serde_json::Value,
    },
    /// Set a map key to a complete subtree (a tombstone deletes the key).
    SetMapKey { key: String, value: Value },
    /// Add an item to a sequence.
    InsertItem { key: SortKey, value: Value },
    /// Remove a sequence item for good.
    RemoveItem { key: SortKey },
}

impl Operation {
    /// Key of the entry this operation touches in its target container.
    pub fn key(&self) -> &str {
        match self {
            Operation::SetScalar { key, .. } | Operation::SetMapKey { key, .. } => key,
            Operation::InsertItem { key, .. } | Operation::RemoveItem { key } => key.as_str(),
        }
    }

    fn target_kind(&self) -> ContainerKind {
        match self {
            Operation::SetScalar { .. } | Operation::SetMapKey { .. } => ContainerKind::Map,
            Operation::InsertItem { .. } | Operation::RemoveItem { .. } => ContainerKind::Sequence,
        }
    }
}

/// A stamped change addressed to a subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delta {
    pub stamp: Timestamp,
    pub path: Vec<PathSegment>,
    pub op: Operation,
}

/// Identifies the entry a delta writes: container path plus entry key.
pub type DeltaTarget = (Vec<PathSegment>, String);

impl Delta {
    pub fn new(stamp: Timestamp, path: Vec<PathSegment>, op: Operation) -> Self {
        Self { stamp, path, op }
    }

    /// Set `key` in the map at `path` to a primitive value.
    pub fn set(
        stamp: Timestamp,
        path: Vec<PathSegment>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        Self::new(
            stamp,
            path,
            Operation::SetScalar {
                key: key.into(),
                value,
            },
        )
    }

    /// Set `key` in the map at `path` to a new subtree built from JSON.
    pub fn set_value(
        stamp: Timestamp,
        path: Vec<PathSegment>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Self {
        let value = Value::from_json(value, &stamp);
        Self::new(
            stamp,
            path,
            Operation::SetMapKey {
                key: key.into(),
                value,
            },
        )
    }

    /// Delete `key` from the map at `path`.
    pub fn remove_key(stamp: Timestamp, path: Vec<PathSegment>, key: impl Into<String>) -> Self {
        let value = Value::tombstone(stamp.clone());
        Self::new(
            stamp,
            path,
            Operation::SetMapKey {
                key: key.into(),
                value,
            },
        )
    }

    /// Insert a JSON value into the sequence at `path` between two items.
    pub fn insert(
        stamp: Timestamp,
        path: Vec<PathSegment>,
        left: Option<&SortKey>,
        right: Option<&SortKey>,
        value: serde_json::Value,
    ) -> Result<Self> {
        let key = SortKey::between(left, right, &stamp)?;
        let value = Value::from_json(value, &stamp);
        Ok(Self::new(stamp, path, Operation::InsertItem { key, value }))
    }

    /// Remove the item `key` from the sequence at `path`.
    pub fn remove_item(stamp: Timestamp, path: Vec<PathSegment>, key: SortKey) -> Self {
        Self::new(stamp, path, Operation::RemoveItem { key })
    }

    /// Stamp used to order deltas for acknowledgement.
    pub fn stamp(&self) -> &Timestamp {
        &self.stamp
    }

    pub fn target(&self) -> DeltaTarget {
        (self.path.clone(), self.op.key().to_string())
    }

    /// The minimal document fragment equivalent to this delta.
    pub fn to_fragment(&self) -> Result<Value> {
        let expected = self
            .path
            .last()
            .map(|seg| seg.kind)
            .unwrap_or(ContainerKind::Map);
        if expected != self.op.target_kind() {
            return Err(Error::InvalidDelta(format!(
                "{} cannot target a {:?}",
                self.op.key(),
                expected
            )));
        }

        let target_stamp = self
            .path
            .last()
            .map(|seg| seg.stamp.clone())
            .unwrap_or_else(Timestamp::origin);

        let mut node = match &self.op {
            Operation::SetScalar { key, value } => {
                let leaf = Value::scalar(self.stamp.clone(), value.clone());
                Value::from_entries(target_stamp, BTreeMap::from([(key.clone(), leaf)]))
            }
            Operation::SetMapKey { key, value } => {
                Value::from_entries(target_stamp, BTreeMap::from([(key.clone(), value.clone())]))
            }
            Operation::InsertItem { key, value } => Value::from_items(
                target_stamp,
                BTreeMap::from([(key.clone(), value.clone())]),
                BTreeMap::new(),
            ),
            Operation::RemoveItem { key } => Value::from_items(
                target_stamp,
                BTreeMap::new(),
                BTreeMap::from([(key.clone(), self.stamp.clone())]),
            ),
        };

        // Wrap the target in placeholder containers up to the root
        for (depth, segment) in self.path.iter().enumerate().rev() {
            let parent = depth.checked_sub(1).map(|i| &self.path[i]);
            node = match parent {
                Some(p) if p.kind == ContainerKind::Sequence => Value::from_items(
                    p.stamp.clone(),
                    BTreeMap::from([(SortKey::parse(segment.key.clone())?, node)]),
                    BTreeMap::new(),
                ),
                _ => Value::from_entries(
                    parent.map(|p| p.stamp.clone()).unwrap_or_else(Timestamp::origin),
                    BTreeMap::from([(segment.key.clone(), node)]),
                ),
            };
        }

        Ok(node)
    }
}

/// A delta together with the node that authored it; the unit of transfer
/// and of the delta log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaEnvelope {
    pub node: NodeId,
    pub delta: Delta,
}

impl DeltaEnvelope {
    pub fn new(node: impl Into<NodeId>, delta: Delta) -> Self {
        Self {
            node: node.into(),
            delta,
        }
    }
}

/// Apply one delta to a document.
pub fn apply_delta(doc: Value, delta: &Delta) -> Result<Value> {
    let mut doc = doc;
    doc.apply(delta)?;
    Ok(doc)
}

impl Value {
    /// Apply one delta in place.
    pub fn apply(&mut self, delta: &Delta) -> Result<()> {
        let fragment = delta.to_fragment()?;
        self.merge_from(fragment);
        Ok(())
    }
}

/// Resolve a path of keys into delta path segments against `doc`.
///
/// Returns `None` when a key is missing or does not name a container.
pub fn resolve_path(doc: &Value, keys: &[&str]) -> Option<Vec<PathSegment>> {
    let mut current = doc;
    let mut path = Vec::with_capacity(keys.len());
    for key in keys {
        let child = current.get(key)?;
        let (kind, stamp) = match child.node()? {
            Node::Map(map) => (ContainerKind::Map, map.stamp()),
            Node::Sequence(sequence) => (ContainerKind::Sequence, sequence.stamp()),
            _ => return None,
        };
        path.push(PathSegment::new(*key, stamp.clone(), kind));
        current = child;
    }
    Some(path)
}

/// Deltas that move `before` to `after`.
///
/// Slots whose own components are unchanged are diffed recursively;
/// anything else that differs is shipped whole. Each delta applies
/// independently.
pub fn diff(before: &Value, after: &Value) -> Vec<Delta> {
    let mut out = Vec::new();
    let mut path = Vec::new();
    if let Some(map) = after.map_node() {
        diff_map(&mut path, before.map_node(), map, &mut out);
    }
    out
}

fn diff_map(
    path: &mut Vec<PathSegment>,
    before: Option<&MapNode>,
    after: &MapNode,
    out: &mut Vec<Delta>,
) {
    for (key, value) in after.entries() {
        match before.and_then(|m| m.entries().get(key)) {
            Some(old) if old == value => {}
            Some(old) if same_components(old, value) => diff_children(path, key, old, value, out),
            _ => out.extend(map_entry_delta(path, key, value)),
        }
    }
}

fn diff_sequence(
    path: &mut Vec<PathSegment>,
    before: Option<&SequenceNode>,
    after: &SequenceNode,
    out: &mut Vec<Delta>,
) {
    for (key, removed_at) in after.tombstones() {
        let known = before.and_then(|s| s.tombstones().get(key));
        if known.map_or(true, |s| s < removed_at) {
            out.push(Delta::remove_item(
                removed_at.clone(),
                path.clone(),
                key.clone(),
            ));
        }
    }
    for (key, value) in after.items() {
        match before.and_then(|s| s.items().get(key)) {
            Some(old) if old == value => {}
            Some(old) if same_components(old, value) => {
                diff_children(path, key.as_str(), old, value, out)
            }
            _ => {
                if let Some(stamp) = value.latest_stamp() {
                    out.push(Delta::new(
                        stamp.clone(),
                        path.clone(),
                        Operation::InsertItem {
                            key: key.clone(),
                            value: value.clone(),
                        },
                    ));
                }
            }
        }
    }
}

/// Recurse into both containers of a slot whose components are unchanged.
fn diff_children(
    path: &mut Vec<PathSegment>,
    key: &str,
    before: &Value,
    after: &Value,
    out: &mut Vec<Delta>,
) {
    if let Some(map) = after.map_node() {
        path.push(PathSegment::new(key, map.stamp().clone(), ContainerKind::Map));
        diff_map(path, before.map_node(), map, out);
        path.pop();
    }
    if let Some(sequence) = after.sequence_node() {
        path.push(PathSegment::new(
            key,
            sequence.stamp().clone(),
            ContainerKind::Sequence,
        ));
        diff_sequence(path, before.sequence_node(), sequence, out);
        path.pop();
    }
}

/// Same leaf and same container stamps; only container content may differ.
fn same_components(before: &Value, after: &Value) -> bool {
    before.leaf() == after.leaf()
        && before.map_node().map(MapNode::stamp) == after.map_node().map(MapNode::stamp)
        && before.sequence_node().map(SequenceNode::stamp)
            == after.sequence_node().map(SequenceNode::stamp)
}

fn map_entry_delta(path: &[PathSegment], key: &str, value: &Value) -> Option<Delta> {
    if let Some((stamp, scalar)) = value.plain_scalar() {
        return Some(Delta::set(stamp.clone(), path.to_vec(), key, scalar.clone()));
    }
    let stamp = value.latest_stamp()?.clone();
    Some(Delta::new(
        stamp,
        path.to_vec(),
        Operation::SetMapKey {
            key: key.to_string(),
            value: value.clone(),
        },
    ))
}

/// Combine two deltas writing the same target into one with the same
/// effect as applying both.
pub fn merge_deltas(a: &Delta, b: &Delta) -> Delta {
    let (older, newer) = if a.stamp <= b.stamp { (a, b) } else { (b, a) };
    match (&older.op, &newer.op) {
        (Operation::RemoveItem { .. }, Operation::RemoveItem { .. }) => newer.clone(),
        (Operation::RemoveItem { .. }, _) => older.clone(),
        (_, Operation::RemoveItem { .. }) => newer.clone(),
        (
            Operation::InsertItem { key, value: first },
            Operation::InsertItem { value: second, .. },
        ) => Delta::new(
            newer.stamp.clone(),
            newer.path.clone(),
            Operation::InsertItem {
                key: key.clone(),
                value: Value::merge(first.clone(), second.clone()),
            },
        ),
        (first, second) => match (entry_of(older, first), entry_of(newer, second)) {
            (Some(x), Some(y)) => {
                let merged = Value::merge(x, y);
                let scalar = merged
                    .plain_scalar()
                    .filter(|(stamp, _)| **stamp == newer.stamp)
                    .map(|(_, value)| value.clone());
                match scalar {
                    Some(value) => Delta::set(
                        newer.stamp.clone(),
                        newer.path.clone(),
                        newer.op.key(),
                        value,
                    ),
                    None => Delta::new(
                        newer.stamp.clone(),
                        newer.path.clone(),
                        Operation::SetMapKey {
                            key: newer.op.key().to_string(),
                            value: merged,
                        },
                    ),
                }
            }
            _ => newer.clone(),
        },
    }
}

/// The map entry a delta writes, as a value.
fn entry_of(delta: &Delta, op: &Operation) -> Option<Value> {
    match op {
        Operation::SetScalar { value, .. } => Some(Value::scalar(delta.stamp.clone(), value.clone())),
        Operation::SetMapKey { value, .. } => Some(value.clone()),
        _ => None,
    }
}

/// Collapse log entries older than `cutoff` (physical ms) into one entry
/// per target using `merge_fn`.
///
/// Entries at or after the cutoff are kept as they are. The document
/// rebuilt from the compacted log equals the one rebuilt from the original.
pub fn compact<F>(log: Vec<DeltaEnvelope>, cutoff: u64, merge_fn: F) -> Vec<DeltaEnvelope>
where
    F: Fn(&Delta, &Delta) -> Delta,
{
    let mut baseline: BTreeMap<DeltaTarget, DeltaEnvelope> = BTreeMap::new();
    let mut recent = Vec::new();

    for envelope in log {
        if envelope.delta.stamp.physical >= cutoff {
            recent.push(envelope);
            continue;
        }
        match baseline.entry(envelope.delta.target()) {
            Entry::Vacant(slot) => {
                slot.insert(envelope);
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get_mut();
                let merged = merge_fn(&current.delta, &envelope.delta);
                // Credit whichever side the merge kept; a blend goes to the newer one
                let kept_current = merged == current.delta;
                if !kept_current
                    && (merged == envelope.delta || envelope.delta.stamp > current.delta.stamp)
                {
                    current.node = envelope.node;
                }
                current.delta = merged;
            }
        }
    }

    let mut compacted: Vec<DeltaEnvelope> = baseline.into_values().collect();
    compacted.sort_by(|a, b| a.delta.stamp.cmp(&b.delta.stamp));
    compacted.extend(recent);
    compacted
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ts(physical: u64, node: &str) -> Timestamp {
        Timestamp::new(physical, 0, node)
    }

    fn apply_all(doc: Value, deltas: &[Delta]) -> Value {
        deltas
            .iter()
            .fold(doc, |doc, d| apply_delta(doc, d).unwrap())
    }

    /// Root with a "tasks" sequence created at stamp 1.
    fn with_tasks() -> (Value, Vec<PathSegment>) {
        let create = Delta::set_value(ts(1, "seed"), vec![], "tasks", json!([]));
        let doc = apply_delta(Value::create_empty(), &create).unwrap();
        let path = resolve_path(&doc, &["tasks"]).unwrap();
        (doc, path)
    }

    #[test]
    fn set_scalar_at_root() {
        let delta = Delta::set(ts(1, "a"), vec![], "title", json!("hello"));
        let doc = apply_delta(Value::create_empty(), &delta).unwrap();
        assert_eq!(doc.to_json(), Some(json!({"title": "hello"})));
    }

    #[test]
    fn applying_twice_is_a_no_op() {
        let (doc, path) = with_tasks();
        let delta = Delta::insert(ts(2, "a"), path, None, None, json!("one")).unwrap();
        let once = apply_delta(doc, &delta).unwrap();
        let twice = apply_delta(once.clone(), &delta).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn nested_delta_arriving_before_its_container() {
        let create = Delta::set_value(ts(1, "a"), vec![], "profile", json!({"name": "Ann"}));
        let path = vec![PathSegment::new("profile", ts(1, "a"), ContainerKind::Map)];
        let edit = Delta::set(ts(2, "a"), path, "age", json!(30));

        let in_order = apply_all(Value::create_empty(), &[create.clone(), edit.clone()]);
        let reversed = apply_all(Value::create_empty(), &[edit, create]);
        assert_eq!(in_order, reversed);
        assert_eq!(
            in_order.to_json(),
            Some(json!({"profile": {"name": "Ann", "age": 30}}))
        );
    }

    #[test]
    fn edits_into_a_recreated_map_are_kept() {
        let old_path = vec![PathSegment::new("profile", ts(1, "a"), ContainerKind::Map)];
        let deltas = [
            Delta::set_value(ts(1, "a"), vec![], "profile", json!({"name": "Ann"})),
            Delta::set_value(ts(3, "b"), vec![], "profile", json!({"name": "Bo"})),
            Delta::set(ts(2, "a"), old_path, "age", json!(30)),
        ];
        let doc = apply_all(Value::create_empty(), &deltas);
        let reversed: Vec<Delta> = deltas.iter().rev().cloned().collect();
        assert_eq!(apply_all(Value::create_empty(), &reversed), doc);
        assert_eq!(
            doc.to_json(),
            Some(json!({"profile": {"name": "Bo", "age": 30}}))
        );
    }

    #[test]
    fn edits_into_a_map_replaced_by_a_scalar_are_absorbed() {
        let old_path = vec![PathSegment::new("profile", ts(1, "a"), ContainerKind::Map)];
        let deltas = [
            Delta::set_value(ts(1, "a"), vec![], "profile", json!({"name": "Ann"})),
            Delta::set(ts(3, "b"), vec![], "profile", json!("gone")),
            Delta::set(ts(2, "a"), old_path, "age", json!(30)),
        ];
        let doc = apply_all(Value::create_empty(), &deltas);
        let reversed: Vec<Delta> = deltas.iter().rev().cloned().collect();
        assert_eq!(apply_all(Value::create_empty(), &reversed), doc);
        assert_eq!(doc.to_json(), Some(json!({"profile": "gone"})));
    }

    #[test]
    fn deleted_then_recreated_map_starts_empty() {
        let deltas = [
            Delta::set_value(ts(1, "a"), vec![], "profile", json!({"name": "Ann"})),
            Delta::remove_key(ts(2, "b"), vec![], "profile"),
            Delta::set_value(ts(3, "a"), vec![], "profile", json!({"age": 30})),
        ];
        let doc = apply_all(Value::create_empty(), &deltas);
        let reversed: Vec<Delta> = deltas.iter().rev().cloned().collect();
        assert_eq!(apply_all(Value::create_empty(), &reversed), doc);
        assert_eq!(doc.to_json(), Some(json!({"profile": {"age": 30}})));
    }

    #[test]
    fn maps_created_on_two_replicas_merge_their_keys() {
        let a = Delta::set_value(ts(1, "a"), vec![], "profile", json!({"name": "Ann"}));
        let b = Delta::set_value(ts(2, "b"), vec![], "profile", json!({"age": 30}));

        let replica_a = apply_all(Value::create_empty(), &[a.clone(), b.clone()]);
        let replica_b = apply_all(Value::create_empty(), &[b, a]);
        assert_eq!(replica_a, replica_b);
        assert_eq!(
            replica_a.to_json(),
            Some(json!({"profile": {"name": "Ann", "age": 30}}))
        );
    }

    #[test]
    fn sequences_created_on_two_replicas_keep_both_items() {
        let replica = |node: &str| {
            let create = Delta::set_value(ts(1, node), vec![], "tasks", json!([]));
            let doc = apply_delta(Value::create_empty(), &create).unwrap();
            let path = resolve_path(&doc, &["tasks"]).unwrap();
            let insert =
                Delta::insert(ts(2, node), path, None, None, json!(format!("from-{}", node))).unwrap();
            vec![create, insert]
        };
        let from_a = replica("a");
        let from_b = replica("b");

        let merged = apply_all(apply_all(Value::create_empty(), &from_a), &from_b);
        let reversed = apply_all(apply_all(Value::create_empty(), &from_b), &from_a);
        assert_eq!(merged, reversed);
        assert_eq!(merged.to_json(), Some(json!({"tasks": ["from-a", "from-b"]})));
    }

    #[test]
    fn concurrent_inserts_between_same_neighbours_converge() {
        let (doc, path) = with_tasks();
        let b = Delta::insert(ts(2, "a"), path.clone(), None, None, json!("b")).unwrap();
        let doc = apply_delta(doc, &b).unwrap();
        let b_key = doc.get("tasks").unwrap().visible_items().next().unwrap().0.clone();
        let c = Delta::insert(ts(3, "a"), path.clone(), Some(&b_key), None, json!("c")).unwrap();
        let doc = apply_delta(doc, &c).unwrap();
        let c_key = SortKey::parse(c.op.key()).unwrap();

        // Client A inserts "e", client B inserts "f", neither seeing the other
        let e = Delta::insert(ts(10, "client-a"), path.clone(), Some(&b_key), Some(&c_key), json!("e")).unwrap();
        let f = Delta::insert(ts(10, "client-b"), path, Some(&b_key), Some(&c_key), json!("f")).unwrap();

        let replica_a = apply_all(doc.clone(), &[e.clone(), f.clone()]);
        let replica_b = apply_all(doc, &[f, e]);
        assert_eq!(replica_a, replica_b);
        assert_eq!(
            replica_a.get("tasks").unwrap().to_json(),
            Some(json!(["b", "e", "f", "c"]))
        );
    }

    #[test]
    fn removed_items_stay_removed() {
        let (doc, path) = with_tasks();
        let insert = Delta::insert(ts(2, "a"), path.clone(), None, None, json!("x")).unwrap();
        let key = SortKey::parse(insert.op.key()).unwrap();
        let remove = Delta::remove_item(ts(3, "b"), path, key);

        let forward = apply_all(doc.clone(), &[insert.clone(), remove.clone()]);
        let backward = apply_all(doc.clone(), &[remove.clone(), insert.clone()]);
        let replayed = apply_all(forward.clone(), &[insert]);
        assert_eq!(forward, backward);
        assert_eq!(forward, replayed);
        assert_eq!(forward.get("tasks").unwrap().to_json(), Some(json!([])));
    }

    #[test]
    fn remove_key_then_stale_write_stays_deleted() {
        let deltas = [
            Delta::set(ts(1, "a"), vec![], "k", json!(1)),
            Delta::remove_key(ts(2, "b"), vec![], "k"),
        ];
        let doc = apply_all(Value::create_empty(), &deltas);
        let doc = apply_delta(doc, &deltas[0]).unwrap();
        assert_eq!(doc.to_json(), Some(json!({})));
    }

    #[test]
    fn op_must_match_container_kind() {
        let (_, path) = with_tasks();
        let bad = Delta::set(ts(2, "a"), path, "field", json!(1));
        assert!(matches!(
            apply_delta(Value::create_empty(), &bad),
            Err(Error::InvalidDelta(_))
        ));
    }

    #[test]
    fn diff_reproduces_after() {
        let before = apply_all(
            Value::create_empty(),
            &[
                Delta::set_value(ts(1, "a"), vec![], "todo", json!({"title": "draft", "tags": ["x"]})),
                Delta::set(ts(1, "a"), vec![], "count", json!(1)),
            ],
        );
        let todo = resolve_path(&before, &["todo"]).unwrap();
        let tags = resolve_path(&before, &["todo", "tags"]).unwrap();
        let first_tag = before
            .get("todo")
            .and_then(|t| t.get("tags"))
            .and_then(|t| t.visible_items().next())
            .map(|(k, _)| k.clone())
            .unwrap();

        let after = apply_all(
            before.clone(),
            &[
                Delta::set(ts(2, "b"), todo, "title", json!("final")),
                Delta::insert(ts(3, "b"), tags.clone(), Some(&first_tag), None, json!("y")).unwrap(),
                Delta::remove_item(ts(4, "b"), tags, first_tag),
                Delta::remove_key(ts(5, "b"), vec![], "count"),
            ],
        );

        let deltas = diff(&before, &after);
        assert_eq!(deltas.len(), 4);
        let rebuilt = apply_all(before.clone(), &deltas);
        assert_eq!(rebuilt, after);
        assert_eq!(
            rebuilt.to_json(),
            Some(json!({"todo": {"title": "final", "tags": ["y"]}}))
        );

        // Each delta applies on its own and moves toward `after`
        for delta in &deltas {
            let partial = apply_delta(before.clone(), delta).unwrap();
            assert_ne!(partial, before);
        }
    }

    #[test]
    fn diff_of_equal_documents_is_empty() {
        let doc = apply_delta(
            Value::create_empty(),
            &Delta::set_value(ts(1, "a"), vec![], "x", json!({"y": [1, 2]})),
        )
        .unwrap();
        assert!(diff(&doc, &doc).is_empty());
    }

    #[test]
    fn compact_preserves_document() {
        let (_, path) = with_tasks();
        let insert = Delta::insert(ts(20, "a"), path.clone(), None, None, json!("keep")).unwrap();
        let doomed = Delta::insert(ts(21, "a"), path.clone(), None, None, json!("drop")).unwrap();
        let doomed_key = SortKey::parse(doomed.op.key()).unwrap();

        let log: Vec<DeltaEnvelope> = vec![
            DeltaEnvelope::new("seed", Delta::set_value(ts(1, "seed"), vec![], "tasks", json!([]))),
            DeltaEnvelope::new("a", Delta::set(ts(10, "a"), vec![], "title", json!("v1"))),
            DeltaEnvelope::new("b", Delta::set(ts(11, "b"), vec![], "title", json!("v2"))),
            DeltaEnvelope::new("a", Delta::set(ts(12, "a"), vec![], "title", json!("v3"))),
            DeltaEnvelope::new("a", insert),
            DeltaEnvelope::new("a", doomed),
            DeltaEnvelope::new("b", Delta::remove_item(ts(22, "b"), path, doomed_key)),
            DeltaEnvelope::new("b", Delta::set(ts(100, "b"), vec![], "title", json!("v4"))),
        ];

        let rebuild = |log: &[DeltaEnvelope]| {
            log.iter()
                .fold(Value::create_empty(), |doc, env| apply_delta(doc, &env.delta).unwrap())
        };

        let compacted = compact(log.clone(), 50, merge_deltas);
        assert_eq!(rebuild(&compacted), rebuild(&log));
        // seed, title, keep, drop/remove collapse to 4; the recent write survives
        assert_eq!(compacted.len(), 5);
        assert_eq!(compacted.last().unwrap().delta.stamp, ts(100, "b"));

        let title = compacted
            .iter()
            .find(|env| env.delta.op.key() == "title" && env.delta.stamp.physical < 50)
            .unwrap();
        assert_eq!(title.node, "a");
        assert_eq!(title.delta.stamp, ts(12, "a"));
    }

    #[test]
    fn compact_credits_the_author_of_the_kept_delta() {
        let (_, path) = with_tasks();
        let insert = Delta::insert(ts(6, "a"), path.clone(), None, None, json!("late")).unwrap();
        let key = SortKey::parse(insert.op.key()).unwrap();
        let remove = Delta::remove_item(ts(5, "b"), path, key);

        let log = vec![
            DeltaEnvelope::new("a", insert),
            DeltaEnvelope::new("b", remove.clone()),
        ];
        let compacted = compact(log, 50, merge_deltas);
        assert_eq!(compacted, vec![DeltaEnvelope::new("b", remove)]);
    }

    #[test]
    fn merge_deltas_prefers_newer_scalar() {
        let a = Delta::set(ts(1, "a"), vec![], "k", json!(1));
        let b = Delta::set(ts(2, "b"), vec![], "k", json!(2));
        assert_eq!(merge_deltas(&a, &b), b);
        assert_eq!(merge_deltas(&b, &a), b);
    }

    #[test]
    fn delta_wire_format() {
        let delta = Delta::set(ts(1, "a"), vec![], "done", json!(true));
        let json = serde_json::to_value(&delta).unwrap();
        assert_eq!(
            json,
            json!({
                "stamp": "000000000000001:00000:a",
                "path": [],
                "op": {"type": "set-scalar", "key": "done", "value": true}
            })
        );
        let parsed: Delta = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, delta);
    }
}

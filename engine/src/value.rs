//! The nested CRDT value model.
//!
//! A document is a tree of slots. A slot holds at most one leaf (a scalar
//! or a deletion marker), one map and one sequence, each carrying a stamp.
//! The component with the greatest stamp is the visible one. The others
//! are kept so that the result of merging never depends on arrival order.
//!
//! Maps merge key by key and sequences merge item by item whatever their
//! stamps, so replicas that create the same container concurrently keep
//! each other's edits. A component of another kind hides what a container
//! held before it: container content stamped earlier than the newest
//! other component is pruned. Deleting a key and writing a fresh map there
//! therefore starts from an empty map.
//!
//! [`Value::merge`] is a join (commutative, associative, idempotent).

use crate::{SortKey, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

/// Last-writer-wins part of a slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Leaf {
    /// A primitive. The JSON payload is opaque to merging.
    Scalar {
        stamp: Timestamp,
        value: serde_json::Value,
    },
    /// Stamped deletion marker.
    Tombstone { stamp: Timestamp },
}

impl Leaf {
    pub fn stamp(&self) -> &Timestamp {
        match self {
            Leaf::Scalar { stamp, .. } | Leaf::Tombstone { stamp } => stamp,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Leaf::Scalar { .. } => RANK_SCALAR,
            Leaf::Tombstone { .. } => RANK_TOMBSTONE,
        }
    }

    fn join(a: Leaf, b: Leaf) -> Leaf {
        let take_b = match (b.stamp(), b.rank()).cmp(&(a.stamp(), a.rank())) {
            Ordering::Greater => true,
            Ordering::Less => false,
            // Only reachable if one stamp was issued twice; pick by content
            Ordering::Equal => match (&a, &b) {
                (Leaf::Scalar { value: x, .. }, Leaf::Scalar { value: y, .. }) => {
                    canonical(y) > canonical(x)
                }
                _ => false,
            },
        };
        if take_b {
            b
        } else {
            a
        }
    }
}

// Tie-break order between components sharing a stamp
const RANK_SCALAR: u8 = 0;
const RANK_MAP: u8 = 1;
const RANK_SEQUENCE: u8 = 2;
const RANK_TOMBSTONE: u8 = 3;

/// Keyed container; keys merge independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapNode {
    stamp: Timestamp,
    entries: BTreeMap<String, Value>,
}

impl MapNode {
    /// Latest creation stamp of this map.
    pub fn stamp(&self) -> &Timestamp {
        &self.stamp
    }

    /// Every entry, deleted ones included.
    pub fn entries(&self) -> &BTreeMap<String, Value> {
        &self.entries
    }

    fn merge_from(&mut self, other: MapNode) {
        if other.stamp > self.stamp {
            self.stamp = other.stamp;
        }
        for (key, value) in other.entries {
            if value.is_empty() {
                continue;
            }
            match self.entries.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(value);
                }
                Entry::Occupied(mut slot) => slot.get_mut().merge_from(value),
            }
        }
    }
}

/// Ordered container. Sort keys double as item ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceNode {
    stamp: Timestamp,
    items: BTreeMap<SortKey, Value>,
    #[serde(default)]
    tombstones: BTreeMap<SortKey, Timestamp>,
}

impl SequenceNode {
    pub fn stamp(&self) -> &Timestamp {
        &self.stamp
    }

    /// Live items in display order.
    pub fn items(&self) -> &BTreeMap<SortKey, Value> {
        &self.items
    }

    /// Removed item ids and when they were removed.
    pub fn tombstones(&self) -> &BTreeMap<SortKey, Timestamp> {
        &self.tombstones
    }

    fn merge_from(&mut self, other: SequenceNode) {
        if other.stamp > self.stamp {
            self.stamp = other.stamp;
        }
        for (key, removed_at) in other.tombstones {
            match self.tombstones.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(removed_at);
                }
                Entry::Occupied(mut slot) => {
                    if removed_at > *slot.get() {
                        slot.insert(removed_at);
                    }
                }
            }
        }
        for (key, value) in other.items {
            if value.is_empty() {
                continue;
            }
            match self.items.entry(key) {
                Entry::Vacant(slot) => {
                    slot.insert(value);
                }
                Entry::Occupied(mut slot) => slot.get_mut().merge_from(value),
            }
        }
        let tombstones = &self.tombstones;
        self.items.retain(|key, _| !tombstones.contains_key(key));
    }
}

/// A slot in a replicated document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Value {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    leaf: Option<Leaf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    map: Option<MapNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sequence: Option<SequenceNode>,
}

/// The visible component of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Node<'a> {
    Scalar {
        stamp: &'a Timestamp,
        value: &'a serde_json::Value,
    },
    Map(&'a MapNode),
    Sequence(&'a SequenceNode),
    Tombstone { stamp: &'a Timestamp },
}

impl<'a> Node<'a> {
    pub fn stamp(&self) -> &'a Timestamp {
        match *self {
            Node::Scalar { stamp, .. } | Node::Tombstone { stamp } => stamp,
            Node::Map(map) => &map.stamp,
            Node::Sequence(sequence) => &sequence.stamp,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Node::Scalar { .. } => RANK_SCALAR,
            Node::Map(_) => RANK_MAP,
            Node::Sequence(_) => RANK_SEQUENCE,
            Node::Tombstone { .. } => RANK_TOMBSTONE,
        }
    }
}

impl Value {
    /// An empty document root.
    pub fn create_empty() -> Self {
        Self::map(Timestamp::origin())
    }

    /// An empty map created at `stamp`.
    pub fn map(stamp: Timestamp) -> Self {
        Self::from_entries(stamp, BTreeMap::new())
    }

    pub fn scalar(stamp: Timestamp, value: serde_json::Value) -> Self {
        Self {
            leaf: Some(Leaf::Scalar { stamp, value }),
            ..Self::default()
        }
    }

    pub fn tombstone(stamp: Timestamp) -> Self {
        Self {
            leaf: Some(Leaf::Tombstone { stamp }),
            ..Self::default()
        }
    }

    /// A map created at `stamp` holding `entries`.
    pub fn from_entries(stamp: Timestamp, mut entries: BTreeMap<String, Value>) -> Self {
        entries.retain(|_, value| !value.is_empty());
        Self {
            map: Some(MapNode { stamp, entries }),
            ..Self::default()
        }
    }

    /// A sequence created at `stamp`. Items listed in `tombstones` are dropped.
    pub fn from_items(
        stamp: Timestamp,
        mut items: BTreeMap<SortKey, Value>,
        tombstones: BTreeMap<SortKey, Timestamp>,
    ) -> Self {
        items.retain(|key, value| !value.is_empty() && !tombstones.contains_key(key));
        Self {
            sequence: Some(SequenceNode {
                stamp,
                items,
                tombstones,
            }),
            ..Self::default()
        }
    }

    /// Build a fully stamped subtree from plain JSON.
    ///
    /// Objects become maps, arrays become sequences in their original
    /// order, everything else becomes a scalar.
    pub fn from_json(json: serde_json::Value, stamp: &Timestamp) -> Self {
        match json {
            serde_json::Value::Object(object) => Self::from_entries(
                stamp.clone(),
                object
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v, stamp)))
                    .collect(),
            ),
            serde_json::Value::Array(array) => {
                let mut items = BTreeMap::new();
                let mut previous: Option<SortKey> = None;
                for element in array {
                    let key = SortKey::after(previous.as_ref(), stamp);
                    items.insert(key.clone(), Value::from_json(element, stamp));
                    previous = Some(key);
                }
                Self::from_items(stamp.clone(), items, BTreeMap::new())
            }
            other => Self::scalar(stamp.clone(), other),
        }
    }

    pub fn leaf(&self) -> Option<&Leaf> {
        self.leaf.as_ref()
    }

    /// The map component, visible or not.
    pub fn map_node(&self) -> Option<&MapNode> {
        self.map.as_ref()
    }

    /// The sequence component, visible or not.
    pub fn sequence_node(&self) -> Option<&SequenceNode> {
        self.sequence.as_ref()
    }

    /// Whether the slot holds nothing at all.
    pub fn is_empty(&self) -> bool {
        self.leaf.is_none() && self.map.is_none() && self.sequence.is_none()
    }

    /// The newest component.
    pub fn node(&self) -> Option<Node<'_>> {
        let leaf = self.leaf.as_ref().map(|leaf| match leaf {
            Leaf::Scalar { stamp, value } => Node::Scalar { stamp, value },
            Leaf::Tombstone { stamp } => Node::Tombstone { stamp },
        });
        let map = self.map.as_ref().map(Node::Map);
        let sequence = self.sequence.as_ref().map(Node::Sequence);
        [leaf, map, sequence]
            .into_iter()
            .flatten()
            .max_by(|a, b| (a.stamp(), a.rank()).cmp(&(b.stamp(), b.rank())))
    }

    /// The scalar, if the slot holds nothing else.
    pub fn plain_scalar(&self) -> Option<(&Timestamp, &serde_json::Value)> {
        match (&self.leaf, &self.map, &self.sequence) {
            (Some(Leaf::Scalar { stamp, value }), None, None) => Some((stamp, value)),
            _ => None,
        }
    }

    /// Greatest stamp anywhere in the slot, hidden components included.
    pub fn latest_stamp(&self) -> Option<&Timestamp> {
        let mut latest = self.leaf.as_ref().map(Leaf::stamp);
        if let Some(map) = &self.map {
            latest = latest.max(Some(&map.stamp));
            for child in map.entries.values() {
                latest = latest.max(child.latest_stamp());
            }
        }
        if let Some(sequence) = &self.sequence {
            latest = latest.max(Some(&sequence.stamp));
            for child in sequence.items.values() {
                latest = latest.max(child.latest_stamp());
            }
            latest = latest.max(sequence.tombstones.values().max());
        }
        latest
    }

    /// Merge two replicas of the same document.
    pub fn merge(a: Value, b: Value) -> Value {
        let mut merged = a;
        merged.merge_from(b);
        merged
    }

    /// Merge `other` into `self` in place.
    pub fn merge_from(&mut self, other: Value) {
        let Value {
            leaf,
            map,
            sequence,
        } = other;

        self.leaf = match (self.leaf.take(), leaf) {
            (Some(mine), Some(theirs)) => Some(Leaf::join(mine, theirs)),
            (mine, theirs) => mine.or(theirs),
        };
        self.map = match (self.map.take(), map) {
            (Some(mut mine), Some(theirs)) => {
                mine.merge_from(theirs);
                Some(mine)
            }
            (mine, theirs) => mine.or(theirs),
        };
        self.sequence = match (self.sequence.take(), sequence) {
            (Some(mut mine), Some(theirs)) => {
                mine.merge_from(theirs);
                Some(mine)
            }
            (mine, theirs) => mine.or(theirs),
        };
        self.settle();
    }

    /// Prune each container's content below the newest other component.
    fn settle(&mut self) {
        let leaf = self.leaf.as_ref().map(Leaf::stamp);
        let map_floor = leaf
            .max(self.sequence.as_ref().map(|s| &s.stamp))
            .cloned();
        let sequence_floor = leaf.max(self.map.as_ref().map(|m| &m.stamp)).cloned();

        if let Some(map) = &mut self.map {
            prune_children(&mut map.entries, map_floor.as_ref());
        }
        if let Some(sequence) = &mut self.sequence {
            prune_children(&mut sequence.items, sequence_floor.as_ref());
        }
    }

    /// Drop everything stamped before `floor`. A container that still has
    /// newer content survives with its stamp raised to `floor`. Sequence
    /// tombstones are never dropped. Returns whether anything is left.
    fn prune(&mut self, floor: &Timestamp) -> bool {
        if self.leaf.as_ref().is_some_and(|leaf| leaf.stamp() < floor) {
            self.leaf = None;
        }
        self.map = self.map.take().and_then(|mut map| {
            prune_children(&mut map.entries, Some(floor));
            if map.stamp >= *floor {
                Some(map)
            } else if map.entries.is_empty() {
                None
            } else {
                map.stamp = floor.clone();
                Some(map)
            }
        });
        self.sequence = self.sequence.take().and_then(|mut sequence| {
            prune_children(&mut sequence.items, Some(floor));
            if sequence.stamp >= *floor {
                Some(sequence)
            } else if sequence.items.is_empty() && sequence.tombstones.is_empty() {
                None
            } else {
                sequence.stamp = floor.clone();
                Some(sequence)
            }
        });
        !self.is_empty()
    }

    /// Deep equality of visible content, ignoring stamps, tombstones,
    /// hidden components and sort keys. Sequence order still counts.
    pub fn compare(a: &Value, b: &Value) -> bool {
        match (a.node(), b.node()) {
            (Some(Node::Scalar { value: x, .. }), Some(Node::Scalar { value: y, .. })) => x == y,
            (Some(Node::Map(_)), Some(Node::Map(_))) => {
                let left: Vec<_> = a.visible_entries().collect();
                let right: Vec<_> = b.visible_entries().collect();
                left.len() == right.len()
                    && left
                        .iter()
                        .zip(right.iter())
                        .all(|((ka, va), (kb, vb))| ka == kb && Value::compare(va, vb))
            }
            (Some(Node::Sequence(_)), Some(Node::Sequence(_))) => {
                let left: Vec<_> = a.visible_items().collect();
                let right: Vec<_> = b.visible_items().collect();
                left.len() == right.len()
                    && left
                        .iter()
                        .zip(right.iter())
                        .all(|((_, va), (_, vb))| Value::compare(va, vb))
            }
            (None | Some(Node::Tombstone { .. }), None | Some(Node::Tombstone { .. })) => true,
            _ => false,
        }
    }

    /// Map entries that are not deleted, in key order.
    pub fn visible_entries(&self) -> impl Iterator<Item = (&String, &Value)> {
        let entries = match self.node() {
            Some(Node::Map(map)) => Some(&map.entries),
            _ => None,
        };
        entries
            .into_iter()
            .flatten()
            .filter(|(_, v)| is_live(v))
    }

    /// Sequence items in display order.
    pub fn visible_items(&self) -> impl Iterator<Item = (&SortKey, &Value)> {
        let items = match self.node() {
            Some(Node::Sequence(sequence)) => Some(&sequence.items),
            _ => None,
        };
        items.into_iter().flatten().filter(|(_, v)| is_live(v))
    }

    /// Look up a live map entry, or a sequence item by sort key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self.node()? {
            Node::Map(map) => map.entries.get(key).filter(|v| is_live(v)),
            Node::Sequence(sequence) => SortKey::parse(key)
                .ok()
                .and_then(|k| sequence.items.get(&k))
                .filter(|v| is_live(v)),
            _ => None,
        }
    }

    /// The plain JSON view of the document. `None` for a deleted value.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self.node()? {
            Node::Scalar { value, .. } => Some(value.clone()),
            Node::Map(_) => Some(serde_json::Value::Object(
                self.visible_entries()
                    .filter_map(|(k, v)| v.to_json().map(|json| (k.clone(), json)))
                    .collect(),
            )),
            Node::Sequence(_) => Some(serde_json::Value::Array(
                self.visible_items().filter_map(|(_, v)| v.to_json()).collect(),
            )),
            Node::Tombstone { .. } => None,
        }
    }
}

fn is_live(value: &Value) -> bool {
    !matches!(value.node(), None | Some(Node::Tombstone { .. }))
}

fn prune_children<K: Ord>(children: &mut BTreeMap<K, Value>, floor: Option<&Timestamp>) {
    children.retain(|_, child| match floor {
        Some(floor) => child.prune(floor),
        None => !child.is_empty(),
    });
}

fn canonical(value: &serde_json::Value) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

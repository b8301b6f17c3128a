//! Hybrid logical clock for causal ordering across replicas.
//!
//! A [`Timestamp`] combines wall-clock milliseconds, a logical counter and
//! the node id. The clock never reads the system time itself: callers pass
//! the current wall time in, which keeps the engine deterministic.

use crate::{error::Result, Error, NodeId};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

/// Largest logical counter representable in the packed form (5 base-36 digits).
pub const MAX_LOGICAL: u32 = 36u32.pow(5) - 1;

/// Default tolerated skew for remote timestamps, in milliseconds.
pub const DEFAULT_MAX_DRIFT: u64 = 60_000;

const PHYSICAL_WIDTH: usize = 15;
const LOGICAL_WIDTH: usize = 5;

/// A hybrid logical timestamp.
///
/// Ordering is lexicographic over `(physical, logical, node)`, which gives
/// a total order across all nodes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    /// Wall-clock milliseconds
    pub physical: u64,
    /// Counter disambiguating events within one physical tick
    pub logical: u32,
    /// Node that produced the timestamp
    pub node: NodeId,
}

impl Timestamp {
    /// Create a timestamp from its parts.
    pub fn new(physical: u64, logical: u32, node: impl Into<NodeId>) -> Self {
        Self {
            physical,
            logical,
            node: node.into(),
        }
    }

    /// The smallest possible timestamp. Stamps the document root.
    pub fn origin() -> Self {
        Self::new(0, 0, "")
    }

    /// Encode as `"{physical}:{logical}:{node}"` with fixed-width numeric
    /// fields, so string order equals timestamp order.
    pub fn pack(&self) -> String {
        format!(
            "{:0pw$}:{}:{}",
            self.physical,
            to_base36(self.logical, LOGICAL_WIDTH),
            self.node,
            pw = PHYSICAL_WIDTH
        )
    }

    /// Decode a string produced by [`Timestamp::pack`].
    pub fn unpack(packed: &str) -> Result<Self> {
        let mut parts = packed.splitn(3, ':');
        let (Some(physical), Some(logical), Some(node)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::InvalidTimestamp(packed.to_string()));
        };

        let physical = physical
            .parse::<u64>()
            .map_err(|_| Error::InvalidTimestamp(packed.to_string()))?;
        let logical = u32::from_str_radix(logical, 36)
            .map_err(|_| Error::InvalidTimestamp(packed.to_string()))?;

        Ok(Self::new(physical, logical, node))
    }
}

fn to_base36(mut value: u32, width: usize) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut out = Vec::with_capacity(width);
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    while out.len() < width {
        out.push(b'0');
    }
    out.reverse();
    out.into_iter().map(char::from).collect()
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pack())
    }
}

impl FromStr for Timestamp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::unpack(s)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.pack())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let packed = String::deserialize(deserializer)?;
        Timestamp::unpack(&packed).map_err(de::Error::custom)
    }
}

/// A hybrid logical clock owned by one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hlc {
    last: Timestamp,
    max_drift: Option<u64>,
}

impl Hlc {
    /// Create a fresh clock for a node.
    pub fn new(node: impl Into<NodeId>, wall: u64) -> Self {
        Self {
            last: Timestamp::new(wall, 0, node),
            max_drift: Some(DEFAULT_MAX_DRIFT),
        }
    }

    /// Resume a clock from its last persisted timestamp.
    pub fn restore(last: Timestamp) -> Self {
        Self {
            last,
            max_drift: Some(DEFAULT_MAX_DRIFT),
        }
    }

    /// Set the tolerated remote skew. `None` accepts any remote time.
    pub fn with_max_drift(mut self, max_drift: Option<u64>) -> Self {
        self.max_drift = max_drift;
        self
    }

    /// Node id of this clock.
    pub fn node(&self) -> &NodeId {
        &self.last.node
    }

    /// The most recently issued or observed timestamp. Persist this.
    pub fn last(&self) -> &Timestamp {
        &self.last
    }

    /// Issue a timestamp for a local event.
    pub fn now(&mut self, wall: u64) -> Result<Timestamp> {
        let (physical, logical) = if wall > self.last.physical {
            (wall, 0)
        } else {
            (self.last.physical, self.bump(self.last.logical)?)
        };

        self.last = Timestamp::new(physical, logical, self.last.node.clone());
        Ok(self.last.clone())
    }

    /// Merge a remote timestamp into the local clock.
    ///
    /// The returned timestamp is strictly greater than both the previous
    /// local timestamp and `remote`.
    pub fn receive(&mut self, remote: &Timestamp, wall: u64) -> Result<Timestamp> {
        if let Some(max) = self.max_drift {
            let drift = remote.physical.saturating_sub(wall);
            if drift > max {
                return Err(Error::ClockDrift { drift, max });
            }
        }

        let local = &self.last;
        let physical = local.physical.max(remote.physical).max(wall);
        let logical = if physical == local.physical && physical == remote.physical {
            self.bump(local.logical.max(remote.logical))?
        } else if physical == local.physical {
            self.bump(local.logical)?
        } else if physical == remote.physical {
            self.bump(remote.logical)?
        } else {
            0
        };

        self.last = Timestamp::new(physical, logical, self.last.node.clone());
        Ok(self.last.clone())
    }

    fn bump(&self, logical: u32) -> Result<u32> {
        match logical.checked_add(1) {
            Some(next) if next <= MAX_LOGICAL => Ok(next),
            _ => Err(Error::ClockOverflow {
                physical: self.last.physical,
                node: self.last.node.clone(),
            }),
        }
    }
}

/// Thread-safe handle serializing `now`/`receive` on a shared [`Hlc`].
#[derive(Debug, Clone)]
pub struct SharedClock {
    inner: Arc<Mutex<Hlc>>,
}

impl SharedClock {
    pub fn new(clock: Hlc) -> Self {
        Self {
            inner: Arc::new(Mutex::new(clock)),
        }
    }

    pub fn now(&self, wall: u64) -> Result<Timestamp> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .now(wall)
    }

    pub fn receive(&self, remote: &Timestamp, wall: u64) -> Result<Timestamp> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .receive(remote, wall)
    }

    pub fn last(&self) -> Timestamp {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .clone()
    }

    pub fn node(&self) -> NodeId {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .node()
            .clone()
    }
}

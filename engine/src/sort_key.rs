//! Fractional-index sort keys for sequence items.
//!
//! Keys are base-62 digit strings read as fractions in `[0, 1)` and never
//! end in `'0'`, so plain string comparison matches numeric order. A new
//! key is the midpoint of its neighbours followed by an order-preserving
//! encoding of the insertion stamp. The midpoint is never a prefix of the
//! right neighbour, so the suffix cannot push the key past it, and there is
//! always room between two distinct keys.

use crate::{error::Result, Error, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

const DIGITS: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const BASE: u16 = 62;

/// Position of an item in a sequence; doubles as the item id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SortKey(String);

impl SortKey {
    /// Validate and wrap an existing key.
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() || raw.ends_with('0') || digits_of(&raw).is_none() {
            return Err(Error::InvalidSortKey(raw));
        }
        Ok(Self(raw))
    }

    /// Generate a key strictly between `left` and `right`.
    ///
    /// `None` stands for the start or end of the sequence. Concurrent
    /// inserts between the same neighbours get the same midpoint and are
    /// ordered by `stamp`, earliest first.
    pub fn between(left: Option<&SortKey>, right: Option<&SortKey>, stamp: &Timestamp) -> Result<Self> {
        if let (Some(l), Some(r)) = (left, right) {
            if l >= r {
                return Err(Error::InvalidSortKey(format!(
                    "left {} is not before right {}",
                    l, r
                )));
            }
        }

        Ok(Self::generate(left, right, stamp))
    }

    /// Generate a key after `left` (or the first key when `None`).
    pub fn after(left: Option<&SortKey>, stamp: &Timestamp) -> Self {
        Self::generate(left, None, stamp)
    }

    fn generate(left: Option<&SortKey>, right: Option<&SortKey>, stamp: &Timestamp) -> Self {
        let a = left.and_then(|k| digits_of(&k.0)).unwrap_or_default();
        let b = right.and_then(|k| digits_of(&k.0));

        let mut key = midpoint(&a, b.as_deref());
        key.extend(uniquifier(stamp));
        Self(key.into_iter().map(|d| DIGITS[d as usize] as char).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SortKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<SortKey> for String {
    fn from(key: SortKey) -> Self {
        key.0
    }
}

fn digits_of(raw: &str) -> Option<Vec<u8>> {
    raw.bytes()
        .map(|b| DIGITS.iter().position(|d| *d == b).map(|p| p as u8))
        .collect()
}

/// Midpoint of two fractions given as digit strings, `b = None` meaning 1.
///
/// Requires `a < b` and no trailing zero digits on either side. The result
/// is strictly between them, has no trailing zero, and is not a prefix of `b`.
fn midpoint(a: &[u8], b: Option<&[u8]>) -> Vec<u8> {
    if let Some(b) = b {
        let mut n = 0;
        while n < b.len() && a.get(n).copied().unwrap_or(0) == b[n] {
            n += 1;
        }
        if n > 0 {
            let rest_a = a.get(n..).unwrap_or(&[]);
            let mut out = b[..n].to_vec();
            out.extend(midpoint(rest_a, Some(&b[n..])));
            return out;
        }
    }

    let da = a.first().copied().unwrap_or(0) as u16;
    let db = b.and_then(|b| b.first()).map(|d| *d as u16).unwrap_or(BASE);
    if db - da > 1 {
        vec![((da + db) / 2) as u8]
    } else {
        let mut out = vec![da as u8];
        out.extend(midpoint(a.get(1..).unwrap_or(&[]), None));
        out
    }
}

/// Two non-zero digits per byte of the packed stamp, preserving byte order.
fn uniquifier(stamp: &Timestamp) -> Vec<u8> {
    stamp
        .pack()
        .bytes()
        .flat_map(|b| [1 + (b >> 4), 1 + (b & 0x0f)])
        .collect()
}

//! 128-bit, lexicographically time-sortable identifiers for tasks and nodes.
//!
//! Layout: `[48-bit unix-ms timestamp | 80-bit random]`, rendered as 32
//! lowercase hex characters. Because the timestamp occupies the high bits,
//! byte-lexicographic ordering (which is also string ordering of the hex
//! rendering) is time order across milliseconds and random order within one
//! millisecond.

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Marker for [`RawId`] distinguishing task IDs from node IDs at the type level.
pub trait IdKind: Clone + Copy + Eq + PartialEq {
    /// Short tag used only in `Debug` output, to tell two otherwise-identical
    /// hex strings apart when printed side by side.
    const TAG: &'static str;
}

/// Marker type for [`TaskId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskKind;
impl IdKind for TaskKind {
    const TAG: &'static str = "task";
}

/// Marker type for [`NodeId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeKind;
impl IdKind for NodeKind {
    const TAG: &'static str = "node";
}

/// Error returned when parsing a hex string into a [`RawId`] fails.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid id {0:?}: expected 32 lowercase hex characters")]
pub struct IdParseError(pub String);

/// A 128-bit, lexicographically time-sortable identifier.
///
/// `TaskId` and `NodeId` are both instantiations of this one generic type so
/// the allocator, parser, and `Ord` impl are written once.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawId<K> {
    bytes: [u8; 16],
    _kind: PhantomData<K>,
}

/// Task identifier: 128-bit, time-sortable, minted at task submission.
pub type TaskId = RawId<TaskKind>;
/// Node identifier: 128-bit, time-sortable, minted at node registration.
pub type NodeId = RawId<NodeKind>;

impl<K: IdKind> RawId<K> {
    /// Mint a new ID: the current unix-ms timestamp in the top 48 bits,
    /// followed by 80 bits from the thread-local random generator.
    pub fn new() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the unix epoch")
            .as_millis() as u64;

        let mut bytes = [0u8; 16];
        // Top 6 bytes: big-endian 48-bit timestamp (truncate the unused top 16 bits).
        let ts_bytes = millis.to_be_bytes();
        bytes[0..6].copy_from_slice(&ts_bytes[2..8]);
        // Remaining 10 bytes: random.
        rand::rng().fill_bytes(&mut bytes[6..16]);

        Self {
            bytes,
            _kind: PhantomData,
        }
    }

    /// Build an ID from raw bytes without going through the allocator.
    /// Used by tests and by callers reconstructing an ID that crossed a
    /// text boundary (e.g. a database row) without re-parsing through
    /// `FromStr` at every call site.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self {
            bytes,
            _kind: PhantomData,
        }
    }

    /// The raw 16 bytes backing this ID.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.bytes
    }

    /// The embedded unix-ms timestamp (top 48 bits).
    pub fn timestamp_millis(&self) -> u64 {
        let mut ts = [0u8; 8];
        ts[2..8].copy_from_slice(&self.bytes[0..6]);
        u64::from_be_bytes(ts)
    }
}

impl<K: IdKind> Default for RawId<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: IdKind> fmt::Display for RawId<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.bytes {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl<K: IdKind> fmt::Debug for RawId<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", K::TAG, self)
    }
}

impl<K: IdKind> FromStr for RawId<K> {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(IdParseError(s.to_owned()));
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in bytes.iter_mut().enumerate() {
            let hex_pair = &s[i * 2..i * 2 + 2];
            *chunk =
                u8::from_str_radix(hex_pair, 16).map_err(|_| IdParseError(s.to_owned()))?;
        }
        // Reject uppercase explicitly even though from_str_radix accepts it;
        // the canonical rendering is lowercase-only.
        if s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(IdParseError(s.to_owned()));
        }
        Ok(Self {
            bytes,
            _kind: PhantomData,
        })
    }
}

impl<K: IdKind> Serialize for RawId<K> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de, K: IdKind> Deserialize<'de> for RawId<K> {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::thread::sleep;
    use std::time::Duration;

    #[test]
    fn format_is_32_lowercase_hex_chars() {
        let id = TaskId::new();
        let s = id.to_string();
        assert_eq!(s.len(), 32);
        assert!(s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
    }

    #[test]
    fn parse_format_roundtrip() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!("abcd".parse::<TaskId>().is_err());
        assert!("a".repeat(31).parse::<TaskId>().is_err());
        assert!("a".repeat(33).parse::<TaskId>().is_err());
    }

    #[test]
    fn rejects_non_hex() {
        assert!("g".repeat(32).parse::<TaskId>().is_err());
        assert!("zz".to_owned().repeat(16).parse::<TaskId>().is_err());
    }

    #[test]
    fn rejects_uppercase() {
        let id = TaskId::new();
        let upper = id.to_string().to_uppercase();
        assert!(upper.parse::<TaskId>().is_err());
    }

    #[test]
    fn ids_minted_later_sort_greater() {
        let a = TaskId::new();
        sleep(Duration::from_millis(5));
        let b = TaskId::new();
        assert!(a < b, "later-minted id should sort after earlier one");
    }

    #[test]
    fn timestamp_matches_embedded_value() {
        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        let id = TaskId::new();
        let after = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        assert!(id.timestamp_millis() >= before && id.timestamp_millis() <= after);
    }

    #[test]
    fn task_and_node_ids_are_distinct_types() {
        // This is a compile-time property; the test just exercises both.
        let t = TaskId::new();
        let n = NodeId::new();
        assert_ne!(t.to_string(), n.to_string());
    }

    #[test]
    fn many_ids_are_unique() {
        let ids: BTreeSet<TaskId> = (0..1000).map(|_| TaskId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }
}

//! Register and map primitives the table document is built from.
//!
//! Every value lives in a last-writer-wins register; the map tracks
//! removals with tombstones so a delete and a stale concurrent write
//! converge the same way on every replica.

use crate::hlc::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;

/// A value tagged with the timestamp of its last write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LwwRegister<T> {
    /// Current value
    pub value: T,
    /// Timestamp of the write that produced `value`
    pub timestamp: Timestamp,
}

impl<T: Clone> LwwRegister<T> {
    /// Create a register holding `value`.
    #[must_use]
    pub fn new(value: T, timestamp: Timestamp) -> Self {
        Self { value, timestamp }
    }

    /// Write `value` if `timestamp` is newer than the stored one.
    ///
    /// Returns `true` when the write won.
    pub fn set(&mut self, value: T, timestamp: Timestamp) -> bool {
        if timestamp <= self.timestamp {
            return false;
        }
        self.value = value;
        self.timestamp = timestamp;
        true
    }

    /// Merge another replica's register into this one.
    pub fn merge(&mut self, other: &Self) {
        self.set(other.value.clone(), other.timestamp);
    }
}

/// Observed-remove map of LWW registers.
///
/// A key is visible when its register is newer than its tombstone.
#[derive(Debug, Clone, PartialEq)]
pub struct OrMap<K, V>
where
    K: Eq + Hash + Clone,
{
    entries: HashMap<K, LwwRegister<V>>,
    tombstones: HashMap<K, Timestamp>,
}

impl<K, V> Default for OrMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> OrMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            tombstones: HashMap::new(),
        }
    }

    /// Visible value for `key`.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|reg| &reg.value)
    }

    /// Visible register for `key`, including its timestamp.
    #[must_use]
    pub fn register(&self, key: &K) -> Option<&LwwRegister<V>> {
        self.entries.get(key)
    }

    /// Whether `key` is currently visible.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Write `value` under `key`.
    ///
    /// Ignored when a tombstone at or after `timestamp` exists, or when the
    /// stored register is newer. Returns `true` when the write took effect.
    pub fn insert(&mut self, key: K, value: V, timestamp: Timestamp) -> bool {
        if let Some(&removed_at) = self.tombstones.get(&key) {
            if removed_at >= timestamp {
                return false;
            }
            self.tombstones.remove(&key);
        }

        match self.entries.get_mut(&key) {
            Some(reg) => reg.set(value, timestamp),
            None => {
                self.entries.insert(key, LwwRegister::new(value, timestamp));
                true
            }
        }
    }

    /// Remove `key` as of `timestamp`.
    ///
    /// The tombstone is always recorded; the visible entry is dropped only
    /// when it is older than the removal. Returns `true` if an entry was dropped.
    pub fn remove(&mut self, key: &K, timestamp: Timestamp) -> bool {
        let tombstone = self.tombstones.entry(key.clone()).or_insert(timestamp);
        if timestamp > *tombstone {
            *tombstone = timestamp;
        }

        let superseded = self
            .entries
            .get(key)
            .is_some_and(|reg| timestamp > reg.timestamp);
        if superseded {
            self.entries.remove(key);
        }
        superseded
    }

    /// Merge another replica's full map.
    pub fn merge(&mut self, other: &Self) {
        for (key, &removed_at) in &other.tombstones {
            self.remove(key, removed_at);
        }
        for (key, reg) in &other.entries {
            self.insert(key.clone(), reg.value.clone(), reg.timestamp);
        }
    }

    /// Visible entries.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().map(|(key, reg)| (key, &reg.value))
    }

    /// Visible keys.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    /// Number of visible entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entry is visible.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop tombstones older than `before`.
    ///
    /// Only safe once every peer has integrated writes up to `before`.
    pub fn compact_tombstones(&mut self, before: Timestamp) -> usize {
        let count = self.tombstones.len();
        self.tombstones.retain(|_, removed_at| *removed_at >= before);
        count - self.tombstones.len()
    }

    /// Encode the complete state (entries and tombstones) as a delta.
    ///
    /// Applying the result to an empty map reproduces this map exactly.
    #[must_use]
    pub fn to_delta(&self) -> Delta<K, V> {
        Delta {
            inserts: self
                .entries
                .iter()
                .map(|(key, reg)| (key.clone(), reg.value.clone(), reg.timestamp))
                .collect(),
            removes: self
                .tombstones
                .iter()
                .map(|(key, removed_at)| (key.clone(), *removed_at))
                .collect(),
        }
    }
}

/// A batch of writes to replicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta<K, V> {
    /// Register writes
    pub inserts: Vec<(K, V, Timestamp)>,
    /// Removals
    pub removes: Vec<(K, Timestamp)>,
}

impl<K, V> Default for Delta<K, V> {
    fn default() -> Self {
        Self {
            inserts: Vec::new(),
            removes: Vec::new(),
        }
    }
}

impl<K, V> Delta<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Empty delta.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a register write.
    pub fn add_insert(&mut self, key: K, value: V, timestamp: Timestamp) {
        self.inserts.push((key, value, timestamp));
    }

    /// Record a removal.
    pub fn add_remove(&mut self, key: K, timestamp: Timestamp) {
        self.removes.push((key, timestamp));
    }

    /// Whether the delta carries no writes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.removes.is_empty()
    }

    /// Highest timestamp carried by this delta.
    #[must_use]
    pub fn max_timestamp(&self) -> Option<Timestamp> {
        self.inserts
            .iter()
            .map(|(_, _, ts)| *ts)
            .chain(self.removes.iter().map(|(_, ts)| *ts))
            .max()
    }

    /// Apply every write to `map`. Removals are applied after inserts.
    pub fn apply_to(&self, map: &mut OrMap<K, V>) {
        for (key, value, timestamp) in &self.inserts {
            map.insert(key.clone(), value.clone(), *timestamp);
        }
        for (key, timestamp) in &self.removes {
            map.remove(key, *timestamp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ActorId;
    use uuid::Uuid;

    fn ts(physical_ms: u64, actor: u8) -> Timestamp {
        Timestamp {
            physical_ms,
            logical: 0,
            actor: ActorId(Uuid::from_bytes([actor; 16])),
        }
    }

    #[test]
    fn register_keeps_newest_write() {
        let mut reg = LwwRegister::new("a", ts(10, 1));
        assert!(reg.set("b", ts(20, 1)));
        assert!(!reg.set("c", ts(15, 2)));
        assert_eq!(reg.value, "b");
    }

    #[test]
    fn stale_insert_cannot_resurrect_removed_key() {
        let mut map: OrMap<&str, i32> = OrMap::new();
        map.insert("pos", 1, ts(10, 1));
        assert!(map.remove(&"pos", ts(20, 1)));

        assert!(!map.insert("pos", 2, ts(15, 2)));
        assert!(map.get(&"pos").is_none());

        assert!(map.insert("pos", 3, ts(30, 2)));
        assert_eq!(map.get(&"pos"), Some(&3));
    }

    #[test]
    fn merge_is_order_independent() {
        let mut a: OrMap<&str, i32> = OrMap::new();
        let mut b: OrMap<&str, i32> = OrMap::new();
        a.insert("x", 1, ts(10, 1));
        a.insert("y", 1, ts(10, 1));
        b.insert("x", 2, ts(11, 2));
        b.remove(&"y", ts(12, 2));

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);

        assert_eq!(ab.get(&"x"), Some(&2));
        assert_eq!(ab.get(&"x"), ba.get(&"x"));
        assert!(ab.get(&"y").is_none());
        assert!(ba.get(&"y").is_none());
    }

    #[test]
    fn full_state_delta_rebuilds_map() {
        let mut map: OrMap<&str, i32> = OrMap::new();
        map.insert("kept", 1, ts(10, 1));
        map.insert("gone", 2, ts(10, 1));
        map.remove(&"gone", ts(11, 1));

        let mut rebuilt = OrMap::new();
        map.to_delta().apply_to(&mut rebuilt);
        assert_eq!(rebuilt, map);

        // the tombstone survives the round trip
        assert!(!rebuilt.insert("gone", 9, ts(10, 3)));
    }

    #[test]
    fn compaction_drops_only_old_tombstones() {
        let mut map: OrMap<&str, i32> = OrMap::new();
        map.remove(&"a", ts(10, 1));
        map.remove(&"b", ts(50, 1));
        assert_eq!(map.compact_tombstones(ts(20, 0)), 1);
    }
}

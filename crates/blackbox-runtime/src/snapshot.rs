#![forbid(unsafe_code)]

//! The registry's published output.
//!
//! A [`Snapshot`] is produced once per pass, never mutated afterwards and
//! handed down the tree as an `Rc<Snapshot>`, so every node compares against
//! the same allocation.

use ahash::RandomState;
use indexmap::IndexMap;

use blackbox_core::Value;

use crate::id::ConsumerId;

/// One consumer's entry in a snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    /// The merged result is reference-identical to the previous pass's.
    pub facsimile: bool,
    /// Primary result with folded secondary values.
    pub merged: Value,
}

/// Per-consumer results of one pass, in registration order.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pass: u64,
    entries: IndexMap<ConsumerId, SnapshotEntry, RandomState>,
}

impl Snapshot {
    pub(crate) fn new(pass: u64, entries: IndexMap<ConsumerId, SnapshotEntry, RandomState>) -> Self {
        Self { pass, entries }
    }

    /// Sequence number of the pass that produced this snapshot. Zero for
    /// the empty snapshot published before any pass.
    #[must_use]
    pub fn pass(&self) -> u64 {
        self.pass
    }

    #[must_use]
    pub fn get(&self, id: ConsumerId) -> Option<&SnapshotEntry> {
        self.entries.get(&id)
    }

    /// Facsimile flag for `id`, `None` when the id is absent.
    #[must_use]
    pub fn is_facsimile(&self, id: ConsumerId) -> Option<bool> {
        self.entries.get(&id).map(|entry| entry.facsimile)
    }

    #[must_use]
    pub fn merged(&self, id: ConsumerId) -> Option<&Value> {
        self.entries.get(&id).map(|entry| &entry.merged)
    }

    #[must_use]
    pub fn contains(&self, id: ConsumerId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Ids in registration order.
    pub fn ids(&self) -> impl Iterator<Item = ConsumerId> + '_ {
        self.entries.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConsumerId, &SnapshotEntry)> {
        self.entries.iter().map(|(id, entry)| (*id, entry))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sub-snapshot holding only `ids` that are present, keeping this
    /// snapshot's order and pass number.
    #[must_use]
    pub fn filter<'a>(&self, ids: impl IntoIterator<Item = &'a ConsumerId>) -> Self {
        let wanted: indexmap::IndexSet<ConsumerId, RandomState> = ids.into_iter().copied().collect();
        let entries = self
            .entries
            .iter()
            .filter(|(id, _)| wanted.contains(*id))
            .map(|(id, entry)| (*id, entry.clone()))
            .collect();
        Self {
            pass: self.pass,
            entries,
        }
    }

    /// Value of the secondary derivation `name` folded under `key` in the
    /// merged result of `id`.
    #[must_use]
    pub fn appended(&self, id: ConsumerId, key: &str, name: &str) -> Option<&Value> {
        self.merged(id)?.as_map()?.get(key)?.as_map()?.get(name)
    }
}

#[cfg(feature = "serde")]
mod serde_impl {
    use serde::ser::{Serialize, SerializeMap, SerializeStruct, Serializer};

    use super::{Snapshot, SnapshotEntry};

    impl Serialize for SnapshotEntry {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            let mut state = serializer.serialize_struct("SnapshotEntry", 2)?;
            state.serialize_field("facsimile", &self.facsimile)?;
            state.serialize_field("merged", &self.merged)?;
            state.end()
        }
    }

    struct Entries<'a>(&'a Snapshot);

    impl Serialize for Entries<'_> {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            let mut map = serializer.serialize_map(Some(self.0.len()))?;
            for (id, entry) in self.0.iter() {
                map.serialize_entry(&id.get(), entry)?;
            }
            map.end()
        }
    }

    impl Serialize for Snapshot {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            let mut state = serializer.serialize_struct("Snapshot", 2)?;
            state.serialize_field("pass", &self.pass)?;
            state.serialize_field("entries", &Entries(self))?;
            state.end()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blackbox_core::{Mapping, mapping};

    fn sample() -> Snapshot {
        let mut entries = IndexMap::default();
        for (raw, facsimile) in [(1, true), (2, false), (3, true)] {
            entries.insert(
                ConsumerId::new(raw),
                SnapshotEntry {
                    facsimile,
                    merged: Value::Map(mapping! { "n" => raw as i64 }),
                },
            );
        }
        Snapshot::new(4, entries)
    }

    #[test]
    fn filter_keeps_order_and_pass() {
        let snap = sample();
        let wanted = [ConsumerId::new(3), ConsumerId::new(1), ConsumerId::new(9)];
        let filtered = snap.filter(&wanted);
        assert_eq!(filtered.pass(), 4);
        let ids: Vec<_> = filtered.ids().map(ConsumerId::get).collect();
        assert_eq!(ids, [1, 3]);
    }

    #[test]
    fn filtered_entries_share_merged_values() {
        let snap = sample();
        let filtered = snap.filter(&[ConsumerId::new(2)]);
        let a = snap.merged(ConsumerId::new(2)).unwrap();
        let b = filtered.merged(ConsumerId::new(2)).unwrap();
        assert!(a.same(b));
    }

    #[test]
    fn lookups() {
        let snap = sample();
        assert_eq!(snap.is_facsimile(ConsumerId::new(2)), Some(false));
        assert_eq!(snap.is_facsimile(ConsumerId::new(5)), None);
        assert_eq!(snap.len(), 3);
        assert!(Snapshot::default().is_empty());
    }

    #[test]
    fn appended_reads_folded_values() {
        let appended = Value::Map(mapping! { "total" => 5 });
        let merged = Mapping::new().with("count", 1).with("appended", appended);
        let mut entries = IndexMap::default();
        entries.insert(
            ConsumerId::new(1),
            SnapshotEntry {
                facsimile: false,
                merged: Value::Map(merged),
            },
        );
        let snap = Snapshot::new(1, entries);
        assert_eq!(
            snap.appended(ConsumerId::new(1), "appended", "total"),
            Some(&Value::Int(5))
        );
        assert_eq!(snap.appended(ConsumerId::new(1), "appended", "other"), None);
    }
}

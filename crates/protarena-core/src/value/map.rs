//! Storage of map fields.
//!
//! Entries are kept ordered by key, so iteration and serialization see them
//! in ascending key order without sorting.

use super::{Elem, MapKey};
use std::collections::BTreeMap;

/// Unique-key entries of one map field
#[derive(Debug, Clone, Default)]
pub(crate) struct MapData {
    entries: BTreeMap<MapKey, Elem>,
}

impl MapData {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn get(&self, key: &MapKey) -> Option<Elem> {
        self.entries.get(key).copied()
    }

    /// Insert or replace; returns the previous value
    pub(crate) fn insert(&mut self, key: MapKey, elem: Elem) -> Option<Elem> {
        self.entries.insert(key, elem)
    }

    pub(crate) fn remove(&mut self, key: &MapKey) -> Option<Elem> {
        self.entries.remove(key)
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Entries in ascending key order
    pub(crate) fn sorted(&self) -> impl Iterator<Item = (&MapKey, Elem)> + '_ {
        self.entries.iter().map(|(key, elem)| (key, *elem))
    }
}

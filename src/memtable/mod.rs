//! # Memtable Module
//!
//! The mutable, in-memory layer of the storage engine: a sorted map of the
//! most recent writes, flushed to an SSTable once its byte budget is spent.
//!
//! ## Semantics
//!
//! - `insert` on a present key behaves as `update`; `update` on an absent key
//!   behaves as `insert`. The delegation is resolved with a single presence
//!   check, so neither call can recurse into the other.
//! - `delete` never removes a node. It overwrites the value with the
//!   [`TOMBSTONE`] sentinel, or inserts a tombstone when the key is absent, so
//!   a later flush shadows any stale on-disk value for that key.
//! - Lookups return the raw stored value; [`Memtable::get`] classifies it into
//!   a live value or a deletion.
//!
//! ## Backing map
//!
//! The ordering structure sits behind the [`OrderedMap`] trait. [`AvlTree`]
//! is the default; `BTreeMap<String, String>` is provided as a drop-in
//! alternative.
//!
//! Durability is not handled here: the engine appends to the WAL before it
//! calls into the memtable.


mod avl;

pub use avl::AvlTree;

use std::collections::BTreeMap;

/// Sentinel value marking a logically deleted key.
pub const TOMBSTONE: &str = "TOMBSTONE";

// ------------------------------------------------------------------------------------------------
// OrderedMap
// ------------------------------------------------------------------------------------------------

/// A sorted string map usable as memtable storage.
pub trait OrderedMap: Send + Sync {
    /// Inserts `key` if absent. Returns `false` and leaves the map untouched
    /// when the key already exists.
    fn insert(&mut self, key: String, value: String) -> bool;

    /// Overwrites the value of an existing key. Returns `false` and leaves the
    /// map untouched when the key is absent.
    fn update(&mut self, key: &str, value: String) -> bool;

    fn get(&self, key: &str) -> Option<&str>;

    /// Ascending iteration over all entries.
    fn iter_sorted(&self) -> Box<dyn Iterator<Item = (&str, &str)> + '_>;

    fn len(&self) -> usize;

    fn clear(&mut self);
}

impl OrderedMap for BTreeMap<String, String> {
    fn insert(&mut self, key: String, value: String) -> bool {
        if self.contains_key(&key) {
            return false;
        }
        BTreeMap::insert(self, key, value);
        true
    }

    fn update(&mut self, key: &str, value: String) -> bool {
        match self.get_mut(key) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    fn get(&self, key: &str) -> Option<&str> {
        BTreeMap::get(self, key).map(String::as_str)
    }

    fn iter_sorted(&self) -> Box<dyn Iterator<Item = (&str, &str)> + '_> {
        Box::new(self.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    fn len(&self) -> usize {
        BTreeMap::len(self)
    }

    fn clear(&mut self) {
        BTreeMap::clear(self)
    }
}

// ------------------------------------------------------------------------------------------------
// Memtable
// ------------------------------------------------------------------------------------------------

/// Result of a memtable point lookup.
#[derive(Debug, PartialEq, Eq)]
pub enum MemtableGetResult<'a> {
    /// The key holds a live value.
    Put(&'a str),
    /// The key holds a tombstone.
    Delete,
    /// The key is not in the memtable.
    NotFound,
}

/// Sorted in-memory buffer of recent writes.
#[derive(Debug, Default)]
pub struct Memtable<M: OrderedMap = AvlTree> {
    map: M,
}

impl Memtable {
    /// Creates an empty memtable backed by an [`AvlTree`].
    pub fn new() -> Self {
        Self::default()
    }
}

impl<M: OrderedMap> Memtable<M> {
    /// Creates a memtable over an arbitrary (normally empty) ordered map.
    pub fn with_map(map: M) -> Self {
        Self { map }
    }

    pub fn insert(&mut self, key: &str, value: &str) {
        if !self.map.update(key, value.to_string()) {
            self.map.insert(key.to_string(), value.to_string());
        }
    }

    pub fn update(&mut self, key: &str, value: &str) {
        self.insert(key, value)
    }

    /// Records a tombstone for `key`, whether or not the key is present.
    pub fn delete(&mut self, key: &str) {
        self.insert(key, TOMBSTONE)
    }

    pub fn find_key(&self, key: &str) -> bool {
        self.map.get(key).is_some()
    }

    /// Raw stored value, including the tombstone sentinel.
    pub fn find_value(&self, key: &str) -> Option<&str> {
        self.map.get(key)
    }

    pub fn get(&self, key: &str) -> MemtableGetResult<'_> {
        match self.map.get(key) {
            Some(TOMBSTONE) => MemtableGetResult::Delete,
            Some(value) => MemtableGetResult::Put(value),
            None => MemtableGetResult::NotFound,
        }
    }

    /// Ascending `(key, value)` pairs, tombstones included. Used at flush.
    pub fn iter_sorted(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.map.iter_sorted()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    /// Sum of `len(key) + len(value)` over every entry.
    pub fn payload_bytes(&self) -> usize {
        self.map.iter_sorted().map(|(k, v)| k.len() + v.len()).sum()
    }

    pub fn clear(&mut self) {
        self.map.clear()
    }

    /// Borrow of the backing map, for invariant checks in tests.
    #[cfg(test)]
    pub(crate) fn map(&self) -> &M {
        &self.map
    }
}

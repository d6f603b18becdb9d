//! Storage — a key-ordered map abstraction for stateful operators (§2, §4.3,
//! §4.4, §4.5).
//!
//! Each stateful operator (`Join`, `Take`, `Exists`) owns one [`Storage`]
//! instance, allocated at operator construction and freed with it (spec
//! §3 "Lifecycle"). Keys are `Vec<Value>` tuples so operators can encode
//! composite keys (a correlation prefix, a parent primary key, ...)
//! directly, and iteration order follows `Value`'s `Ord` impl — which is
//! sufficient for the prefix-scans these operators need (e.g. "all rows
//! whose key starts with this parentKey").

use std::collections::BTreeMap;

use crate::value::Value;

/// A storage key: an ordered tuple of values. Two keys where one is a
/// prefix of the other sort adjacently, which is what [`Storage::scan_prefix`]
/// relies on.
pub type StorageKey = Vec<Value>;

/// A key-ordered map private to one operator.
#[derive(Debug, Default)]
pub struct Storage<V> {
    entries: BTreeMap<StorageKey, V>,
}

impl<V> Storage<V> {
    pub fn new() -> Self {
        Storage {
            entries: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &StorageKey) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &StorageKey) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    pub fn insert(&mut self, key: StorageKey, value: V) -> Option<V> {
        self.entries.insert(key, value)
    }

    pub fn remove(&mut self, key: &StorageKey) -> Option<V> {
        self.entries.remove(key)
    }

    pub fn contains_key(&self, key: &StorageKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose key starts with `prefix`. Used by `Join` to check
    /// whether any materialized pairing remains for a given parentKey, and
    /// by `Exists` to scope its per-parent size cache.
    pub fn scan_prefix<'a>(
        &'a self,
        prefix: &'a [Value],
    ) -> impl Iterator<Item = (&'a StorageKey, &'a V)> + 'a {
        self.entries
            .range(prefix.to_vec()..)
            .take_while(move |(k, _)| k.starts_with(prefix))
    }

    /// Whether any entry exists whose key starts with `prefix`.
    pub fn prefix_is_empty(&self, prefix: &[Value]) -> bool {
        self.scan_prefix(prefix).next().is_none()
    }

    /// Remove every entry whose key starts with `prefix`, returning how
    /// many were removed. Used when a join's parent row is fully cleaned
    /// up and all of its materialized child pairings must go with it.
    pub fn remove_prefix(&mut self, prefix: &[Value]) -> usize {
        let keys: Vec<StorageKey> = self
            .scan_prefix(prefix)
            .map(|(k, _)| k.clone())
            .collect();
        let n = keys.len();
        for k in keys {
            self.entries.remove(&k);
        }
        n
    }
}

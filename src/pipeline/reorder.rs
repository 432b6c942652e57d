//! Ordered-release buffer keyed by segment.
//!
//! Both reordering points of the pipeline use it: the tagger holds the
//! content of segments that are not yet frontmost, the sequencer holds
//! result frames that completed ahead of the release cursor. Items under
//! one key keep their insertion order.

use std::collections::BTreeMap;

/// Holds items per key until the owner releases that key.
#[derive(Debug)]
pub struct ReorderBuffer<K, T> {
    held: BTreeMap<K, Vec<T>>,
    len: usize,
}

impl<K: Ord + Copy, T> ReorderBuffer<K, T> {
    pub fn new() -> Self {
        Self {
            held: BTreeMap::new(),
            len: 0,
        }
    }

    /// Appends `item` behind everything already held for `key`.
    pub fn push(&mut self, key: K, item: T) {
        self.held.entry(key).or_default().push(item);
        self.len += 1;
    }

    /// Removes and returns everything held for `key`, in arrival order.
    pub fn take(&mut self, key: &K) -> Vec<T> {
        let items = self.held.remove(key).unwrap_or_default();
        self.len -= items.len();
        items
    }

    pub fn contains(&self, key: &K) -> bool {
        self.held.contains_key(key)
    }

    /// Drops every key strictly below `bound`. Returns the number of items dropped.
    pub fn discard_below(&mut self, bound: &K) -> usize {
        let kept = self.held.split_off(bound);
        let dropped: usize = self.held.values().map(Vec::len).sum();
        self.held = kept;
        self.len -= dropped;
        dropped
    }

    /// Drops everything. Returns the number of items dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.len;
        self.held.clear();
        self.len = 0;
        dropped
    }

    /// Total number of items held.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<K: Ord + Copy, T> Default for ReorderBuffer<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

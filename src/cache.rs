// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded cache with strict least-recently-used eviction.
//!
//! The [`BoundedCache`] is the second tier of the loader's memoization:
//! a fixed-capacity map that evicts exactly the least-recently-touched
//! entry when a new key would push it over capacity. Both reads and
//! writes refresh an entry's recency.
//!
//! The API is single-owner (`&mut self`); the loader serialises access
//! behind its own lock, so the cache itself carries none.
//!
//! # Example
//!
//! ```
//! use docsync::BoundedCache;
//!
//! let mut cache = BoundedCache::new(2);
//! cache.insert("a".into(), 1);
//! cache.insert("b".into(), 2);
//! cache.get("a");            // "a" is now most recent
//! cache.insert("c".into(), 3); // evicts "b", the LRU entry
//!
//! assert!(cache.contains("a"));
//! assert!(!cache.contains("b"));
//! assert!(cache.contains("c"));
//! ```

use std::collections::{HashMap, VecDeque};

/// Fixed-capacity cache evicting the single least-recently-used entry.
///
/// Recency is refreshed by both [`get`](Self::get) and
/// [`insert`](Self::insert); [`remove`](Self::remove) leaves the
/// recency order of the surviving entries untouched.
pub struct BoundedCache<V> {
    entries: HashMap<String, V>,
    /// Recency order, front = least recently used.
    order: VecDeque<String>,
    max_size: usize,
}

impl<V> BoundedCache<V> {
    /// Create a cache holding at most `max_size` entries.
    /// Zero is clamped to 1.
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            max_size: max_size.max(1),
        }
    }

    /// Look up `key`, marking it most-recently-used on a hit.
    pub fn get(&mut self, key: &str) -> Option<&V> {
        if self.entries.contains_key(key) {
            self.touch(key);
            self.entries.get(key)
        } else {
            None
        }
    }

    /// Insert or replace `key`. An existing key is refreshed in place
    /// (value and recency); at capacity, the least-recently-used entry
    /// is evicted first.
    pub fn insert(&mut self, key: String, value: V) {
        if self.entries.contains_key(&key) {
            self.touch(&key);
            self.entries.insert(key, value);
            return;
        }

        if self.entries.len() >= self.max_size {
            if let Some(lru) = self.order.pop_front() {
                self.entries.remove(&lru);
            }
        }

        self.order.push_back(key.clone());
        self.entries.insert(key, value);
    }

    /// Membership check without refreshing recency.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove `key` if present, returning its value.
    pub fn remove(&mut self, key: &str) -> Option<V> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.order.retain(|k| k != key);
        }
        removed
    }

    /// Drop all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Current number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Configured capacity.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key.to_string());
    }
}

/*!
 * Bounded-Memory Storage
 *
 * In-memory key-value map with LRU eviction under a fixed byte budget.
 * Keys and values are opaque byte strings. A single mutex guards the entry
 * map, the recency order, and the usage counter; every public operation
 * takes the lock exactly once and releases it before returning, so the
 * store can be shared as `Arc<Store>` by any number of callers.
 */

use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::sync::Mutex;

use crate::lru::RecencyList;

type AHash = BuildHasherDefault<ahash::AHasher>;

/// Accounted bytes per entry beyond the key and value themselves: map slot,
/// recency node, bookkeeping. An accounting estimate, not a measurement of
/// the allocator.
pub const ENTRY_OVERHEAD: usize = 64;

struct Entry {
    value: Vec<u8>,
    last_accessed: u64,
    size: usize,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<Vec<u8>, Entry, AHash>,
    order: RecencyList,
    mem_used: usize,
    /// Logical clock; bumped on every touch so recency ties cannot happen.
    clock: u64,
}

/// Bounded-memory key-value store with least-recently-used eviction.
pub struct Store {
    inner: Mutex<Inner>,
    max_memory: usize,
}

impl Store {
    /// Create a store that evicts to stay within `max_memory` accounted bytes.
    pub fn new(max_memory: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_memory,
        }
    }

    /// Accounted size of an entry for the given key and value.
    #[inline]
    pub fn entry_size(key: &[u8], value: &[u8]) -> usize {
        key.len() + value.len() + ENTRY_OVERHEAD
    }

    /// Insert or overwrite a key.
    ///
    /// Overwriting updates the entry in place, re-accounts its size, and
    /// promotes the key. Inserting first evicts least-recent entries until
    /// the new entry fits or the store is empty; an entry larger than the
    /// whole budget is still inserted once the store has been emptied.
    pub fn set(&self, key: Vec<u8>, value: Vec<u8>) {
        let size = Self::entry_size(&key, &value);
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.clock += 1;

        if let Some(entry) = inner.entries.get_mut(&key) {
            inner.mem_used = inner.mem_used - entry.size + size;
            entry.value = value;
            entry.size = size;
            entry.last_accessed = inner.clock;
            inner.order.touch(&key);
            return;
        }

        while !inner.order.is_empty() && inner.mem_used + size > self.max_memory {
            if let Some(victim) = inner.order.pop_back() {
                if let Some(evicted) = inner.entries.remove(&victim) {
                    inner.mem_used -= evicted.size;
                }
            }
        }

        inner.order.push_front(key.clone());
        inner.entries.insert(
            key,
            Entry {
                value,
                last_accessed: inner.clock,
                size,
            },
        );
        inner.mem_used += size;
    }

    /// Look up a key, promoting it to most-recent on a hit.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.clock += 1;

        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.last_accessed = inner.clock;
                let value = entry.value.clone();
                inner.order.touch(key);
                Some(value)
            }
            None => None,
        }
    }

    /// Remove a key. Returns whether it was present. Does not promote.
    pub fn del(&self, key: &[u8]) -> bool {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        match inner.entries.remove(key) {
            Some(entry) => {
                inner.mem_used -= entry.size;
                inner.order.remove(key);
                true
            }
            None => false,
        }
    }

    /// Accounted bytes currently held.
    pub fn memory_usage(&self) -> usize {
        self.inner.lock().unwrap().mem_used
    }

    /// The configured budget.
    pub fn max_memory(&self) -> usize {
        self.max_memory
    }

    /// Number of keys currently present.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check the cross-structure invariants; test support.
    #[cfg(test)]
    fn assert_consistent(&self) {
        let inner = self.inner.lock().unwrap();
        assert_eq!(inner.entries.len(), inner.order.len());
        let mut sum = 0;
        for key in inner.order.iter() {
            let entry = inner.entries.get(key).expect("key in order but not in map");
            sum += entry.size;
        }
        assert_eq!(sum, inner.mem_used);
        for key in inner.entries.keys() {
            assert!(inner.order.contains(key), "key in map but not in order");
        }
    }
}

//! Bounded LRU cache with per-entry TTL.
//!
//! Shared by the router (decision cache) and the expert executor (result
//! cache). Lock-protected; all operations are O(capacity) worst case, which
//! is fine at the configured sizes (hundreds of entries).

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Instant,
    /// Monotonic access counter used for LRU eviction.
    last_used: u64,
}

struct Inner<K, V> {
    map: HashMap<K, Entry<V>>,
    tick: u64,
}

/// Thread-safe LRU cache with TTL expiry.
pub struct TtlCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    max_entries: usize,
    ttl: Duration,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                tick: 0,
            }),
            max_entries: max_entries.max(1),
            ttl,
        }
    }

    /// Fetch a live entry, refreshing its LRU position.
    /// Expired entries are removed on access.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;

        let expired = match inner.map.get_mut(key) {
            Some(entry) => {
                if entry.expires_at > Instant::now() {
                    entry.last_used = tick;
                    return Some(entry.value.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            inner.map.remove(key);
        }
        None
    }

    /// Insert or replace an entry. When the cache is full, the
    /// least-recently-used entry is evicted first.
    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;

        if !inner.map.contains_key(&key) && inner.map.len() >= self.max_entries {
            let lru_key = inner
                .map
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            if let Some(k) = lru_key {
                inner.map.remove(&k);
            }
        }

        inner.map.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
                last_used: tick,
            },
        );
    }

    pub fn remove(&self, key: &K) {
        self.inner.lock().unwrap().map.remove(key);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

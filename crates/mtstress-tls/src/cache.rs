//! Server session cache serialized through the installed locking callback.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use mtstress_core::{ContextStats, Hooks, Shared};
use rustls::server::StoresServerSessions;

#[derive(Debug, Default)]
struct Table {
    entries: HashMap<Vec<u8>, Vec<u8>>,
    order: VecDeque<Vec<u8>>,
    hits: u64,
    misses: u64,
}

impl Table {
    fn insert(&mut self, capacity: usize, key: Vec<u8>, value: Vec<u8>) {
        if let Some(slot) = self.entries.get_mut(&key) {
            *slot = value;
            return;
        }
        while self.entries.len() >= capacity {
            let Some(oldest) = self.order.pop_front() else { break };
            self.entries.remove(&oldest);
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, value);
    }

    fn lookup(&mut self, key: &[u8], remove: bool) -> Option<Vec<u8>> {
        let found = if remove { self.entries.remove(key) } else { self.entries.get(key).cloned() };
        if remove && found.is_some() {
            self.order.retain(|queued| queued.as_slice() != key);
        }
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        found
    }
}

/// Bounded FIFO store of server-side TLS sessions.
///
/// Every operation holds the library's session-cache lock for its duration.
#[derive(Debug)]
pub struct SessionCache {
    hooks: Arc<Hooks>,
    table: Shared<Table>,
    capacity: usize,
}

impl SessionCache {
    /// Empty cache of at most `capacity` sessions under lock `id`.
    pub fn new(hooks: Arc<Hooks>, id: usize, capacity: usize) -> Self {
        Self { hooks, table: Shared::new(id, Table::default()), capacity: capacity.max(1) }
    }

    /// Copy hit, miss and item counts into `stats`.
    pub fn fill_stats(&self, stats: &mut ContextStats) {
        self.table.with(&self.hooks, |table| {
            stats.cache_hits = table.hits;
            stats.cache_misses = table.misses;
            stats.cache_items = table.entries.len() as u64;
        });
    }
}

impl StoresServerSessions for SessionCache {
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> bool {
        self.table.with(&self.hooks, |table| table.insert(self.capacity, key, value));
        true
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.table.with(&self.hooks, |table| table.lookup(key, false))
    }

    fn take(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.table.with(&self.hooks, |table| table.lookup(key, true))
    }

    fn can_cache(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use mtstress_core::LockRegistry;

    use super::*;

    #[test]
    fn take_is_single_use() {
        let cache = SessionCache::new(Arc::new(Hooks::new()), 0, 8);
        cache.put(b"id".to_vec(), b"state".to_vec());

        assert_eq!(cache.get(b"id"), Some(b"state".to_vec()));
        assert_eq!(cache.take(b"id"), Some(b"state".to_vec()));
        assert_eq!(cache.take(b"id"), None);

        let mut stats = ContextStats::default();
        cache.fill_stats(&mut stats);
        assert_eq!((stats.cache_hits, stats.cache_misses, stats.cache_items), (2, 1, 0));
    }

    #[test]
    fn oldest_entry_is_evicted() {
        let cache = SessionCache::new(Arc::new(Hooks::new()), 0, 2);
        for key in [b"a", b"b", b"c"] {
            cache.put(key.to_vec(), key.to_vec());
        }

        assert_eq!(cache.get(b"a"), None);
        assert!(cache.get(b"b").is_some());
        assert!(cache.get(b"c").is_some());
    }

    #[test]
    fn taken_keys_leave_the_eviction_order() {
        let cache = SessionCache::new(Arc::new(Hooks::new()), 0, 4);
        for round in 0u32..10_000 {
            let key = round.to_be_bytes().to_vec();
            cache.put(key.clone(), b"state".to_vec());
            assert!(cache.take(&key).is_some());
        }

        let (entries, queued) =
            cache.table.with(&cache.hooks, |table| (table.entries.len(), table.order.len()));
        assert_eq!((entries, queued), (0, 0));
    }

    #[test]
    fn reinserted_key_is_not_evicted_early() {
        let cache = SessionCache::new(Arc::new(Hooks::new()), 0, 2);
        cache.put(b"a".to_vec(), b"1".to_vec());
        cache.take(b"a");
        cache.put(b"b".to_vec(), b"2".to_vec());
        cache.put(b"a".to_vec(), b"3".to_vec());
        cache.put(b"c".to_vec(), b"4".to_vec());

        assert_eq!(cache.get(b"a"), Some(b"3".to_vec()));
        assert_eq!(cache.get(b"b"), None);
        assert!(cache.get(b"c").is_some());
    }

    #[test]
    fn operations_take_the_cache_lock() {
        let hooks = Arc::new(Hooks::new());
        let registry = Arc::new(LockRegistry::new(2));
        hooks.install(registry.clone()).unwrap();

        let cache = SessionCache::new(Arc::clone(&hooks), 1, 4);
        cache.put(b"k".to_vec(), b"v".to_vec());
        cache.take(b"k");

        assert_eq!(registry.counters(), vec![0, 2]);
    }
}

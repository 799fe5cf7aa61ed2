//! In-memory mirror of the remote table.
//!
//! The cache is the single source of truth for synchronous reads. It is
//! never evicted: entries live as long as the cache does. A key can be
//! present with a null value (a remote row whose `value` is NULL), which is
//! different from a key the cache has never seen.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use satchel_core::KeyValueRecord;

use super::traits::{CacheStats, LocalBackend};

#[derive(Debug, Default)]
pub struct LocalCache {
    entries: RwLock<HashMap<String, Option<String>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a value. Never blocks on I/O.
    pub fn read(&self, key: &str) -> Option<String> {
        self.entry(key).flatten()
    }

    /// Read the raw entry: `None` when the key is unknown, `Some(None)` for
    /// a known null value.
    pub fn entry(&self, key: &str) -> Option<Option<String>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(key)
    }

    /// Assign a value, returning the previous one.
    pub fn write(&self, key: &str, value: Option<String>) -> Option<String> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), value).flatten()
    }

    /// Raw entry without touching the hit/miss counters.
    pub fn peek(&self, key: &str) -> Option<Option<String>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned()
    }

    /// Remove an entry, returning the previous value.
    pub fn clear(&self, key: &str) -> Option<String> {
        self.take(key).flatten()
    }

    /// Remove an entry, returning it. `None` when there was no entry.
    pub fn take(&self, key: &str) -> Option<Option<String>> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(key)
    }

    /// Read, falling through to the device-local backend for unknown keys.
    pub fn read_through_default(&self, key: &str, fallback: &dyn LocalBackend) -> Option<String> {
        match self.entry(key) {
            Some(value) => value,
            None => fallback.get(key),
        }
    }

    /// Load records, skipping keys rejected by `accept` and keys that already
    /// have an entry. Returns the number of entries added.
    pub fn load<I, F>(&self, records: I, accept: F) -> usize
    where
        I: IntoIterator<Item = KeyValueRecord>,
        F: Fn(&str) -> bool,
    {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let mut added = 0;
        for record in records {
            if !accept(&record.key) || entries.contains_key(&record.key) {
                continue;
            }
            entries.insert(record.key, record.value);
            added += 1;
        }
        added
    }

    /// Snapshot of the keys currently cached, sorted.
    pub fn keys(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: self.len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryLocalBackend;
    use proptest::prelude::*;

    #[test]
    fn test_write_then_read() {
        let cache = LocalCache::new();
        assert_eq!(cache.write("k", Some("1".to_string())), None);
        assert_eq!(cache.write("k", Some("2".to_string())), Some("1".to_string()));
        assert_eq!(cache.read("k").as_deref(), Some("2"));
    }

    #[test]
    fn test_null_entry_is_not_a_miss() {
        let cache = LocalCache::new();
        cache.write("k", None);

        assert_eq!(cache.entry("k"), Some(None));
        assert!(cache.contains("k"));
        assert_eq!(cache.read("k"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn test_clear_returns_previous() {
        let cache = LocalCache::new();
        cache.write("k", Some("v".to_string()));
        assert_eq!(cache.clear("k"), Some("v".to_string()));
        assert_eq!(cache.clear("k"), None);
        assert!(cache.is_empty());

        cache.write("n", None);
        assert_eq!(cache.take("n"), Some(None));
        assert_eq!(cache.take("n"), None);
    }

    #[test]
    fn test_peek_does_not_count() {
        let cache = LocalCache::new();
        cache.write("k", Some("v".to_string()));
        assert_eq!(cache.peek("k"), Some(Some("v".to_string())));
        assert_eq!(cache.peek("missing"), None);
        assert_eq!(cache.stats().hits + cache.stats().misses, 0);
    }

    #[test]
    fn test_read_through_falls_back_on_miss_only() {
        let cache = LocalCache::new();
        let device = MemoryLocalBackend::new();
        device.set("k", "device").unwrap();
        device.set("n", "device").unwrap();

        assert_eq!(cache.read_through_default("k", &device).as_deref(), Some("device"));

        cache.write("k", Some("cached".to_string()));
        assert_eq!(cache.read_through_default("k", &device).as_deref(), Some("cached"));

        // A known null stays null.
        cache.write("n", None);
        assert_eq!(cache.read_through_default("n", &device), None);
    }

    #[test]
    fn test_load_respects_filter_and_existing_entries() {
        let cache = LocalCache::new();
        cache.write("local", Some("mine".to_string()));

        let added = cache.load(
            vec![
                KeyValueRecord::new("local", Some("remote".to_string())),
                KeyValueRecord::new("synced", Some("1".to_string())),
                KeyValueRecord::new("sb-token", Some("secret".to_string())),
            ],
            |key| !key.starts_with("sb-"),
        );

        assert_eq!(added, 1);
        assert_eq!(cache.read("local").as_deref(), Some("mine"));
        assert_eq!(cache.read("synced").as_deref(), Some("1"));
        assert!(!cache.contains("sb-token"));
        assert_eq!(cache.keys(), vec!["local".to_string(), "synced".to_string()]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Read-your-writes: the last write to a key is what a read returns.
        #[test]
        fn prop_last_write_wins(
            key in "[a-z-]{1,16}",
            values in proptest::collection::vec(".{0,24}", 1..8)
        ) {
            let cache = LocalCache::new();
            for value in &values {
                cache.write(&key, Some(value.clone()));
            }
            prop_assert_eq!(cache.read(&key), values.last().cloned());
            prop_assert_eq!(cache.len(), 1);
        }
    }
}

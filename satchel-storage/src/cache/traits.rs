//! Device-local backend trait and cache statistics.

use satchel_core::SatchelResult;

/// Synchronous key-value storage that never leaves the device.
///
/// Excluded keys live here exclusively, and synced keys fall back to it on a
/// cache miss. Implementations must be cheap to call from synchronous code:
/// no network, no blocking on other tasks.
pub trait LocalBackend: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> Option<String>;

    /// Store a value, replacing any previous one.
    fn set(&self, key: &str, value: &str) -> SatchelResult<()>;

    /// Remove a value, returning what was stored.
    fn remove(&self, key: &str) -> SatchelResult<Option<String>>;

    /// All stored keys.
    fn keys(&self) -> Vec<String>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads answered from the cache.
    pub hits: u64,
    /// Reads for keys the cache had never seen.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
}

impl CacheStats {
    /// Reads counted so far.
    pub fn reads(&self) -> u64 {
        self.hits + self.misses
    }

    /// Share of reads answered from the cache, `None` before the first read.
    pub fn hit_rate(&self) -> Option<f64> {
        match self.reads() {
            0 => None,
            reads => Some(self.hits as f64 / reads as f64),
        }
    }
}

//! Local cache and device-local storage.
//!
//! [`LocalCache`] mirrors the remote table in memory and answers every
//! synchronous read. [`LocalBackend`] implementations hold what never leaves
//! the device: excluded keys, and the fallback for keys the cache has not
//! seen yet.

mod device;
mod local;
mod traits;

pub use device::{FileLocalBackend, MemoryLocalBackend};
pub use local::LocalCache;
pub use traits::{CacheStats, LocalBackend};

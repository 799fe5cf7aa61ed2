//! SATCHEL Storage - local-first sync over a remote key-value table
//!
//! Reads are answered synchronously from an in-memory cache, writes commit
//! locally and replicate in the background, and a realtime change feed
//! keeps every process that shares a backend converging.
//!
//! - [`remote`]: the [`RemoteStore`] seam, an in-memory store and a REST +
//!   realtime WebSocket client
//! - [`cache`]: the [`LocalCache`] and device-local backends
//! - [`events`]: synchronous change dispatch
//! - [`engine`]: the [`SyncEngine`]
//! - [`facade`]: the typed [`KeyValueStore`]

pub mod cache;
pub mod engine;
pub mod events;
pub mod facade;
pub mod layer;
pub mod remote;

pub use cache::{CacheStats, FileLocalBackend, LocalBackend, LocalCache, MemoryLocalBackend};
pub use engine::{EngineOptions, FetchOutcome, LocalWrite, RemoteWrite, SyncEngine, WriteReceipt};
pub use events::{ChangeBus, ChangeHandler, Listener};
pub use facade::KeyValueStore;
pub use layer::{initialize_sync_layer, SyncLayer};
pub use remote::{
    ChangeFeed, InMemoryRemoteStore, RealtimeHandle, RemoteCallCounts, RemoteStore,
    RestRemoteStore,
};

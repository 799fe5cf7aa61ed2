//! Wiring for a configured backend.

use satchel_core::{SatchelResult, SyncConfig};
use tracing::info;

use crate::engine::EngineOptions;
use crate::facade::KeyValueStore;
use crate::remote::{RealtimeHandle, RestRemoteStore};

/// A bootstrapped store talking to a REST backend, plus its realtime socket.
///
/// Dropping it stops realtime ingestion.
#[derive(Debug)]
pub struct SyncLayer {
    store: KeyValueStore<RestRemoteStore>,
    realtime: Option<RealtimeHandle>,
}

impl SyncLayer {
    pub fn store(&self) -> &KeyValueStore<RestRemoteStore> {
        &self.store
    }

    /// Whether a realtime connection task is running.
    pub fn has_realtime(&self) -> bool {
        self.realtime
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Send queued writes, then stop realtime ingestion and the replicator.
    pub async fn shutdown(mut self) {
        self.store.engine().flush().await;
        if let Some(handle) = self.realtime.take() {
            handle.stop();
        }
        self.store.engine().shutdown();
    }
}

/// Build the REST client, open the device store, start realtime and load
/// the remote table.
///
/// Configuration and construction errors are returned; an unreachable
/// backend is not an error (the layer starts empty and keeps serving local
/// data). Must be called inside a tokio runtime.
///
/// Call it once per process and share the returned layer. Every call builds
/// a new engine with its own cache, realtime socket and bulk fetch. Repeated
/// bootstrap of one layer is what [`KeyValueStore::initialize`] guards, and
/// calling that again is a no-op.
pub async fn initialize_sync_layer(config: &SyncConfig) -> SatchelResult<SyncLayer> {
    config.validate()?;
    let remote = RestRemoteStore::new(config)?;
    let realtime = remote.start_realtime(config);
    let options = EngineOptions::from_config(config)?;

    let store = KeyValueStore::new(remote, options);
    store.initialize().await;

    info!(
        table = %config.table,
        realtime = realtime.is_some(),
        "Sync layer ready"
    );
    Ok(SyncLayer { store, realtime })
}

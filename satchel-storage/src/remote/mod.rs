//! Remote store clients.
//!
//! The remote side is a single table of `(key, value, updated_at)` rows plus
//! a change feed. [`RemoteStore`] is the seam the sync engine talks to;
//! [`InMemoryRemoteStore`] backs tests and in-process sharing, and
//! [`RestRemoteStore`] talks to a PostgREST-compatible backend with a
//! realtime WebSocket feed.

pub mod memory;
pub mod realtime;
pub mod rest;

use async_trait::async_trait;
use satchel_core::{KeyValueRecord, RemoteChange, RemoteError};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

pub use memory::{InMemoryRemoteStore, RemoteCallCounts};
pub use realtime::{spawn_realtime, RealtimeHandle, RealtimeOptions};
pub use rest::RestRemoteStore;

/// Client for the remote key-value table.
///
/// Every failure is reported as a [`RemoteError`]; callers decide whether to
/// log and continue. Writes are last-writer-wins with no version check.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Fetch every row. Used once, at bootstrap.
    async fn fetch_all(&self) -> Result<Vec<KeyValueRecord>, RemoteError>;

    /// Fetch a single row by key.
    async fn fetch_one(&self, key: &str) -> Result<Option<KeyValueRecord>, RemoteError>;

    /// Insert or replace a row by key.
    async fn upsert(&self, record: &KeyValueRecord) -> Result<(), RemoteError>;

    /// Delete a row by key. Deleting a missing row is not an error.
    async fn delete(&self, key: &str) -> Result<(), RemoteError>;

    /// Subscribe to row changes.
    ///
    /// The feed carries every INSERT/UPDATE/DELETE, including the ones this
    /// process caused. Dropping the feed unsubscribes.
    fn subscribe_changes(&self) -> ChangeFeed;
}

#[async_trait]
impl<R: RemoteStore> RemoteStore for Arc<R> {
    async fn fetch_all(&self) -> Result<Vec<KeyValueRecord>, RemoteError> {
        (**self).fetch_all().await
    }

    async fn fetch_one(&self, key: &str) -> Result<Option<KeyValueRecord>, RemoteError> {
        (**self).fetch_one(key).await
    }

    async fn upsert(&self, record: &KeyValueRecord) -> Result<(), RemoteError> {
        (**self).upsert(record).await
    }

    async fn delete(&self, key: &str) -> Result<(), RemoteError> {
        (**self).delete(key).await
    }

    fn subscribe_changes(&self) -> ChangeFeed {
        (**self).subscribe_changes()
    }
}

/// Receiving end of a remote change subscription.
#[derive(Debug)]
pub struct ChangeFeed {
    rx: broadcast::Receiver<RemoteChange>,
}

impl ChangeFeed {
    pub fn new(rx: broadcast::Receiver<RemoteChange>) -> Self {
        Self { rx }
    }

    /// Wait for the next change.
    ///
    /// Returns `None` once the sending side is gone. A lagging receiver
    /// skips the overwritten changes and keeps going.
    pub async fn next(&mut self) -> Option<RemoteChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Change feed lagged, some remote changes were dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take a change if one is already queued.
    pub fn try_next(&mut self) -> Option<RemoteChange> {
        loop {
            match self.rx.try_recv() {
                Ok(change) => return Some(change),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Change feed lagged, some remote changes were dropped");
                }
                Err(_) => return None,
            }
        }
    }
}

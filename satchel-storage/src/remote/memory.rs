//! In-memory remote store.
//!
//! Behaves like the hosted table: last writer wins, every mutation is
//! broadcast on the change feed (including to the writer), and any number
//! of engines can share one instance through an `Arc`. Offline mode,
//! artificial latency and delayed read responses let tests exercise the
//! failure paths and races.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use satchel_core::{ChangeKind, KeyValueRecord, RemoteChange, RemoteError};
use tokio::sync::broadcast;

use super::{ChangeFeed, RemoteStore};

const DEFAULT_FEED_CAPACITY: usize = 1024;

/// Number of calls made per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemoteCallCounts {
    pub fetch_all: u64,
    pub fetch_one: u64,
    pub upsert: u64,
    pub delete: u64,
}

#[derive(Debug, Default)]
struct CallCounters {
    fetch_all: AtomicU64,
    fetch_one: AtomicU64,
    upsert: AtomicU64,
    delete: AtomicU64,
}

/// Shared in-memory table with a change feed.
#[derive(Debug)]
pub struct InMemoryRemoteStore {
    rows: RwLock<HashMap<String, KeyValueRecord>>,
    changes: broadcast::Sender<RemoteChange>,
    offline: AtomicBool,
    latency_ms: AtomicU64,
    read_lag_ms: AtomicU64,
    calls: CallCounters,
}

impl Default for InMemoryRemoteStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_FEED_CAPACITY)
    }
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store whose change feed buffers `capacity` events per subscriber.
    pub fn with_capacity(capacity: usize) -> Self {
        let (changes, _rx) = broadcast::channel(capacity);
        Self {
            rows: RwLock::new(HashMap::new()),
            changes,
            offline: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            read_lag_ms: AtomicU64::new(0),
            calls: CallCounters::default(),
        }
    }

    /// Pre-populate rows without counting calls or broadcasting.
    pub fn seed<I>(&self, records: I)
    where
        I: IntoIterator<Item = KeyValueRecord>,
    {
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        for record in records {
            rows.insert(record.key.clone(), record);
        }
    }

    /// Write a row without notifying subscribers.
    ///
    /// Models a change whose realtime notification never arrived.
    pub fn put_silently(&self, key: &str, value: Option<String>) {
        let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
        rows.insert(key.to_string(), KeyValueRecord::new(key, value));
    }

    /// Read a row without counting a call.
    pub fn peek(&self, key: &str) -> Option<KeyValueRecord> {
        let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
        rows.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Hold every `fetch_one` answer for `lag` after reading the row.
    ///
    /// The caller receives the row as it was when the read happened, so a
    /// write that lands in between makes the answer stale.
    pub fn set_read_lag(&self, lag: Duration) {
        self.read_lag_ms
            .store(lag.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn call_counts(&self) -> RemoteCallCounts {
        RemoteCallCounts {
            fetch_all: self.calls.fetch_all.load(Ordering::SeqCst),
            fetch_one: self.calls.fetch_one.load(Ordering::SeqCst),
            upsert: self.calls.upsert.load(Ordering::SeqCst),
            delete: self.calls.delete.load(Ordering::SeqCst),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.changes.receiver_count()
    }

    async fn enter(&self, operation: &str) -> Result<(), RemoteError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable {
                reason: format!("{} attempted while offline", operation),
            });
        }
        Ok(())
    }

    fn publish(&self, change: RemoteChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn fetch_all(&self) -> Result<Vec<KeyValueRecord>, RemoteError> {
        self.calls.fetch_all.fetch_add(1, Ordering::SeqCst);
        self.enter("fetch_all").await?;
        let rows = self.rows.read().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<KeyValueRecord> = rows.values().cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(records)
    }

    async fn fetch_one(&self, key: &str) -> Result<Option<KeyValueRecord>, RemoteError> {
        self.calls.fetch_one.fetch_add(1, Ordering::SeqCst);
        self.enter("fetch_one").await?;
        let row = self.peek(key);
        let lag = self.read_lag_ms.load(Ordering::SeqCst);
        if lag > 0 {
            tokio::time::sleep(Duration::from_millis(lag)).await;
        }
        Ok(row)
    }

    async fn upsert(&self, record: &KeyValueRecord) -> Result<(), RemoteError> {
        self.calls.upsert.fetch_add(1, Ordering::SeqCst);
        self.enter("upsert").await?;
        let kind = {
            let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
            match rows.insert(record.key.clone(), record.clone()) {
                Some(_) => ChangeKind::Update,
                None => ChangeKind::Insert,
            }
        };
        self.publish(RemoteChange::upsert(
            kind,
            record.key.clone(),
            record.value.clone(),
        ));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), RemoteError> {
        self.calls.delete.fetch_add(1, Ordering::SeqCst);
        self.enter("delete").await?;
        let existed = {
            let mut rows = self.rows.write().unwrap_or_else(|e| e.into_inner());
            rows.remove(key).is_some()
        };
        if existed {
            self.publish(RemoteChange::delete(key));
        }
        Ok(())
    }

    fn subscribe_changes(&self) -> ChangeFeed {
        ChangeFeed::new(self.changes.subscribe())
    }
}

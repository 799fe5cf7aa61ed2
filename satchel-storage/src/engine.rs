//! Sync engine: local-first reads and writes over a remote table.
//!
//! The engine owns the [`LocalCache`], the device-local backend for
//! excluded keys, and a background replicator task that issues remote
//! writes in call order. Every local write returns a [`WriteReceipt`]
//! immediately; its [`RemoteWrite`] half resolves once the replicator has
//! tried the network.
//!
//! Remote changes arrive through the store's change feed after
//! [`SyncEngine::initialize`] and are applied to the cache whatever their
//! origin, so every engine sharing a backend converges on the last write
//! it observed.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use satchel_core::{
    ChangeEvent, ChangeKind, ChangeOrigin, ExclusionRules, KeyValueRecord, RemoteChange,
    SatchelResult, SyncConfig,
};
use tokio::sync::{mpsc, oneshot, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::cache::{FileLocalBackend, LocalBackend, LocalCache, MemoryLocalBackend};
use crate::events::{ChangeBus, Listener};
use crate::remote::{ChangeFeed, RemoteStore};

// =============================================================================
// OPTIONS
// =============================================================================

/// Construction options for a [`SyncEngine`].
#[derive(Clone)]
pub struct EngineOptions {
    /// How long a cache miss waits for the remote before giving up.
    pub fetch_timeout: Duration,
    /// Keys that never leave the device.
    pub exclusions: ExclusionRules,
    /// Storage for excluded keys and the fallback for cache misses.
    pub device: Arc<dyn LocalBackend>,
}

impl std::fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineOptions")
            .field("fetch_timeout", &self.fetch_timeout)
            .field("exclusions", &self.exclusions.patterns())
            .finish_non_exhaustive()
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_millis(satchel_core::DEFAULT_FETCH_TIMEOUT_MS),
            exclusions: ExclusionRules::default(),
            device: Arc::new(MemoryLocalBackend::new()),
        }
    }
}

impl EngineOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build options from configuration, opening the device store file when
    /// one is configured.
    pub fn from_config(config: &SyncConfig) -> SatchelResult<Self> {
        let device: Arc<dyn LocalBackend> = match &config.local_store_path {
            Some(path) => Arc::new(FileLocalBackend::open(path.clone())?),
            None => Arc::new(MemoryLocalBackend::new()),
        };
        Ok(Self {
            fetch_timeout: config.fetch_timeout(),
            exclusions: config.exclusion_rules()?,
            device,
        })
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_exclusions(mut self, exclusions: ExclusionRules) -> Self {
        self.exclusions = exclusions;
        self
    }

    pub fn with_device(mut self, device: Arc<dyn LocalBackend>) -> Self {
        self.device = device;
        self
    }
}

// =============================================================================
// WRITE RESULTS
// =============================================================================

/// Local half of a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalWrite {
    /// The cache changed. `previous` is the value it replaced.
    Applied { previous: Option<String> },
    /// The cache already held this value (or had no entry to remove).
    Unchanged,
    /// The key is excluded and went to the device-local backend only.
    DeviceLocal,
}

/// Remote half of a write: resolves to whether the backend accepted it.
///
/// Dropping it does not cancel the write.
#[derive(Debug)]
pub struct RemoteWrite {
    state: RemoteState,
}

#[derive(Debug)]
enum RemoteState {
    Ready(bool),
    Pending(oneshot::Receiver<bool>),
}

impl RemoteWrite {
    fn ready(ok: bool) -> Self {
        Self {
            state: RemoteState::Ready(ok),
        }
    }

    fn pending(rx: oneshot::Receiver<bool>) -> Self {
        Self {
            state: RemoteState::Pending(rx),
        }
    }

    /// True while the replicator has not reported back.
    pub fn is_pending(&self) -> bool {
        matches!(self.state, RemoteState::Pending(_))
    }

    /// Wait for the outcome. A replicator that stopped counts as failure.
    pub async fn wait(self) -> bool {
        match self.state {
            RemoteState::Ready(ok) => ok,
            RemoteState::Pending(rx) => rx.await.unwrap_or(false),
        }
    }
}

/// Two-phase result of [`SyncEngine::write`] and [`SyncEngine::remove`].
#[derive(Debug)]
pub struct WriteReceipt {
    pub local: LocalWrite,
    pub remote: RemoteWrite,
}

impl WriteReceipt {
    fn new(local: LocalWrite, remote: RemoteWrite) -> Self {
        Self { local, remote }
    }
}

/// Result of a bounded single-key fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Found(KeyValueRecord),
    /// The backend answered and has no such row.
    Missing,
    /// Error or timeout. The remote state is unknown.
    Failed,
}

// =============================================================================
// REPLICATION
// =============================================================================

#[derive(Debug)]
enum ReplicationOp {
    Upsert(KeyValueRecord),
    Delete(String),
}

impl ReplicationOp {
    fn key(&self) -> &str {
        match self {
            Self::Upsert(record) => &record.key,
            Self::Delete(key) => key,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Upsert(_) => "upsert",
            Self::Delete(_) => "delete",
        }
    }
}

#[derive(Debug)]
enum Replication {
    Write {
        op: ReplicationOp,
        ack: oneshot::Sender<bool>,
    },
    /// Answered once every earlier write has been attempted.
    Barrier(oneshot::Sender<()>),
}

/// Per-key replication bookkeeping shared with the replicator task.
#[derive(Debug, Default)]
struct ReplicationState {
    inner: Mutex<ReplicationInner>,
}

#[derive(Debug, Default)]
struct ReplicationInner {
    /// Writes queued or in flight, per key.
    pending: HashMap<String, usize>,
    /// Keys whose cached value is not known to match the backend.
    unsynced: HashSet<String>,
    /// Bumped on every cache mutation that is newer than a fetch in flight.
    generations: HashMap<String, u64>,
}

impl ReplicationInner {
    fn bump(&mut self, key: &str) {
        *self.generations.entry(key.to_string()).or_insert(0) += 1;
    }

    fn generation(&self, key: &str) -> u64 {
        self.generations.get(key).copied().unwrap_or(0)
    }

    /// No write queued and the last one did not fail.
    fn is_settled(&self, key: &str) -> bool {
        !self.pending.contains_key(key) && !self.unsynced.contains(key)
    }
}

impl ReplicationState {
    fn lock(&self) -> std::sync::MutexGuard<'_, ReplicationInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn begin(&self, key: &str) {
        *self.lock().pending.entry(key.to_string()).or_insert(0) += 1;
    }

    fn finish(&self, key: &str, ok: bool) {
        let mut inner = self.lock();
        let drained = match inner.pending.get_mut(key) {
            Some(count) => {
                *count -= 1;
                *count == 0
            }
            None => false,
        };
        if drained {
            inner.pending.remove(key);
        }
        if ok {
            inner.unsynced.remove(key);
        } else {
            inner.unsynced.insert(key.to_string());
        }
    }
}

async fn run_replicator<R: RemoteStore>(
    remote: Arc<R>,
    state: Arc<ReplicationState>,
    mut queue: mpsc::UnboundedReceiver<Replication>,
) {
    while let Some(item) = queue.recv().await {
        let (op, ack) = match item {
            Replication::Write { op, ack } => (op, ack),
            Replication::Barrier(done) => {
                let _ = done.send(());
                continue;
            }
        };
        let result = match &op {
            ReplicationOp::Upsert(record) => remote.upsert(record).await,
            ReplicationOp::Delete(key) => remote.delete(key).await,
        };
        let ok = match result {
            Ok(()) => {
                trace!(key = %op.key(), operation = op.name(), "Replicated");
                true
            }
            Err(e) => {
                warn!(
                    key = %op.key(),
                    operation = op.name(),
                    error = %e,
                    "Remote write failed, local value kept"
                );
                false
            }
        };
        state.finish(op.key(), ok);
        // The caller may have dropped the receipt.
        let _ = ack.send(ok);
    }
    debug!("Replicator stopped");
}

// =============================================================================
// ENGINE
// =============================================================================

/// Local-first synchronization handle.
///
/// Construct one per backend identity and share it through an `Arc`.
/// Construction spawns the replicator, so it must happen inside a tokio
/// runtime.
pub struct SyncEngine<R: RemoteStore> {
    remote: Arc<R>,
    cache: LocalCache,
    device: Arc<dyn LocalBackend>,
    exclusions: ExclusionRules,
    fetch_timeout: Duration,
    bus: ChangeBus,
    bootstrap: OnceCell<()>,
    replication: Arc<ReplicationState>,
    replicator: Mutex<Option<mpsc::UnboundedSender<Replication>>>,
    ingest: Mutex<Option<JoinHandle<()>>>,
}

impl<R: RemoteStore> std::fmt::Debug for SyncEngine<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("cached", &self.cache.len())
            .field("initialized", &self.is_initialized())
            .field("fetch_timeout", &self.fetch_timeout)
            .finish_non_exhaustive()
    }
}

impl<R: RemoteStore> SyncEngine<R> {
    /// Create an engine and start its replicator.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn new(remote: impl Into<Arc<R>>, options: EngineOptions) -> Self {
        let remote = remote.into();
        let replication = Arc::new(ReplicationState::default());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_replicator(
            Arc::clone(&remote),
            Arc::clone(&replication),
            rx,
        ));

        Self {
            remote,
            cache: LocalCache::new(),
            device: options.device,
            exclusions: options.exclusions,
            fetch_timeout: options.fetch_timeout,
            bus: ChangeBus::new(),
            bootstrap: OnceCell::new(),
            replication,
            replicator: Mutex::new(Some(tx)),
            ingest: Mutex::new(None),
        }
    }

    /// Load the remote table and start realtime ingestion.
    ///
    /// Runs once per engine: concurrent callers wait for the first call and
    /// later calls return immediately. A failed bulk fetch is logged and the
    /// engine keeps serving local data and realtime changes.
    pub async fn initialize(self: &Arc<Self>) {
        self.bootstrap
            .get_or_init(|| async {
                // Subscribe before the snapshot so no change falls in between.
                let feed = self.remote.subscribe_changes();

                match self.remote.fetch_all().await {
                    Ok(records) => {
                        let total = records.len();
                        let loaded = self
                            .cache
                            .load(records, |key| self.exclusions.is_synced(key));
                        info!(total, loaded, "Sync layer bootstrapped");
                    }
                    Err(e) => {
                        warn!(error = %e, "Bootstrap fetch failed, serving local data only");
                    }
                }

                let handle = tokio::spawn(run_ingest(Arc::downgrade(self), feed));
                *self.ingest.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
            })
            .await;
    }

    pub fn is_initialized(&self) -> bool {
        self.bootstrap.initialized()
    }

    /// Read a value without touching the network.
    ///
    /// Excluded keys read from the device-local backend; synced keys read
    /// from the cache, falling back to the device-local backend on a miss.
    pub fn read(&self, key: &str) -> Option<String> {
        if self.exclusions.is_excluded(key) {
            return self.device.get(key);
        }
        self.cache.read_through_default(key, self.device.as_ref())
    }

    /// Commit a value locally and queue its upsert.
    ///
    /// No network call is made when the cache already holds exactly this
    /// value, no write to the key is queued and its last replication did not
    /// fail.
    pub fn write(&self, key: &str, value: impl Into<String>) -> WriteReceipt {
        let value = value.into();

        if self.exclusions.is_excluded(key) {
            let ok = match self.device.set(key, &value) {
                Ok(()) => true,
                Err(e) => {
                    warn!(key = %key, error = %e, "Device-local write failed");
                    false
                }
            };
            return WriteReceipt::new(LocalWrite::DeviceLocal, RemoteWrite::ready(ok));
        }

        let previous = {
            let mut replication = self.replication.lock();
            let current = self.cache.peek(key);
            if current.as_ref().and_then(|v| v.as_deref()) == Some(value.as_str()) {
                if replication.is_settled(key) {
                    trace!(key = %key, "Value unchanged, skipping upsert");
                    return WriteReceipt::new(LocalWrite::Unchanged, RemoteWrite::ready(true));
                }
                // The backend has not confirmed this value yet: send it again
                // and report that attempt's outcome.
                drop(replication);
                let remote =
                    self.replicate(ReplicationOp::Upsert(KeyValueRecord::new(key, Some(value))));
                return WriteReceipt::new(LocalWrite::Unchanged, remote);
            }
            replication.bump(key);
            self.cache.write(key, Some(value.clone()))
        };
        self.bus.emit(&ChangeEvent::new(
            key,
            previous.clone(),
            Some(value.clone()),
            ChangeOrigin::Local,
        ));

        let remote = self.replicate(ReplicationOp::Upsert(KeyValueRecord::new(key, Some(value))));
        WriteReceipt::new(LocalWrite::Applied { previous }, remote)
    }

    /// Remove a key locally and queue its remote delete.
    ///
    /// The delete is always sent for synced keys: the backend may hold rows
    /// this cache never loaded.
    pub fn remove(&self, key: &str) -> WriteReceipt {
        if self.exclusions.is_excluded(key) {
            let ok = match self.device.remove(key) {
                Ok(_) => true,
                Err(e) => {
                    warn!(key = %key, error = %e, "Device-local remove failed");
                    false
                }
            };
            return WriteReceipt::new(LocalWrite::DeviceLocal, RemoteWrite::ready(ok));
        }

        let taken = {
            let mut replication = self.replication.lock();
            replication.bump(key);
            self.cache.take(key)
        };
        let local = match taken {
            Some(previous) => {
                self.bus.emit(&ChangeEvent::new(
                    key,
                    previous.clone(),
                    None,
                    ChangeOrigin::Local,
                ));
                LocalWrite::Applied { previous }
            }
            None => LocalWrite::Unchanged,
        };

        let remote = self.replicate(ReplicationOp::Delete(key.to_string()));
        WriteReceipt::new(local, remote)
    }

    /// Cache a value without replicating it.
    ///
    /// The key is marked unsynced, so a later write of the same value still
    /// reaches the backend.
    pub fn seed_local(&self, key: &str, value: impl Into<String>) {
        let value = value.into();
        if self.exclusions.is_excluded(key) {
            if let Err(e) = self.device.set(key, &value) {
                warn!(key = %key, error = %e, "Device-local write failed");
            }
            return;
        }
        let previous = {
            let mut replication = self.replication.lock();
            replication.unsynced.insert(key.to_string());
            replication.bump(key);
            self.cache.write(key, Some(value.clone()))
        };
        self.bus.emit(&ChangeEvent::new(
            key,
            previous,
            Some(value),
            ChangeOrigin::Local,
        ));
    }

    /// Apply one realtime change to the cache and emit it.
    ///
    /// Every change to a synced key is emitted, including a DELETE for a key
    /// this cache never held. Returns `false` only for excluded keys.
    pub fn apply_remote(&self, change: RemoteChange) -> bool {
        if self.exclusions.is_excluded(&change.key) {
            trace!(key = %change.key, "Ignoring remote change for excluded key");
            return false;
        }

        let previous = {
            let mut replication = self.replication.lock();
            replication.bump(&change.key);
            match change.kind {
                ChangeKind::Delete => self.cache.take(&change.key).flatten(),
                ChangeKind::Insert | ChangeKind::Update => self
                    .cache
                    .write(&change.key, change.new_value.clone()),
            }
        };
        self.bus.emit(&ChangeEvent::new(
            change.key,
            previous,
            change.new_value,
            ChangeOrigin::Remote,
        ));
        true
    }

    /// Current write generation of `key`.
    ///
    /// Capture it before fetching and pass it to [`Self::adopt_remote`].
    pub fn generation(&self, key: &str) -> u64 {
        self.replication.lock().generation(key)
    }

    /// Store a fetched record in the cache when it differs.
    ///
    /// `generation` is the value of [`Self::generation`] taken before the
    /// fetch started. The record is refused when the key changed locally or
    /// through realtime since then, or while a local write to it is still
    /// replicating, so a slow fetch cannot roll a newer value back.
    pub fn adopt_remote(&self, record: KeyValueRecord, generation: u64) -> bool {
        if self.exclusions.is_excluded(&record.key) {
            return false;
        }

        let previous = {
            let replication = self.replication.lock();
            if replication.pending.contains_key(&record.key) {
                debug!(key = %record.key, "Local write in flight, not adopting fetched value");
                return false;
            }
            if replication.generation(&record.key) != generation {
                debug!(key = %record.key, "Key changed during fetch, not adopting fetched value");
                return false;
            }
            if self.cache.peek(&record.key).as_ref() == Some(&record.value) {
                return false;
            }
            self.cache.write(&record.key, record.value.clone())
        };
        self.bus.emit(&ChangeEvent::new(
            record.key,
            previous,
            record.value,
            ChangeOrigin::Remote,
        ));
        true
    }

    /// Fetch one key and adopt it when it differs from the cache.
    pub async fn refresh(&self, key: &str) -> bool {
        if self.exclusions.is_excluded(key) {
            return false;
        }
        let generation = self.generation(key);
        match self.remote.fetch_one(key).await {
            Ok(Some(record)) => {
                let changed = self.adopt_remote(record, generation);
                if changed {
                    debug!(key = %key, "Revalidation picked up a newer value");
                }
                changed
            }
            Ok(None) => false,
            Err(e) => {
                warn!(key = %key, error = %e, "Revalidation fetch failed");
                false
            }
        }
    }

    /// Fetch one key, giving up after the configured fetch timeout.
    pub async fn fetch(&self, key: &str) -> FetchOutcome {
        self.fetch_with_timeout(key, self.fetch_timeout).await
    }

    /// Fetch one key, giving up after `timeout`.
    ///
    /// On timeout the fetch future is dropped, which cancels the request.
    /// Excluded keys are never fetched.
    pub async fn fetch_with_timeout(&self, key: &str, timeout: Duration) -> FetchOutcome {
        if self.exclusions.is_excluded(key) {
            return FetchOutcome::Missing;
        }
        match tokio::time::timeout(timeout, self.remote.fetch_one(key)).await {
            Ok(Ok(Some(record))) => FetchOutcome::Found(record),
            Ok(Ok(None)) => FetchOutcome::Missing,
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "Remote fetch failed");
                FetchOutcome::Failed
            }
            Err(_) => {
                debug!(
                    key = %key,
                    timeout_ms = timeout.as_millis() as u64,
                    "Remote fetch timed out and was cancelled"
                );
                FetchOutcome::Failed
            }
        }
    }

    /// Register a change listener.
    pub fn listen<F>(&self, callback: F) -> Listener
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.bus.listen(callback)
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub fn exclusions(&self) -> &ExclusionRules {
        &self.exclusions
    }

    pub fn is_synced(&self, key: &str) -> bool {
        self.exclusions.is_synced(key)
    }

    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout
    }

    /// Wait until every write queued so far has been attempted.
    pub async fn flush(&self) {
        let (done, rx) = oneshot::channel();
        let queued = {
            let sender = self.replicator.lock().unwrap_or_else(|e| e.into_inner());
            sender
                .as_ref()
                .map(|sender| sender.send(Replication::Barrier(done)).is_ok())
                .unwrap_or(false)
        };
        if queued {
            let _ = rx.await;
        }
    }

    /// Stop realtime ingestion and close the replication queue.
    ///
    /// Writes already queued are still sent. Later writes apply locally and
    /// report remote failure.
    pub fn shutdown(&self) {
        if let Some(handle) = self.ingest.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        self.replicator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        debug!("Sync engine shut down");
    }

    fn replicate(&self, op: ReplicationOp) -> RemoteWrite {
        let sender = self.replicator.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = sender.as_ref() else {
            debug!(key = %op.key(), "Engine shut down, remote write skipped");
            return RemoteWrite::ready(false);
        };

        let key = op.key().to_string();
        let (ack, rx) = oneshot::channel();
        self.replication.begin(&key);
        if sender.send(Replication::Write { op, ack }).is_err() {
            self.replication.finish(&key, false);
            warn!(key = %key, "Replicator is gone, remote write skipped");
            return RemoteWrite::ready(false);
        }
        RemoteWrite::pending(rx)
    }
}

impl<R: RemoteStore> Drop for SyncEngine<R> {
    fn drop(&mut self) {
        if let Some(handle) = self.ingest.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

async fn run_ingest<R: RemoteStore>(handle: Weak<SyncEngine<R>>, mut feed: ChangeFeed) {
    while let Some(change) = feed.next().await {
        let Some(engine) = handle.upgrade() else {
            break;
        };
        trace!(key = %change.key, kind = change.kind.as_str(), "Applying remote change");
        engine.apply_remote(change);
    }
    debug!("Realtime ingestion stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryRemoteStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn engine(remote: &Arc<InMemoryRemoteStore>) -> Arc<SyncEngine<InMemoryRemoteStore>> {
        Arc::new(SyncEngine::new(Arc::clone(remote), EngineOptions::default()))
    }

    #[tokio::test]
    async fn test_write_is_visible_before_replication() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        remote.set_latency(Duration::from_millis(50));
        let engine = engine(&remote);

        let receipt = engine.write("royal-academy-pricing", "5000");

        assert_eq!(receipt.local, LocalWrite::Applied { previous: None });
        assert!(receipt.remote.is_pending());
        assert_eq!(engine.read("royal-academy-pricing").as_deref(), Some("5000"));
        assert!(remote.peek("royal-academy-pricing").is_none());

        assert!(receipt.remote.wait().await);
        assert_eq!(
            remote.peek("royal-academy-pricing").unwrap().value.as_deref(),
            Some("5000")
        );
    }

    #[tokio::test]
    async fn test_identical_write_skips_network() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let engine = engine(&remote);

        assert!(engine.write("k", "v").remote.wait().await);
        let second = engine.write("k", "v");

        assert_eq!(second.local, LocalWrite::Unchanged);
        assert!(!second.remote.is_pending());
        assert_eq!(remote.call_counts().upsert, 1);
    }

    #[tokio::test]
    async fn test_failed_write_is_retried_on_identical_value() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let engine = engine(&remote);

        remote.set_offline(true);
        assert!(!engine.write("k", "v").remote.wait().await);
        assert_eq!(engine.read("k").as_deref(), Some("v"));

        remote.set_offline(false);
        let retry = engine.write("k", "v");
        assert!(retry.remote.wait().await);
        assert_eq!(remote.call_counts().upsert, 2);
    }

    #[tokio::test]
    async fn test_excluded_write_stays_on_device() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let engine = engine(&remote);
        let events = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&events);
        let _listener = engine.listen(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let receipt = engine.write("sb-access-token", "secret");

        assert_eq!(receipt.local, LocalWrite::DeviceLocal);
        assert!(receipt.remote.wait().await);
        assert_eq!(engine.read("sb-access-token").as_deref(), Some("secret"));
        assert!(!engine.cache().contains("sb-access-token"));
        assert_eq!(remote.call_counts().upsert, 0);
        assert_eq!(events.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remove_emits_and_deletes() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let engine = engine(&remote);
        engine.write("k", "v").remote.wait().await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _listener = engine.listen(move |e| sink.lock().unwrap().push(e.clone()));

        let receipt = engine.remove("k");
        assert_eq!(
            receipt.local,
            LocalWrite::Applied {
                previous: Some("v".to_string())
            }
        );
        assert!(receipt.remote.wait().await);
        assert!(remote.peek("k").is_none());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].is_removal());
        assert_eq!(seen[0].origin, ChangeOrigin::Local);
    }

    #[tokio::test]
    async fn test_remove_unknown_key_still_deletes_remotely() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        remote.seed(vec![KeyValueRecord::new("k", Some("v".to_string()))]);
        let engine = engine(&remote);

        let receipt = engine.remove("k");
        assert_eq!(receipt.local, LocalWrite::Unchanged);
        assert!(receipt.remote.wait().await);
        assert!(remote.is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_loads_synced_keys_once() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        remote.seed(vec![
            KeyValueRecord::new("royal-academy-teachers", Some("[]".to_string())),
            KeyValueRecord::new("royal-academy-ui-theme", Some("\"dark\"".to_string())),
        ]);
        let engine = engine(&remote);

        engine.initialize().await;
        engine.initialize().await;

        assert!(engine.is_initialized());
        assert_eq!(remote.call_counts().fetch_all, 1);
        assert_eq!(engine.read("royal-academy-teachers").as_deref(), Some("[]"));
        assert!(!engine.cache().contains("royal-academy-ui-theme"));
    }

    #[tokio::test]
    async fn test_bootstrap_keeps_earlier_local_writes() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        remote.seed(vec![KeyValueRecord::new("k", Some("remote".to_string()))]);
        remote.set_latency(Duration::from_millis(20));
        let engine = engine(&remote);

        let receipt = engine.write("k", "local");
        engine.initialize().await;

        assert_eq!(engine.read("k").as_deref(), Some("local"));
        receipt.remote.wait().await;
    }

    #[tokio::test]
    async fn test_failed_bootstrap_still_initializes() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        remote.set_offline(true);
        let engine = engine(&remote);

        engine.initialize().await;

        assert!(engine.is_initialized());
        assert!(engine.cache().is_empty());
    }

    #[tokio::test]
    async fn test_apply_remote_assigns_and_clears() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let engine = engine(&remote);

        assert!(engine.apply_remote(RemoteChange::upsert(
            ChangeKind::Insert,
            "k",
            Some("1".to_string())
        )));
        assert_eq!(engine.read("k").as_deref(), Some("1"));

        assert!(engine.apply_remote(RemoteChange::delete("k")));
        assert_eq!(engine.read("k"), None);

        assert!(!engine.apply_remote(RemoteChange::upsert(
            ChangeKind::Insert,
            "sb-refresh-token",
            Some("x".to_string())
        )));
    }

    #[tokio::test]
    async fn test_realtime_changes_reach_cache() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let engine = engine(&remote);
        engine.initialize().await;

        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let _listener = engine.listen(move |e| {
            if e.is_remote() {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(e.clone());
                }
            }
        });

        remote
            .upsert(&KeyValueRecord::new("k", Some("pushed".to_string())))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.new_value.as_deref(), Some("pushed"));
        assert_eq!(engine.read("k").as_deref(), Some("pushed"));
    }

    #[tokio::test]
    async fn test_refresh_adopts_newer_value() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let engine = engine(&remote);
        engine.write("k", "old").remote.wait().await;

        remote.put_silently("k", Some("new".to_string()));

        assert!(engine.refresh("k").await);
        assert_eq!(engine.read("k").as_deref(), Some("new"));
        assert!(!engine.refresh("k").await);
    }

    #[tokio::test]
    async fn test_adopt_skipped_while_write_pending() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        remote.set_latency(Duration::from_millis(50));
        let engine = engine(&remote);

        let receipt = engine.write("k", "mine");
        let generation = engine.generation("k");
        assert!(!engine.adopt_remote(
            KeyValueRecord::new("k", Some("stale".to_string())),
            generation
        ));
        assert_eq!(engine.read("k").as_deref(), Some("mine"));

        receipt.remote.wait().await;
        assert!(engine.adopt_remote(
            KeyValueRecord::new("k", Some("newer".to_string())),
            generation
        ));
    }

    #[tokio::test]
    async fn test_adopt_refused_after_key_changed() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let engine = engine(&remote);
        assert!(engine.write("k", "first").remote.wait().await);

        let before_fetch = engine.generation("k");
        assert!(engine.write("k", "second").remote.wait().await);

        assert!(!engine.adopt_remote(
            KeyValueRecord::new("k", Some("first".to_string())),
            before_fetch
        ));
        assert_eq!(engine.read("k").as_deref(), Some("second"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_refresh_does_not_roll_back_completed_write() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let engine = engine(&remote);
        assert!(engine.write("royal-academy-pricing", "5000").remote.wait().await);

        remote.set_read_lag(Duration::from_millis(100));
        let refresher = Arc::clone(&engine);
        let refresh =
            tokio::spawn(async move { refresher.refresh("royal-academy-pricing").await });
        tokio::task::yield_now().await;

        assert!(engine.write("royal-academy-pricing", "6000").remote.wait().await);
        assert!(!refresh.await.unwrap());

        assert_eq!(engine.read("royal-academy-pricing").as_deref(), Some("6000"));
    }

    #[tokio::test]
    async fn test_identical_write_reports_pending_failure() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        remote.set_offline(true);
        let engine = engine(&remote);

        let first = engine.write("royal-academy-pricing", "1");
        let second = engine.write("royal-academy-pricing", "1");

        assert_eq!(second.local, LocalWrite::Unchanged);
        assert!(!first.remote.wait().await);
        assert!(!second.remote.wait().await);
        assert!(remote.is_empty());
    }

    #[tokio::test]
    async fn test_identical_write_while_pending_resends() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        remote.set_latency(Duration::from_millis(10));
        let engine = engine(&remote);

        let first = engine.write("k", "v");
        let second = engine.write("k", "v");

        assert!(second.remote.is_pending());
        assert!(first.remote.wait().await);
        assert!(second.remote.wait().await);
        assert_eq!(remote.call_counts().upsert, 2);

        let third = engine.write("k", "v");
        assert!(!third.remote.is_pending());
    }

    #[tokio::test]
    async fn test_remote_delete_of_unknown_key_is_emitted() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let engine = engine(&remote);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _listener = engine.listen(move |e| sink.lock().unwrap().push(e.clone()));

        assert!(engine.apply_remote(RemoteChange::delete("royal-academy-events")));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].is_removal());
        assert_eq!(seen[0].old_value, None);
        assert_eq!(seen[0].origin, ChangeOrigin::Remote);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_times_out() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        remote.seed(vec![KeyValueRecord::new("k", Some("v".to_string()))]);
        remote.set_latency(Duration::from_secs(5));
        let engine = engine(&remote);

        let outcome = engine
            .fetch_with_timeout("k", Duration::from_millis(1200))
            .await;
        assert_eq!(outcome, FetchOutcome::Failed);
    }

    #[tokio::test]
    async fn test_fetch_outcomes() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        remote.seed(vec![KeyValueRecord::new("k", Some("v".to_string()))]);
        let engine = engine(&remote);

        assert!(matches!(engine.fetch("k").await, FetchOutcome::Found(_)));
        assert_eq!(engine.fetch("missing").await, FetchOutcome::Missing);
        assert_eq!(engine.fetch("sb-token").await, FetchOutcome::Missing);
        assert_eq!(remote.call_counts().fetch_one, 2);

        remote.set_offline(true);
        assert_eq!(engine.fetch("k").await, FetchOutcome::Failed);
    }

    #[tokio::test]
    async fn test_seed_local_marks_unsynced() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let engine = engine(&remote);

        engine.seed_local("k", "default");
        assert_eq!(engine.read("k").as_deref(), Some("default"));
        tokio::task::yield_now().await;
        assert_eq!(remote.call_counts().upsert, 0);

        assert!(engine.write("k", "default").remote.wait().await);
        assert_eq!(remote.call_counts().upsert, 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_replication() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let engine = engine(&remote);
        engine.initialize().await;

        engine.shutdown();
        let receipt = engine.write("k", "v");

        assert!(!receipt.remote.wait().await);
        assert_eq!(engine.read("k").as_deref(), Some("v"));
        assert_eq!(remote.call_counts().upsert, 0);
    }

    #[tokio::test]
    async fn test_flush_waits_for_queued_writes() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        remote.set_latency(Duration::from_millis(10));
        let engine = engine(&remote);

        let _a = engine.write("a", "1");
        let _b = engine.write("b", "2");
        engine.flush().await;

        assert_eq!(remote.len(), 2);
    }

    #[tokio::test]
    async fn test_writes_replicate_in_call_order() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let engine = engine(&remote);

        let receipts: Vec<_> = (0..10).map(|i| engine.write("k", i.to_string())).collect();
        for receipt in receipts {
            assert!(receipt.remote.wait().await);
        }

        assert_eq!(remote.peek("k").unwrap().value.as_deref(), Some("9"));
    }
}

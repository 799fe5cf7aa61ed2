//! Typed accessors over the sync engine.
//!
//! Values are stored as JSON text. Reads never fail: a malformed value is
//! treated like a missing one, and every miss ends at the caller's default.
//!
//! ```ignore
//! let store = KeyValueStore::new(remote, EngineOptions::default());
//! store.initialize().await;
//!
//! let key = StoreKey::academy(catalog::PRICING);
//! let pricing: Pricing = store.get(&key, Pricing::default()).await;
//! let persisted = store.set(&key, &pricing).await;
//! ```

use std::sync::Arc;

use satchel_core::CodecError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::engine::{EngineOptions, FetchOutcome, SyncEngine};
use crate::events::Listener;
use crate::remote::RemoteStore;

/// JSON key-value store with stale-while-revalidate reads.
///
/// Cloning is cheap and shares the engine.
pub struct KeyValueStore<R: RemoteStore> {
    engine: Arc<SyncEngine<R>>,
}

impl<R: RemoteStore> Clone for KeyValueStore<R> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<R: RemoteStore> std::fmt::Debug for KeyValueStore<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyValueStore")
            .field("engine", &self.engine)
            .finish()
    }
}

impl<R: RemoteStore> KeyValueStore<R> {
    /// Build a store with a fresh engine. Must be called inside a tokio runtime.
    pub fn new(remote: impl Into<Arc<R>>, options: EngineOptions) -> Self {
        Self::from_engine(Arc::new(SyncEngine::new(remote, options)))
    }

    pub fn from_engine(engine: Arc<SyncEngine<R>>) -> Self {
        Self { engine }
    }

    /// Bootstrap the engine. Safe to call any number of times.
    pub async fn initialize(&self) {
        self.engine.initialize().await;
    }

    pub fn engine(&self) -> &Arc<SyncEngine<R>> {
        &self.engine
    }

    /// Read a value, falling back to `default`.
    ///
    /// A locally known value is returned at once and revalidated in the
    /// background. Otherwise the remote is asked, bounded by the engine's
    /// fetch timeout. When neither has a usable value, `default` is stored
    /// under `key` and returned.
    pub async fn get<T>(&self, key: impl AsRef<str>, default: T) -> T
    where
        T: Serialize + DeserializeOwned,
    {
        let key = key.as_ref();

        if let Some(raw) = self.engine.read(key) {
            match decode::<T>(key, &raw) {
                Ok(value) => {
                    self.revalidate(key);
                    return value;
                }
                Err(e) => warn!(error = %e, "Ignoring unreadable local value"),
            }
        }

        let generation = self.engine.generation(key);
        let outcome = if self.engine.is_synced(key) {
            self.engine.fetch(key).await
        } else {
            FetchOutcome::Missing
        };

        if let FetchOutcome::Found(record) = &outcome {
            if let Some(raw) = record.value.as_deref() {
                match decode::<T>(key, raw) {
                    Ok(value) => {
                        if self.engine.adopt_remote(record.clone(), generation) {
                            return value;
                        }
                        // Refused or unchanged: the cache holds the newest value.
                        return self
                            .engine
                            .read(key)
                            .and_then(|raw| decode::<T>(key, &raw).ok())
                            .unwrap_or(value);
                    }
                    Err(e) => warn!(error = %e, "Ignoring unreadable remote value"),
                }
            }
        }

        self.store_default(key, &default, &outcome);
        default
    }

    /// Store a value. Returns whether the backend accepted it.
    ///
    /// The local cache is updated before this awaits anything, so a `get`
    /// issued meanwhile already sees the new value. Device-local keys and
    /// unchanged values report `true` without a network call.
    pub async fn set<T>(&self, key: impl AsRef<str>, value: &T) -> bool
    where
        T: Serialize + ?Sized,
    {
        let key = key.as_ref();
        let raw = match encode(key, value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Refusing to store unserializable value");
                return false;
            }
        };
        self.engine.write(key, raw).remote.wait().await
    }

    /// Delete a value. Returns whether the backend accepted it.
    pub async fn delete(&self, key: impl AsRef<str>) -> bool {
        self.engine.remove(key.as_ref()).remote.wait().await
    }

    /// Call `callback` with each new value of `key` pushed from the remote.
    ///
    /// Local writes are not echoed here; their realtime echo is. Deletions
    /// and undecodable values are skipped.
    pub fn subscribe<T, F>(&self, key: impl AsRef<str>, callback: F) -> Listener
    where
        T: DeserializeOwned,
        F: Fn(T) + Send + Sync + 'static,
    {
        let key = key.as_ref().to_string();
        self.engine.listen(move |event| {
            if event.key != key || !event.is_remote() {
                return;
            }
            let Some(raw) = event.new_value.as_deref() else {
                return;
            };
            match decode::<T>(&key, raw) {
                Ok(value) => callback(value),
                Err(e) => warn!(error = %e, "Skipping undecodable change"),
            }
        })
    }

    fn revalidate(&self, key: &str) {
        if !self.engine.is_synced(key) {
            return;
        }
        let engine = Arc::clone(&self.engine);
        let key = key.to_string();
        tokio::spawn(async move {
            engine.refresh(&key).await;
        });
    }

    fn store_default<T: Serialize>(&self, key: &str, default: &T, outcome: &FetchOutcome) {
        let raw = match encode(key, default) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Default value is not serializable, not stored");
                return;
            }
        };
        match outcome {
            // Remote state unknown: the default must not replace a row the
            // fetch failed to see.
            FetchOutcome::Failed => {
                debug!(key = %key, "Caching default locally");
                self.engine.seed_local(key, raw);
            }
            FetchOutcome::Missing | FetchOutcome::Found(_) => {
                debug!(key = %key, "Storing default");
                let _receipt = self.engine.write(key, raw);
            }
        }
    }
}

fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T, CodecError> {
    serde_json::from_str(raw).map_err(|e| CodecError::Decode {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn encode<T: Serialize + ?Sized>(key: &str, value: &T) -> Result<String, CodecError> {
    serde_json::to_string(value).map_err(|e| CodecError::Encode {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryRemoteStore;
    use satchel_core::KeyValueRecord;
    use serde::Deserialize;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Pricing {
        monthly: u32,
        yearly: u32,
    }

    fn store(remote: &Arc<InMemoryRemoteStore>) -> KeyValueStore<InMemoryRemoteStore> {
        KeyValueStore::new(Arc::clone(remote), EngineOptions::default())
    }

    #[tokio::test]
    async fn test_set_then_get_returns_value() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let store = store(&remote);
        let pricing = Pricing {
            monthly: 5000,
            yearly: 50000,
        };

        assert!(store.set("royal-academy-pricing", &pricing).await);
        let read: Pricing = store
            .get(
                "royal-academy-pricing",
                Pricing {
                    monthly: 0,
                    yearly: 0,
                },
            )
            .await;

        assert_eq!(read, pricing);
    }

    #[tokio::test]
    async fn test_get_missing_stores_default() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let store = store(&remote);

        let first: Vec<String> = store.get("royal-academy-gallery", vec!["a".to_string()]).await;
        let second: Vec<String> = store.get("royal-academy-gallery", Vec::new()).await;

        assert_eq!(first, vec!["a".to_string()]);
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_get_uses_remote_on_miss() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        remote.seed(vec![KeyValueRecord::new(
            "royal-academy-events",
            Some("[1,2]".to_string()),
        )]);
        let store = store(&remote);

        let events: Vec<u32> = store.get("royal-academy-events", Vec::new()).await;

        assert_eq!(events, vec![1, 2]);
        assert_eq!(
            store.engine().read("royal-academy-events").as_deref(),
            Some("[1,2]")
        );
    }

    #[tokio::test]
    async fn test_malformed_local_value_is_a_miss() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        remote.seed(vec![KeyValueRecord::new("k", Some("42".to_string()))]);
        let store = store(&remote);
        store.engine().seed_local("k", "{not json");

        let value: u32 = store.get("k", 0).await;
        assert_eq!(value, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_remote_falls_back_to_default() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        remote.seed(vec![KeyValueRecord::new("k", Some("\"remote\"".to_string()))]);
        remote.set_latency(Duration::from_secs(10));
        let store = store(&remote);

        let value: String = store.get("k", "default".to_string()).await;

        assert_eq!(value, "default");
        // Kept local only: the remote row survives.
        assert_eq!(
            remote.peek("k").unwrap().value.as_deref(),
            Some("\"remote\"")
        );
        assert_eq!(remote.call_counts().upsert, 0);
    }

    #[tokio::test]
    async fn test_excluded_keys_never_reach_remote() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let store = store(&remote);

        assert!(store.set("royal-academy-admin-logged-in", &true).await);
        let logged_in: bool = store.get("royal-academy-admin-logged-in", false).await;
        let theme: String = store.get("royal-academy-ui-theme", "light".to_string()).await;

        assert!(logged_in);
        assert_eq!(theme, "light");
        let counts = remote.call_counts();
        assert_eq!(counts.upsert, 0);
        assert_eq!(counts.fetch_one, 0);
    }

    #[tokio::test]
    async fn test_delete_removes_remote_row() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let store = store(&remote);
        store.set("k", &1).await;

        assert!(store.delete("k").await);
        assert!(remote.peek("k").is_none());
    }

    #[tokio::test]
    async fn test_set_reports_offline_failure() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        remote.set_offline(true);
        let store = store(&remote);

        assert!(!store.set("k", &"v").await);
        let value: String = store.get("k", String::new()).await;
        assert_eq!(value, "v");
    }

    #[tokio::test]
    async fn test_subscribe_delivers_remote_values_only() {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let store = store(&remote);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _listener = store.subscribe("k", move |value: u32| sink.lock().unwrap().push(value));

        store.set("k", &1u32).await;
        store.engine().apply_remote(satchel_core::RemoteChange::upsert(
            satchel_core::ChangeKind::Update,
            "k",
            Some("2".to_string()),
        ));
        store.engine().apply_remote(satchel_core::RemoteChange::upsert(
            satchel_core::ChangeKind::Update,
            "other",
            Some("3".to_string()),
        ));
        store.engine().apply_remote(satchel_core::RemoteChange::delete("k"));

        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }
}

//! SATCHEL Test Utilities
//!
//! Shared test infrastructure for the SATCHEL workspace:
//! - Proptest generators for keys, values and records
//! - A call-recording wrapper around any remote store
//! - Fixtures for the Royal Academy content payloads
//! - Assertions and polling helpers for eventually-consistent state

pub use satchel_core::{
    catalog, ChangeEvent, ChangeKind, ChangeOrigin, ExclusionRules, KeyValueRecord, RemoteChange,
    RemoteError, StoreKey, SyncConfig,
};
pub use satchel_storage::{
    ChangeFeed, EngineOptions, InMemoryRemoteStore, KeyValueStore, LocalBackend,
    MemoryLocalBackend, RemoteStore, SyncEngine,
};

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

// ============================================================================
// RECORDING REMOTE
// ============================================================================

/// One call observed by [`RecordingRemote`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    FetchAll,
    FetchOne(String),
    Upsert { key: String, value: Option<String> },
    Delete(String),
    Subscribe,
}

impl RemoteCall {
    pub fn is_upsert(&self) -> bool {
        matches!(self, Self::Upsert { .. })
    }

    /// Key the call targeted, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::FetchOne(key) | Self::Delete(key) => Some(key),
            Self::Upsert { key, .. } => Some(key),
            Self::FetchAll | Self::Subscribe => None,
        }
    }
}

/// Remote store wrapper that records every call, in order.
#[derive(Debug)]
pub struct RecordingRemote<R> {
    inner: R,
    calls: Mutex<Vec<RemoteCall>>,
}

impl<R: RemoteStore> RecordingRemote<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Every call so far.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Calls that targeted `key`.
    pub fn calls_for(&self, key: &str) -> Vec<RemoteCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.key() == Some(key))
            .collect()
    }

    pub fn upserts(&self) -> usize {
        self.calls().iter().filter(|call| call.is_upsert()).count()
    }

    pub fn fetch_alls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| **call == RemoteCall::FetchAll)
            .count()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn record(&self, call: RemoteCall) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }
}

#[async_trait]
impl<R: RemoteStore> RemoteStore for RecordingRemote<R> {
    async fn fetch_all(&self) -> Result<Vec<KeyValueRecord>, RemoteError> {
        self.record(RemoteCall::FetchAll);
        self.inner.fetch_all().await
    }

    async fn fetch_one(&self, key: &str) -> Result<Option<KeyValueRecord>, RemoteError> {
        self.record(RemoteCall::FetchOne(key.to_string()));
        self.inner.fetch_one(key).await
    }

    async fn upsert(&self, record: &KeyValueRecord) -> Result<(), RemoteError> {
        self.record(RemoteCall::Upsert {
            key: record.key.clone(),
            value: record.value.clone(),
        });
        self.inner.upsert(record).await
    }

    async fn delete(&self, key: &str) -> Result<(), RemoteError> {
        self.record(RemoteCall::Delete(key.to_string()));
        self.inner.delete(key).await
    }

    fn subscribe_changes(&self) -> ChangeFeed {
        self.record(RemoteCall::Subscribe);
        self.inner.subscribe_changes()
    }
}

/// Engine over a recording wrapper of a shared in-memory store.
pub fn recording_engine(
    shared: &Arc<InMemoryRemoteStore>,
    options: EngineOptions,
) -> (
    Arc<SyncEngine<RecordingRemote<Arc<InMemoryRemoteStore>>>>,
    Arc<RecordingRemote<Arc<InMemoryRemoteStore>>>,
) {
    let remote = Arc::new(RecordingRemote::new(Arc::clone(shared)));
    let engine = Arc::new(SyncEngine::new(Arc::clone(&remote), options));
    (engine, remote)
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for SATCHEL data.

    use super::*;
    use proptest::prelude::*;

    /// A key name that no default exclusion pattern matches.
    pub fn arb_synced_name() -> impl Strategy<Value = String> {
        "[a-z]{2,10}(-[a-z0-9]{1,8}){0,2}".prop_filter("excluded by default rules", |name| {
            let key = StoreKey::academy(name.clone());
            ExclusionRules::default().is_synced(key.as_str())
        })
    }

    /// A namespaced key that takes part in synchronization.
    pub fn arb_synced_key() -> impl Strategy<Value = StoreKey> {
        arb_synced_name().prop_map(StoreKey::academy)
    }

    /// A key that the default rules keep on the device.
    pub fn arb_excluded_key() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-z0-9-]{1,12}".prop_map(|s| format!("sb-{}", s)),
            "[a-z]{1,8}".prop_map(|s| format!("royal-academy-ui-{}", s)),
            "[a-z]{1,8}".prop_map(|s| format!("{}-session", s)),
            "[a-z]{1,8}".prop_map(|s| format!("{}-auth-token", s)),
            "[a-z]{0,8}".prop_map(|s| format!("{}theme", s)),
            prop_oneof![Just("admin"), Just("teacher"), Just("student")]
                .prop_map(|role| format!("royal-academy-{}-logged-in", role)),
        ]
    }

    /// A JSON value as stored text.
    pub fn arb_json_text() -> impl Strategy<Value = String> {
        let leaf = prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
            "[ -~]{0,16}".prop_map(serde_json::Value::from),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..4).prop_map(serde_json::Value::Array),
                proptest::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|map| serde_json::Value::Object(map.into_iter().collect())),
            ]
        })
        .prop_map(|value| value.to_string())
    }

    /// A record for a synced key.
    pub fn arb_record() -> impl Strategy<Value = KeyValueRecord> {
        (arb_synced_key(), proptest::option::of(arb_json_text()))
            .prop_map(|(key, value)| KeyValueRecord::new(key.as_str(), value))
    }

    /// A realtime change for a synced key.
    pub fn arb_remote_change() -> impl Strategy<Value = RemoteChange> {
        prop_oneof![
            (arb_synced_key(), arb_json_text())
                .prop_map(|(key, value)| RemoteChange::upsert(ChangeKind::Insert, key, Some(value))),
            (arb_synced_key(), arb_json_text())
                .prop_map(|(key, value)| RemoteChange::upsert(ChangeKind::Update, key, Some(value))),
            arb_synced_key().prop_map(RemoteChange::delete),
        ]
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built payloads for common scenarios.

    use super::*;
    use serde::{Deserialize, Serialize};

    /// Tuition pricing as stored under the academy [`catalog::PRICING`] key.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Pricing {
        pub monthly: u32,
        pub yearly: u32,
    }

    impl Pricing {
        pub fn new(monthly: u32, yearly: u32) -> Self {
            Self { monthly, yearly }
        }

        pub fn zero() -> Self {
            Self::new(0, 0)
        }
    }

    /// One admission application.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Admission {
        pub id: u32,
        pub student_name: String,
        pub grade: String,
        pub status: String,
    }

    pub fn admissions() -> Vec<Admission> {
        vec![
            Admission {
                id: 1,
                student_name: "Amara Okafor".to_string(),
                grade: "Grade 4".to_string(),
                status: "pending".to_string(),
            },
            Admission {
                id: 2,
                student_name: "Lucas Meyer".to_string(),
                grade: "Grade 7".to_string(),
                status: "approved".to_string(),
            },
        ]
    }

    /// Remote rows as they look after the site has been used for a while,
    /// including rows that must never reach a cache.
    pub fn academy_rows() -> Vec<KeyValueRecord> {
        vec![
            json_record(academy(catalog::PRICING), &Pricing::new(5000, 50000)),
            json_record(academy(catalog::ADMISSIONS), &admissions()),
            json_record(academy(catalog::NOTIFICATIONS), &Vec::<String>::new()),
            KeyValueRecord::new(academy(catalog::SITE_CONTENT), None),
            json_record("royal-academy-ui-theme", &"dark"),
            json_record("sb-access-token", &"leaked"),
        ]
    }

    /// Rendered academy key for a catalog name.
    pub fn academy(name: &str) -> String {
        StoreKey::academy(name).into()
    }

    /// Record whose value is `value` as JSON.
    pub fn json_record<T: Serialize + ?Sized>(key: impl AsRef<str>, value: &T) -> KeyValueRecord {
        let text = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
        KeyValueRecord::new(key.as_ref(), Some(text))
    }

    /// Config pointing at a local test backend with realtime disabled.
    pub fn test_config() -> SyncConfig {
        SyncConfig::from_toml(
            r#"
            [backend]
            url = "http://127.0.0.1:54321"
            api_key = "test-anon-key"

            [realtime]
            enabled = false
            "#,
        )
        .unwrap_or_else(|e| panic!("test config must parse: {}", e))
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for eventually-consistent state.

    use std::future::Future;
    use std::time::Duration;

    /// Default wait for realtime round-trips in tests.
    pub const CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(2);

    /// Poll `condition` until it holds or `timeout` elapses.
    pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Poll an async check until it returns `expected`.
    pub async fn eventually_eq<T, F, Fut>(timeout: Duration, expected: &T, mut check: F) -> bool
    where
        T: PartialEq,
        F: FnMut() -> Fut,
        Fut: Future<Output = T>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if check().await == *expected {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Assert that `condition` becomes true within [`CONVERGENCE_TIMEOUT`].
    #[track_caller]
    pub fn assert_converged(converged: bool, what: &str) {
        assert!(converged, "Did not converge within {:?}: {}", CONVERGENCE_TIMEOUT, what);
    }
}

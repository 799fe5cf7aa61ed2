//! SATCHEL Core - data model for the synchronized key-value layer
//!
//! Types shared by every part of the sync layer:
//! - [`KeyValueRecord`]: one row of the remote table
//! - [`StoreKey`]: namespace-qualified key
//! - [`ExclusionRules`]: keys that never leave the device
//! - [`ChangeEvent`] / [`RemoteChange`]: change notifications
//! - [`SyncConfig`]: TOML configuration
//! - error taxonomy ([`SatchelError`] and friends)

pub mod change;
pub mod config;
pub mod error;
pub mod exclusion;
pub mod key;
pub mod record;

pub use change::{ChangeEvent, ChangeKind, ChangeOrigin, RemoteChange};
pub use config::{
    BackendConfig, RealtimeConfig, ReconnectConfig, SyncConfig, CONFIG_ENV,
    DEFAULT_FETCH_TIMEOUT_MS,
};
pub use error::{CodecError, ConfigError, RemoteError, SatchelError, SatchelResult};
pub use exclusion::{ExclusionRules, DEFAULT_EXCLUSIONS};
pub use key::{catalog, StoreKey, DEFAULT_NAMESPACE};
pub use record::KeyValueRecord;

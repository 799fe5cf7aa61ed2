//! Change notifications.
//!
//! [`RemoteChange`] is what the realtime feed delivers; [`ChangeEvent`] is
//! what listeners receive after the local cache has been mutated. The event
//! mirrors the shape of a browser `storage` event (key, old value, new value)
//! so consumers do not care where a change came from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Row operation reported by the backend's change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    /// Parse the backend's event type name (`INSERT`, `UPDATE`, `DELETE`).
    pub fn from_wire(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "INSERT" => Some(Self::Insert),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

/// A row change pushed by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub kind: ChangeKind,
    pub key: String,
    /// New JSON text; `None` for deletions and null rows.
    pub new_value: Option<String>,
}

impl RemoteChange {
    pub fn upsert(kind: ChangeKind, key: impl Into<String>, new_value: Option<String>) -> Self {
        Self {
            kind,
            key: key.into(),
            new_value,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            kind: ChangeKind::Delete,
            key: key.into(),
            new_value: None,
        }
    }
}

/// Where a cache mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOrigin {
    /// A write made through this process.
    Local,
    /// A realtime push or a revalidation fetch.
    Remote,
}

/// Notification dispatched to listeners after a cache mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub origin: ChangeOrigin,
    pub occurred_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(
        key: impl Into<String>,
        old_value: Option<String>,
        new_value: Option<String>,
        origin: ChangeOrigin,
    ) -> Self {
        Self {
            key: key.into(),
            old_value,
            new_value,
            origin,
            occurred_at: Utc::now(),
        }
    }

    /// True when the key was removed.
    pub fn is_removal(&self) -> bool {
        self.new_value.is_none()
    }

    pub fn is_remote(&self) -> bool {
        self.origin == ChangeOrigin::Remote
    }
}

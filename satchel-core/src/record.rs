//! Rows of the remote key-value table.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row of the remote store: a key, its JSON text and the write time.
///
/// Field names match the backend columns (`key`, `value`, `updated_at`) so
/// the record serializes straight into REST payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValueRecord {
    pub key: String,
    /// JSON text. Nullable in the backend schema.
    pub value: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl KeyValueRecord {
    /// Build a record stamped with the current time.
    pub fn new(key: impl Into<String>, value: Option<String>) -> Self {
        Self {
            key: key.into(),
            value,
            updated_at: Utc::now(),
        }
    }

    /// Build a record with an explicit timestamp.
    pub fn with_timestamp(
        key: impl Into<String>,
        value: Option<String>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            updated_at,
        }
    }
}

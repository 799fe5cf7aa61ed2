//! Structured keys for the shared key-value table.
//!
//! The remote table has a single flat key space. Every application writes
//! `"{namespace}-{name}"` strings into it; `StoreKey` makes the namespace an
//! explicit part of the value instead of a string-prefix convention. Raw
//! strings are still accepted by every storage API through `AsRef<str>`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Namespace used by the Royal Academy site.
pub const DEFAULT_NAMESPACE: &str = "royal-academy";

/// Well-known entry names under [`DEFAULT_NAMESPACE`].
pub mod catalog {
    pub const ADMISSIONS: &str = "admissions";
    pub const TEACHERS: &str = "teachers";
    pub const NOTIFICATIONS: &str = "notifications";
    pub const TIMETABLES: &str = "timetables";
    pub const PRICING: &str = "pricing";
    pub const GALLERY: &str = "gallery";
    pub const EVENTS: &str = "events";
    pub const SITE_CONTENT: &str = "site-content";
}

/// A namespace-qualified key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct StoreKey {
    namespace: String,
    name: String,
    rendered: String,
}

impl StoreKey {
    /// Create a key in the given namespace.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = namespace.into();
        let name = name.into();
        let rendered = format!("{}-{}", namespace, name);
        Self {
            namespace,
            name,
            rendered,
        }
    }

    /// Create a key in the Royal Academy namespace.
    pub fn academy(name: impl Into<String>) -> Self {
        Self::new(DEFAULT_NAMESPACE, name)
    }

    /// Split a raw key that belongs to `namespace`.
    ///
    /// Returns `None` when the key carries another prefix or has an empty name.
    pub fn parse_in(raw: &str, namespace: &str) -> Option<Self> {
        let name = raw.strip_prefix(namespace)?.strip_prefix('-')?;
        if name.is_empty() {
            return None;
        }
        Some(Self::new(namespace, name))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The flat string stored in the remote table.
    pub fn as_str(&self) -> &str {
        &self.rendered
    }
}

impl AsRef<str> for StoreKey {
    fn as_ref(&self) -> &str {
        &self.rendered
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rendered)
    }
}

impl From<StoreKey> for String {
    fn from(key: StoreKey) -> Self {
        key.rendered
    }
}

impl TryFrom<String> for StoreKey {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        StoreKey::parse_in(&raw, DEFAULT_NAMESPACE)
            .ok_or_else(|| format!("key {:?} is not in the {} namespace", raw, DEFAULT_NAMESPACE))
    }
}

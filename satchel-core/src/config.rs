//! Configuration loading for the sync layer.
//!
//! Configuration is a TOML file. Only `backend.url` and `backend.api_key`
//! are required; everything else has a default matching the Royal Academy
//! deployment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;
use crate::exclusion::{ExclusionRules, DEFAULT_EXCLUSIONS};
use crate::key::DEFAULT_NAMESPACE;

/// Environment variable consulted when no `--config` argument is given.
pub const CONFIG_ENV: &str = "SATCHEL_CONFIG";

/// Timeout for the first remote read of a key with no local value.
pub const DEFAULT_FETCH_TIMEOUT_MS: u64 = 1200;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    #[serde(default = "default_change_feed_capacity")]
    pub change_feed_capacity: usize,
    #[serde(default = "default_exclusions")]
    pub exclusions: Vec<String>,
    pub backend: BackendConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    /// JSON file backing device-local keys. In-memory when absent.
    #[serde(default)]
    pub local_store_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    pub url: String,
    pub api_key: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RealtimeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// WebSocket endpoint. Derived from `backend.url` when absent.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReconnectConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: None,
            heartbeat_ms: default_heartbeat_ms(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 30_000,
            multiplier: 2.0,
            jitter_ms: 250,
        }
    }
}

fn default_table() -> String {
    "kv_store".to_string()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_fetch_timeout_ms() -> u64 {
    DEFAULT_FETCH_TIMEOUT_MS
}

fn default_change_feed_capacity() -> usize {
    1024
}

fn default_exclusions() -> Vec<String> {
    DEFAULT_EXCLUSIONS.iter().map(|p| p.to_string()).collect()
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

impl SyncConfig {
    /// Load from an explicit path, falling back to `SATCHEL_CONFIG`.
    pub fn load(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = path
            .or_else(config_path_from_env)
            .ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.table.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "table",
                reason: "must not be empty".to_string(),
            });
        }
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "namespace",
                reason: "must not be empty".to_string(),
            });
        }
        if self.fetch_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "fetch_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.change_feed_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "change_feed_capacity",
                reason: "must be > 0".to_string(),
            });
        }
        if self.backend.url.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "backend.url",
                reason: "must not be empty".to_string(),
            });
        }
        if !self.backend.url.starts_with("http://") && !self.backend.url.starts_with("https://") {
            return Err(ConfigError::InvalidValue {
                field: "backend.url",
                reason: "must be an http(s) URL".to_string(),
            });
        }
        if self.backend.api_key.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "backend.api_key",
                reason: "must not be empty".to_string(),
            });
        }
        if self.backend.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "backend.request_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.realtime.heartbeat_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "realtime.heartbeat_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.realtime.reconnect.initial_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "realtime.reconnect.initial_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.realtime.reconnect.max_ms < self.realtime.reconnect.initial_ms {
            return Err(ConfigError::InvalidValue {
                field: "realtime.reconnect.max_ms",
                reason: "must be >= initial_ms".to_string(),
            });
        }
        if self.realtime.reconnect.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "realtime.reconnect.multiplier",
                reason: "must be >= 1.0".to_string(),
            });
        }
        self.exclusion_rules()?;
        Ok(())
    }

    /// Compile the configured exclusion patterns.
    pub fn exclusion_rules(&self) -> Result<ExclusionRules, ConfigError> {
        ExclusionRules::new(&self.exclusions)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.backend.request_timeout_ms)
    }

    /// Realtime WebSocket endpoint, explicit or derived from the REST URL.
    pub fn realtime_url(&self) -> String {
        if let Some(url) = &self.realtime.url {
            return url.clone();
        }
        let base = self.backend.url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!(
            "{}/realtime/v1/websocket?apikey={}&vsn=1.0.0",
            ws_base, self.backend.api_key
        )
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV).ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
[backend]
url = "https://academy.example.co"
api_key = "anon-key"
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = SyncConfig::from_toml(MINIMAL).unwrap();
        config.validate().unwrap();

        assert_eq!(config.table, "kv_store");
        assert_eq!(config.namespace, "royal-academy");
        assert_eq!(config.fetch_timeout(), Duration::from_millis(1200));
        assert!(config.realtime.enabled);
        assert_eq!(config.realtime.reconnect, ReconnectConfig::default());
        assert_eq!(config.exclusions.len(), DEFAULT_EXCLUSIONS.len());
        assert!(config.local_store_path.is_none());
    }

    #[test]
    fn test_realtime_url_is_derived() {
        let config = SyncConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(
            config.realtime_url(),
            "wss://academy.example.co/realtime/v1/websocket?apikey=anon-key&vsn=1.0.0"
        );
    }

    #[test]
    fn test_explicit_realtime_url_wins() {
        let toml = format!("{}\n[realtime]\nurl = \"ws://localhost:4000/socket\"\n", MINIMAL);
        let config = SyncConfig::from_toml(&toml).unwrap();
        assert_eq!(config.realtime_url(), "ws://localhost:4000/socket");
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let toml = format!("{}\nsurprise = 1\n", MINIMAL);
        assert!(matches!(
            SyncConfig::from_toml(&toml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = SyncConfig::from_toml(MINIMAL).unwrap();
        config.fetch_timeout_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "fetch_timeout_ms", .. })
        ));

        let mut config = SyncConfig::from_toml(MINIMAL).unwrap();
        config.backend.url = "academy.example.co".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "backend.url", .. })
        ));

        let mut config = SyncConfig::from_toml(MINIMAL).unwrap();
        config.realtime.reconnect.max_ms = 10;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "realtime.reconnect.max_ms", .. })
        ));

        let mut config = SyncConfig::from_toml(MINIMAL).unwrap();
        config.exclusions.push("[".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_load_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = SyncConfig::load(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.backend.api_key, "anon-key");
    }
}

//! Error types for the CLI.

use satchel_core::{ConfigError, SatchelError};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Sync(#[from] SatchelError),
    #[error("Value for {key} is not valid JSON: {source}")]
    InvalidJson {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Backend did not accept the {operation} of {key}")]
    NotPersisted { operation: &'static str, key: String },
    #[error("Failed to install log subscriber: {0}")]
    Telemetry(String),
}

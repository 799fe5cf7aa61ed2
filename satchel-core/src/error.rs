//! Error types for SATCHEL operations

use std::time::Duration;
use thiserror::Error;

/// Failures talking to the remote backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Remote store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Request {operation} failed: {reason}")]
    Request { operation: String, reason: String },

    #[error("Request {operation} returned status {status}: {message}")]
    Status {
        operation: String,
        status: u16,
        message: String,
    },

    #[error("Request {operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Invalid response for {operation}: {reason}")]
    Decode { operation: String, reason: String },

    #[error("Realtime channel error: {reason}")]
    Realtime { reason: String },
}

impl RemoteError {
    /// Shorthand for a transport-level request failure.
    pub fn request(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Request {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for a response that could not be decoded.
    pub fn decode(operation: impl Into<String>, reason: impl ToString) -> Self {
        Self::Decode {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }
}

/// JSON encoding failures for stored values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Malformed JSON under key {key}: {reason}")]
    Decode { key: String, reason: String },

    #[error("Could not serialize value for key {key}: {reason}")]
    Encode { key: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing configuration file path (use --config or SATCHEL_CONFIG)")]
    MissingConfigPath,

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Invalid exclusion pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// Master error type for all SATCHEL errors.
#[derive(Debug, Error)]
pub enum SatchelError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Local storage error: {reason}")]
    Local { reason: String },
}

/// Result type alias for SATCHEL operations.
pub type SatchelResult<T> = Result<T, SatchelError>;

// =============================================================================
// TESTS
// =============================================================================

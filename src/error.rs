//! Error types for the write-back store
//!
//! Provides structured error types for the cache adapters, the persistent
//! storage adapters and the write-back engine itself.

use thiserror::Error;

/// Unified error type for the write-back store
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // =========================================================================
    // Key Errors
    // =========================================================================
    #[error("Not a reminder key: {key}")]
    InvalidKey { key: String },

    #[error("Atomic write rejected: {keys} keys but {values} values")]
    KeyValueMismatch { keys: usize, values: usize },

    #[error("Reminder counter for {key} is not a number: {value:?}")]
    CorruptReminder { key: String, value: String },

    // =========================================================================
    // Consistency Errors
    // =========================================================================
    /// A reminder expired but the state it guards is gone from the cache.
    #[error("Consistency violation: {missing} for {key} is missing from the cache")]
    ConsistencyViolation { key: String, missing: String },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Backend unavailable: {backend}")]
    BackendUnavailable { backend: String },

    #[error("Storage operation failed: {backend} - {operation}: {reason}")]
    StorageOperationFailed {
        backend: String,
        operation: String,
        reason: String,
    },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is transient (the backend may recover on its own)
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            Error::BackendUnavailable { .. } | Error::Io(_) => true,
            _ => false,
        }
    }

    /// Check if this error means cached state was lost before being persisted
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ConsistencyViolation { .. })
    }

    pub(crate) fn missing(key: impl Into<String>, missing: impl Into<String>) -> Self {
        Error::ConsistencyViolation {
            key: key.into(),
            missing: missing.into(),
        }
    }
}

/// Result type alias for the write-back store
pub type Result<T> = std::result::Result<T, Error>;

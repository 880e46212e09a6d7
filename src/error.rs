//! Error types for the chat relay
//!
//! This module defines all error types used throughout the relay,
//! using `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for relay operations
///
/// Covers request validation, calls to the generation backend, execution
/// tracking, persistence, and the ambient configuration/IO failures.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The incoming chat request is malformed or fails sanitization
    #[error("Validation error: {0}")]
    Validation(String),

    /// The generation backend did not answer within the configured timeout
    #[error("Generation backend timed out after {seconds}s")]
    Timeout {
        /// The timeout that elapsed, in seconds
        seconds: u64,
    },

    /// The generation backend answered with a non-success status
    #[error("Upstream error (HTTP {status}): {body}")]
    Upstream {
        /// HTTP status returned by the backend
        status: u16,
        /// Raw response body, surfaced verbatim
        body: String,
    },

    /// A requested chat or message does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The upstream stream could not be decoded
    #[error("Stream decode error: {0}")]
    Decode(String),

    /// Execution status polling failed
    #[error("Tracking error: {0}")]
    Tracking(String),

    /// Persistence store errors
    ///
    /// `status` carries an HTTP-equivalent classification when the failure is
    /// structural (400 validation, 401/403 auth, 404 not found). Those are
    /// never retried.
    #[error("Persistence error: {message}")]
    Persistence {
        /// HTTP-equivalent status for structural failures
        status: Option<u16>,
        /// Human readable description
        message: String,
    },

    /// Storage setup errors (opening the database, creating directories)
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RelayError {
    /// Build a transient persistence error that is eligible for retry
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            status: None,
            message: message.into(),
        }
    }

    /// Build a persistence error with an HTTP-equivalent status
    pub fn persistence_status(status: u16, message: impl Into<String>) -> Self {
        Self::Persistence {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Whether retrying the failed operation could succeed
    ///
    /// 4xx-class failures (validation, auth, not found) and request timeouts
    /// are final. Everything else is treated as transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Config(_) | Self::Timeout { .. } | Self::NotFound(_) => {
                false
            }
            Self::Persistence {
                status: Some(status),
                ..
            } => !(400..500).contains(status),
            Self::Upstream { status, .. } => !(400..500).contains(status),
            _ => true,
        }
    }

    /// HTTP status code used when the error is reported to a client
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::Timeout { .. } => 408,
            Self::NotFound(_) => 404,
            Self::Upstream { status, .. } => *status,
            Self::Persistence {
                status: Some(status),
                ..
            } => *status,
            Self::Decode(_) | Self::Http(_) => 502,
            _ => 500,
        }
    }

    /// Short machine readable kind, used in JSON error bodies and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Validation(_) => "validation",
            Self::Timeout { .. } => "timeout",
            Self::Upstream { .. } => "upstream",
            Self::NotFound(_) => "not_found",
            Self::Decode(_) => "decode",
            Self::Tracking(_) => "tracking",
            Self::Persistence { .. } => "persistence",
            Self::Storage(_) => "storage",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
            Self::Yaml(_) => "yaml",
            Self::Http(_) => "http",
        }
    }
}

/// Result type alias for relay operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation. Typed
/// failures are recovered with `downcast_ref::<RelayError>()`.
pub type Result<T> = anyhow::Result<T>;

/// Classify an arbitrary error for retry purposes
///
/// Errors that are not a [`RelayError`] are assumed transient.
pub fn is_retryable(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<RelayError>()
        .map(RelayError::is_retryable)
        .unwrap_or(true)
}

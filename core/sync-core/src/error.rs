//! Error types for tasksync-core operations.
//!
//! Transient connection failures are not errors here: they are surfaced as
//! [`ConnectionEvent::ConnectError`](crate::connection::ConnectionEvent) and
//! retried by the connection manager. Only caller mistakes and I/O problems
//! come back as `SyncError`.

use std::path::PathBuf;
use tasksync_protocol::ErrorInfo;

/// All errors that can occur in tasksync-core operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ─────────────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid endpoint {endpoint}: {details}")]
    InvalidEndpoint { endpoint: String, details: String },

    #[error("Invalid handshake: {0}")]
    InvalidHandshake(ErrorInfo),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not connected")]
    NotConnected,

    // ─────────────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Protocol error: {0}")]
    Protocol(ErrorInfo),

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parsing error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Convenience type alias for Results using SyncError.
pub type Result<T> = std::result::Result<T, SyncError>;

impl From<ErrorInfo> for SyncError {
    fn from(info: ErrorInfo) -> Self {
        SyncError::Protocol(info)
    }
}

/// A failure raised by an event handler.
///
/// Reported and swallowed at the dispatch boundary; it never reaches the
/// connection manager.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("payload rejected: {0}")]
    Payload(ErrorInfo),

    #[error("{0}")]
    Failed(String),
}

impl From<ErrorInfo> for HandlerError {
    fn from(info: ErrorInfo) -> Self {
        HandlerError::Payload(info)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        HandlerError::Failed(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        HandlerError::Failed(message.to_string())
    }
}

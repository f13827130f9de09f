//! Error types for pipehub
//!
//! Provides a unified error type for all hub operations.

use thiserror::Error;

/// Result type alias for hub operations
pub type Result<T> = std::result::Result<T, HubError>;

/// Main error type for hub operations
#[derive(Debug, Error)]
pub enum HubError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Metadata store error
    #[error("database error: {0}")]
    Database(String),

    /// Blob bucket error
    #[error("bucket error: {0}")]
    Bucket(String),

    /// Durable transaction queue error
    #[error("transaction queue error: {0}")]
    Queue(String),

    /// Wire protocol error (bad frame, bad body, sentinel collision)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Request named a method the hub does not know
    #[error("unknown method: {0}")]
    UnknownMethod(String),

    /// Not found error
    #[error("not found: {0}")]
    NotFound(String),

    /// A client request exhausted its retry attempts
    #[error("request to {addr} timed out after {attempts} attempts")]
    Timeout { addr: String, attempts: u32 },

    /// IO error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// SQL error
    #[error("SQL error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl From<String> for HubError {
    fn from(msg: String) -> Self {
        Self::Other(msg)
    }
}

impl From<&str> for HubError {
    fn from(msg: &str) -> Self {
        Self::Other(msg.to_string())
    }
}

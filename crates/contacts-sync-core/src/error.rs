//! Error types shared by the collaborator seams (stores and gateways)

use thiserror::Error;

/// Result type alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for gateway operations
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Errors raised by durable storage (credentials, sync links, cursors)
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row violates a model invariant
    #[error("Corrupt stored row: {0}")]
    Corrupt(String),

    /// The blocking storage task could not run to completion
    #[error("Storage task failed: {0}")]
    Task(String),
}

/// Errors raised by the remote contacts API and the local registry API
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid gateway configuration: {0}")]
    InvalidConfiguration(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: {0}")]
    Api(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    /// The incremental-changes cursor is expired or otherwise invalid
    #[error("Sync cursor was rejected by the remote side")]
    CursorRejected,

    #[error("Refusing to write a record with no populated fields")]
    EmptyPayload,

    #[error("Invalid response payload: {0}")]
    InvalidPayload(String),
}

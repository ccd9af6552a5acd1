//! Sync error types.

use thiserror::Error;

/// Errors from the durable queue store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Failed to create database directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sync item not found: {0}")]
    NotFound(String),

    #[error("Sync item already exists: {0}")]
    Duplicate(String),

    #[error("Corrupt sync item {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Errors from a single remote call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("HTTP {status}: {reason}")]
    Status { status: u16, reason: String },

    /// The server holds a different version of the record.
    #[error("Conflict on {url}")]
    Conflict {
        url: String,
        server: Option<serde_json::Value>,
    },
}

/// Errors surfaced by the sync engine.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid backup: {0}")]
    InvalidBackup(String),
}

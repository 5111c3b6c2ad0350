//! Error taxonomy for the client data layer.
//!
//! One variant per kind in the failure-semantics table: init-time failures
//! that activate emergency mode, per-call failures that are surfaced to the
//! caller without tearing anything down, and sync/migration failures that
//! are reported through progress events rather than unwinding.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("durable storage is not available on this host")]
    StorageUnavailable,

    #[error("insufficient storage quota: {free_fraction:.2} free, need at least 0.10")]
    InsufficientStorage { free_fraction: f64 },

    #[error("migration failed: {0}")]
    MigrationFailed(String),

    #[error("query failed: {0}")]
    QueryError(#[from] rusqlite::Error),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("batch {batch_id} timed out waiting for a response")]
    BatchTimeout { batch_id: u64 },

    #[error("unresolved conflict on {table}/{row_id}")]
    Conflict { table: String, row_id: String },

    #[error("retry budget exhausted for change {change_id}")]
    RetryExhausted { change_id: i64 },

    #[error("storage quota critical: {percent:.2}")]
    QuotaCritical { percent: f64 },

    #[error("migration validation failed: {0}")]
    MigrationValidationError(String),

    #[error("host denied storage permission")]
    PermissionDenied,

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store is not ready: {0}")]
    NotReady(String),

    #[error("internal error: {0}")]
    Internal(String),
}

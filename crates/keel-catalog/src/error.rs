//! Error types for catalog operations.
//!
//! Structural catalog errors (store open failures, schema conflicts) are fatal
//! to the specific operation and propagate to the caller. Per-record indexing
//! errors are never surfaced here; the background indexer logs and skips them
//! because indexing is idempotent and the record is retried by whichever path
//! next touches it.

use keel_commons::{AttributeName, DatabaseName, TableName};
use keel_store::StoreError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for catalog operations.
pub type Result<T> = std::result::Result<T, CatalogError>;

/// Errors surfaced by the catalog engine.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// A configured storage path is not a valid store. Fatal for that path
    /// only; discovery logs and skips it, direct callers receive it.
    #[error("failed to open store at {path}: {source}")]
    StoreOpen {
        path: PathBuf,
        #[source]
        source: StoreError,
    },

    /// A requested attribute's flags conflict with a persisted definition
    /// under exclusive-ownership rules.
    #[error("schema conflict on {database}.{table}.{attribute}: {reason}")]
    SchemaConflict {
        database: DatabaseName,
        table: TableName,
        attribute: AttributeName,
        reason: String,
    },

    /// The named table is not present in the registry.
    #[error("table not found: {database}.{table}")]
    TableNotFound {
        database: DatabaseName,
        table: TableName,
    },

    /// A persisted catalog entry failed to decode.
    #[error("corrupt catalog entry under {key:?}: {reason}")]
    CorruptEntry { key: String, reason: String },

    /// No storage root is configured; a new store cannot be placed.
    #[error("no storage root configured")]
    NoStorageRoot,

    /// A background task failed to run to completion.
    #[error("background task failed: {0}")]
    Task(String),

    /// A record value could not be encoded or decoded.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Passthrough for driver errors without extra context.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CatalogError {
    /// Wraps a driver error with the path being opened.
    pub fn store_open(path: impl Into<PathBuf>, source: StoreError) -> Self {
        Self::StoreOpen {
            path: path.into(),
            source,
        }
    }
}

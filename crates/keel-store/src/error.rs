//! Error types for store driver operations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by a store driver implementation.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The path is not a valid store file. Fatal for that path only.
    #[error("failed to open store at {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    /// A named sub-store does not exist in this root store.
    #[error("sub-store not found: {0}")]
    SubStoreNotFound(String),

    /// The root store was closed; in-flight operations on stale handles land
    /// here after a reload evicted the store.
    #[error("store at {0} is closed")]
    Closed(PathBuf),

    /// A stored value does not carry a valid version header.
    #[error("corrupt record in sub-store {sub_store}: {reason}")]
    Corrupt { sub_store: String, reason: String },

    /// Generic I/O error from the underlying engine.
    #[error("storage I/O error: {0}")]
    Io(String),
}

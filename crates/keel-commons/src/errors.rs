//! Shared error types for KeelDB.
//!
//! This module provides the small set of error variants that are useful across
//! crates without pulling in heavier error tooling; the domain crates define
//! their own `thiserror` enums and convert from these where needed.

use std::fmt;

/// Result alias over [`CommonError`].
pub type Result<T> = std::result::Result<T, CommonError>;

/// Common error type for KeelDB shared utilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommonError {
    /// Invalid input provided to a function (bad name, malformed key, ...)
    InvalidInput(String),

    /// Resource not found (database, table, attribute, ...)
    NotFound(String),

    /// Internal error (unexpected state)
    Internal(String),
}

impl CommonError {
    /// Creates an InvalidInput error with a message.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Creates a NotFound error with a message.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Creates an Internal error with a message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl fmt::Display for CommonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommonError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            CommonError::NotFound(msg) => write!(f, "Not found: {}", msg),
            CommonError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for CommonError {}

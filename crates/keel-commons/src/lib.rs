//! # keel-commons
//!
//! Shared types, constants, and utilities for KeelDB.
//!
//! This crate provides the foundational types used across the KeelDB crates
//! (keel-store, keel-catalog). It carries only the serialization stack so that
//! the persisted catalog models live in exactly one place.
//!
//! ## Type-Safe Wrappers
//!
//! - `DatabaseName` / `TableName`: case-insensitive logical names
//! - `AttributeName`: case-preserving attribute identifier
//! - `TableId`: integer table id, monotonic per root store
//! - `WorkerId`: opaque identity of a process/worker claiming background work
//!
//! ## Catalog Models
//!
//! The `catalog` module is the single source of truth for the persisted catalog
//! entry shape (`CatalogEntry`), the in-memory attribute definition (`Attribute`),
//! and the index build progress state (`IndexBuildState`, `IndexingLease`).
//! Do not duplicate these models elsewhere; always import from
//! `keel_commons::catalog`.
//!
//! ## Example Usage
//!
//! ```rust
//! use keel_commons::{DatabaseName, TableName, AttributeName};
//!
//! let db = DatabaseName::new("Sales");
//! let table = TableName::new("orders");
//! let attr = AttributeName::new("customerId");
//!
//! assert_eq!(db.as_str(), "sales");
//! assert_eq!(attr.as_str(), "customerId");
//! ```

pub mod catalog;
pub mod catalog_key;
pub mod config;
pub mod errors;
pub mod ids;
pub mod names;
pub mod time;

// Re-export commonly used types at crate root
pub use catalog::{Attribute, AuditRecord, CatalogEntry, IndexBuildState, IndexingLease};
pub use config::CatalogConfig;
pub use errors::{CommonError, Result};
pub use ids::{TableId, WorkerId};
pub use names::{AttributeName, DatabaseName, TableName};
pub use time::now_ms;

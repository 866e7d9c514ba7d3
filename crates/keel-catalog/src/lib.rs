//! # keel-catalog
//!
//! Table catalog and online-indexing engine for KeelDB.
//!
//! The engine manages table metadata and secondary indexes inside shared
//! storage: tables are described by per-attribute catalog entries persisted in
//! each root store's catalog sub-store, discovered by scanning configured
//! storage roots, and held in a process-wide registry of `Arc<Table>` objects.
//! `ensure_table` reconciles a caller's declarative table spec against the
//! persisted catalog; newly requested indexes are built online by a resumable
//! background indexer that coexists with live writers.
//!
//! ## Architecture
//!
//! - `lifecycle` — root store handles cached by path, mark/sweep close on reload
//! - `discovery` — storage-root scanning and registry (re)construction
//! - `registry` / `table` — the in-memory database → table → attribute mapping
//! - `ensure` — declarative schema reconciliation (`ensure_table`)
//! - `indexer` — checkpointed, lease-guarded background index builds
//! - `write` — the indexed record write path and index lookups
//! - `transaction` / `audit` — atomic catalog edits and the audit trail
//! - `signal` — schema-change notifications to sibling processes
//!
//! ## Multi-process model
//!
//! Several engine instances may share the same storage roots. Coordination is
//! storage-level: per-record version tags guard every conditional write, index
//! builds are claimed through expiring leases with fencing tokens, and peers
//! learn of changes through the [`SchemaSignal`] seam plus explicit reloads.

mod audit;
mod catalog;
mod discovery;
mod ensure;
mod indexer;
mod layout;
mod lifecycle;
mod registry;
mod signal;
mod table;
mod transaction;
mod write;

mod error;

pub use catalog::Catalog;
pub use ensure::{AttributeSpec, TableSpec};
pub use error::{CatalogError, Result};
pub use layout::{AUDIT_SUB_STORE, CATALOG_SUB_STORE};
pub use lifecycle::StoreLifecycleManager;
pub use registry::{TableListener, TableRegistry};
pub use signal::{LogSignal, SchemaChangeEvent, SchemaSignal, SignalKind};
pub use table::Table;
pub use transaction::CatalogTransaction;

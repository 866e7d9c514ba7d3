//! On-disk layout conventions: store file paths and sub-store names.
//!
//! ## Store files
//!
//! Current layout: one root store per database, `<root>/<database>.<ext>`.
//! Legacy layout: one root store per table, `<root>/<database>/<table>.<ext>`,
//! whose catalog uses bare attribute keys for its single default table.
//!
//! ## Sub-store names
//!
//! - `__catalog__` — catalog entries
//! - `__audit__` — shared append-only audit log
//! - `data:<table>` — a table's primary records (`data` in a legacy store)
//! - `idx:<table>:<attribute>` — one secondary index (`idx:<attribute>` in a
//!   legacy store)
//!
//! ## Index entry keys
//!
//! The engine's store has no native duplicate keys, so an index entry is keyed
//! `derived_value ++ 0x00 ++ primary_key` with the primary key as the value;
//! lookups scan the `derived_value ++ 0x00` prefix.

use crate::error::{CatalogError, Result};
use keel_commons::{AttributeName, CatalogConfig, DatabaseName, TableName};
use std::path::PathBuf;

/// Catalog sub-store name, one per root store.
pub const CATALOG_SUB_STORE: &str = "__catalog__";

/// Audit sub-store name, shared by all tables of a root store.
pub const AUDIT_SUB_STORE: &str = "__audit__";

/// Primary data sub-store name for a table (`None` = legacy default table).
pub fn data_sub_store(table: Option<&TableName>) -> String {
    match table {
        Some(table) => format!("data:{}", table),
        None => "data".to_string(),
    }
}

/// Index sub-store name for one attribute of a table.
pub fn index_sub_store(table: Option<&TableName>, attribute: &AttributeName) -> String {
    match table {
        Some(table) => format!("idx:{}:{}", table, attribute),
        None => format!("idx:{}", attribute),
    }
}

/// Key under which one `(derived value, primary key)` index entry is stored.
pub fn index_entry_key(derived: &[u8], primary_key: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(derived.len() + 1 + primary_key.len());
    key.extend_from_slice(derived);
    key.push(0x00);
    key.extend_from_slice(primary_key);
    key
}

/// Prefix covering every index entry for one derived value.
pub fn index_prefix(derived: &[u8]) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(derived.len() + 1);
    prefix.extend_from_slice(derived);
    prefix.push(0x00);
    prefix
}

/// Store file for a database in the current layout.
pub fn database_store_path(config: &CatalogConfig, database: &DatabaseName) -> Result<PathBuf> {
    let root = config.storage_roots.first().ok_or(CatalogError::NoStorageRoot)?;
    Ok(root.join(format!("{}.{}", database, config.extension)))
}

/// Store file for a table in the legacy one-file-per-table layout.
pub fn legacy_store_path(
    config: &CatalogConfig,
    database: &DatabaseName,
    table: &TableName,
) -> Result<PathBuf> {
    let root = config.storage_roots.first().ok_or(CatalogError::NoStorageRoot)?;
    Ok(root
        .join(database.as_str())
        .join(format!("{}.{}", table, config.extension)))
}

/// Resolves the store path for `(database, table)`: an existing legacy store
/// wins, otherwise the current per-database layout is used (and created on
/// first write). Returns the path and whether it is a legacy store.
pub fn resolve_store_path(
    config: &CatalogConfig,
    database: &DatabaseName,
    table: &TableName,
) -> Result<(PathBuf, bool)> {
    let legacy = legacy_store_path(config, database, table)?;
    if legacy.exists() {
        return Ok((legacy, true));
    }
    Ok((database_store_path(config, database)?, false))
}

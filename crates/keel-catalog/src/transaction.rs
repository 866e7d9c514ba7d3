//! Explicit catalog edit transactions.
//!
//! One `CatalogTransaction` is acquired per `ensure_table` call and passed to
//! every mutation helper; `commit` applies all accumulated operations as a
//! single atomic write batch, so a crash can never leave attribute and index
//! catalog entries inconsistent with each other. Dropping the transaction
//! without committing discards it.

use crate::error::{CatalogError, Result};
use keel_commons::CatalogEntry;
use keel_store::{BatchOp, RootStore};
use std::sync::Arc;

/// Accumulates catalog mutations for one atomic commit.
pub struct CatalogTransaction {
    root: Arc<dyn RootStore>,
    catalog_sub: String,
    ops: Vec<BatchOp>,
}

impl CatalogTransaction {
    /// Begins an edit against `root`'s catalog sub-store.
    pub fn begin(root: Arc<dyn RootStore>, catalog_sub: impl Into<String>) -> Self {
        Self {
            root,
            catalog_sub: catalog_sub.into(),
            ops: Vec::new(),
        }
    }

    /// Stages a catalog entry write.
    pub fn put_entry(&mut self, key: Vec<u8>, entry: &CatalogEntry) -> Result<()> {
        let value = entry
            .encode()
            .map_err(|e| CatalogError::CorruptEntry {
                key: String::from_utf8_lossy(&key).into_owned(),
                reason: e.to_string(),
            })?;
        self.ops.push(BatchOp::Put {
            sub_store: self.catalog_sub.clone(),
            key,
            value,
        });
        Ok(())
    }

    /// Stages a catalog entry removal.
    pub fn remove_entry(&mut self, key: Vec<u8>) {
        self.ops.push(BatchOp::Remove {
            sub_store: self.catalog_sub.clone(),
            key,
        });
    }

    /// Stages a raw write into another sub-store of the same root store
    /// (audit records ride in the same commit).
    pub fn put_raw(&mut self, sub_store: impl Into<String>, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put {
            sub_store: sub_store.into(),
            key,
            value,
        });
    }

    /// Number of staged operations.
    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Applies all staged operations atomically. An empty transaction commits
    /// without touching the store.
    pub fn commit(self) -> Result<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        self.root.batch(self.ops)?;
        Ok(())
    }
}

//! Store lifecycle manager: open-by-path caching with mark/sweep staleness.
//!
//! A root store handle is shared by every table that references its path and is
//! never closed while referenced. A full catalog reload runs the two phases:
//! `mark_potentially_stale` flags every cached handle, discovery re-opens (and
//! thereby un-flags) every path it still finds, and `close_stale` closes and
//! evicts whatever stayed flagged. Table removal from the registry happens
//! before handle eviction in the reload routine, so a handle with live table
//! references is never swept.

use crate::error::{CatalogError, Result};
use dashmap::DashMap;
use keel_store::{RootStore, StoreDriver, StoreError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct StoreSlot {
    store: Arc<dyn RootStore>,
    /// Close candidate flag, set by the mark phase and cleared by `open`.
    stale: AtomicBool,
}

/// Opens, caches, and closes root store handles, keyed by physical path.
pub struct StoreLifecycleManager {
    driver: Arc<dyn StoreDriver>,
    stores: DashMap<PathBuf, StoreSlot>,
}

impl StoreLifecycleManager {
    pub fn new(driver: Arc<dyn StoreDriver>) -> Self {
        Self {
            driver,
            stores: DashMap::new(),
        }
    }

    /// Returns the cached handle for `path`, opening it on first use. Re-use
    /// clears the handle's stale flag: a discovery pass that still finds the
    /// path keeps its store alive through the sweep.
    pub fn open(&self, path: &Path) -> Result<Arc<dyn RootStore>> {
        if let Some(slot) = self.stores.get(path) {
            slot.stale.store(false, Ordering::Release);
            return Ok(Arc::clone(&slot.store));
        }

        let store = self.driver.open(path).map_err(|e| match e {
            StoreError::Open { path, reason } => {
                CatalogError::store_open(path.clone(), StoreError::Open { path, reason })
            }
            other => CatalogError::store_open(path.to_path_buf(), other),
        })?;

        // Two threads can race the open; first insert wins and the loser's
        // handle is closed immediately (it has no other references yet).
        match self.stores.entry(path.to_path_buf()) {
            dashmap::mapref::entry::Entry::Occupied(slot) => {
                let _ = store.close();
                slot.get().stale.store(false, Ordering::Release);
                Ok(Arc::clone(&slot.get().store))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(StoreSlot {
                    store: Arc::clone(&store),
                    stale: AtomicBool::new(false),
                });
                Ok(store)
            }
        }
    }

    /// Flags every cached handle as a close candidate (reload mark phase).
    pub fn mark_potentially_stale(&self) {
        for slot in self.stores.iter() {
            slot.stale.store(true, Ordering::Release);
        }
    }

    /// Closes and evicts every handle still flagged (reload sweep phase).
    /// Returns the paths that were closed.
    pub fn close_stale(&self) -> Vec<PathBuf> {
        let flagged: Vec<PathBuf> = self
            .stores
            .iter()
            .filter(|slot| slot.stale.load(Ordering::Acquire))
            .map(|slot| slot.key().clone())
            .collect();

        let mut closed = Vec::with_capacity(flagged.len());
        for path in flagged {
            if let Some((path, slot)) = self.stores.remove(&path) {
                if let Err(e) = slot.store.close() {
                    log::warn!("closing stale store at {}: {}", path.display(), e);
                } else {
                    closed.push(path);
                }
            }
        }
        closed
    }

    /// Number of cached handles.
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_store::RocksDriver;
    use tempfile::TempDir;

    fn manager() -> (StoreLifecycleManager, TempDir) {
        let dir = TempDir::new().unwrap();
        (StoreLifecycleManager::new(Arc::new(RocksDriver::new())), dir)
    }

    #[test]
    fn test_open_is_cached() {
        let (manager, dir) = manager();
        let path = dir.path().join("a.keel");
        let first = manager.open(&path).unwrap();
        let second = manager.open(&path).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_mark_sweep_closes_unreferenced() {
        let (manager, dir) = manager();
        let kept = dir.path().join("kept.keel");
        let dropped = dir.path().join("dropped.keel");
        manager.open(&kept).unwrap();
        let dropped_store = manager.open(&dropped).unwrap();

        manager.mark_potentially_stale();
        // A discovery pass re-opens only the surviving path.
        manager.open(&kept).unwrap();

        let closed = manager.close_stale();
        assert_eq!(closed, vec![dropped.clone()]);
        assert!(dropped_store.is_closed());
        assert_eq!(manager.len(), 1);

        // Nothing left flagged: a second sweep closes nothing.
        assert!(manager.close_stale().is_empty());
    }

    #[test]
    fn test_open_failure_carries_path() {
        let (manager, dir) = manager();
        let bogus = dir.path().join("bogus.keel");
        std::fs::write(&bogus, b"junk").unwrap();
        match manager.open(&bogus).map(|_| ()).unwrap_err() {
            CatalogError::StoreOpen { path, .. } => assert_eq!(path, bogus),
            other => panic!("unexpected error: {other}"),
        }
    }
}

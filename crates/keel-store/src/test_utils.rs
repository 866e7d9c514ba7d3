//! Test utilities for keel-store.
//!
//! Provides helpers for setting up scratch root stores with minimal
//! boilerplate.

use crate::driver::{RootStore, StoreDriver};
use crate::rocks::RocksDriver;
use anyhow::Result;
use std::sync::Arc;
use tempfile::TempDir;

/// Scratch root store that cleans up its directory on drop.
pub struct TestStore {
    /// The opened root store.
    pub store: Arc<dyn RootStore>,
    /// Temporary directory (kept alive for the duration of the test).
    #[allow(dead_code)]
    temp_dir: TempDir,
}

impl TestStore {
    /// Opens a fresh root store in a temporary directory.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use keel_store::test_utils::TestStore;
    /// use keel_store::SubStoreOptions;
    ///
    /// let test = TestStore::open().unwrap();
    /// let data = test.store.open_sub_store("data", SubStoreOptions::primary()).unwrap();
    /// ```
    pub fn open() -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let store = RocksDriver::new().open(&temp_dir.path().join("test.keel"))?;
        Ok(Self { store, temp_dir })
    }
}

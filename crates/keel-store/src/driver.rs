//! Store driver traits: root stores, sub-stores, and versioned operations.
//!
//! A `RootStore` is one physical storage file; `SubStore`s are named partitions
//! within it (primary data, secondary indexes, the catalog, the audit log).
//! Implementations must be thread-safe; handles are shared as `Arc<dyn ...>`
//! across every table that references the same path.

use crate::error::Result;
use std::path::Path;
use std::sync::Arc;

/// Per-record version tag, bumped by the driver on every write to a key.
pub type Version = u64;

/// One record returned by a range scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub version: Version,
}

/// Options for opening a sub-store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubStoreOptions {
    /// The sub-store holds index entries where one key may map to many primary
    /// keys. Advisory for engines without native duplicate keys; see the index
    /// key layout in `keel-catalog`.
    pub duplicate_keys: bool,
    /// Keys of this sub-store are the table's primary-key values.
    pub key_is_primary: bool,
}

impl SubStoreOptions {
    /// Options for a table's primary data sub-store.
    pub fn primary() -> Self {
        Self {
            duplicate_keys: false,
            key_is_primary: true,
        }
    }

    /// Options for a secondary index sub-store.
    pub fn index() -> Self {
        Self {
            duplicate_keys: true,
            key_is_primary: false,
        }
    }
}

/// Options for a range scan.
///
/// Forward scans visit keys in `[start, end)`; reverse scans visit keys in
/// `(end, start]` walking downward (unset bounds are unbounded).
#[derive(Debug, Clone, Default)]
pub struct RangeOptions {
    pub start: Option<Vec<u8>>,
    pub end: Option<Vec<u8>>,
    pub reverse: bool,
    pub limit: Option<usize>,
}

impl RangeOptions {
    /// Scan the whole sub-store in key order.
    pub fn all() -> Self {
        Self::default()
    }

    /// Forward scan starting at `start` (inclusive).
    pub fn from(start: impl Into<Vec<u8>>) -> Self {
        Self {
            start: Some(start.into()),
            ..Self::default()
        }
    }

    /// Forward scan over every key beginning with `prefix`.
    pub fn prefix(prefix: impl Into<Vec<u8>>) -> Self {
        let prefix = prefix.into();
        let end = prefix_upper_bound(&prefix);
        Self {
            start: Some(prefix),
            end,
            ..Self::default()
        }
    }

    /// Caps the number of returned records.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Smallest key strictly greater than every key with the given prefix, or
/// `None` when no such key exists (all bytes are `0xff`).
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.last_mut() {
        if *last < 0xff {
            *last += 1;
            return Some(bound);
        }
        bound.pop();
    }
    None
}

/// One operation in an atomic write batch. Sub-stores are addressed by name;
/// all operations in a batch must target the same root store.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put {
        sub_store: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Remove {
        sub_store: String,
        key: Vec<u8>,
    },
}

/// A named partition within a root store.
pub trait SubStore: Send + Sync {
    /// Name of this sub-store within its root store.
    fn name(&self) -> &str;

    /// Reads a record, returning its payload and version tag.
    fn get(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Version)>>;

    /// Writes a record, returning the new version tag.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<Version>;

    /// Deletes a record. Returns whether it existed.
    fn remove(&self, key: &[u8]) -> Result<bool>;

    /// Range scan returning version-tagged records.
    fn get_range(&self, options: &RangeOptions) -> Result<Vec<RecordEntry>>;

    /// Writes `value` only if the record's current version equals `expected`
    /// (`None` = only if the key is absent). Returns whether the write applied.
    fn conditional_put(&self, key: &[u8], expected: Option<Version>, value: &[u8])
        -> Result<bool>;
}

/// One physical storage file, owning named sub-stores.
pub trait RootStore: Send + Sync {
    /// Path this store was opened from.
    fn path(&self) -> &Path;

    /// Opens a sub-store, creating it if absent. Cheap for already-open names.
    fn open_sub_store(&self, name: &str, options: SubStoreOptions) -> Result<Arc<dyn SubStore>>;

    /// Drops a sub-store and all its records.
    fn drop_sub_store(&self, name: &str) -> Result<()>;

    /// Names of all sub-stores present in this root store.
    fn sub_store_names(&self) -> Result<Vec<String>>;

    /// Applies all operations atomically: a crash observes either none or all.
    fn batch(&self, ops: Vec<BatchOp>) -> Result<()>;

    /// Writes `(key, value)` into `target_sub` only if the record at
    /// `guard_key` in `guard_sub` still carries version `expected`. This is the
    /// cross-sub-store form of the version guard: the background indexer writes
    /// an index entry only if the primary record it derived it from is
    /// unchanged. Returns whether the write applied.
    #[allow(clippy::too_many_arguments)]
    fn guarded_put(
        &self,
        guard_sub: &str,
        guard_key: &[u8],
        expected: Version,
        target_sub: &str,
        key: &[u8],
        value: &[u8],
    ) -> Result<bool>;

    /// Flushes buffered writes to durable storage.
    fn flush(&self) -> Result<()>;

    /// Closes the store. Returns an error if already closed; callers
    /// (the store lifecycle manager) close each store exactly once.
    fn close(&self) -> Result<()>;

    /// Whether `close` has been called.
    fn is_closed(&self) -> bool;
}

/// Opens root stores by physical path.
pub trait StoreDriver: Send + Sync {
    /// Opens (or creates) the root store at `path`.
    fn open(&self, path: &Path) -> Result<Arc<dyn RootStore>>;
}

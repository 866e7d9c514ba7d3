//! RocksDB implementation of the store driver traits.
//!
//! Maps each root store to one RocksDB database and each sub-store to a column
//! family. Uses `DBWithThreadMode<MultiThreaded>` because sub-stores are
//! created and dropped at runtime through shared handles.
//!
//! ## Version tags
//!
//! RocksDB has no per-record version, so the backend prepends an 8-byte
//! little-endian version header to every stored value. The header is bumped on
//! each write to a key; all writes to one root store are serialized through its
//! write mutex, which makes read-modify-write version maintenance and the
//! conditional/guarded puts atomic.

use crate::driver::{
    BatchOp, RangeOptions, RecordEntry, RootStore, StoreDriver, SubStore, SubStoreOptions, Version,
};
use crate::error::{Result, StoreError};
use parking_lot::Mutex;
use rocksdb::{BoundColumnFamily, DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, WriteBatch};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type Db = DBWithThreadMode<MultiThreaded>;

const VERSION_HEADER_LEN: usize = 8;

/// Store driver backed by RocksDB.
pub struct RocksDriver;

impl RocksDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RocksDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreDriver for RocksDriver {
    fn open(&self, path: &Path) -> Result<Arc<dyn RootStore>> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        // Existing stores must reopen every column family they contain.
        let cf_names = Db::list_cf(&Options::default(), path)
            .unwrap_or_else(|_| vec!["default".to_string()]);

        let db = Db::open_cf(&opts, path, &cf_names).map_err(|e| StoreError::Open {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let subs: BTreeSet<String> =
            cf_names.into_iter().filter(|name| name != "default").collect();

        log::debug!("opened root store at {} ({} sub-stores)", path.display(), subs.len());

        Ok(Arc::new(RocksRootStore {
            inner: Arc::new(Inner {
                db,
                path: path.to_path_buf(),
                write_lock: Mutex::new(()),
                subs: Mutex::new(subs),
                closed: AtomicBool::new(false),
            }),
        }))
    }
}

struct Inner {
    db: Db,
    path: PathBuf,
    /// Serializes all writes so version read-modify-write is atomic.
    write_lock: Mutex<()>,
    subs: Mutex<BTreeSet<String>>,
    closed: AtomicBool,
}

impl Inner {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed(self.path.clone()));
        }
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::SubStoreNotFound(name.to_string()))
    }

    fn io(e: rocksdb::Error) -> StoreError {
        StoreError::Io(e.to_string())
    }

    /// Current version of `key` in `sub`, `None` if absent.
    fn current_version(&self, sub: &str, key: &[u8]) -> Result<Option<Version>> {
        let cf = self.cf(sub)?;
        match self.db.get_cf(&cf, key).map_err(Self::io)? {
            Some(raw) => Ok(Some(decode_value(sub, &raw)?.0)),
            None => Ok(None),
        }
    }

    /// Writes `value` to `key` in `sub`, bumping the version header. Caller
    /// must hold the write lock.
    fn write_versioned(&self, sub: &str, key: &[u8], value: &[u8]) -> Result<Version> {
        let next = self.current_version(sub, key)?.map_or(1, |v| v + 1);
        let cf = self.cf(sub)?;
        self.db
            .put_cf(&cf, key, encode_value(next, value))
            .map_err(Self::io)?;
        Ok(next)
    }
}

fn encode_value(version: Version, payload: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(VERSION_HEADER_LEN + payload.len());
    raw.extend_from_slice(&version.to_le_bytes());
    raw.extend_from_slice(payload);
    raw
}

fn decode_value<'a>(sub: &str, raw: &'a [u8]) -> Result<(Version, &'a [u8])> {
    if raw.len() < VERSION_HEADER_LEN {
        return Err(StoreError::Corrupt {
            sub_store: sub.to_string(),
            reason: format!("value shorter than version header ({} bytes)", raw.len()),
        });
    }
    let mut header = [0u8; VERSION_HEADER_LEN];
    header.copy_from_slice(&raw[..VERSION_HEADER_LEN]);
    Ok((Version::from_le_bytes(header), &raw[VERSION_HEADER_LEN..]))
}

/// RocksDB root store: one database directory, sub-store = column family.
pub struct RocksRootStore {
    inner: Arc<Inner>,
}

impl RootStore for RocksRootStore {
    fn path(&self) -> &Path {
        &self.inner.path
    }

    fn open_sub_store(&self, name: &str, _options: SubStoreOptions) -> Result<Arc<dyn SubStore>> {
        self.inner.check_open()?;
        if self.inner.db.cf_handle(name).is_none() {
            let _guard = self.inner.write_lock.lock();
            if self.inner.db.cf_handle(name).is_none() {
                self.inner
                    .db
                    .create_cf(name, &Options::default())
                    .map_err(Inner::io)?;
            }
        }
        self.inner.subs.lock().insert(name.to_string());
        Ok(Arc::new(RocksSubStore {
            inner: Arc::clone(&self.inner),
            name: name.to_string(),
        }))
    }

    fn drop_sub_store(&self, name: &str) -> Result<()> {
        self.inner.check_open()?;
        let _guard = self.inner.write_lock.lock();
        if self.inner.db.cf_handle(name).is_some() {
            self.inner.db.drop_cf(name).map_err(Inner::io)?;
        }
        self.inner.subs.lock().remove(name);
        Ok(())
    }

    fn sub_store_names(&self) -> Result<Vec<String>> {
        self.inner.check_open()?;
        Ok(self.inner.subs.lock().iter().cloned().collect())
    }

    fn batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        self.inner.check_open()?;
        let _guard = self.inner.write_lock.lock();
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                BatchOp::Put {
                    sub_store,
                    key,
                    value,
                } => {
                    let next = self
                        .inner
                        .current_version(&sub_store, &key)?
                        .map_or(1, |v| v + 1);
                    let cf = self.inner.cf(&sub_store)?;
                    batch.put_cf(&cf, key, encode_value(next, &value));
                }
                BatchOp::Remove { sub_store, key } => {
                    let cf = self.inner.cf(&sub_store)?;
                    batch.delete_cf(&cf, key);
                }
            }
        }
        self.inner.db.write(batch).map_err(Inner::io)
    }

    fn guarded_put(
        &self,
        guard_sub: &str,
        guard_key: &[u8],
        expected: Version,
        target_sub: &str,
        key: &[u8],
        value: &[u8],
    ) -> Result<bool> {
        self.inner.check_open()?;
        let _guard = self.inner.write_lock.lock();
        match self.inner.current_version(guard_sub, guard_key)? {
            Some(current) if current == expected => {
                self.inner.write_versioned(target_sub, key, value)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn flush(&self) -> Result<()> {
        self.inner.check_open()?;
        self.inner.db.flush().map_err(Inner::io)
    }

    fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Err(StoreError::Closed(self.inner.path.clone()));
        }
        self.inner.db.flush().map_err(Inner::io)?;
        log::info!("closed root store at {}", self.inner.path.display());
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

/// Column-family-backed sub-store.
pub struct RocksSubStore {
    inner: Arc<Inner>,
    name: String,
}

impl SubStore for RocksSubStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Version)>> {
        self.inner.check_open()?;
        let cf = self.inner.cf(&self.name)?;
        match self.inner.db.get_cf(&cf, key).map_err(Inner::io)? {
            Some(raw) => {
                let (version, payload) = decode_value(&self.name, &raw)?;
                Ok(Some((payload.to_vec(), version)))
            }
            None => Ok(None),
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<Version> {
        self.inner.check_open()?;
        let _guard = self.inner.write_lock.lock();
        self.inner.write_versioned(&self.name, key, value)
    }

    fn remove(&self, key: &[u8]) -> Result<bool> {
        self.inner.check_open()?;
        let _guard = self.inner.write_lock.lock();
        let cf = self.inner.cf(&self.name)?;
        let existed = self.inner.db.get_cf(&cf, key).map_err(Inner::io)?.is_some();
        if existed {
            self.inner.db.delete_cf(&cf, key).map_err(Inner::io)?;
        }
        Ok(existed)
    }

    fn get_range(&self, options: &RangeOptions) -> Result<Vec<RecordEntry>> {
        self.inner.check_open()?;
        let cf = self.inner.cf(&self.name)?;

        let mode = match (&options.start, options.reverse) {
            (Some(start), false) => IteratorMode::From(start.as_slice(), Direction::Forward),
            (Some(start), true) => IteratorMode::From(start.as_slice(), Direction::Reverse),
            (None, false) => IteratorMode::Start,
            (None, true) => IteratorMode::End,
        };

        let mut out = Vec::new();
        for item in self.inner.db.iterator_cf(&cf, mode) {
            let (key, raw) = item.map_err(Inner::io)?;
            if let Some(end) = &options.end {
                let past_end = if options.reverse {
                    key.as_ref() <= end.as_slice()
                } else {
                    key.as_ref() >= end.as_slice()
                };
                if past_end {
                    break;
                }
            }
            let (version, payload) = decode_value(&self.name, &raw)?;
            out.push(RecordEntry {
                key: key.into_vec(),
                value: payload.to_vec(),
                version,
            });
            if let Some(limit) = options.limit {
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    fn conditional_put(
        &self,
        key: &[u8],
        expected: Option<Version>,
        value: &[u8],
    ) -> Result<bool> {
        self.inner.check_open()?;
        let _guard = self.inner.write_lock.lock();
        if self.inner.current_version(&self.name, key)? != expected {
            return Ok(false);
        }
        self.inner.write_versioned(&self.name, key, value)?;
        Ok(true)
    }
}

//! # keel-store
//!
//! Embedded store driver boundary for KeelDB.
//!
//! This crate defines the trait-based abstraction the catalog engine consumes
//! (a root store per physical path, named sub-stores within it, version-tagged
//! records, atomic write batches, and version-guarded conditional writes) plus
//! the RocksDB-backed implementation.
//!
//! ## Architecture
//!
//! ```text
//! StoreDriver              ← opens root stores by path (driver.rs)
//!     ↓
//! RootStore / SubStore     ← versioned K/V operations (driver.rs)
//!     ↓
//! RocksDB                  ← sub-store = column family (rocks.rs)
//! ```
//!
//! ## Version tags
//!
//! Every stored value carries a version tag maintained by the driver and bumped
//! on each write to its key. `conditional_put` and `guarded_put` only apply if
//! the observed version is unchanged, which is how concurrent modification is
//! detected without locking (see `keel-catalog`'s background indexer).

pub mod driver;
pub mod error;
pub mod rocks;
pub mod test_utils;

pub use driver::{
    prefix_upper_bound, BatchOp, RangeOptions, RecordEntry, RootStore, StoreDriver, SubStore,
    SubStoreOptions, Version,
};
pub use error::{Result, StoreError};
pub use rocks::RocksDriver;

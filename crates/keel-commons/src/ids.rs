//! Identifier types for tables and background workers.

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Integer table identifier, unique within one root store.
///
/// Assigned monotonically when a table is first created and persisted into the
/// table's primary catalog entry so restarts never reuse an id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode,
)]
pub struct TableId(u32);

impl TableId {
    /// Creates a TableId from a raw integer.
    #[inline]
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw integer id.
    #[inline]
    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// Returns the next id in allocation order.
    #[inline]
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identity of the process/worker performing background work.
///
/// Written into indexing leases so that sibling processes sharing the same
/// storage can tell their own claims apart from foreign ones. The identity is
/// unique per engine instance, not just per OS process: two engines in one
/// process (tests do this) get distinct ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct WorkerId(String);

impl WorkerId {
    /// Creates a WorkerId from a raw string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh WorkerId for this engine instance.
    pub fn generate() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static INSTANCE: AtomicU64 = AtomicU64::new(0);
        let seq = INSTANCE.fetch_add(1, Ordering::Relaxed);
        Self(format!(
            "{}-{}-{}",
            std::process::id(),
            crate::time::now_ms(),
            seq
        ))
    }

    /// Returns the id as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

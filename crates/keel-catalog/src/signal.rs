//! Schema-change signaling to sibling processes.
//!
//! Fire-and-forget: the engine never waits on delivery and delivery failures
//! must not fail the originating operation. The transport is external; this
//! crate only defines the seam.

use keel_commons::{DatabaseName, TableName};
use std::fmt;

/// Kind of schema event announced to peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// The table's attribute set changed.
    SchemaChange,
    /// A background index build completed; peers may start using the index.
    IndexingFinished,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::SchemaChange => write!(f, "schema-change"),
            SignalKind::IndexingFinished => write!(f, "indexing-finished"),
        }
    }
}

/// Notification sent to sibling processes sharing the same storage.
#[derive(Debug, Clone)]
pub struct SchemaChangeEvent {
    /// Origin id of the engine instance that made the change.
    pub origin: String,
    pub kind: SignalKind,
    pub database: DatabaseName,
    pub table: TableName,
}

/// Transport seam for schema-change notifications.
pub trait SchemaSignal: Send + Sync {
    /// Announces `event` to peers. Must not block and must not fail the caller.
    fn signal(&self, event: &SchemaChangeEvent);
}

/// Default transport: logs the event and goes no further. Deployments wire a
/// real transport here.
pub struct LogSignal;

impl SchemaSignal for LogSignal {
    fn signal(&self, event: &SchemaChangeEvent) {
        log::debug!(
            "signal {} for {}.{} (origin {})",
            event.kind,
            event.database,
            event.table,
            event.origin
        );
    }
}

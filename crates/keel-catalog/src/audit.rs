//! Audit log writes for schema mutations.
//!
//! When auditing is enabled, every schema mutation appends a record to the
//! root store's shared `__audit__` sub-store, riding in the same atomic batch
//! as the catalog mutation it describes. Keys order records by wall-clock
//! time with a process-wide sequence suffix for uniqueness.

use crate::layout::AUDIT_SUB_STORE;
use crate::transaction::CatalogTransaction;
use keel_commons::AuditRecord;
use std::sync::atomic::{AtomicU64, Ordering};

static AUDIT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Key for one audit record: big-endian millis then sequence, so range scans
/// return records in write order.
fn audit_key(timestamp_ms: u64) -> Vec<u8> {
    let seq = AUDIT_SEQ.fetch_add(1, Ordering::Relaxed);
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&timestamp_ms.to_be_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

/// Stages an audit record into `txn`. Encode failures are logged and skipped;
/// auditing never fails the mutation it describes.
pub(crate) fn stage(txn: &mut CatalogTransaction, record: &AuditRecord) {
    match record.encode() {
        Ok(value) => txn.put_raw(AUDIT_SUB_STORE, audit_key(record.timestamp_ms), value),
        Err(e) => log::warn!(
            "skipping audit record for {}.{}: {}",
            record.database,
            record.table,
            e
        ),
    }
}

/// Appends an audit record directly (for events outside a catalog transaction,
/// such as background index completion). Failures are logged and swallowed.
pub(crate) fn append(sub: &std::sync::Arc<dyn keel_store::SubStore>, record: &AuditRecord) {
    let value = match record.encode() {
        Ok(value) => value,
        Err(e) => {
            log::warn!(
                "skipping audit record for {}.{}: {}",
                record.database,
                record.table,
                e
            );
            return;
        }
    };
    if let Err(e) = sub.put(&audit_key(record.timestamp_ms), &value) {
        log::warn!(
            "failed to append audit record for {}.{}: {}",
            record.database,
            record.table,
            e
        );
    }
}

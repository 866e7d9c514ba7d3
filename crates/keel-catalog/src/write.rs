//! Indexed record writes and index lookups.
//!
//! The live write path: a record write updates the primary sub-store and every
//! secondary index in one atomic batch — stale entries for the record's old
//! derived values are removed and entries for the new values added. This is
//! what makes concurrent writes safe against the background indexer: the
//! indexer's version-guarded puts lose to any record a writer touched, and the
//! writer's own batch carries the index entries for its final value.
//!
//! ## Value derivation
//!
//! One attribute value yields zero, one, or many indexable values: scalars map
//! to one derived key, arrays fan out to one per scalar element, and nulls,
//! missing fields, and nested structures yield none.

use crate::error::{CatalogError, Result};
use crate::layout::{index_entry_key, index_prefix};
use crate::table::Table;
use keel_commons::AttributeName;
use keel_store::{BatchOp, RangeOptions, Version};
use serde_json::Value;
use std::collections::BTreeSet;

/// Derived index key bytes for one scalar value, `None` for values that do not
/// index (null, objects, nested arrays).
pub(crate) fn index_value_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::String(s) => Some(s.as_bytes().to_vec()),
        Value::Number(n) => Some(n.to_string().into_bytes()),
        Value::Bool(b) => Some(if *b { b"true".to_vec() } else { b"false".to_vec() }),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// All indexable values a record yields for one attribute.
pub(crate) fn derived_index_values(record: &Value, attribute: &AttributeName) -> BTreeSet<Vec<u8>> {
    let field = match record.get(attribute.as_str()) {
        Some(field) => field,
        None => return BTreeSet::new(),
    };
    match field {
        Value::Array(elements) => elements.iter().filter_map(index_value_bytes).collect(),
        other => index_value_bytes(other).into_iter().collect(),
    }
}

impl Table {
    /// Writes a record under `primary_key`, maintaining every secondary index
    /// in the same atomic batch.
    ///
    /// The read-derive-batch sequence is not serialized against other writers
    /// of the same key: two racing writes to one key can strand a stale index
    /// entry. Callers own per-key write ordering; writes to distinct keys need
    /// no coordination.
    pub fn put_record(&self, primary_key: &[u8], record: &Value) -> Result<()> {
        let payload = serde_json::to_vec(record)
            .map_err(|e| CatalogError::InvalidRecord(e.to_string()))?;

        self.read_state(|state| {
            let old_record: Option<Value> = match state.primary.get(primary_key)? {
                Some((raw, _)) => serde_json::from_slice(&raw).ok(),
                None => None,
            };

            let mut ops = Vec::new();
            for attr in state.attributes.iter().filter(|a| a.indexed && !a.is_primary_key) {
                let sub_store = if state.legacy {
                    crate::layout::index_sub_store(None, &attr.name)
                } else {
                    crate::layout::index_sub_store(Some(self.name()), &attr.name)
                };
                let new_values = derived_index_values(record, &attr.name);
                let old_values = old_record
                    .as_ref()
                    .map(|old| derived_index_values(old, &attr.name))
                    .unwrap_or_default();

                for stale in old_values.difference(&new_values) {
                    ops.push(BatchOp::Remove {
                        sub_store: sub_store.clone(),
                        key: index_entry_key(stale, primary_key),
                    });
                }
                for value in &new_values {
                    ops.push(BatchOp::Put {
                        sub_store: sub_store.clone(),
                        key: index_entry_key(value, primary_key),
                        value: primary_key.to_vec(),
                    });
                }
            }

            ops.push(BatchOp::Put {
                sub_store: if state.legacy {
                    crate::layout::data_sub_store(None)
                } else {
                    crate::layout::data_sub_store(Some(self.name()))
                },
                key: primary_key.to_vec(),
                value: payload.clone(),
            });

            state.root.batch(ops)?;
            Ok(())
        })
    }

    /// Reads a record and its version tag.
    pub fn get_record(&self, primary_key: &[u8]) -> Result<Option<(Value, Version)>> {
        match self.primary().get(primary_key)? {
            Some((raw, version)) => {
                let record = serde_json::from_slice(&raw)
                    .map_err(|e| CatalogError::InvalidRecord(e.to_string()))?;
                Ok(Some((record, version)))
            }
            None => Ok(None),
        }
    }

    /// Primary keys of every record whose `attribute` yields `value`, in key
    /// order. The attribute must be indexed.
    pub fn lookup_index(&self, attribute: &AttributeName, value: &Value) -> Result<Vec<Vec<u8>>> {
        let index = self
            .index(attribute)
            .ok_or_else(|| CatalogError::InvalidRecord(format!("attribute {} is not indexed", attribute)))?;
        let derived = match index_value_bytes(value) {
            Some(derived) => derived,
            None => return Ok(Vec::new()),
        };
        let entries = index.get_range(&RangeOptions::prefix(index_prefix(&derived)))?;
        Ok(entries.into_iter().map(|e| e.value).collect())
    }
}

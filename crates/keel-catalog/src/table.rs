//! In-memory table objects.
//!
//! A `Table` is shared as `Arc<Table>` by every component holding a reference
//! (query layer, replication, the background indexer). All mutable state lives
//! behind interior mutability so a catalog reload can mutate a surviving table
//! in place: callers holding the `Arc` observe the new schema without
//! re-fetching, and reference identity is preserved across reloads.

use crate::layout;
use keel_commons::{Attribute, AttributeName, DatabaseName, TableId, TableName};
use keel_store::{RootStore, SubStore};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Mutable portion of a table, swapped in place on reload.
pub(crate) struct TableState {
    pub id: TableId,
    /// Legacy single-table root store: catalog entries use bare keys and
    /// sub-store names carry no table segment.
    pub legacy: bool,
    /// Ordered attribute list; the primary key is first.
    pub attributes: Vec<Attribute>,
    pub root: Arc<dyn RootStore>,
    pub catalog: Arc<dyn SubStore>,
    pub primary: Arc<dyn SubStore>,
    pub audit: Option<Arc<dyn SubStore>>,
    pub indexes: HashMap<AttributeName, Arc<dyn SubStore>>,
}

/// One logical table: identity, schema, and storage handles.
pub struct Table {
    database: DatabaseName,
    name: TableName,
    schema_version: AtomicU64,
    state: RwLock<TableState>,
}

impl Table {
    pub(crate) fn new(database: DatabaseName, name: TableName, state: TableState) -> Self {
        Self {
            database,
            name,
            schema_version: AtomicU64::new(1),
            state: RwLock::new(state),
        }
    }

    pub fn database(&self) -> &DatabaseName {
        &self.database
    }

    pub fn name(&self) -> &TableName {
        &self.name
    }

    pub fn id(&self) -> TableId {
        self.state.read().id
    }

    /// Whether this table is the default table of a legacy single-table store.
    pub fn is_legacy(&self) -> bool {
        self.state.read().legacy
    }

    /// Monotonically increasing schema version, bumped on any attribute or
    /// index change. The background indexer self-aborts when it observes a
    /// version newer than the one it started with.
    pub fn schema_version(&self) -> u64 {
        self.schema_version.load(Ordering::Acquire)
    }

    pub(crate) fn bump_schema_version(&self) -> u64 {
        self.schema_version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Snapshot of the ordered attribute list (primary key first).
    pub fn attributes(&self) -> Vec<Attribute> {
        self.state.read().attributes.clone()
    }

    /// Looks up one attribute definition by name.
    pub fn attribute(&self, name: &AttributeName) -> Option<Attribute> {
        self.state
            .read()
            .attributes
            .iter()
            .find(|a| a.name == *name)
            .cloned()
    }

    /// Name of the primary-key attribute. Exactly one attribute carries the
    /// flag; tables are never constructed without it.
    pub fn primary_key_name(&self) -> AttributeName {
        self.state
            .read()
            .attributes
            .iter()
            .find(|a| a.is_primary_key)
            .map(|a| a.name.clone())
            .unwrap_or_else(|| AttributeName::new("id"))
    }

    /// Handle to the primary data sub-store (keys are primary-key values).
    pub fn primary(&self) -> Arc<dyn SubStore> {
        Arc::clone(&self.state.read().primary)
    }

    /// Handle to one attribute's index sub-store, if the attribute is indexed.
    pub fn index(&self, attribute: &AttributeName) -> Option<Arc<dyn SubStore>> {
        self.state.read().indexes.get(attribute).cloned()
    }

    /// Names of all currently indexed attributes.
    pub fn indexed_attributes(&self) -> Vec<AttributeName> {
        self.state.read().indexes.keys().cloned().collect()
    }

    pub(crate) fn root(&self) -> Arc<dyn RootStore> {
        Arc::clone(&self.state.read().root)
    }

    pub(crate) fn catalog_sub(&self) -> Arc<dyn SubStore> {
        Arc::clone(&self.state.read().catalog)
    }

    pub(crate) fn audit_sub(&self) -> Option<Arc<dyn SubStore>> {
        self.state.read().audit.clone()
    }

    /// Catalog key for one of this table's attributes, honoring the legacy
    /// bare-key layout.
    pub(crate) fn catalog_key_for(&self, attribute: &AttributeName) -> Vec<u8> {
        if self.state.read().legacy {
            keel_commons::catalog_key::catalog_key(None, attribute)
        } else {
            keel_commons::catalog_key::catalog_key(Some(&self.name), attribute)
        }
    }

    /// Sub-store name of one attribute's index, honoring the legacy layout.
    pub(crate) fn index_sub_name(&self, attribute: &AttributeName) -> String {
        if self.state.read().legacy {
            layout::index_sub_store(None, attribute)
        } else {
            layout::index_sub_store(Some(&self.name), attribute)
        }
    }

    /// Name of the primary data sub-store.
    pub(crate) fn primary_sub_name(&self) -> String {
        if self.state.read().legacy {
            layout::data_sub_store(None)
        } else {
            layout::data_sub_store(Some(&self.name))
        }
    }

    pub(crate) fn read_state<R>(&self, f: impl FnOnce(&TableState) -> R) -> R {
        f(&self.state.read())
    }

    pub(crate) fn write_state<R>(&self, f: impl FnOnce(&mut TableState) -> R) -> R {
        f(&mut self.state.write())
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("database", &self.database)
            .field("name", &self.name)
            .field("id", &self.id())
            .field("schema_version", &self.schema_version())
            .finish()
    }
}

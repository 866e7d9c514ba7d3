//! Catalog discovery: scanning storage roots and rebuilding the registry.
//!
//! Discovery runs once at startup (first registry use) and again on explicit
//! reload. For each configured storage root it enumerates candidate store
//! files by extension — current layout `<root>/<database>.<ext>`, legacy layout
//! `<root>/<database>/<table>.<ext>` — opens or reuses each root store, range
//! scans its catalog sub-store, and groups entries by table. The primary-key
//! entry determines table identity: a table already in the registry is mutated
//! in place (reference identity for callers holding the `Arc` is preserved)
//! with a schema version bump; an unknown table is constructed fresh.
//!
//! An explicit [`ReloadSession`] carries the set of tables seen this pass; the
//! sweep at the end removes undiscovered registry entries first and only then
//! closes unreferenced store handles.
//!
//! A path that fails to open as a valid store is fatal for that path only: it
//! is logged with the path and its databases degrade to unavailable while
//! every other store continues loading.

use crate::error::{CatalogError, Result};
use crate::layout::{self, AUDIT_SUB_STORE, CATALOG_SUB_STORE};
use crate::lifecycle::StoreLifecycleManager;
use crate::registry::TableRegistry;
use crate::table::{Table, TableState};
use keel_commons::catalog_key::parse_catalog_key;
use keel_commons::{
    Attribute, AttributeName, CatalogConfig, CatalogEntry, DatabaseName, TableName,
};
use keel_store::{RangeOptions, RootStore, SubStore, SubStoreOptions};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// State threaded through one discovery pass.
#[derive(Default)]
pub(crate) struct ReloadSession {
    /// Tables observed on disk this pass.
    pub seen: HashSet<(DatabaseName, TableName)>,
    /// Store paths that failed to open, with their errors.
    pub failures: Vec<(PathBuf, CatalogError)>,
    /// Registry tables removed by the sweep.
    pub removed: Vec<Arc<Table>>,
    /// Store handles closed by the sweep.
    pub closed: Vec<PathBuf>,
}

/// One discovery pass over the configured storage roots.
pub(crate) struct Discovery<'a> {
    pub config: &'a CatalogConfig,
    pub lifecycle: &'a StoreLifecycleManager,
    pub registry: &'a TableRegistry,
}

impl Discovery<'_> {
    /// Runs mark, scan, and sweep. Never fails globally; per-path failures are
    /// recorded in the returned session.
    pub async fn run(&self) -> ReloadSession {
        let mut session = ReloadSession::default();
        self.lifecycle.mark_potentially_stale();

        for root in &self.config.storage_roots {
            self.scan_root(root, &mut session).await;
        }

        // Registry removal happens before handle eviction so the sweep never
        // closes a store that still has live table references.
        session.removed = self.registry.sweep(&session.seen);
        session.closed = self.lifecycle.close_stale();

        log::info!(
            "discovery complete: {} tables seen, {} removed, {} stores closed, {} paths failed",
            session.seen.len(),
            session.removed.len(),
            session.closed.len(),
            session.failures.len()
        );
        session
    }

    async fn scan_root(&self, root: &Path, session: &mut ReloadSession) {
        let mut entries: Vec<PathBuf> = match std::fs::read_dir(root) {
            Ok(read) => read.flatten().map(|e| e.path()).collect(),
            Err(e) => {
                log::warn!("skipping storage root {}: {}", root.display(), e);
                return;
            }
        };
        entries.sort();

        for path in entries {
            if self.has_store_extension(&path) {
                let Some(database) = file_stem_name(&path) else { continue };
                let database = DatabaseName::new(database);
                self.load_store(&path, database, None, session).await;
            } else if path.is_dir() {
                // Legacy layout: one store per table under a database directory.
                let Some(database) = file_stem_name(&path) else { continue };
                let database = DatabaseName::new(database);
                let mut inner: Vec<PathBuf> = match std::fs::read_dir(&path) {
                    Ok(read) => read.flatten().map(|e| e.path()).collect(),
                    Err(e) => {
                        log::warn!("skipping database directory {}: {}", path.display(), e);
                        continue;
                    }
                };
                inner.sort();
                for store_path in inner {
                    if !self.has_store_extension(&store_path) {
                        continue;
                    }
                    let Some(table) = file_stem_name(&store_path) else { continue };
                    let table = TableName::new(table);
                    self.load_store(&store_path, database.clone(), Some(table), session)
                        .await;
                }
            }
        }
    }

    fn has_store_extension(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| ext.to_string_lossy() == self.config.extension)
            .unwrap_or(false)
    }

    async fn load_store(
        &self,
        path: &Path,
        database: DatabaseName,
        legacy_table: Option<TableName>,
        session: &mut ReloadSession,
    ) {
        if let Err(e) = self
            .load_store_inner(path, &database, legacy_table, session)
            .await
        {
            log::error!("discovery failed for store at {}: {}", path.display(), e);
            session.failures.push((path.to_path_buf(), e));
        }
    }

    async fn load_store_inner(
        &self,
        path: &Path,
        database: &DatabaseName,
        legacy_table: Option<TableName>,
        session: &mut ReloadSession,
    ) -> Result<()> {
        let store = self.lifecycle.open(path)?;
        let catalog = store.open_sub_store(CATALOG_SUB_STORE, SubStoreOptions::default())?;

        let records = {
            let catalog = Arc::clone(&catalog);
            tokio::task::spawn_blocking(move || catalog.get_range(&RangeOptions::all()))
                .await
                .map_err(|e| CatalogError::Task(e.to_string()))??
        };

        // Group entries by table. Bare keys belong to the legacy store's
        // default table.
        struct Group {
            legacy: bool,
            attrs: Vec<(AttributeName, CatalogEntry)>,
        }
        let mut groups: BTreeMap<TableName, Group> = BTreeMap::new();
        for record in records {
            let (segment, attr) = match parse_catalog_key(&record.key) {
                Ok(parsed) => parsed,
                Err(e) => {
                    log::warn!("skipping malformed catalog key in {}: {}", path.display(), e);
                    continue;
                }
            };
            let (table, legacy) = match (segment, &legacy_table) {
                (Some(table), _) => (table, false),
                (None, Some(default_table)) => (default_table.clone(), true),
                (None, None) => {
                    log::warn!(
                        "bare catalog key for attribute {} in multi-table store {}",
                        attr,
                        path.display()
                    );
                    continue;
                }
            };
            let entry = match CatalogEntry::decode(&record.value) {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!(
                        "skipping corrupt catalog entry {:?} in {}: {}",
                        String::from_utf8_lossy(&record.key),
                        path.display(),
                        e
                    );
                    continue;
                }
            };
            groups
                .entry(table)
                .or_insert_with(|| Group {
                    legacy,
                    attrs: Vec::new(),
                })
                .attrs
                .push((attr, entry));
        }

        for (table, group) in groups {
            match self.materialize(&store, &catalog, database, &table, group.legacy, group.attrs) {
                Ok(Some(_)) => {
                    session.seen.insert((database.clone(), table));
                }
                Ok(None) => {}
                Err(e) => {
                    log::warn!("skipping table {}.{}: {}", database, table, e);
                }
            }
        }
        Ok(())
    }

    /// Builds (or mutates in place) the registry table for one group of
    /// catalog entries. Returns `None` when the group has no primary-key entry
    /// and therefore defines no table.
    pub(crate) fn materialize(
        &self,
        store: &Arc<dyn RootStore>,
        catalog: &Arc<dyn SubStore>,
        database: &DatabaseName,
        table: &TableName,
        legacy: bool,
        mut attrs: Vec<(AttributeName, CatalogEntry)>,
    ) -> Result<Option<Arc<Table>>> {
        let Some(pk_pos) = attrs.iter().position(|(_, e)| e.is_primary_key) else {
            log::warn!(
                "no primary-key entry for {}.{}; ignoring {} secondary entries",
                database,
                table,
                attrs.len()
            );
            return Ok(None);
        };
        let pk_entry = attrs.remove(pk_pos);
        let table_id = pk_entry.1.table_id;

        let mut attributes: Vec<Attribute> = Vec::with_capacity(attrs.len() + 1);
        attributes.push(pk_entry.1.to_attribute());
        attributes.extend(attrs.iter().map(|(_, e)| e.to_attribute()));

        let segment = if legacy { None } else { Some(table) };
        let primary =
            store.open_sub_store(&layout::data_sub_store(segment), SubStoreOptions::primary())?;
        let audit = if self.config.audit {
            Some(store.open_sub_store(AUDIT_SUB_STORE, SubStoreOptions::default())?)
        } else {
            None
        };
        let mut indexes: HashMap<AttributeName, Arc<dyn SubStore>> = HashMap::new();
        for attr in attributes.iter().filter(|a| a.indexed && !a.is_primary_key) {
            let sub = store.open_sub_store(
                &layout::index_sub_store(segment, &attr.name),
                SubStoreOptions::index(),
            )?;
            indexes.insert(attr.name.clone(), sub);
        }

        if let Some(existing) = self.registry.get(database, table) {
            existing.write_state(|state| {
                state.id = table_id;
                state.legacy = legacy;
                state.attributes = attributes;
                state.root = Arc::clone(store);
                state.catalog = Arc::clone(catalog);
                state.primary = primary;
                state.audit = audit;
                state.indexes = indexes;
            });
            existing.bump_schema_version();
            log::debug!(
                "rediscovered table {}.{} (schema version {})",
                database,
                table,
                existing.schema_version()
            );
            self.registry.notify(&existing);
            Ok(Some(existing))
        } else {
            let created = Arc::new(Table::new(
                database.clone(),
                table.clone(),
                TableState {
                    id: table_id,
                    legacy,
                    attributes,
                    root: Arc::clone(store),
                    catalog: Arc::clone(catalog),
                    primary,
                    audit,
                    indexes,
                },
            ));
            self.registry.insert(Arc::clone(&created));
            log::info!("discovered table {}.{} (id {})", database, table, table_id);
            self.registry.notify(&created);
            Ok(Some(created))
        }
    }
}

fn file_stem_name(path: &Path) -> Option<String> {
    path.file_stem().map(|stem| stem.to_string_lossy().into_owned())
}

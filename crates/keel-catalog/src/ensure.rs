//! `ensure_table`: idempotent declarative schema reconciliation.
//!
//! A caller declares the table and attribute set it needs; the engine
//! reconciles the persisted catalog against that declaration. The table is
//! created if missing (adopting any on-disk definition a sibling process wrote
//! since the last scan), new attributes are added, newly requested indexes are
//! claimed and built in the background, and attributes the caller no longer
//! declares are released. Repeating the same call is a no-op: no schema
//! version bump, no signal, no indexing work.
//!
//! ## Ownership rules
//!
//! Attribute definitions are shared. An origin-carrying caller joins an
//! existing attribute's origin set; an index is only dropped once no origin
//! still declares it. A primary-key flag conflicting with the persisted
//! definition is an error for an origin-carrying caller and silently resolved
//! in favor of the persisted definition otherwise.
//!
//! ## Index claims
//!
//! Claiming an index build is a conditional put on the attribute's catalog
//! entry, guarded by the entry's record version. The loser of a racing claim
//! observes the winner's live lease on re-read and stands down; an expired
//! lease is overridden with an incremented fencing token.

use crate::audit;
use crate::catalog::Catalog;
use crate::discovery::Discovery;
use crate::error::{CatalogError, Result};
use crate::indexer::IndexPlan;
use crate::layout::{self, CATALOG_SUB_STORE};
use crate::table::Table;
use crate::transaction::CatalogTransaction;
use keel_commons::catalog::AuditAction;
use keel_commons::catalog_key::parse_catalog_key;
use keel_commons::{
    now_ms, Attribute, AttributeName, AuditRecord, CatalogEntry, DatabaseName, IndexBuildState,
    IndexingLease, TableId, TableName,
};
use keel_store::{RangeOptions, RootStore, SubStore, SubStoreOptions, Version};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

/// One attribute in a caller's table declaration.
#[derive(Debug, Clone)]
pub struct AttributeSpec {
    pub name: AttributeName,
    pub indexed: bool,
    pub is_primary_key: bool,
}

impl AttributeSpec {
    /// Plain attribute, neither indexed nor primary key.
    pub fn new(name: impl Into<AttributeName>) -> Self {
        Self {
            name: name.into(),
            indexed: false,
            is_primary_key: false,
        }
    }

    /// Attribute with a secondary index.
    pub fn indexed(name: impl Into<AttributeName>) -> Self {
        Self {
            indexed: true,
            ..Self::new(name)
        }
    }

    /// Primary-key attribute.
    pub fn primary_key(name: impl Into<AttributeName>) -> Self {
        Self {
            is_primary_key: true,
            ..Self::new(name)
        }
    }
}

/// A caller's full declaration for one table.
#[derive(Debug, Clone)]
pub struct TableSpec {
    pub database: DatabaseName,
    pub table: TableName,
    pub attributes: Vec<AttributeSpec>,
    /// Declarer identity; origin-carrying declarations participate in shared
    /// ownership of attributes and may release them later.
    pub origin: Option<String>,
    /// Whether this declaration comes from a closed, declared schema.
    pub schema_defined: bool,
}

impl TableSpec {
    pub fn new(database: impl Into<DatabaseName>, table: impl Into<TableName>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            attributes: Vec::new(),
            origin: None,
            schema_defined: false,
        }
    }

    pub fn attribute(mut self, spec: AttributeSpec) -> Self {
        self.attributes.push(spec);
        self
    }

    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn schema_defined(mut self, schema_defined: bool) -> Self {
        self.schema_defined = schema_defined;
        self
    }
}

/// Outcome of reconciling one existing attribute against the declaration.
struct SpecDiff {
    plans: Vec<IndexPlan>,
    subs_to_drop: Vec<String>,
    final_entries: BTreeMap<AttributeName, CatalogEntry>,
    changed: bool,
}

impl Catalog {
    /// Reconciles the persisted catalog with `spec` and returns the table.
    /// Creates the table if absent; otherwise applies the attribute diff.
    /// Idempotent: a declaration matching the persisted state changes nothing.
    pub async fn ensure_table(&self, spec: TableSpec) -> Result<Arc<Table>> {
        self.ensure_discovered().await;
        validate_spec(&spec)?;

        match self.registry.get(&spec.database, &spec.table) {
            Some(table) => self.apply_spec(table, spec).await,
            None => self.create_or_adopt(spec).await,
        }
    }

    /// Removes every catalog entry and index sub-store of a table. Record data
    /// in the primary sub-store is left untouched.
    pub async fn drop_table_metadata(
        &self,
        database: &DatabaseName,
        table_name: &TableName,
    ) -> Result<()> {
        self.ensure_discovered().await;
        let table = self.registry.get(database, table_name).ok_or_else(|| {
            CatalogError::TableNotFound {
                database: database.clone(),
                table: table_name.clone(),
            }
        })?;

        let persisted =
            read_table_entries(&table.catalog_sub(), table.is_legacy(), table_name).await?;

        let mut txn = CatalogTransaction::begin(table.root(), CATALOG_SUB_STORE);
        let mut index_subs = Vec::new();
        for (attr, entry, _) in &persisted {
            txn.remove_entry(table.catalog_key_for(attr));
            if entry.indexed && !entry.is_primary_key {
                index_subs.push(table.index_sub_name(attr));
            }
        }
        if self.config.audit {
            audit::stage(
                &mut txn,
                &AuditRecord {
                    timestamp_ms: now_ms(),
                    origin: self.config.origin.clone(),
                    database: database.clone(),
                    table: table_name.clone(),
                    action: AuditAction::TableDropped,
                },
            );
        }
        commit_blocking(txn).await?;

        let root = table.root();
        for sub in index_subs {
            if let Err(e) = root.drop_sub_store(&sub) {
                log::warn!("dropping index sub-store {}: {}", sub, e);
            }
        }

        self.registry.remove(database, table_name);
        // Any in-flight build for this table observes the bump and aborts.
        table.bump_schema_version();
        self.emit(crate::signal::SignalKind::SchemaChange, database, table_name);
        log::info!("dropped table metadata for {}.{}", database, table_name);
        Ok(())
    }

    /// Creation path: resolves the store, then either adopts a definition a
    /// sibling process persisted since our last scan or creates one fresh.
    async fn create_or_adopt(&self, spec: TableSpec) -> Result<Arc<Table>> {
        let (path, legacy) = layout::resolve_store_path(&self.config, &spec.database, &spec.table)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CatalogError::store_open(path.clone(), keel_store::StoreError::Io(e.to_string()))
            })?;
        }
        let store = self.lifecycle.open(&path)?;
        let catalog_sub = store.open_sub_store(CATALOG_SUB_STORE, SubStoreOptions::default())?;

        let persisted = read_table_entries(&catalog_sub, legacy, &spec.table).await?;
        if persisted.iter().any(|(_, entry, _)| entry.is_primary_key) {
            let discovery = Discovery {
                config: &self.config,
                lifecycle: &self.lifecycle,
                registry: &self.registry,
            };
            let attrs = persisted
                .into_iter()
                .map(|(attr, entry, _)| (attr, entry))
                .collect();
            if let Some(table) = discovery.materialize(
                &store,
                &catalog_sub,
                &spec.database,
                &spec.table,
                legacy,
                attrs,
            )? {
                log::debug!(
                    "adopted on-disk definition of {}.{} during ensure",
                    spec.database,
                    spec.table
                );
                return self.apply_spec(table, spec).await;
            }
        }

        self.create_fresh(store, catalog_sub, legacy, spec).await
    }

    async fn create_fresh(
        &self,
        store: Arc<dyn RootStore>,
        catalog_sub: Arc<dyn SubStore>,
        legacy: bool,
        spec: TableSpec,
    ) -> Result<Arc<Table>> {
        let segment = if legacy { None } else { Some(&spec.table) };
        let primary =
            store.open_sub_store(&layout::data_sub_store(segment), SubStoreOptions::primary())?;

        // Records can outlive their catalog entries: a metadata drop leaves
        // the primary sub-store intact. An index requested at creation is only
        // complete immediately when there is nothing to backfill.
        let has_records = {
            let primary = Arc::clone(&primary);
            let options = RangeOptions {
                start: None,
                end: None,
                reverse: false,
                limit: Some(1),
            };
            !tokio::task::spawn_blocking(move || primary.get_range(&options))
                .await
                .map_err(|e| CatalogError::Task(e.to_string()))??
                .is_empty()
        };

        let now = now_ms();
        let mut plans = Vec::new();
        let mut attributes: Vec<Attribute> = Vec::with_capacity(spec.attributes.len() + 1);
        if !spec.attributes.iter().any(|a| a.is_primary_key) {
            attributes.push(Attribute::primary_key("id"));
        }
        for requested in &spec.attributes {
            let indexed = requested.indexed && !requested.is_primary_key;
            let build = if indexed && has_records {
                plans.push(IndexPlan {
                    attribute: requested.name.clone(),
                    fencing_token: 1,
                });
                IndexBuildState::InProgress {
                    checkpoint: None,
                    lease: self.new_lease(1, now),
                }
            } else if indexed {
                IndexBuildState::Complete
            } else {
                IndexBuildState::NotStarted
            };
            let attr = Attribute {
                name: requested.name.clone(),
                indexed,
                is_primary_key: requested.is_primary_key,
                schema_defined: spec.schema_defined,
                origins: spec.origin.iter().cloned().collect(),
                build,
            };
            if attr.is_primary_key {
                attributes.insert(0, attr);
            } else {
                attributes.push(attr);
            }
        }

        let table_id = allocate_table_id(&catalog_sub).await?;
        let audit_sub = if self.config.audit {
            Some(store.open_sub_store(layout::AUDIT_SUB_STORE, SubStoreOptions::default())?)
        } else {
            None
        };
        let mut indexes = std::collections::HashMap::new();
        for attr in attributes.iter().filter(|a| a.indexed) {
            let sub = store.open_sub_store(
                &layout::index_sub_store(segment, &attr.name),
                SubStoreOptions::index(),
            )?;
            indexes.insert(attr.name.clone(), sub);
        }

        let mut txn = CatalogTransaction::begin(Arc::clone(&store), CATALOG_SUB_STORE);
        for attr in &attributes {
            txn.put_entry(
                keel_commons::catalog_key::catalog_key(segment, &attr.name),
                &CatalogEntry::from_attribute(attr, table_id),
            )?;
        }
        if self.config.audit {
            audit::stage(
                &mut txn,
                &AuditRecord {
                    timestamp_ms: now_ms(),
                    origin: self.config.origin.clone(),
                    database: spec.database.clone(),
                    table: spec.table.clone(),
                    action: AuditAction::TableCreated,
                },
            );
        }
        commit_blocking(txn).await?;

        let table = Arc::new(Table::new(
            spec.database.clone(),
            spec.table.clone(),
            crate::table::TableState {
                id: table_id,
                legacy,
                attributes,
                root: store,
                catalog: catalog_sub,
                primary,
                audit: audit_sub,
                indexes,
            },
        ));
        self.registry.insert(Arc::clone(&table));
        self.registry.notify(&table);
        self.emit(
            crate::signal::SignalKind::SchemaChange,
            &spec.database,
            &spec.table,
        );
        log::info!(
            "created table {}.{} (id {}, {} attributes)",
            spec.database,
            spec.table,
            table_id,
            table.attributes().len()
        );
        if !plans.is_empty() {
            self.spawn_indexing(Arc::clone(&table), plans, Vec::new());
        }
        Ok(table)
    }

    /// Diff path: reconciles the declaration against the persisted entries of
    /// an existing table.
    async fn apply_spec(&self, table: Arc<Table>, spec: TableSpec) -> Result<Arc<Table>> {
        let catalog_sub = table.catalog_sub();
        // Diff against a fresh persisted read, not the in-memory snapshot: a
        // sibling process may have mutated the catalog since our last scan.
        let persisted = read_table_entries(&catalog_sub, table.is_legacy(), table.name()).await?;
        let mut by_name: BTreeMap<AttributeName, (CatalogEntry, Version)> = persisted
            .into_iter()
            .map(|(attr, entry, version)| (attr, (entry, version)))
            .collect();

        let mut txn = CatalogTransaction::begin(table.root(), CATALOG_SUB_STORE);
        let mut diff = SpecDiff {
            plans: Vec::new(),
            subs_to_drop: Vec::new(),
            final_entries: by_name
                .iter()
                .map(|(name, (entry, _))| (name.clone(), entry.clone()))
                .collect(),
            changed: false,
        };
        let now = now_ms();

        for requested in &spec.attributes {
            match by_name.remove(&requested.name) {
                None => self.diff_new_attribute(&table, &spec, requested, now, &mut txn, &mut diff)?,
                Some((entry, version)) => {
                    self.diff_existing_attribute(
                        &table, &spec, requested, entry, version, now, &catalog_sub, &mut txn,
                        &mut diff,
                    )
                    .await?
                }
            }
        }

        // Entries the caller no longer declares.
        let requested_names: HashSet<&AttributeName> =
            spec.attributes.iter().map(|a| &a.name).collect();
        for (name, (entry, _)) in &by_name {
            if requested_names.contains(name) || entry.is_primary_key {
                continue;
            }
            self.diff_released_attribute(&table, &spec, name, entry, &mut txn, &mut diff)?;
        }

        if !diff.changed && diff.plans.is_empty() && diff.subs_to_drop.is_empty() {
            log::debug!(
                "ensure_table for {}.{} matched persisted state; no-op",
                spec.database,
                spec.table
            );
            return Ok(table);
        }

        commit_blocking(txn).await?;
        self.install_state(&table, &diff, &spec)?;
        table.bump_schema_version();
        self.registry.notify(&table);
        self.emit(
            crate::signal::SignalKind::SchemaChange,
            &spec.database,
            &spec.table,
        );
        log::info!(
            "ensured table {}.{}: schema version {}, {} index builds scheduled, {} indexes dropped",
            spec.database,
            spec.table,
            table.schema_version(),
            diff.plans.len(),
            diff.subs_to_drop.len()
        );

        if !diff.plans.is_empty() || !diff.subs_to_drop.is_empty() {
            self.spawn_indexing(Arc::clone(&table), diff.plans, diff.subs_to_drop);
        }
        Ok(table)
    }

    /// An attribute the persisted catalog has never seen.
    fn diff_new_attribute(
        &self,
        table: &Arc<Table>,
        spec: &TableSpec,
        requested: &AttributeSpec,
        now: u64,
        txn: &mut CatalogTransaction,
        diff: &mut SpecDiff,
    ) -> Result<()> {
        if requested.is_primary_key {
            return Err(CatalogError::SchemaConflict {
                database: spec.database.clone(),
                table: spec.table.clone(),
                attribute: requested.name.clone(),
                reason: "table already has a primary key".to_string(),
            });
        }
        let entry = CatalogEntry {
            attribute: requested.name.clone(),
            indexed: requested.indexed,
            is_primary_key: false,
            schema_defined: spec.schema_defined,
            table_id: table.id(),
            origins: spec.origin.iter().cloned().collect(),
            build: if requested.indexed {
                IndexBuildState::InProgress {
                    checkpoint: None,
                    lease: self.new_lease(1, now),
                }
            } else {
                IndexBuildState::NotStarted
            },
        };
        txn.put_entry(table.catalog_key_for(&requested.name), &entry)?;
        if requested.indexed {
            diff.plans.push(IndexPlan {
                attribute: requested.name.clone(),
                fencing_token: 1,
            });
        }
        if self.config.audit {
            audit::stage(
                txn,
                &AuditRecord {
                    timestamp_ms: now,
                    origin: self.config.origin.clone(),
                    database: spec.database.clone(),
                    table: spec.table.clone(),
                    action: AuditAction::AttributeAdded(requested.name.clone()),
                },
            );
        }
        diff.final_entries.insert(requested.name.clone(), entry);
        diff.changed = true;
        Ok(())
    }

    /// An attribute both declared and persisted: reconcile flags, origins, and
    /// index build state.
    #[allow(clippy::too_many_arguments)]
    async fn diff_existing_attribute(
        &self,
        table: &Arc<Table>,
        spec: &TableSpec,
        requested: &AttributeSpec,
        entry: CatalogEntry,
        version: Version,
        now: u64,
        catalog_sub: &Arc<dyn SubStore>,
        txn: &mut CatalogTransaction,
        diff: &mut SpecDiff,
    ) -> Result<()> {
        if requested.is_primary_key != entry.is_primary_key {
            if spec.origin.is_some() {
                return Err(CatalogError::SchemaConflict {
                    database: spec.database.clone(),
                    table: spec.table.clone(),
                    attribute: requested.name.clone(),
                    reason: "primary-key flag conflicts with persisted definition".to_string(),
                });
            }
            log::debug!(
                "keeping persisted primary-key flag for {}.{}.{}",
                spec.database,
                spec.table,
                requested.name
            );
        }

        let mut updated = entry.clone();
        let mut passive_change = false;
        if let Some(origin) = &spec.origin {
            if updated.origins.insert(origin.clone()) {
                passive_change = true;
            }
        }
        if spec.schema_defined && !updated.schema_defined {
            updated.schema_defined = true;
            passive_change = true;
        }

        let wants_index = requested.indexed && !entry.is_primary_key;
        if wants_index && !entry.indexed {
            // Newly required index: the claim is a conditional write on this
            // entry, carrying the passive changes along with it.
            if let Some(plan) = self
                .claim_index(catalog_sub, table.catalog_key_for(&requested.name), updated.clone(), version, now)
                .await?
            {
                diff.final_entries.insert(requested.name.clone(), plan.1);
                diff.plans.push(plan.0);
                diff.changed = true;
            }
            return Ok(());
        }

        if !requested.indexed && entry.indexed {
            // Un-indexing is only honored when the caller is the sole origin.
            let sole_owner = match &spec.origin {
                Some(origin) => entry.origins.iter().all(|o| o == origin),
                None => true,
            };
            if sole_owner {
                updated.indexed = false;
                updated.build = IndexBuildState::NotStarted;
                txn.put_entry(table.catalog_key_for(&requested.name), &updated)?;
                diff.subs_to_drop.push(table.index_sub_name(&requested.name));
                diff.final_entries.insert(requested.name.clone(), updated);
                diff.changed = true;
                return Ok(());
            }
            log::debug!(
                "keeping index on {}.{}.{}: other origins still declare it",
                spec.database,
                spec.table,
                requested.name
            );
        }

        if wants_index && entry.indexed {
            // Already indexed; a build abandoned under an expired lease is
            // re-claimed and resumed from its checkpoint.
            if let IndexBuildState::InProgress { lease, .. } = &entry.build {
                if !lease.is_held_by(&self.worker_id, now) && lease.is_expired(now) {
                    if let Some(plan) = self
                        .claim_index(
                            catalog_sub,
                            table.catalog_key_for(&requested.name),
                            updated.clone(),
                            version,
                            now,
                        )
                        .await?
                    {
                        log::info!(
                            "re-claiming abandoned index build for {}.{}.{}",
                            spec.database,
                            spec.table,
                            requested.name
                        );
                        diff.final_entries.insert(requested.name.clone(), plan.1);
                        diff.plans.push(plan.0);
                        diff.changed = true;
                    }
                    return Ok(());
                }
            }
        }

        if passive_change {
            txn.put_entry(table.catalog_key_for(&requested.name), &updated)?;
            diff.changed = true;
        }
        diff.final_entries.insert(requested.name.clone(), updated);
        Ok(())
    }

    /// A persisted attribute the caller no longer declares.
    fn diff_released_attribute(
        &self,
        table: &Arc<Table>,
        spec: &TableSpec,
        name: &AttributeName,
        entry: &CatalogEntry,
        txn: &mut CatalogTransaction,
        diff: &mut SpecDiff,
    ) -> Result<()> {
        let mut remaining = entry.origins.clone();
        let released = match &spec.origin {
            Some(origin) => remaining.remove(origin),
            None => false,
        };

        if entry.indexed && remaining.is_empty() {
            // No origin still declares this index: drop entry and sub-store.
            txn.remove_entry(table.catalog_key_for(name));
            diff.subs_to_drop.push(table.index_sub_name(name));
            diff.final_entries.remove(name);
            diff.changed = true;
            if self.config.audit {
                audit::stage(
                    txn,
                    &AuditRecord {
                        timestamp_ms: now_ms(),
                        origin: self.config.origin.clone(),
                        database: spec.database.clone(),
                        table: spec.table.clone(),
                        action: AuditAction::AttributeRemoved(name.clone()),
                    },
                );
            }
        } else if released {
            let mut updated = entry.clone();
            updated.origins = remaining;
            txn.put_entry(table.catalog_key_for(name), &updated)?;
            diff.final_entries.insert(name.clone(), updated);
            diff.changed = true;
        }
        Ok(())
    }

    /// Conditionally writes the claimed entry. Returns the plan and final
    /// entry on success, `None` when a racing claimant won and holds a live
    /// lease.
    async fn claim_index(
        &self,
        catalog_sub: &Arc<dyn SubStore>,
        key: Vec<u8>,
        mut updated: CatalogEntry,
        expected: Version,
        now: u64,
    ) -> Result<Option<(IndexPlan, CatalogEntry)>> {
        let (checkpoint, fencing_token) = match &updated.build {
            IndexBuildState::InProgress { checkpoint, lease } => {
                (checkpoint.clone(), lease.fencing_token + 1)
            }
            _ => (None, 1),
        };
        updated.indexed = true;
        updated.build = IndexBuildState::InProgress {
            checkpoint,
            lease: self.new_lease(fencing_token, now),
        };
        let encoded = updated.encode().map_err(|e| CatalogError::CorruptEntry {
            key: String::from_utf8_lossy(&key).into_owned(),
            reason: e.to_string(),
        })?;

        let won = {
            let catalog = Arc::clone(catalog_sub);
            let key = key.clone();
            tokio::task::spawn_blocking(move || catalog.conditional_put(&key, Some(expected), &encoded))
                .await
                .map_err(|e| CatalogError::Task(e.to_string()))??
        };
        if won {
            let attribute = updated.attribute.clone();
            return Ok(Some((
                IndexPlan {
                    attribute,
                    fencing_token,
                },
                updated,
            )));
        }

        // Lost the race. The winner's build state stands, but the caller's
        // origin and schema flag must still land on the winner's entry, or a
        // later release by the winner's origin would drop an index this
        // caller declares.
        let current = {
            let catalog = Arc::clone(catalog_sub);
            let key = key.clone();
            let origins = updated.origins.clone();
            let schema_defined = updated.schema_defined;
            tokio::task::spawn_blocking(move || {
                merge_lost_claim(&catalog, &key, &origins, schema_defined)
            })
            .await
            .map_err(|e| CatalogError::Task(e.to_string()))??
        };
        match current {
            Some(entry) => {
                if let Some(lease) = entry.build.lease() {
                    if !lease.is_expired(now_ms()) && lease.owner != self.worker_id {
                        log::info!(
                            "index claim for {} lost to worker {}; standing down",
                            updated.attribute,
                            lease.owner
                        );
                        return Ok(None);
                    }
                }
                log::warn!(
                    "index claim for {} lost to a concurrent catalog write; deferring to next ensure",
                    updated.attribute
                );
            }
            None => log::warn!(
                "could not record ownership of {} after a lost index claim",
                updated.attribute
            ),
        }
        Ok(None)
    }

    /// Rebuilds the table's in-memory state from the reconciled entries.
    /// Surviving attributes keep their positions; new ones append in
    /// declaration order.
    fn install_state(&self, table: &Arc<Table>, diff: &SpecDiff, spec: &TableSpec) -> Result<()> {
        let mut ordered: Vec<AttributeName> = table
            .attributes()
            .into_iter()
            .map(|a| a.name)
            .filter(|name| diff.final_entries.contains_key(name))
            .collect();
        for requested in &spec.attributes {
            if diff.final_entries.contains_key(&requested.name) && !ordered.contains(&requested.name)
            {
                ordered.push(requested.name.clone());
            }
        }
        for name in diff.final_entries.keys() {
            if !ordered.contains(name) {
                ordered.push(name.clone());
            }
        }

        let mut attributes: Vec<Attribute> = Vec::with_capacity(ordered.len());
        for name in &ordered {
            if let Some(entry) = diff.final_entries.get(name) {
                let attr = entry.to_attribute();
                if attr.is_primary_key {
                    attributes.insert(0, attr);
                } else {
                    attributes.push(attr);
                }
            }
        }

        // Sub-store handles are opened outside the state lock.
        let root = table.root();
        let mut new_indexes = std::collections::HashMap::new();
        for attr in attributes.iter().filter(|a| a.indexed && !a.is_primary_key) {
            let sub = match table.index(&attr.name) {
                Some(sub) => sub,
                None => root.open_sub_store(
                    &table.index_sub_name(&attr.name),
                    SubStoreOptions::index(),
                )?,
            };
            new_indexes.insert(attr.name.clone(), sub);
        }

        table.write_state(|state| {
            state.attributes = attributes;
            state.indexes = new_indexes;
        });
        Ok(())
    }

    fn new_lease(&self, fencing_token: u64, now: u64) -> IndexingLease {
        IndexingLease {
            owner: self.worker_id.clone(),
            expires_at_ms: now + self.config.lease_duration.as_millis() as u64,
            fencing_token,
        }
    }
}

fn validate_spec(spec: &TableSpec) -> Result<()> {
    let mut seen = HashSet::new();
    let mut primary_keys = 0usize;
    for attr in &spec.attributes {
        if !seen.insert(&attr.name) {
            return Err(CatalogError::SchemaConflict {
                database: spec.database.clone(),
                table: spec.table.clone(),
                attribute: attr.name.clone(),
                reason: "attribute declared twice".to_string(),
            });
        }
        if attr.is_primary_key {
            primary_keys += 1;
            if primary_keys > 1 {
                return Err(CatalogError::SchemaConflict {
                    database: spec.database.clone(),
                    table: spec.table.clone(),
                    attribute: attr.name.clone(),
                    reason: "multiple primary-key attributes declared".to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Folds a lost claimant's origins and schema flag into the current entry,
/// leaving the winner's build state untouched. Returns the entry as persisted,
/// `None` when the entry vanished or the merge could not be applied.
fn merge_lost_claim(
    catalog: &Arc<dyn SubStore>,
    key: &[u8],
    origins: &BTreeSet<String>,
    schema_defined: bool,
) -> Result<Option<CatalogEntry>> {
    // Two attempts: the winner may checkpoint between our read and write.
    for _ in 0..2 {
        let Some((raw, version)) = catalog.get(key)? else {
            return Ok(None);
        };
        let mut entry = match CatalogEntry::decode(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("corrupt catalog entry during claim merge: {}", e);
                return Ok(None);
            }
        };
        let mut changed = false;
        for origin in origins {
            changed |= entry.origins.insert(origin.clone());
        }
        if schema_defined && !entry.schema_defined {
            entry.schema_defined = true;
            changed = true;
        }
        if !changed {
            return Ok(Some(entry));
        }
        let encoded = entry.encode().map_err(|e| CatalogError::CorruptEntry {
            key: String::from_utf8_lossy(key).into_owned(),
            reason: e.to_string(),
        })?;
        if catalog.conditional_put(key, Some(version), &encoded)? {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

/// Reads every persisted catalog entry of one table, with record versions for
/// conditional writes.
pub(crate) async fn read_table_entries(
    catalog_sub: &Arc<dyn SubStore>,
    legacy: bool,
    table: &TableName,
) -> Result<Vec<(AttributeName, CatalogEntry, Version)>> {
    let catalog = Arc::clone(catalog_sub);
    let table = table.clone();
    tokio::task::spawn_blocking(move || -> Result<Vec<(AttributeName, CatalogEntry, Version)>> {
        let options = if legacy {
            RangeOptions::all()
        } else {
            RangeOptions::prefix(keel_commons::catalog_key::table_prefix(&table))
        };
        let mut entries = Vec::new();
        for record in catalog.get_range(&options)? {
            let (segment, attr) = match parse_catalog_key(&record.key) {
                Ok(parsed) => parsed,
                Err(e) => {
                    log::warn!("skipping malformed catalog key: {}", e);
                    continue;
                }
            };
            let matches = if legacy {
                segment.is_none()
            } else {
                segment.as_ref() == Some(&table)
            };
            if !matches {
                continue;
            }
            match CatalogEntry::decode(&record.value) {
                Ok(entry) => entries.push((attr, entry, record.version)),
                Err(e) => log::warn!(
                    "skipping corrupt catalog entry {:?}: {}",
                    String::from_utf8_lossy(&record.key),
                    e
                ),
            }
        }
        Ok(entries)
    })
    .await
    .map_err(|e| CatalogError::Task(e.to_string()))?
}

/// Allocates the next table id for a root store: one past the highest id any
/// persisted entry carries.
async fn allocate_table_id(catalog_sub: &Arc<dyn SubStore>) -> Result<TableId> {
    let catalog = Arc::clone(catalog_sub);
    tokio::task::spawn_blocking(move || -> Result<TableId> {
        let mut max_id: Option<TableId> = None;
        for record in catalog.get_range(&RangeOptions::all())? {
            if let Ok(entry) = CatalogEntry::decode(&record.value) {
                max_id = Some(max_id.map_or(entry.table_id, |m| m.max(entry.table_id)));
            }
        }
        Ok(max_id.map_or(TableId::new(1), |m| m.next()))
    })
    .await
    .map_err(|e| CatalogError::Task(e.to_string()))?
}

/// Commits a transaction off the async runtime.
async fn commit_blocking(txn: CatalogTransaction) -> Result<()> {
    tokio::task::spawn_blocking(move || txn.commit())
        .await
        .map_err(|e| CatalogError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::LogSignal;
    use keel_commons::{CatalogConfig, WorkerId};
    use keel_store::{RocksDriver, StoreDriver};
    use tempfile::TempDir;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_lost_claim_stands_down_but_records_ownership() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::new(
            CatalogConfig::with_root(dir.path()),
            Arc::new(RocksDriver::new()),
            Arc::new(LogSignal),
        );
        let table = catalog
            .ensure_table(
                TableSpec::new("sales", "orders")
                    .attribute(AttributeSpec::primary_key("orderId"))
                    .attribute(AttributeSpec::new("status"))
                    .origin("svc-a"),
            )
            .await
            .unwrap();

        let status = AttributeName::new("status");
        let sub = table.catalog_sub();
        let key = table.catalog_key_for(&status);
        let (raw, version) = sub.get(&key).unwrap().unwrap();

        // A sibling wins the claim after our read of the entry.
        let mut winner = CatalogEntry::decode(&raw).unwrap();
        winner.indexed = true;
        winner.build = IndexBuildState::InProgress {
            checkpoint: None,
            lease: IndexingLease {
                owner: WorkerId::new("sibling"),
                expires_at_ms: now_ms() + 60_000,
                fencing_token: 3,
            },
        };
        assert!(sub
            .conditional_put(&key, Some(version), &winner.encode().unwrap())
            .unwrap());

        // Claim against the version observed before the sibling's write.
        let mut stale = CatalogEntry::decode(&raw).unwrap();
        stale.origins.insert("svc-b".to_string());
        let claimed = catalog
            .claim_index(&sub, key.clone(), stale, version, now_ms())
            .await
            .unwrap();
        assert!(claimed.is_none());

        let (raw, _) = sub.get(&key).unwrap().unwrap();
        let entry = CatalogEntry::decode(&raw).unwrap();
        // The winner's lease stands untouched.
        match &entry.build {
            IndexBuildState::InProgress { lease, .. } => {
                assert_eq!(lease.owner, WorkerId::new("sibling"));
                assert_eq!(lease.fencing_token, 3);
            }
            other => panic!("unexpected build state: {other:?}"),
        }
        // The loser's ownership declaration landed anyway.
        assert!(entry.origins.contains("svc-a"));
        assert!(entry.origins.contains("svc-b"));
    }

    #[test]
    fn test_merge_preserves_winner_entry_when_nothing_to_add() {
        let dir = TempDir::new().unwrap();
        let driver = RocksDriver::new();
        let store = driver.open(&dir.path().join("t.keel")).unwrap();
        let sub = store
            .open_sub_store(CATALOG_SUB_STORE, SubStoreOptions::default())
            .unwrap();

        let mut entry = CatalogEntry::from_attribute(
            &Attribute::indexed("status"),
            keel_commons::TableId::new(1),
        );
        entry.origins.insert("svc-a".to_string());
        sub.put(b"orders/status", &entry.encode().unwrap()).unwrap();
        let (_, version) = sub.get(b"orders/status").unwrap().unwrap();

        // No new origin, no schema flag: the merge must not touch the record.
        let origins: BTreeSet<String> = ["svc-a".to_string()].into();
        let merged = merge_lost_claim(&sub, b"orders/status", &origins, false)
            .unwrap()
            .unwrap();
        assert_eq!(merged, entry);
        let (_, after) = sub.get(b"orders/status").unwrap().unwrap();
        assert_eq!(after, version);
    }
}

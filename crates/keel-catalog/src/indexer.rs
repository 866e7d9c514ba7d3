//! Resumable background index builds.
//!
//! One run per `ensure_table` call that scheduled work: drops released index
//! sub-stores, then builds each claimed index by scanning the table's primary
//! sub-store in batches from the persisted checkpoint. Every index entry write
//! is guarded by the source record's version, so a record mutated by a live
//! writer after the scan read it is skipped (the writer's own batch carries
//! the entry for the final value). Progress is checkpointed into the attribute's
//! catalog entry at a fixed record interval, renewing the lease; a worker whose
//! lease was superseded observes the foreign fencing token at the next
//! checkpoint and aborts.
//!
//! A build also aborts when the table's schema version advances past the one
//! the run started with: the ensure call that bumped it has scheduled the
//! authoritative follow-up work.
//!
//! Per-record failures (undecodable payloads) are logged and skipped, never
//! fatal: indexing is idempotent and the record is repaired by whichever path
//! next writes it.

use crate::error::{CatalogError, Result};
use crate::signal::{SchemaChangeEvent, SchemaSignal, SignalKind};
use crate::table::Table;
use crate::write::derived_index_values;
use keel_commons::{
    now_ms, AttributeName, CatalogConfig, CatalogEntry, IndexBuildState, IndexingLease, WorkerId,
};
use keel_store::{RangeOptions, StoreError, SubStore, Version};
use std::sync::Arc;

/// One index build scheduled by an ensure call, under an already-persisted
/// lease claim.
#[derive(Debug, Clone)]
pub(crate) struct IndexPlan {
    pub attribute: AttributeName,
    /// Fencing token of our claim; progress writes verify it is still ours.
    pub fencing_token: u64,
}

enum BuildOutcome {
    Completed,
    Aborted,
}

/// Executes background index builds and sub-store drops.
pub(crate) struct BackgroundIndexer {
    config: CatalogConfig,
    worker_id: WorkerId,
    signal: Arc<dyn SchemaSignal>,
}

impl BackgroundIndexer {
    pub fn new(config: CatalogConfig, worker_id: WorkerId, signal: Arc<dyn SchemaSignal>) -> Self {
        Self {
            config,
            worker_id,
            signal,
        }
    }

    /// Runs one scheduled batch of work for `table`.
    pub async fn run(&self, table: Arc<Table>, plans: Vec<IndexPlan>, subs_to_remove: Vec<String>) {
        // Released indexes are reclaimed first; their storage must go even if
        // a build below aborts.
        if !subs_to_remove.is_empty() {
            let root = table.root();
            let result = tokio::task::spawn_blocking(move || {
                for sub in subs_to_remove {
                    if let Err(e) = root.drop_sub_store(&sub) {
                        log::warn!("dropping index sub-store {}: {}", sub, e);
                    }
                }
            })
            .await;
            if let Err(e) = result {
                log::error!("index sub-store drop task failed: {}", e);
            }
        }
        if plans.is_empty() {
            return;
        }

        let started_version = table.schema_version();
        let mut aborted = false;
        for plan in &plans {
            match self.build_index(&table, plan, started_version).await {
                Ok(BuildOutcome::Completed) => {}
                Ok(BuildOutcome::Aborted) => {
                    aborted = true;
                    break;
                }
                Err(e) => {
                    log::error!(
                        "index build for {}.{}.{} failed: {}",
                        table.database(),
                        table.name(),
                        plan.attribute,
                        e
                    );
                    aborted = true;
                    break;
                }
            }
        }

        if !aborted {
            self.signal.signal(&SchemaChangeEvent {
                origin: self.config.origin.clone(),
                kind: SignalKind::IndexingFinished,
                database: table.database().clone(),
                table: table.name().clone(),
            });
            log::info!(
                "indexing finished for {}.{} ({} attributes)",
                table.database(),
                table.name(),
                plans.len()
            );
        }
    }

    async fn build_index(
        &self,
        table: &Arc<Table>,
        plan: &IndexPlan,
        started_version: u64,
    ) -> Result<BuildOutcome> {
        let attribute = plan.attribute.clone();
        let primary = table.primary();
        let primary_name = table.primary_sub_name();
        let index_name = table.index_sub_name(&attribute);
        let catalog_sub = table.catalog_sub();
        let entry_key = table.catalog_key_for(&attribute);
        let root = table.root();

        // Resume from the checkpoint our claim carried forward.
        let mut checkpoint: Option<Vec<u8>> = {
            let catalog = Arc::clone(&catalog_sub);
            let key = entry_key.clone();
            tokio::task::spawn_blocking(move || catalog.get(&key))
                .await
                .map_err(|e| CatalogError::Task(e.to_string()))??
                .and_then(|(raw, _)| CatalogEntry::decode(&raw).ok())
                .and_then(|entry| entry.build.checkpoint().map(|c| c.to_vec()))
        };
        if checkpoint.is_some() {
            log::info!(
                "resuming index build for {}.{}.{} from checkpoint",
                table.database(),
                table.name(),
                attribute
            );
        }

        let mut since_checkpoint = 0usize;
        let mut outstanding = 0usize;
        let mut since_yield = 0usize;
        let mut scanned = 0u64;

        loop {
            if table.schema_version() != started_version {
                log::info!(
                    "aborting index build for {}.{}.{}: schema changed underneath it",
                    table.database(),
                    table.name(),
                    attribute
                );
                return Ok(BuildOutcome::Aborted);
            }

            let batch = {
                let primary = Arc::clone(&primary);
                // Exclusive resume: the checkpoint key itself is already done.
                let start = checkpoint.as_ref().map(|key| {
                    let mut next = key.clone();
                    next.push(0x00);
                    next
                });
                let options = RangeOptions {
                    start,
                    end: None,
                    reverse: false,
                    limit: Some(self.config.scan_batch_size),
                };
                tokio::task::spawn_blocking(move || primary.get_range(&options))
                    .await
                    .map_err(|e| CatalogError::Task(e.to_string()))??
            };
            let Some(last_key) = batch.last().map(|record| record.key.clone()) else {
                break;
            };

            // Derive entries on the async side, write them in one blocking hop.
            let mut writes: Vec<(Vec<u8>, Vec<u8>, Version)> = Vec::new();
            for record in &batch {
                let parsed: serde_json::Value = match serde_json::from_slice(&record.value) {
                    Ok(value) => value,
                    Err(e) => {
                        log::warn!(
                            "skipping unreadable record {:?} in {}.{}: {}",
                            String::from_utf8_lossy(&record.key),
                            table.database(),
                            table.name(),
                            e
                        );
                        continue;
                    }
                };
                for derived in derived_index_values(&parsed, &attribute) {
                    writes.push((
                        crate::layout::index_entry_key(&derived, &record.key),
                        record.key.clone(),
                        record.version,
                    ));
                }
            }

            let applied = {
                let root = Arc::clone(&root);
                let primary_name = primary_name.clone();
                let index_name = index_name.clone();
                tokio::task::spawn_blocking(move || -> Result<usize> {
                    let mut applied = 0usize;
                    for (index_key, primary_key, guard) in writes {
                        match root.guarded_put(
                            &primary_name,
                            &primary_key,
                            guard,
                            &index_name,
                            &index_key,
                            &primary_key,
                        ) {
                            Ok(true) => applied += 1,
                            Ok(false) => {
                                // A live writer got there first; its batch
                                // carries the entry for the final value.
                                log::debug!("record changed under scan; skipping index entry");
                            }
                            Err(e @ StoreError::Closed(_)) => return Err(e.into()),
                            Err(e) => {
                                log::warn!("index entry write failed, skipping record: {}", e);
                            }
                        }
                    }
                    Ok(applied)
                })
                .await
                .map_err(|e| CatalogError::Task(e.to_string()))??
            };

            scanned += batch.len() as u64;
            since_checkpoint += batch.len();
            outstanding += applied;
            since_yield += applied;
            checkpoint = Some(last_key);

            if outstanding >= self.config.index_high_water {
                let root = Arc::clone(&root);
                tokio::task::spawn_blocking(move || root.flush())
                    .await
                    .map_err(|e| CatalogError::Task(e.to_string()))??;
                outstanding = 0;
            }
            if since_yield >= self.config.index_low_water {
                tokio::task::yield_now().await;
                since_yield = 0;
            }

            if since_checkpoint >= self.config.checkpoint_interval {
                if !self
                    .persist_progress(&catalog_sub, &entry_key, plan, checkpoint.clone(), false)
                    .await?
                {
                    log::info!(
                        "index build for {}.{}.{} superseded; aborting",
                        table.database(),
                        table.name(),
                        attribute
                    );
                    return Ok(BuildOutcome::Aborted);
                }
                since_checkpoint = 0;
            }
        }

        if !self
            .persist_progress(&catalog_sub, &entry_key, plan, None, true)
            .await?
        {
            return Ok(BuildOutcome::Aborted);
        }
        table.write_state(|state| {
            if let Some(attr) = state.attributes.iter_mut().find(|a| a.name == attribute) {
                attr.build = IndexBuildState::Complete;
            }
        });
        if let Some(audit_sub) = table.audit_sub() {
            crate::audit::append(
                &audit_sub,
                &keel_commons::AuditRecord {
                    timestamp_ms: now_ms(),
                    origin: self.config.origin.clone(),
                    database: table.database().clone(),
                    table: table.name().clone(),
                    action: keel_commons::catalog::AuditAction::IndexingFinished(attribute.clone()),
                },
            );
        }
        log::info!(
            "built index for {}.{}.{} ({} records scanned)",
            table.database(),
            table.name(),
            attribute,
            scanned
        );
        Ok(BuildOutcome::Completed)
    }

    /// Persists a checkpoint and lease renewal, or the final `Complete` state.
    /// Returns `false` when our claim is no longer the live one.
    async fn persist_progress(
        &self,
        catalog_sub: &Arc<dyn SubStore>,
        entry_key: &[u8],
        plan: &IndexPlan,
        checkpoint: Option<Vec<u8>>,
        complete: bool,
    ) -> Result<bool> {
        let catalog = Arc::clone(catalog_sub);
        let key = entry_key.to_vec();
        let worker = self.worker_id.clone();
        let fencing_token = plan.fencing_token;
        let lease_ms = self.config.lease_duration.as_millis() as u64;
        tokio::task::spawn_blocking(move || -> Result<bool> {
            // Two attempts: an unrelated write to this entry (an ensure call
            // joining an origin) can fail the version guard without the lease
            // having changed hands.
            for _ in 0..2 {
                let Some((raw, version)) = catalog.get(&key)? else {
                    return Ok(false);
                };
                let mut entry = match CatalogEntry::decode(&raw) {
                    Ok(entry) => entry,
                    Err(e) => {
                        log::warn!("corrupt catalog entry during checkpoint: {}", e);
                        return Ok(false);
                    }
                };
                let ours = matches!(
                    &entry.build,
                    IndexBuildState::InProgress { lease, .. }
                        if lease.owner == worker && lease.fencing_token == fencing_token
                );
                if !ours {
                    return Ok(false);
                }
                entry.build = if complete {
                    IndexBuildState::Complete
                } else {
                    IndexBuildState::InProgress {
                        checkpoint: checkpoint.clone(),
                        lease: IndexingLease {
                            owner: worker.clone(),
                            expires_at_ms: now_ms() + lease_ms,
                            fencing_token,
                        },
                    }
                };
                let encoded = entry.encode().map_err(|e| CatalogError::CorruptEntry {
                    key: String::from_utf8_lossy(&key).into_owned(),
                    reason: e.to_string(),
                })?;
                if catalog.conditional_put(&key, Some(version), &encoded)? {
                    return Ok(true);
                }
            }
            Ok(false)
        })
        .await
        .map_err(|e| CatalogError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::ensure::{AttributeSpec, TableSpec};
    use keel_store::{RocksDriver, SubStoreOptions};
    use parking_lot::Mutex;
    use serde_json::json;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CapturingSignal(Mutex<Vec<SchemaChangeEvent>>);

    impl SchemaSignal for CapturingSignal {
        fn signal(&self, event: &SchemaChangeEvent) {
            self.0.lock().push(event.clone());
        }
    }

    impl CapturingSignal {
        fn kinds(&self) -> Vec<SignalKind> {
            self.0.lock().iter().map(|e| e.kind).collect()
        }
    }

    async fn orders_table(
        catalog: &Catalog,
        records: u32,
    ) -> std::sync::Arc<crate::table::Table> {
        let table = catalog
            .ensure_table(
                TableSpec::new("sales", "orders").attribute(AttributeSpec::primary_key("orderId")),
            )
            .await
            .unwrap();
        for i in 0..records {
            let pk = format!("ord-{:04}", i);
            table
                .put_record(pk.as_bytes(), &json!({"orderId": pk, "status": "open"}))
                .unwrap();
        }
        table
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_build_aborts_when_schema_version_advances() {
        let dir = TempDir::new().unwrap();
        let signal = Arc::new(CapturingSignal::default());
        let catalog = Catalog::new(
            CatalogConfig::with_root(dir.path()),
            Arc::new(RocksDriver::new()),
            Arc::clone(&signal) as Arc<dyn SchemaSignal>,
        );
        let table = orders_table(&catalog, 50).await;

        let indexer = BackgroundIndexer::new(
            catalog.config().clone(),
            catalog.worker_id().clone(),
            Arc::clone(&signal) as Arc<dyn SchemaSignal>,
        );
        let plan = IndexPlan {
            attribute: AttributeName::new("status"),
            fencing_token: 1,
        };

        // A second schema change lands before the build's first batch.
        let started = table.schema_version();
        table.bump_schema_version();
        let outcome = indexer.build_index(&table, &plan, started).await.unwrap();
        assert!(matches!(outcome, BuildOutcome::Aborted));

        // Nothing was written for the superseded generation.
        let idx = table
            .root()
            .open_sub_store(&table.index_sub_name(&plan.attribute), SubStoreOptions::index())
            .unwrap();
        assert!(idx.get_range(&RangeOptions::all()).unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_superseded_build_emits_no_finish_signal() {
        let dir = TempDir::new().unwrap();
        let signal = Arc::new(CapturingSignal::default());
        let catalog = Catalog::new(
            CatalogConfig::with_root(dir.path()),
            Arc::new(RocksDriver::new()),
            Arc::clone(&signal) as Arc<dyn SchemaSignal>,
        );
        let table = orders_table(&catalog, 5).await;

        // The entry is owned by a live sibling lease with a newer fencing
        // token; our run must stand down at completion and stay silent.
        let status = AttributeName::new("status");
        let foreign = CatalogEntry {
            attribute: status.clone(),
            indexed: true,
            is_primary_key: false,
            schema_defined: false,
            table_id: table.id(),
            origins: Default::default(),
            build: IndexBuildState::InProgress {
                checkpoint: None,
                lease: IndexingLease {
                    owner: WorkerId::new("sibling"),
                    expires_at_ms: now_ms() + 60_000,
                    fencing_token: 7,
                },
            },
        };
        let key = table.catalog_key_for(&status);
        table
            .catalog_sub()
            .put(&key, &foreign.encode().unwrap())
            .unwrap();
        table
            .root()
            .open_sub_store(&table.index_sub_name(&status), SubStoreOptions::index())
            .unwrap();

        let indexer = BackgroundIndexer::new(
            catalog.config().clone(),
            catalog.worker_id().clone(),
            Arc::clone(&signal) as Arc<dyn SchemaSignal>,
        );
        indexer
            .run(
                Arc::clone(&table),
                vec![IndexPlan {
                    attribute: status.clone(),
                    fencing_token: 1,
                }],
                Vec::new(),
            )
            .await;

        assert!(!signal.kinds().contains(&SignalKind::IndexingFinished));
        // The sibling's claim is untouched.
        let (raw, _) = table.catalog_sub().get(&key).unwrap().unwrap();
        let persisted = CatalogEntry::decode(&raw).unwrap();
        match &persisted.build {
            IndexBuildState::InProgress { lease, .. } => {
                assert_eq!(lease.owner, WorkerId::new("sibling"));
                assert_eq!(lease.fencing_token, 7);
            }
            other => panic!("unexpected build state: {other:?}"),
        }
    }
}

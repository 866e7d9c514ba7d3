//! The catalog engine facade.
//!
//! One `Catalog` per engine instance owns the store lifecycle manager, the
//! table registry, the schema-change signal transport, and the background
//! indexer. Discovery is lazy: the first registry access scans the configured
//! storage roots; `reload` re-runs the scan, preserving table reference
//! identity for surviving tables.

use crate::discovery::Discovery;
use crate::indexer::{BackgroundIndexer, IndexPlan};
use crate::lifecycle::StoreLifecycleManager;
use crate::registry::{TableListener, TableRegistry};
use crate::signal::{LogSignal, SchemaChangeEvent, SchemaSignal, SignalKind};
use crate::table::Table;
use keel_commons::{CatalogConfig, DatabaseName, TableName, WorkerId};
use keel_store::{RocksDriver, StoreDriver};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Table catalog and online-indexing engine.
pub struct Catalog {
    pub(crate) config: CatalogConfig,
    pub(crate) lifecycle: Arc<StoreLifecycleManager>,
    pub(crate) registry: Arc<TableRegistry>,
    pub(crate) signal: Arc<dyn SchemaSignal>,
    pub(crate) worker_id: WorkerId,
    pub(crate) indexer: Arc<BackgroundIndexer>,
    /// Guards discovery; `true` once the initial scan has run.
    discovered: tokio::sync::Mutex<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Catalog {
    /// Creates an engine over an explicit driver and signal transport.
    pub fn new(
        config: CatalogConfig,
        driver: Arc<dyn StoreDriver>,
        signal: Arc<dyn SchemaSignal>,
    ) -> Self {
        let worker_id = WorkerId::generate();
        let indexer = Arc::new(BackgroundIndexer::new(
            config.clone(),
            worker_id.clone(),
            Arc::clone(&signal),
        ));
        log::info!("catalog engine starting (worker {})", worker_id);
        Self {
            config,
            lifecycle: Arc::new(StoreLifecycleManager::new(driver)),
            registry: Arc::new(TableRegistry::new()),
            signal,
            worker_id,
            indexer,
            discovered: tokio::sync::Mutex::new(false),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Creates an engine over the RocksDB driver with log-only signaling.
    pub fn open(config: CatalogConfig) -> Self {
        Self::new(config, Arc::new(RocksDriver::new()), Arc::new(LogSignal))
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    /// Identity this engine instance writes into indexing leases.
    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Snapshot of every known database and table, running the initial
    /// discovery scan on first use.
    pub async fn get_databases(
        &self,
    ) -> HashMap<DatabaseName, HashMap<TableName, Arc<Table>>> {
        self.ensure_discovered().await;
        self.registry.snapshot()
    }

    /// Looks up a table by name, running discovery on first use.
    pub async fn get_table(
        &self,
        database: &DatabaseName,
        table: &TableName,
    ) -> Option<Arc<Table>> {
        self.ensure_discovered().await;
        self.registry.get(database, table)
    }

    /// Discards the discovered state and re-scans the storage roots. Tables
    /// still present on disk keep their registry objects (mutated in place);
    /// tables whose stores vanished are removed and their handles closed.
    pub async fn reset_databases(&self) {
        let mut discovered = self.discovered.lock().await;
        self.run_discovery().await;
        *discovered = true;
    }

    /// Alias for [`Self::reset_databases`], the externally-triggered reload.
    pub async fn reload(&self) {
        self.reset_databases().await;
    }

    /// Registers a callback for newly created or structurally changed tables.
    pub fn on_new_table(&self, listener: TableListener) {
        self.registry.on_new_table(listener);
    }

    /// Waits for every outstanding background indexing task to finish.
    pub async fn indexing_idle(&self) {
        loop {
            let handle = self.tasks.lock().pop();
            match handle {
                Some(handle) => {
                    if let Err(e) = handle.await {
                        log::error!("background indexing task panicked: {}", e);
                    }
                }
                None => return,
            }
        }
    }

    pub(crate) async fn ensure_discovered(&self) {
        let mut discovered = self.discovered.lock().await;
        if *discovered {
            return;
        }
        self.run_discovery().await;
        *discovered = true;
    }

    async fn run_discovery(&self) {
        let discovery = Discovery {
            config: &self.config,
            lifecycle: &self.lifecycle,
            registry: &self.registry,
        };
        let session = discovery.run().await;
        for (path, error) in &session.failures {
            log::error!("store unavailable at {}: {}", path.display(), error);
        }
    }

    pub(crate) fn emit(&self, kind: SignalKind, database: &DatabaseName, table: &TableName) {
        self.signal.signal(&SchemaChangeEvent {
            origin: self.config.origin.clone(),
            kind,
            database: database.clone(),
            table: table.clone(),
        });
    }

    /// Spawns a background indexing run and tracks its handle.
    pub(crate) fn spawn_indexing(
        &self,
        table: Arc<Table>,
        plans: Vec<IndexPlan>,
        subs_to_remove: Vec<String>,
    ) {
        let indexer = Arc::clone(&self.indexer);
        let handle = tokio::spawn(async move {
            indexer.run(table, plans, subs_to_remove).await;
        });
        self.tasks.lock().push(handle);
    }
}

//! Table registry: the in-memory database → table → attribute mapping.
//!
//! Single source of truth consulted by every other subsystem. Lock-free
//! concurrent access via DashMap; tables are shared as `Arc<Table>` so lookups
//! are cheap clones.

use crate::table::Table;
use dashmap::DashMap;
use keel_commons::{DatabaseName, TableName};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Callback invoked whenever a table is newly created or structurally changed.
pub type TableListener = Box<dyn Fn(&Arc<Table>) + Send + Sync>;

/// In-memory mapping of databases to their tables.
pub struct TableRegistry {
    databases: DashMap<DatabaseName, Arc<DashMap<TableName, Arc<Table>>>>,
    listeners: Mutex<Vec<TableListener>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self {
            databases: DashMap::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Looks up a table by name.
    pub fn get(&self, database: &DatabaseName, table: &TableName) -> Option<Arc<Table>> {
        self.databases
            .get(database)
            .and_then(|tables| tables.get(table).map(|t| Arc::clone(&t)))
    }

    /// Registers a table, replacing any previous object under the same name.
    pub fn insert(&self, table: Arc<Table>) {
        let tables = self
            .databases
            .entry(table.database().clone())
            .or_insert_with(|| Arc::new(DashMap::new()))
            .clone();
        tables.insert(table.name().clone(), table);
    }

    /// Removes a table. Empty databases are removed with their last table.
    pub fn remove(&self, database: &DatabaseName, table: &TableName) -> Option<Arc<Table>> {
        let removed = self
            .databases
            .get(database)
            .and_then(|tables| tables.remove(table).map(|(_, t)| t));
        if let Some(tables) = self.databases.get(database) {
            if tables.is_empty() {
                drop(tables);
                self.databases.remove_if(database, |_, tables| tables.is_empty());
            }
        }
        removed
    }

    /// Point-in-time snapshot of all databases and tables.
    pub fn snapshot(&self) -> HashMap<DatabaseName, HashMap<TableName, Arc<Table>>> {
        self.databases
            .iter()
            .map(|db| {
                let tables = db
                    .value()
                    .iter()
                    .map(|t| (t.key().clone(), Arc::clone(t.value())))
                    .collect();
                (db.key().clone(), tables)
            })
            .collect()
    }

    /// Removes every table not present in `seen` (the mark/sweep counterpart
    /// of a discovery pass). Returns the removed tables.
    pub fn sweep(&self, seen: &HashSet<(DatabaseName, TableName)>) -> Vec<Arc<Table>> {
        let mut removed = Vec::new();
        for db in self.databases.iter() {
            let database = db.key().clone();
            let stale: Vec<TableName> = db
                .value()
                .iter()
                .filter(|t| !seen.contains(&(database.clone(), t.key().clone())))
                .map(|t| t.key().clone())
                .collect();
            for table in stale {
                if let Some((_, t)) = db.value().remove(&table) {
                    removed.push(t);
                }
            }
        }
        self.databases.retain(|_, tables| !tables.is_empty());
        removed
    }

    /// Registers a callback for new or structurally changed tables.
    pub fn on_new_table(&self, listener: TableListener) {
        self.listeners.lock().push(listener);
    }

    /// Invokes every registered listener for `table`.
    pub fn notify(&self, table: &Arc<Table>) {
        for listener in self.listeners.lock().iter() {
            listener(table);
        }
    }
}

impl Default for TableRegistry {
    fn default() -> Self {
        Self::new()
    }
}

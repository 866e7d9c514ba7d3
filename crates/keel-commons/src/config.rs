//! Engine configuration.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the catalog and indexing engine.
///
/// Deserializable from the deployment's config file; every field has a default
/// so a config can specify only `storage_roots`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Directories scanned for root store files.
    pub storage_roots: Vec<PathBuf>,

    /// File extension identifying root store files under a storage root.
    pub extension: String,

    /// Whether schema mutations append records to the shared audit sub-store.
    pub audit: bool,

    /// Origin id attached to outgoing schema-change signals.
    pub origin: String,

    /// Records processed between indexing checkpoint persists. A crash loses at
    /// most this many records of indexing progress.
    pub checkpoint_interval: usize,

    /// Outstanding unconfirmed index writes above which the indexer awaits
    /// completion before issuing more.
    pub index_high_water: usize,

    /// Outstanding index writes above which the indexer yields a scheduling
    /// turn.
    pub index_low_water: usize,

    /// Duration of an indexing lease before it expires and may be overridden.
    #[serde(with = "duration_ms")]
    pub lease_duration: Duration,

    /// Records fetched per primary sub-store scan batch during indexing.
    pub scan_batch_size: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            storage_roots: Vec::new(),
            extension: "keel".to_string(),
            audit: false,
            origin: "keel".to_string(),
            checkpoint_interval: 100,
            index_high_water: 1000,
            index_low_water: 100,
            lease_duration: Duration::from_secs(30),
            scan_batch_size: 256,
        }
    }
}

impl CatalogConfig {
    /// Convenience constructor for a single storage root with defaults.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            storage_roots: vec![root.into()],
            ..Self::default()
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

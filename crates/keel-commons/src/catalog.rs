//! Persisted catalog models.
//!
//! Single source of truth for the shape of everything the engine writes into a
//! root store's catalog sub-store: the per-attribute [`CatalogEntry`], the index
//! build progress ([`IndexBuildState`], [`IndexingLease`]), and the audit record
//! appended on schema mutations.
//!
//! ## Entry layout
//!
//! One `CatalogEntry` per attribute per table, stored under the key
//! `"<table>/<attribute>"` (bare `"<attribute>"` for the default table of a
//! legacy single-table root store, see `catalog_key`). The entry with
//! `is_primary_key = true` is what defines a table's existence; every other
//! entry under the same table prefix is a secondary attribute or index
//! definition.
//!
//! ## Build state vs. definition
//!
//! "What the schema is" (name/flags/origins) is separate from "how far indexing
//! has progressed" (`IndexBuildState`). The build state is only ever
//! `InProgress` while a background index build is outstanding; it carries the
//! resume checkpoint and the owning worker's lease.

use crate::errors::{CommonError, Result};
use crate::ids::{TableId, WorkerId};
use crate::names::{AttributeName, DatabaseName, TableName};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Time-bounded ownership claim over one attribute's index build.
///
/// Replaces a permanent owner flag: a lease that is past `expires_at_ms` is
/// treated as abandoned and may be overridden by any other worker. The fencing
/// token increments on every successful claim, so a checkpoint written under an
/// expired lease can never clobber state written by the successor claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct IndexingLease {
    /// Worker currently performing the build.
    pub owner: WorkerId,
    /// Wall-clock expiry in milliseconds since the Unix epoch.
    pub expires_at_ms: u64,
    /// Monotonic claim counter, bumped on every successful (re-)claim.
    pub fencing_token: u64,
}

impl IndexingLease {
    /// True if the lease has expired as of `now_ms`.
    #[inline]
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }

    /// True if the lease is held by `worker` and still live.
    #[inline]
    pub fn is_held_by(&self, worker: &WorkerId, now_ms: u64) -> bool {
        !self.is_expired(now_ms) && self.owner == *worker
    }
}

/// Progress of an attribute's secondary index build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode, Default)]
pub enum IndexBuildState {
    /// No build has been scheduled for this attribute.
    #[default]
    NotStarted,
    /// A build is outstanding.
    InProgress {
        /// Last primary key successfully indexed; `None` means start from the
        /// beginning of the primary sub-store.
        checkpoint: Option<Vec<u8>>,
        /// Ownership claim of the worker performing the build.
        lease: IndexingLease,
    },
    /// The index is fully built and usable for queries.
    Complete,
}

impl IndexBuildState {
    /// Returns the resume checkpoint, if a build is in progress.
    pub fn checkpoint(&self) -> Option<&[u8]> {
        match self {
            IndexBuildState::InProgress { checkpoint, .. } => checkpoint.as_deref(),
            _ => None,
        }
    }

    /// Returns the current lease, if a build is in progress.
    pub fn lease(&self) -> Option<&IndexingLease> {
        match self {
            IndexBuildState::InProgress { lease, .. } => Some(lease),
            _ => None,
        }
    }

    /// True if a build is outstanding.
    pub fn is_in_progress(&self) -> bool {
        matches!(self, IndexBuildState::InProgress { .. })
    }
}

/// In-memory attribute definition held by a registry table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: AttributeName,
    /// Whether a secondary index exists (or is being built) for this attribute.
    pub indexed: bool,
    /// Exactly one attribute per table carries this flag.
    pub is_primary_key: bool,
    /// Whether the attribute set is closed/enforced by a declared schema.
    pub schema_defined: bool,
    /// External declarers that requested this attribute. An indexed attribute
    /// is only dropped once no origin still requests it.
    pub origins: BTreeSet<String>,
    /// Index build progress, `NotStarted` unless `indexed`.
    pub build: IndexBuildState,
}

impl Attribute {
    /// Creates a plain (non-indexed, non-primary) attribute.
    pub fn new(name: impl Into<AttributeName>) -> Self {
        Self {
            name: name.into(),
            indexed: false,
            is_primary_key: false,
            schema_defined: false,
            origins: BTreeSet::new(),
            build: IndexBuildState::NotStarted,
        }
    }

    /// Creates a primary-key attribute.
    pub fn primary_key(name: impl Into<AttributeName>) -> Self {
        Self {
            is_primary_key: true,
            ..Self::new(name)
        }
    }

    /// Creates an indexed attribute.
    pub fn indexed(name: impl Into<AttributeName>) -> Self {
        Self {
            indexed: true,
            ..Self::new(name)
        }
    }
}

/// Persisted form of an [`Attribute`], one record in the catalog sub-store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct CatalogEntry {
    pub attribute: AttributeName,
    pub indexed: bool,
    pub is_primary_key: bool,
    pub schema_defined: bool,
    /// Id of the owning table, monotonic per root store.
    pub table_id: TableId,
    pub origins: BTreeSet<String>,
    pub build: IndexBuildState,
}

impl CatalogEntry {
    /// Builds the persisted entry for an in-memory attribute.
    pub fn from_attribute(attr: &Attribute, table_id: TableId) -> Self {
        Self {
            attribute: attr.name.clone(),
            indexed: attr.indexed,
            is_primary_key: attr.is_primary_key,
            schema_defined: attr.schema_defined,
            table_id,
            origins: attr.origins.clone(),
            build: attr.build.clone(),
        }
    }

    /// Converts back into the in-memory attribute form.
    pub fn to_attribute(&self) -> Attribute {
        Attribute {
            name: self.attribute.clone(),
            indexed: self.indexed,
            is_primary_key: self.is_primary_key,
            schema_defined: self.schema_defined,
            origins: self.origins.clone(),
            build: self.build.clone(),
        }
    }

    /// Encodes the entry for storage.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CommonError::internal(format!("catalog entry encode: {}", e)))
    }

    /// Decodes an entry from its stored bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map(|(entry, _)| entry)
            .map_err(|e| CommonError::invalid_input(format!("catalog entry decode: {}", e)))
    }
}

/// Action recorded in the audit sub-store on a schema mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub enum AuditAction {
    TableCreated,
    AttributeAdded(AttributeName),
    AttributeRemoved(AttributeName),
    IndexingFinished(AttributeName),
    TableDropped,
}

/// Append-only audit record for schema mutations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct AuditRecord {
    pub timestamp_ms: u64,
    /// Signal origin id of the engine instance that made the change.
    pub origin: String,
    pub database: DatabaseName,
    pub table: TableName,
    pub action: AuditAction,
}

impl AuditRecord {
    /// Encodes the record for storage.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CommonError::internal(format!("audit record encode: {}", e)))
    }

    /// Decodes a record from its stored bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map(|(rec, _)| rec)
            .map_err(|e| CommonError::invalid_input(format!("audit record decode: {}", e)))
    }
}

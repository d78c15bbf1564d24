//! Versioned record storage.
//!
//! The engine reads records through [`RecordStore`] and writes them back as
//! [`PersistenceInstruction`]s. Each stored record carries a version token;
//! an instruction names the version it was computed from (`None` for a
//! create) and the store applies it only if that still matches.
//!
//! ## CAS semantics
//!
//! - create: applied only if no record exists under the key
//! - update: applied only if the stored version equals `expected_version`
//! - every applied write bumps the version by one
//!
//! A rejected instruction is reported in [`UpsertReport::conflicts`] and the
//! rest of the bulk still applies, so the caller can re-enqueue just the
//! conflicting keys.

pub mod memory;

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::StoreError;
use crate::key::{ComputeKey, GlobalKey};
use crate::model::{CompletenessRecord, GlobalRecord};

pub use memory::InMemoryStore;

/// Optimistic-concurrency token.
pub type Version = u64;

/// A stored record with its current version.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Versioned<T> {
    pub record: T,
    pub version: Version,
}

/// One create-or-update emitted by the engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PersistenceInstruction {
    Local {
        record: CompletenessRecord,
        expected_version: Option<Version>,
    },
    Global {
        record: GlobalRecord,
        expected_version: Option<Version>,
    },
}

impl PersistenceInstruction {
    #[must_use]
    pub fn storage_id(&self) -> String {
        match self {
            Self::Local { record, .. } => record.key.storage_id(),
            Self::Global { record, .. } => record.key.storage_id(),
        }
    }

    #[must_use]
    pub const fn expected_version(&self) -> Option<Version> {
        match self {
            Self::Local {
                expected_version, ..
            }
            | Self::Global {
                expected_version, ..
            } => *expected_version,
        }
    }

    #[must_use]
    pub const fn is_create(&self) -> bool {
        self.expected_version().is_none()
    }

    /// `local` or `global`.
    #[must_use]
    pub const fn family(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::Global { .. } => "global",
        }
    }

    #[must_use]
    pub fn acquisition(&self) -> &str {
        match self {
            Self::Local { record, .. } => &record.key.acquisition,
            Self::Global { record, .. } => &record.key.acquisition,
        }
    }
}

/// Instruction rejected by the version check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub family: &'static str,
    pub storage_id: String,
    pub expected_version: Option<Version>,
    /// Version found in the store; `None` when the record vanished.
    pub actual_version: Option<Version>,
}

/// Per-item outcome of [`RecordStore::bulk_upsert`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    /// Storage ids written, in instruction order.
    pub applied: Vec<String>,
    pub conflicts: Vec<Conflict>,
}

impl UpsertReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }
}

/// Storage abstraction for completeness records.
///
/// Reads return `Ok(None)`/absent entries for unknown keys; errors mean the
/// store could not answer.
pub trait RecordStore: Send + Sync {
    /// Gets one local record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get_local(&self, key: &ComputeKey) -> Result<Option<Versioned<CompletenessRecord>>, StoreError> {
        let mut found = self.get_locals(std::slice::from_ref(key))?;
        Ok(found.remove(key))
    }

    /// Multi-get of local records. Absent keys are missing from the map.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get_locals(
        &self,
        keys: &[ComputeKey],
    ) -> Result<BTreeMap<ComputeKey, Versioned<CompletenessRecord>>, StoreError>;

    /// Multi-get of global records.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get_globals(
        &self,
        keys: &[GlobalKey],
    ) -> Result<BTreeMap<GlobalKey, Versioned<GlobalRecord>>, StoreError>;

    /// Every local record of an acquisition, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn locals_for_acquisition(
        &self,
        acquisition: &str,
    ) -> Result<Vec<Versioned<CompletenessRecord>>, StoreError>;

    /// Applies instructions with per-item version checks.
    ///
    /// # Errors
    ///
    /// Returns an error only when the store fails as a whole; version
    /// mismatches are reported in the [`UpsertReport`].
    fn bulk_upsert(&self, instructions: &[PersistenceInstruction]) -> Result<UpsertReport, StoreError>;
}

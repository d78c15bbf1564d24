//! In-memory [`RecordStore`] for tests and dry runs.
//!
//! Reads of storage ids registered with [`InMemoryStore::fail_reads_for`]
//! fail with [`StoreError::Unavailable`], which lets tests drive the
//! staleness paths of the engine.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock};

use super::{Conflict, PersistenceInstruction, RecordStore, UpsertReport, Version, Versioned};
use crate::error::StoreError;
use crate::key::{ComputeKey, GlobalKey};
use crate::model::{CompletenessRecord, GlobalRecord};

#[derive(Debug, Default)]
struct Tables {
    locals: BTreeMap<ComputeKey, Versioned<CompletenessRecord>>,
    globals: BTreeMap<GlobalKey, Versioned<GlobalRecord>>,
}

/// Thread-safe map-backed store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    failing: RwLock<BTreeSet<String>>,
}

fn poison_err<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Unavailable("lock poisoned".into())
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every read that touches `storage_id` fail.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail_reads_for(&self, storage_id: impl Into<String>) -> Result<(), StoreError> {
        self.failing
            .write()
            .map_err(poison_err)?
            .insert(storage_id.into());
        Ok(())
    }

    /// Clear injected read failures.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn heal(&self) -> Result<(), StoreError> {
        self.failing.write().map_err(poison_err)?.clear();
        Ok(())
    }

    /// Number of stored local and global records.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn counts(&self) -> Result<(usize, usize), StoreError> {
        let tables = self.tables.read().map_err(poison_err)?;
        Ok((tables.locals.len(), tables.globals.len()))
    }

    /// Snapshot of every local record.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn locals(&self) -> Result<Vec<Versioned<CompletenessRecord>>, StoreError> {
        let tables = self.tables.read().map_err(poison_err)?;
        Ok(tables.locals.values().cloned().collect())
    }

    fn check_reads<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> Result<(), StoreError> {
        let failing = self.failing.read().map_err(poison_err)?;
        if failing.is_empty() {
            return Ok(());
        }
        for id in ids {
            if failing.contains(id) {
                return Err(StoreError::Unavailable(format!("read of {id} failed")));
            }
        }
        Ok(())
    }
}

fn apply<K: Ord + Clone, T: Clone>(
    table: &mut BTreeMap<K, Versioned<T>>,
    key: &K,
    record: &T,
    expected_version: Option<Version>,
) -> Result<(), Option<Version>> {
    let actual = table.get(key).map(|stored| stored.version);
    if actual != expected_version {
        return Err(actual);
    }
    let version = actual.map_or(1, |v| v + 1);
    table.insert(
        key.clone(),
        Versioned {
            record: record.clone(),
            version,
        },
    );
    Ok(())
}

impl RecordStore for InMemoryStore {
    fn get_locals(
        &self,
        keys: &[ComputeKey],
    ) -> Result<BTreeMap<ComputeKey, Versioned<CompletenessRecord>>, StoreError> {
        let ids: Vec<String> = keys.iter().map(ComputeKey::storage_id).collect();
        self.check_reads(ids.iter().map(String::as_str))?;

        let tables = self.tables.read().map_err(poison_err)?;
        Ok(keys
            .iter()
            .filter_map(|key| tables.locals.get(key).map(|v| (key.clone(), v.clone())))
            .collect())
    }

    fn get_globals(
        &self,
        keys: &[GlobalKey],
    ) -> Result<BTreeMap<GlobalKey, Versioned<GlobalRecord>>, StoreError> {
        let ids: Vec<String> = keys.iter().map(GlobalKey::storage_id).collect();
        self.check_reads(ids.iter().map(String::as_str))?;

        let tables = self.tables.read().map_err(poison_err)?;
        Ok(keys
            .iter()
            .filter_map(|key| tables.globals.get(key).map(|v| (key.clone(), v.clone())))
            .collect())
    }

    fn locals_for_acquisition(
        &self,
        acquisition: &str,
    ) -> Result<Vec<Versioned<CompletenessRecord>>, StoreError> {
        let tables = self.tables.read().map_err(poison_err)?;
        let found: Vec<_> = tables
            .locals
            .values()
            .filter(|v| v.record.key.acquisition == acquisition)
            .cloned()
            .collect();
        drop(tables);

        let ids: Vec<String> = found.iter().map(|v| v.record.key.storage_id()).collect();
        self.check_reads(ids.iter().map(String::as_str))?;
        Ok(found)
    }

    fn bulk_upsert(
        &self,
        instructions: &[PersistenceInstruction],
    ) -> Result<UpsertReport, StoreError> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        let mut report = UpsertReport::default();

        for instruction in instructions {
            let expected_version = instruction.expected_version();
            let outcome = match instruction {
                PersistenceInstruction::Local { record, .. } => {
                    apply(&mut tables.locals, &record.key, record, expected_version)
                }
                PersistenceInstruction::Global { record, .. } => {
                    apply(&mut tables.globals, &record.key, record, expected_version)
                }
            };
            match outcome {
                Ok(()) => report.applied.push(instruction.storage_id()),
                Err(actual_version) => report.conflicts.push(Conflict {
                    family: instruction.family(),
                    storage_id: instruction.storage_id(),
                    expected_version,
                    actual_version,
                }),
            }
        }

        Ok(report)
    }
}

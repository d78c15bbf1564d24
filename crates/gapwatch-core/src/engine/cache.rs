//! Batch-scoped record cache.
//!
//! One entry per key for the lifetime of a batch. Local and global records
//! live in separate typed maps. Each entry keeps the record as loaded (its
//! snapshot) and the store version it came with; records created during the
//! batch have neither and always produce a create instruction.

use std::collections::BTreeMap;

use crate::key::{ComputeKey, GlobalKey};
use crate::model::{CompletenessRecord, GlobalRecord};
use crate::store::{PersistenceInstruction, Version, Versioned};

/// How an entry entered the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Loaded,
    /// Created for a key that received events.
    Event,
    /// Zero-coverage sibling or neighbor.
    Placeholder,
    /// Aggregate created for a touched acquisition.
    Aggregate,
}

#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub record: T,
    snapshot: Option<T>,
    version: Option<Version>,
    origin: Origin,
}

impl<T: Clone + PartialEq> CacheEntry<T> {
    #[must_use]
    pub fn loaded(stored: Versioned<T>) -> Self {
        Self {
            snapshot: Some(stored.record.clone()),
            record: stored.record,
            version: Some(stored.version),
            origin: Origin::Loaded,
        }
    }

    #[must_use]
    pub const fn created(record: T, origin: Origin) -> Self {
        Self {
            record,
            snapshot: None,
            version: None,
            origin,
        }
    }

    /// Structural comparison against the loaded snapshot.
    #[must_use]
    pub fn is_changed(&self) -> bool {
        self.snapshot.as_ref() != Some(&self.record)
    }

    #[must_use]
    pub const fn version(&self) -> Option<Version> {
        self.version
    }

    #[must_use]
    pub const fn origin(&self) -> Origin {
        self.origin
    }
}

#[derive(Debug, Default)]
pub struct BatchCache {
    locals: BTreeMap<ComputeKey, CacheEntry<CompletenessRecord>>,
    globals: BTreeMap<GlobalKey, CacheEntry<GlobalRecord>>,
}

impl BatchCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains_local(&self, key: &ComputeKey) -> bool {
        self.locals.contains_key(key)
    }

    #[must_use]
    pub fn local(&self, key: &ComputeKey) -> Option<&CacheEntry<CompletenessRecord>> {
        self.locals.get(key)
    }

    pub fn local_mut(&mut self, key: &ComputeKey) -> Option<&mut CacheEntry<CompletenessRecord>> {
        self.locals.get_mut(key)
    }

    /// Insert an entry for a key not cached yet. Returns `false` and leaves
    /// the cache untouched if the key is already present.
    pub fn insert_local(&mut self, key: ComputeKey, entry: CacheEntry<CompletenessRecord>) -> bool {
        if self.locals.contains_key(&key) {
            return false;
        }
        self.locals.insert(key, entry);
        true
    }

    #[must_use]
    pub fn contains_global(&self, key: &GlobalKey) -> bool {
        self.globals.contains_key(key)
    }

    pub fn global_mut(&mut self, key: &GlobalKey) -> Option<&mut CacheEntry<GlobalRecord>> {
        self.globals.get_mut(key)
    }

    pub fn insert_global(&mut self, key: GlobalKey, entry: CacheEntry<GlobalRecord>) -> bool {
        if self.globals.contains_key(&key) {
            return false;
        }
        self.globals.insert(key, entry);
        true
    }

    pub fn locals(&self) -> impl Iterator<Item = (&ComputeKey, &CacheEntry<CompletenessRecord>)> {
        self.locals.iter()
    }

    /// Cached local records that feed `global`.
    pub fn locals_of<'a>(
        &'a self,
        global: &'a GlobalKey,
    ) -> impl Iterator<Item = &'a CompletenessRecord> + 'a {
        self.locals
            .iter()
            .filter(move |(key, _)| {
                key.acquisition == global.acquisition && key.timeliness == global.timeliness
            })
            .map(|(_, entry)| &entry.record)
    }

    /// `(changed, unchanged)` entry counts across both maps.
    #[must_use]
    pub fn change_counts(&self) -> (usize, usize) {
        let changed = self.locals.values().filter(|e| e.is_changed()).count()
            + self.globals.values().filter(|e| e.is_changed()).count();
        let total = self.locals.len() + self.globals.len();
        (changed, total - changed)
    }

    /// Persistence instructions for changed entries: locals in key order,
    /// then globals in key order. Consumes the cache.
    #[must_use]
    pub fn into_instructions(self) -> Vec<PersistenceInstruction> {
        let locals = self
            .locals
            .into_values()
            .filter(CacheEntry::is_changed)
            .map(|entry| PersistenceInstruction::Local {
                expected_version: entry.version,
                record: entry.record,
            });
        let globals = self
            .globals
            .into_values()
            .filter(CacheEntry::is_changed)
            .map(|entry| PersistenceInstruction::Global {
                expected_version: entry.version,
                record: entry.record,
            });
        locals.chain(globals).collect()
    }
}

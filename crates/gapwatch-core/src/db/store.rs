//! [`RecordStore`] over the SQLite record database.
//!
//! A bulk upsert runs in one `IMMEDIATE` transaction. Creates use
//! `INSERT .. ON CONFLICT DO NOTHING`; updates carry `WHERE version = ?`.
//! A statement that changes no row is a version conflict and is reported
//! without aborting the transaction.
//!
//! File-backed connections run in WAL mode so `gw show` can read while a
//! batch commits, with a busy timeout covering short lock waits between
//! concurrent batches.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;
use crate::key::{ComputeKey, GlobalKey};
use crate::model::{CompletenessRecord, GlobalRecord};
use crate::store::{Conflict, PersistenceInstruction, RecordStore, UpsertReport, Version, Versioned};

/// How long a writer waits on another connection's lock.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct SqliteRecordStore {
    conn: Mutex<Connection>,
}

/// Bookkeeping of the last batch written through [`RecordStore::bulk_upsert`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LastBatch {
    /// Commit time in microseconds since the epoch; 0 before the first batch.
    pub at_us: i64,
    pub applied: u64,
    pub conflicts: u64,
}

fn poison_err<T>(_: PoisonError<T>) -> StoreError {
    StoreError::Unavailable("connection lock poisoned".into())
}

fn now_us() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

fn version_to_sql(id: &str, version: Version) -> Result<i64, StoreError> {
    i64::try_from(version).map_err(|_| StoreError::Corrupt {
        id: id.to_string(),
        reason: format!("version {version} out of range"),
    })
}

fn version_from_sql(id: &str, version: i64) -> Result<Version, StoreError> {
    Version::try_from(version).map_err(|_| StoreError::Corrupt {
        id: id.to_string(),
        reason: format!("negative version {version}"),
    })
}

fn decode<T: DeserializeOwned>(id: &str, json: &str, version: i64) -> Result<Versioned<T>, StoreError> {
    let record = serde_json::from_str(json).map_err(|err| StoreError::Corrupt {
        id: id.to_string(),
        reason: err.to_string(),
    })?;
    Ok(Versioned {
        record,
        version: version_from_sql(id, version)?,
    })
}

fn encode<T: Serialize>(id: &str, record: &T) -> Result<String, StoreError> {
    serde_json::to_string(record).map_err(|err| StoreError::Corrupt {
        id: id.to_string(),
        reason: err.to_string(),
    })
}

/// Columns shared by both record tables.
struct Row<'a> {
    table: &'static str,
    storage_id: String,
    acquisition: &'a str,
    product_type: Option<&'a str>,
    timeliness: Option<&'a str>,
    mission: &'a str,
    status: &'static str,
    percentage: f64,
    json: String,
}

impl SqliteRecordStore {
    /// Open the database at `path`, creating and migrating it as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create record db directory {}", parent.display()))?;
        }
        let mut conn = Connection::open(path)
            .with_context(|| format!("open record database {}", path.display()))?;

        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let journal: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        tracing::debug!(path = %path.display(), journal = %journal, "record database opened");

        super::migrations::migrate(&mut conn)
            .with_context(|| format!("migrate record database {}", path.display()))?;
        Ok(Self::from_connection(conn))
    }

    /// Wrap a connection that is already migrated.
    #[must_use]
    pub const fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
        }
    }

    /// In-memory database, migrated. Used by tests and dry runs.
    ///
    /// # Errors
    ///
    /// Returns an error if migration fails.
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        super::migrations::migrate(&mut conn)?;
        Ok(Self::from_connection(conn))
    }

    /// Time and outcome counts of the last persisted batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata row cannot be read.
    pub fn last_batch(&self) -> Result<LastBatch, StoreError> {
        let conn = self.conn.lock().map_err(poison_err)?;
        let (at_us, applied, conflicts): (i64, i64, i64) = conn.query_row(
            "SELECT last_batch_at_us, last_batch_applied, last_batch_conflicts
             FROM store_meta WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let count = |column: &str, value: i64| {
            u64::try_from(value).map_err(|_| StoreError::Corrupt {
                id: "store_meta".into(),
                reason: format!("negative {column} {value}"),
            })
        };
        Ok(LastBatch {
            at_us,
            applied: count("last_batch_applied", applied)?,
            conflicts: count("last_batch_conflicts", conflicts)?,
        })
    }

    /// Every global record of an acquisition.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row does not decode.
    pub fn globals_for_acquisition(
        &self,
        acquisition: &str,
    ) -> Result<Vec<Versioned<GlobalRecord>>, StoreError> {
        let conn = self.conn.lock().map_err(poison_err)?;
        let mut stmt = conn.prepare_cached(
            "SELECT storage_id, record_json, version FROM global_records
             WHERE acquisition = ?1 ORDER BY storage_id",
        )?;
        let rows = stmt.query_map([acquisition], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, json, version) = row?;
            out.push(decode(&id, &json, version)?);
        }
        Ok(out)
    }

    fn get_one<T: DeserializeOwned>(
        conn: &Connection,
        table: &str,
        storage_id: &str,
    ) -> Result<Option<Versioned<T>>, StoreError> {
        let sql = format!("SELECT record_json, version FROM {table} WHERE storage_id = ?1");
        let mut stmt = conn.prepare_cached(&sql)?;
        let found = stmt
            .query_row([storage_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .optional()?;
        found
            .map(|(json, version)| decode(storage_id, &json, version))
            .transpose()
    }

    fn stored_version(
        conn: &Connection,
        table: &str,
        storage_id: &str,
    ) -> Result<Option<Version>, StoreError> {
        let sql = format!("SELECT version FROM {table} WHERE storage_id = ?1");
        let found: Option<i64> = conn
            .query_row(&sql, [storage_id], |row| row.get(0))
            .optional()?;
        found.map(|v| version_from_sql(storage_id, v)).transpose()
    }

    fn write_row(
        conn: &Connection,
        row: &Row<'_>,
        expected_version: Option<Version>,
    ) -> Result<bool, StoreError> {
        let changed = match expected_version {
            None => {
                let sql = format!(
                    "INSERT INTO {} (storage_id, acquisition, {}timeliness, mission, status,
                         percentage, record_json, version, updated_at_us)
                     VALUES (?1, ?2, {}?3, ?4, ?5, ?6, ?7, 1, ?8)
                     ON CONFLICT(storage_id) DO NOTHING",
                    row.table,
                    if row.product_type.is_some() { "product_type, " } else { "" },
                    if row.product_type.is_some() { "?9, " } else { "" },
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                match row.product_type {
                    Some(product_type) => stmt.execute(params![
                        row.storage_id,
                        row.acquisition,
                        row.timeliness,
                        row.mission,
                        row.status,
                        row.percentage,
                        row.json,
                        now_us(),
                        product_type,
                    ])?,
                    None => stmt.execute(params![
                        row.storage_id,
                        row.acquisition,
                        row.timeliness,
                        row.mission,
                        row.status,
                        row.percentage,
                        row.json,
                        now_us(),
                    ])?,
                }
            }
            Some(version) => {
                let sql = format!(
                    "UPDATE {} SET status = ?1, percentage = ?2, record_json = ?3,
                         version = version + 1, updated_at_us = ?4
                     WHERE storage_id = ?5 AND version = ?6",
                    row.table
                );
                let mut stmt = conn.prepare_cached(&sql)?;
                stmt.execute(params![
                    row.status,
                    row.percentage,
                    row.json,
                    now_us(),
                    row.storage_id,
                    version_to_sql(&row.storage_id, version)?,
                ])?
            }
        };
        Ok(changed == 1)
    }
}

fn local_row(record: &CompletenessRecord) -> Result<Row<'_>, StoreError> {
    let storage_id = record.key.storage_id();
    let json = encode(&storage_id, record)?;
    Ok(Row {
        table: "local_records",
        acquisition: &record.key.acquisition,
        product_type: Some(&record.key.product_type),
        timeliness: record.key.timeliness.as_deref(),
        mission: &record.mission,
        status: record.status.as_str(),
        percentage: record.percentage,
        json,
        storage_id,
    })
}

fn global_row(record: &GlobalRecord) -> Result<Row<'_>, StoreError> {
    let storage_id = record.key.storage_id();
    let json = encode(&storage_id, record)?;
    Ok(Row {
        table: "global_records",
        acquisition: &record.key.acquisition,
        product_type: None,
        timeliness: record.key.timeliness.as_deref(),
        mission: &record.mission,
        status: record.status.as_str(),
        percentage: record.percentage,
        json,
        storage_id,
    })
}

impl RecordStore for SqliteRecordStore {
    fn get_locals(
        &self,
        keys: &[ComputeKey],
    ) -> Result<BTreeMap<ComputeKey, Versioned<CompletenessRecord>>, StoreError> {
        let conn = self.conn.lock().map_err(poison_err)?;
        let mut out = BTreeMap::new();
        for key in keys {
            if let Some(found) = Self::get_one(&conn, "local_records", &key.storage_id())? {
                out.insert(key.clone(), found);
            }
        }
        Ok(out)
    }

    fn get_globals(
        &self,
        keys: &[GlobalKey],
    ) -> Result<BTreeMap<GlobalKey, Versioned<GlobalRecord>>, StoreError> {
        let conn = self.conn.lock().map_err(poison_err)?;
        let mut out = BTreeMap::new();
        for key in keys {
            if let Some(found) = Self::get_one(&conn, "global_records", &key.storage_id())? {
                out.insert(key.clone(), found);
            }
        }
        Ok(out)
    }

    fn locals_for_acquisition(
        &self,
        acquisition: &str,
    ) -> Result<Vec<Versioned<CompletenessRecord>>, StoreError> {
        let conn = self.conn.lock().map_err(poison_err)?;
        let mut stmt = conn.prepare_cached(
            "SELECT storage_id, record_json, version FROM local_records
             WHERE acquisition = ?1 ORDER BY storage_id",
        )?;
        let rows = stmt.query_map([acquisition], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, json, version) = row?;
            out.push(decode(&id, &json, version)?);
        }
        Ok(out)
    }

    fn bulk_upsert(
        &self,
        instructions: &[PersistenceInstruction],
    ) -> Result<UpsertReport, StoreError> {
        let mut conn = self.conn.lock().map_err(poison_err)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut report = UpsertReport::default();

        for instruction in instructions {
            let row = match instruction {
                PersistenceInstruction::Local { record, .. } => local_row(record)?,
                PersistenceInstruction::Global { record, .. } => global_row(record)?,
            };
            let expected_version = instruction.expected_version();

            if Self::write_row(&tx, &row, expected_version)? {
                report.applied.push(row.storage_id);
            } else {
                let actual_version = Self::stored_version(&tx, row.table, &row.storage_id)?;
                tracing::warn!(
                    storage_id = %row.storage_id,
                    expected = ?expected_version,
                    actual = ?actual_version,
                    "version conflict; instruction rejected"
                );
                report.conflicts.push(Conflict {
                    family: instruction.family(),
                    storage_id: row.storage_id,
                    expected_version,
                    actual_version,
                });
            }
        }

        let applied = i64::try_from(report.applied.len()).unwrap_or(i64::MAX);
        let conflicts = i64::try_from(report.conflicts.len()).unwrap_or(i64::MAX);
        tx.execute(
            "UPDATE store_meta
             SET last_batch_at_us = ?1, last_batch_applied = ?2, last_batch_conflicts = ?3
             WHERE id = 1",
            params![now_us(), applied, conflicts],
        )?;
        tx.commit()?;
        Ok(report)
    }
}

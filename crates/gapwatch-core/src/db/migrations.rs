//! Forward-only schema migrations, tracked in `PRAGMA user_version`.
//!
//! `store_meta.schema_version` mirrors the pragma so a plain `SELECT` shows
//! which binary last touched the file.

use rusqlite::{Connection, TransactionBehavior, types::Type};

use super::schema;
use crate::error::StoreError;

/// Latest schema version understood by this binary.
pub const LATEST_SCHEMA_VERSION: u32 = 3;

struct Migration {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "record tables",
        sql: schema::MIGRATION_V1_SQL,
    },
    Migration {
        version: 2,
        name: "read-path indexes",
        sql: schema::MIGRATION_V2_SQL,
    },
    Migration {
        version: 3,
        name: "batch conflict count",
        sql: schema::MIGRATION_V3_SQL,
    },
];

/// Read `PRAGMA user_version` as a `u32`.
///
/// # Errors
///
/// Returns an error if querying SQLite fails or the value does not fit.
pub fn current_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(version).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(error))
    })
}

/// Bring the record database up to [`LATEST_SCHEMA_VERSION`].
///
/// A file written by a newer binary is refused, never downgraded.
///
/// # Errors
///
/// Returns [`StoreError::Unavailable`] for a newer schema, and
/// [`StoreError::Sqlite`] when a migration fails. A failed migration leaves
/// the file at the last version that applied cleanly.
pub fn migrate(conn: &mut Connection) -> Result<u32, StoreError> {
    let found = current_schema_version(conn)?;
    if found > LATEST_SCHEMA_VERSION {
        return Err(StoreError::Unavailable(format!(
            "record database schema v{found} is newer than this build (v{LATEST_SCHEMA_VERSION})"
        )));
    }

    let mut current = found;
    for migration in MIGRATIONS.iter().filter(|m| m.version > found) {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(migration.sql)?;
        tx.pragma_update(None, "user_version", i64::from(migration.version))?;
        tx.execute(
            "UPDATE store_meta SET schema_version = ?1 WHERE id = 1",
            [i64::from(migration.version)],
        )?;
        tx.commit()?;
        tracing::info!(
            from = current,
            to = migration.version,
            migration = migration.name,
            "record database migrated"
        );
        current = migration.version;
    }
    Ok(current)
}

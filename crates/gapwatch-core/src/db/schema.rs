//! SQLite schema for persisted completeness records.
//!
//! Records are stored as canonical JSON next to a few columns pulled out for
//! querying:
//! - `local_records` holds one row per compute key
//! - `global_records` holds one row per acquisition aggregate
//! - `store_meta` tracks the schema version and the last persisted batch

/// Migration v1: record tables plus store metadata.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS local_records (
    storage_id TEXT PRIMARY KEY,
    acquisition TEXT NOT NULL,
    product_type TEXT NOT NULL,
    timeliness TEXT,
    mission TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('missing', 'partial', 'complete')),
    percentage REAL NOT NULL CHECK (percentage >= 0 AND percentage <= 100),
    record_json TEXT NOT NULL,
    version INTEGER NOT NULL CHECK (version >= 1),
    updated_at_us INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS global_records (
    storage_id TEXT PRIMARY KEY,
    acquisition TEXT NOT NULL,
    timeliness TEXT,
    mission TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('missing', 'partial', 'complete')),
    percentage REAL NOT NULL CHECK (percentage >= 0 AND percentage <= 100),
    record_json TEXT NOT NULL,
    version INTEGER NOT NULL CHECK (version >= 1),
    updated_at_us INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS store_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL,
    last_batch_at_us INTEGER NOT NULL DEFAULT 0,
    last_batch_applied INTEGER NOT NULL DEFAULT 0
);

INSERT OR IGNORE INTO store_meta (
    id,
    schema_version,
    last_batch_at_us,
    last_batch_applied
) VALUES (1, 1, 0, 0);
";

/// Migration v2: read-path indexes.
pub const MIGRATION_V2_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_local_records_acquisition
    ON local_records(acquisition, product_type);

CREATE INDEX IF NOT EXISTS idx_local_records_mission_status
    ON local_records(mission, status);

CREATE INDEX IF NOT EXISTS idx_global_records_acquisition
    ON global_records(acquisition);
";

/// Migration v3: conflict count of the last batch.
pub const MIGRATION_V3_SQL: &str = r"
ALTER TABLE store_meta ADD COLUMN last_batch_conflicts INTEGER NOT NULL DEFAULT 0;
";

/// Indexes expected after all migrations.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_local_records_acquisition",
    "idx_local_records_mission_status",
    "idx_global_records_acquisition",
];

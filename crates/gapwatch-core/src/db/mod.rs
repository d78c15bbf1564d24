//! SQLite record database: schema, migrations and the [`SqliteRecordStore`]
//! adapter.

pub mod migrations;
pub mod schema;
pub mod store;

pub use store::{LastBatch, SqliteRecordStore};

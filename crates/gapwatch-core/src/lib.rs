//! gapwatch-core library.
//!
//! Derives per-acquisition completeness records from delivered product
//! events: interval algebra over sensing periods, a tolerance resolver, the
//! orbit/datatake key scheme, and the batch engine that loads, materializes
//! and recomputes records against a versioned [`store::RecordStore`].
//!
//! # Conventions
//!
//! - **Errors**: typed `thiserror` enums in [`error`] at the library seams,
//!   `anyhow::Result` for loading files.
//! - **Logging**: `tracing` macros with structured fields.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod key;
pub mod model;
pub mod period;
pub mod provider;
pub mod store;
pub mod timing;
pub mod tolerance;

pub use config::{EngineConfig, MissionConfig};
pub use engine::{BatchEngine, BatchOutcome, BatchStats, PersistedBatch};
pub use error::{EngineError, ErrorCode};
pub use event::RawEvent;
pub use key::{ComputeKey, GlobalKey, KeyScheme};
pub use period::{Micros, Period};

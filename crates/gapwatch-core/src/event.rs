//! Raw product events as delivered by the ingestion layer.
//!
//! Events are read as JSON lines. A line that fails to deserialize is a
//! transport problem and is reported with its line number; events that parse
//! but cannot be keyed are a domain matter handled by the engine.

use std::io::BufRead;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::period::Period;

/// One delivered product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub mission: String,
    /// Name of the delivered product. Contributions are keyed by it.
    pub product_name: String,
    pub acquisition_id: String,
    pub product_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeliness: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instrument_mode: Option<String>,
    /// Sensing period covered by the product.
    pub observation: Period,
    /// Planned sensing window of the acquisition, when the producer knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquisition_window: Option<Period>,
}

/// Parse a JSON-lines batch. Blank lines and `#` comments are ignored.
///
/// # Errors
///
/// Returns an error naming the first line that is not a valid event.
pub fn read_events<R: BufRead>(reader: R) -> Result<Vec<RawEvent>> {
    let mut events = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("failed to read event line {}", idx + 1))?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let event: RawEvent = serde_json::from_str(trimmed)
            .with_context(|| format!("invalid event on line {}", idx + 1))?;
        events.push(event);
    }
    Ok(events)
}

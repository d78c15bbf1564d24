use anyhow::{Context, Result, anyhow};
use clap::Args;
use gapwatch_core::EngineConfig;
use gapwatch_core::db::SqliteRecordStore;
use gapwatch_core::engine::{BatchEngine, BatchStats};
use gapwatch_core::event::{RawEvent, read_events};
use gapwatch_core::provider::StaticExpectedTable;
use gapwatch_core::store::{Conflict, PersistenceInstruction};
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::output::{OutputMode, percent, pretty_kv, pretty_rule, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct ConsolidateArgs {
    /// JSON-lines file of product events (`-` for stdin)
    #[arg(long, value_name = "JSONL")]
    pub events: PathBuf,

    /// SQLite record database (created when missing)
    #[arg(long, value_name = "SQLITE")]
    pub db: PathBuf,

    /// Compute instructions without writing them
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Serialize)]
struct InstructionSummary {
    kind: &'static str,
    storage_id: String,
    action: &'static str,
    status: String,
    percentage: f64,
    expected_version: Option<u64>,
}

impl From<&PersistenceInstruction> for InstructionSummary {
    fn from(instruction: &PersistenceInstruction) -> Self {
        let (status, percentage) = match instruction {
            PersistenceInstruction::Local { record, .. } => (record.status, record.percentage),
            PersistenceInstruction::Global { record, .. } => (record.status, record.percentage),
        };
        Self {
            kind: instruction.family(),
            storage_id: instruction.storage_id(),
            action: if instruction.is_create() {
                "create"
            } else {
                "update"
            },
            status: status.to_string(),
            percentage,
            expected_version: instruction.expected_version(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ConsolidateReport {
    dry_run: bool,
    stats: BatchStats,
    instructions: Vec<InstructionSummary>,
    applied: usize,
    conflicts: Vec<Conflict>,
}

pub fn run_consolidate(
    args: &ConsolidateArgs,
    config: &EngineConfig,
    output: OutputMode,
) -> Result<()> {
    let events = load_events(&args.events)?;
    let store = open_store(&args.db, args.dry_run)?;
    let expected = StaticExpectedTable::from_config(config);
    let engine = BatchEngine::new(config, &store, &expected);

    let report = if args.dry_run {
        let outcome = engine.run(&events).map_err(engine_error)?;
        ConsolidateReport {
            dry_run: true,
            instructions: outcome.instructions.iter().map(Into::into).collect(),
            stats: outcome.stats,
            applied: 0,
            conflicts: Vec::new(),
        }
    } else {
        let persisted = engine.run_and_persist(&events).map_err(engine_error)?;
        ConsolidateReport {
            dry_run: false,
            instructions: persisted.outcome.instructions.iter().map(Into::into).collect(),
            stats: persisted.outcome.stats,
            applied: persisted.report.applied.len(),
            conflicts: persisted.report.conflicts,
        }
    };

    render_mode(output, &report, render_text, render_pretty)
}

fn load_events(path: &Path) -> Result<Vec<RawEvent>> {
    if path == Path::new("-") {
        return read_events(io::stdin().lock()).context("Failed to read events from stdin");
    }
    let file = File::open(path)
        .with_context(|| format!("Failed to open events file {}", path.display()))?;
    read_events(BufReader::new(file))
        .with_context(|| format!("Failed to read events from {}", path.display()))
}

/// A dry run against a database that does not exist yet uses a scratch
/// in-memory store so nothing is created on disk.
fn open_store(path: &Path, dry_run: bool) -> Result<SqliteRecordStore> {
    if dry_run && !path.exists() {
        return SqliteRecordStore::open_in_memory();
    }
    SqliteRecordStore::open(path)
        .with_context(|| format!("Failed to open record database {}", path.display()))
}

fn engine_error(err: gapwatch_core::EngineError) -> anyhow::Error {
    let code = err.code();
    let mut message = format!("[{}] {}: {err}", code.code(), code.message());
    if let Some(hint) = code.hint() {
        message.push_str("\n  hint: ");
        message.push_str(hint);
    }
    anyhow!(message)
}

fn render_text(report: &ConsolidateReport, w: &mut dyn Write) -> io::Result<()> {
    for item in &report.instructions {
        writeln!(
            w,
            "{}\t{}\t{}\t{}\t{:.1}",
            item.action, item.kind, item.storage_id, item.status, item.percentage
        )?;
    }
    for conflict in &report.conflicts {
        writeln!(w, "conflict\t{}\t{}", conflict.family, conflict.storage_id)?;
    }
    let stats = &report.stats;
    writeln!(
        w,
        "events={} skipped={} keys={} created={} placeholders={} unchanged={} deferred={} applied={} conflicts={}",
        stats.events,
        stats.domain_skips,
        stats.distinct_keys,
        stats.created,
        stats.placeholders,
        stats.unchanged,
        stats.deferred.len(),
        report.applied,
        report.conflicts.len()
    )
}

fn render_pretty(report: &ConsolidateReport, w: &mut dyn Write) -> io::Result<()> {
    let heading = if report.dry_run {
        "Batch (dry run)"
    } else {
        "Batch"
    };
    pretty_section(w, heading)?;
    let stats = &report.stats;
    pretty_kv(w, "events", stats.events.to_string())?;
    pretty_kv(w, "skipped", stats.domain_skips.to_string())?;
    pretty_kv(w, "keys", stats.distinct_keys.to_string())?;
    pretty_kv(w, "loaded", stats.loaded.to_string())?;
    pretty_kv(w, "created", stats.created.to_string())?;
    pretty_kv(w, "placeholders", stats.placeholders.to_string())?;
    pretty_kv(w, "aggregates", stats.globals.to_string())?;
    pretty_kv(w, "unchanged", stats.unchanged.to_string())?;
    if !report.dry_run {
        pretty_kv(w, "applied", report.applied.to_string())?;
    }

    writeln!(w)?;
    pretty_section(w, "Instructions")?;
    if report.instructions.is_empty() {
        writeln!(w, "nothing changed")?;
    }
    for item in &report.instructions {
        writeln!(
            w,
            "{:<7} {:<6} {:<40} {:<8} {:>7}",
            item.action,
            item.kind,
            item.storage_id,
            item.status,
            percent(item.percentage)
        )?;
    }

    if !stats.deferred.is_empty() {
        writeln!(w)?;
        pretty_section(w, "Deferred")?;
        for id in &stats.deferred {
            writeln!(w, "{id}")?;
        }
    }

    if !report.conflicts.is_empty() {
        writeln!(w)?;
        pretty_section(w, "Conflicts")?;
        for conflict in &report.conflicts {
            writeln!(
                w,
                "{} {} (expected {:?}, found {:?})",
                conflict.family,
                conflict.storage_id,
                conflict.expected_version,
                conflict.actual_version
            )?;
        }
        pretty_rule(w)?;
        writeln!(w, "conflicting keys are left for the next batch")?;
    }
    Ok(())
}

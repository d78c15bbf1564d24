use anyhow::{Context, Result, bail};
use clap::Args;
use gapwatch_core::EngineConfig;
use gapwatch_core::db::{LastBatch, SqliteRecordStore};
use gapwatch_core::model::{CompletenessRecord, GlobalRecord};
use gapwatch_core::store::{RecordStore, Versioned};
use serde::Serialize;
use std::io::{self, Write};
use std::path::PathBuf;

use crate::output::{OutputMode, percent, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Acquisition identifier (datatake id or orbit key)
    pub acquisition: String,

    /// SQLite record database
    #[arg(long, value_name = "SQLITE")]
    pub db: PathBuf,

    /// Canonicalize the identifier with this mission's key scheme first
    #[arg(long)]
    pub mission: Option<String>,
}

#[derive(Debug, Serialize)]
struct StoredRecords {
    acquisition: String,
    locals: Vec<Versioned<CompletenessRecord>>,
    globals: Vec<Versioned<GlobalRecord>>,
    last_batch: LastBatch,
}

pub fn run_show(args: &ShowArgs, config: &EngineConfig, output: OutputMode) -> Result<()> {
    let acquisition = match &args.mission {
        Some(name) => {
            let Some(mission) = config.mission(name) else {
                bail!("mission '{name}' is not configured");
            };
            mission
                .scheme
                .canonicalize(&args.acquisition)
                .with_context(|| format!("'{}' is not a valid {name} acquisition id", args.acquisition))?
        }
        None => args.acquisition.clone(),
    };

    if !args.db.exists() {
        bail!("record database {} does not exist", args.db.display());
    }
    let store = SqliteRecordStore::open(&args.db)
        .with_context(|| format!("Failed to open record database {}", args.db.display()))?;
    let records = StoredRecords {
        locals: store.locals_for_acquisition(&acquisition)?,
        globals: store.globals_for_acquisition(&acquisition)?,
        last_batch: store.last_batch()?,
        acquisition,
    };

    render_mode(output, &records, render_text, render_pretty)
}

fn render_text(records: &StoredRecords, w: &mut dyn Write) -> io::Result<()> {
    for stored in &records.locals {
        let r = &stored.record;
        writeln!(
            w,
            "local\t{}\t{}\t{:.1}\t{}\t{}",
            r.key,
            r.status,
            r.percentage,
            r.missing_periods.len(),
            stored.version
        )?;
    }
    for stored in &records.globals {
        let r = &stored.record;
        writeln!(
            w,
            "global\t{}\t{}\t{:.1}\t-\t{}",
            r.key, r.status, r.percentage, stored.version
        )?;
    }
    Ok(())
}

fn render_pretty(records: &StoredRecords, w: &mut dyn Write) -> io::Result<()> {
    if records.locals.is_empty() && records.globals.is_empty() {
        return writeln!(w, "no records for {}", records.acquisition);
    }

    for stored in &records.globals {
        let r = &stored.record;
        pretty_section(w, &format!("Acquisition {}", r.key))?;
        pretty_kv(w, "mission", &r.mission)?;
        pretty_kv(w, "window", r.observation_window.to_string())?;
        pretty_kv(w, "status", format!("{} ({})", r.status, percent(r.percentage)))?;
        if let Some(ticket) = &r.ticket {
            pretty_kv(w, "ticket", &ticket.id)?;
        }
        writeln!(w)?;
    }

    pretty_section(w, "Product types")?;
    for stored in &records.locals {
        let r = &stored.record;
        writeln!(
            w,
            "{:<40} {:<8} {:>7}  {} product(s), {} gap(s)",
            r.key.to_string(),
            r.status.to_string(),
            percent(r.percentage),
            r.contributions.len(),
            r.missing_periods.len()
        )?;
        for gap in &r.missing_periods {
            writeln!(w, "    missing {gap}")?;
        }
    }

    let batch = &records.last_batch;
    writeln!(w)?;
    pretty_kv(
        w,
        "last batch",
        format!("{} applied, {} conflict(s)", batch.applied, batch.conflicts),
    )?;
    Ok(())
}

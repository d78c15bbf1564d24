use anyhow::Result;
use clap::Args;
use gapwatch_core::EngineConfig;
use gapwatch_core::tolerance::Scope;
use serde::Serialize;
use std::io::{self, Write};

use crate::output::{OutputMode, pretty_kv, render_mode};

#[derive(Args, Debug)]
pub struct ToleranceArgs {
    /// Mission name as used in the tolerance table
    pub mission: String,

    /// Record family: local or global
    pub scope: Scope,

    /// Product type to match against the configured patterns
    pub product_type: String,
}

#[derive(Debug, Serialize)]
struct ToleranceReport<'a> {
    mission: &'a str,
    scope: Scope,
    product_type: &'a str,
    tolerance_us: i64,
}

pub fn run_tolerance(args: &ToleranceArgs, config: &EngineConfig, output: OutputMode) -> Result<()> {
    let report = ToleranceReport {
        mission: &args.mission,
        scope: args.scope,
        product_type: &args.product_type,
        tolerance_us: config
            .tolerance
            .resolve(&args.mission, args.scope, &args.product_type),
    };

    render_mode(output, &report, render_text, render_pretty)
}

fn render_text(report: &ToleranceReport<'_>, w: &mut dyn Write) -> io::Result<()> {
    writeln!(w, "{}", report.tolerance_us)
}

fn render_pretty(report: &ToleranceReport<'_>, w: &mut dyn Write) -> io::Result<()> {
    pretty_kv(w, "mission", report.mission)?;
    pretty_kv(w, "scope", report.scope.as_str())?;
    pretty_kv(w, "product type", report.product_type)?;
    pretty_kv(w, "tolerance", format!("{} µs", report.tolerance_us))
}

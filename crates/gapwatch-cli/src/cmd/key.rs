use anyhow::{Result, bail};
use clap::Args;
use gapwatch_core::EngineConfig;
use gapwatch_core::key::Direction;
use serde::Serialize;
use std::io::{self, Write};

use crate::output::{OutputMode, pretty_kv, pretty_section, render_mode};

#[derive(Args, Debug)]
pub struct KeyArgs {
    /// Mission whose key scheme applies
    pub mission: String,

    /// Raw acquisition identifier
    pub acquisition: String,

    /// Only compute the previous neighbor
    #[arg(long, conflicts_with = "next")]
    pub previous: bool,

    /// Only compute the next neighbor
    #[arg(long)]
    pub next: bool,
}

#[derive(Debug, Serialize)]
struct KeyReport {
    mission: String,
    scheme: &'static str,
    canonical: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next: Option<String>,
}

pub fn run_key(args: &KeyArgs, config: &EngineConfig, output: OutputMode) -> Result<()> {
    let Some(mission) = config.mission(&args.mission) else {
        bail!("mission '{}' is not configured", args.mission);
    };
    let scheme = mission.scheme;
    let Some(parsed) = scheme.parse(&args.acquisition) else {
        bail!(
            "'{}' is not a valid {} acquisition id",
            args.acquisition,
            args.mission
        );
    };

    let wanted = |direction: Direction| match direction {
        Direction::Previous => !args.next,
        Direction::Next => !args.previous,
    };
    let neighbor = |direction: Direction| {
        if wanted(direction) {
            scheme
                .neighbor(&parsed, direction)
                .map(|key| scheme.render(&key))
        } else {
            None
        }
    };

    let report = KeyReport {
        mission: args.mission.clone(),
        scheme: if scheme.is_orbit_based() {
            "orbit"
        } else {
            "datatake"
        },
        canonical: scheme.render(&parsed),
        previous: neighbor(Direction::Previous),
        next: neighbor(Direction::Next),
    };

    render_mode(output, &report, render_text, render_pretty)
}

fn render_text(report: &KeyReport, w: &mut dyn Write) -> io::Result<()> {
    writeln!(
        w,
        "{}\t{}\t{}",
        report.previous.as_deref().unwrap_or("-"),
        report.canonical,
        report.next.as_deref().unwrap_or("-")
    )
}

fn render_pretty(report: &KeyReport, w: &mut dyn Write) -> io::Result<()> {
    pretty_section(w, &format!("{} key", report.mission))?;
    pretty_kv(w, "scheme", report.scheme)?;
    pretty_kv(w, "canonical", &report.canonical)?;
    if let Some(previous) = &report.previous {
        pretty_kv(w, "previous", previous)?;
    }
    if let Some(next) = &report.next {
        pretty_kv(w, "next", next)?;
    }
    if report.scheme == "datatake" {
        writeln!(w, "datatake neighbors come from acquisition planning")?;
    }
    Ok(())
}

use anyhow::{Context, Result};
use gapwatch_core::EngineConfig;
use gapwatch_core::config::ConfigSource;
use serde::Serialize;
use std::io::{self, Write};

use crate::output::{OutputMode, pretty_kv, pretty_rule, pretty_section, render_mode};

#[derive(Debug, Serialize)]
struct EffectiveConfig<'a> {
    source: Option<String>,
    source_exists: bool,
    missions: Vec<&'a str>,
    config: &'a EngineConfig,
    #[serde(skip)]
    toml: String,
}

pub fn run_config(config: &EngineConfig, source: &ConfigSource, output: OutputMode) -> Result<()> {
    let effective = EffectiveConfig {
        source: source.path.as_ref().map(|p| p.display().to_string()),
        source_exists: source.exists,
        missions: config.missions.keys().map(String::as_str).collect(),
        config,
        toml: toml::to_string_pretty(config).context("Failed to render config as TOML")?,
    };

    render_mode(output, &effective, render_text, render_pretty)
}

fn render_text(effective: &EffectiveConfig<'_>, w: &mut dyn Write) -> io::Result<()> {
    write!(w, "{}", effective.toml)
}

fn render_pretty(effective: &EffectiveConfig<'_>, w: &mut dyn Write) -> io::Result<()> {
    pretty_section(w, "Effective configuration")?;
    let source = match (&effective.source, effective.source_exists) {
        (Some(path), true) => path.clone(),
        (Some(path), false) => format!("{path} (not found, defaults)"),
        (None, _) => "defaults".to_string(),
    };
    pretty_kv(w, "source", source)?;
    let missions = if effective.missions.is_empty() {
        "none".to_string()
    } else {
        effective.missions.join(", ")
    };
    pretty_kv(w, "missions", missions)?;
    pretty_rule(w)?;
    write!(w, "{}", effective.toml)
}

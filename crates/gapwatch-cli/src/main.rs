#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{Parser, Subcommand};
use gapwatch_core::config::discover_config;
use gapwatch_core::timing;
use output::{OutputMode, resolve_output_mode};
use std::env;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "gw: acquisition completeness for satellite ground segments",
    long_about = None
)]
struct Cli {
    /// Enable debug logging (unless GAPWATCH_LOG is set).
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit a per-phase timing report to stderr.
    #[arg(long, global = true)]
    timing: bool,

    /// Shorthand for `--format json`.
    #[arg(long, global = true)]
    json: bool,

    /// Output format; defaults to pretty on a terminal and text when piped.
    #[arg(long, global = true, value_enum)]
    format: Option<OutputMode>,

    /// Config file (default: $GAPWATCH_CONFIG, then the user config dir).
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Batches",
        about = "Consolidate a batch of product events",
        long_about = "Run one batch of product events through the completeness engine and persist the changed records.",
        after_help = "EXAMPLES:\n    # Consolidate a batch into the record database\n    gw consolidate --events batch.jsonl --db gapwatch.db\n\n    # Preview the instructions without writing\n    gw consolidate --events batch.jsonl --db gapwatch.db --dry-run\n\n    # Read events from stdin, emit JSON\n    cat batch.jsonl | gw consolidate --events - --db gapwatch.db --json"
    )]
    Consolidate(cmd::consolidate::ConsolidateArgs),

    #[command(
        next_help_heading = "Read",
        about = "Show stored records of an acquisition",
        long_about = "List the per product type and aggregate records stored for one acquisition.",
        after_help = "EXAMPLES:\n    # Show a datatake\n    gw show 0x3A4F2 --db gapwatch.db\n\n    # Canonicalize an orbit key first\n    gw show S3A_5_17 --mission S3 --db gapwatch.db"
    )]
    Show(cmd::show::ShowArgs),

    #[command(
        next_help_heading = "Inspect",
        about = "Canonicalize an acquisition id and compute its neighbors",
        after_help = "EXAMPLES:\n    # Both neighbors of a relative orbit\n    gw key S3 S3A_042_001\n\n    # Only the next one\n    gw key S3 S3A_042_385 --next"
    )]
    Key(cmd::key::KeyArgs),

    #[command(
        next_help_heading = "Inspect",
        about = "Resolve a tolerance adjustment",
        after_help = "EXAMPLES:\n    # Local tolerance of a wave mode product\n    gw tolerance S1 local WV_RAW__0A"
    )]
    Tolerance(cmd::tolerance::ToleranceArgs),

    #[command(
        next_help_heading = "Inspect",
        about = "Print the effective configuration",
        after_help = "EXAMPLES:\n    # Show where the config came from and what it contains\n    gw config\n\n    # Use an explicit file\n    gw --config ./gapwatch.toml config --json"
    )]
    Config,
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("GAPWATCH_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose || env::var("DEBUG").is_ok() {
            "gapwatch=debug,info"
        } else {
            "gapwatch=info,warn"
        })
    });

    let format = env::var("GAPWATCH_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let timing_enabled = cli.timing || timing::timing_enabled_from_env();
    timing::set_timing_enabled(timing_enabled);
    timing::clear_timings();

    let (config, source) = discover_config(cli.config.as_deref())?;
    debug!(
        path = ?source.path,
        exists = source.exists,
        missions = config.missions.len(),
        "configuration loaded"
    );
    let output = resolve_output_mode(cli.format, cli.json, config.output.as_deref())?;

    let command_result = match &cli.command {
        Commands::Consolidate(args) => cmd::consolidate::run_consolidate(args, &config, output),
        Commands::Show(args) => cmd::show::run_show(args, &config, output),
        Commands::Key(args) => cmd::key::run_key(args, &config, output),
        Commands::Tolerance(args) => cmd::tolerance::run_tolerance(args, &config, output),
        Commands::Config => cmd::config::run_config(&config, &source, output),
    };

    if timing_enabled {
        let report = timing::collect_report();
        if report.is_empty() {
            eprintln!("timing report: no samples recorded");
        } else {
            eprintln!("timing report:");
            eprintln!("{}", report.display_table());
            eprintln!("timing report (json):");
            eprintln!("{}", serde_json::to_string_pretty(&report.to_json())?);
        }
    }

    command_result
}

//! Lapse: timelapse mirror and artifact publisher.
//!
//! # Usage
//!
//! ```text
//! lapse run [--config <path>] [--partition <domain>/<camera>] [--json] [--every <secs>]
//! lapse status [--config <path>] [--json]
//! lapse config check [--config <path>]
//! lapse config path
//! ```
//!
//! Logs go to stderr; `RUST_LOG` overrides the level, `--verbose` lowers the
//! default to `debug`.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{config::ConfigCommand, run::RunArgs, status::StatusArgs};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "lapse",
    version,
    about = "Mirror camera images, enforce capacity and publish timelapse videos",
    long_about = None,
)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile, evict and publish for every partition (or one).
    Run(RunArgs),

    /// Show the local mirror and the last published artifact per partition.
    Status(StatusArgs),

    /// Inspect the effective configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Commands::Run(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Config { command } => commands::config::run(command),
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

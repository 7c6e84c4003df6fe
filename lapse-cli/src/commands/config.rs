//! `lapse config`: show where configuration comes from and what it resolves to.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use lapse_core::config;

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Load, overlay and validate; print the effective config as YAML.
    Check(CheckArgs),

    /// Print the default config file location.
    Path,
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Config file to use instead of ~/.lapse/config.yaml.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

pub fn run(command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Check(args) => {
            let cfg = config::load(args.config.as_deref()).context("configuration is invalid")?;
            let yaml = config::to_yaml(&cfg).context("failed to render configuration")?;
            print!("{yaml}");
            eprintln!("✓ configuration valid");
            Ok(())
        }
        ConfigCommand::Path => {
            let home = dirs::home_dir().context("could not determine home directory")?;
            println!("{}", config::default_path_at(&home).display());
            Ok(())
        }
    }
}

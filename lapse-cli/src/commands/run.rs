//! `lapse run`: reconcile, evict and publish.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Local;
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use lapse_core::{config, Partition};
use lapse_sync::{ArtifactStatus, DriveStore, Engine, FfmpegEncoder, RunScope, RunSummary};

const TOKEN_VAR: &str = "LAPSE_DRIVE_TOKEN";

/// Arguments for `lapse run`.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Config file to use instead of ~/.lapse/config.yaml.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Run a single partition only.
    #[arg(long, value_name = "DOMAIN/CAMERA")]
    pub partition: Option<Partition>,

    /// Emit machine-readable JSON summaries.
    #[arg(long)]
    pub json: bool,

    /// Keep running, starting a new run this many seconds after the last ended.
    #[arg(long, value_name = "SECS")]
    pub every: Option<u64>,
}

impl RunArgs {
    pub fn run(self) -> Result<()> {
        let cfg = config::load(self.config.as_deref()).context("configuration is invalid")?;
        let token = std::env::var(TOKEN_VAR)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .with_context(|| format!("{TOKEN_VAR} is not set; export a Drive access token"))?;

        let store = DriveStore::new(token);
        let encoder = FfmpegEncoder::new(&cfg.ffmpeg_path);
        let engine = Engine::new(&cfg, &store, &encoder);
        let scope = match self.partition.clone() {
            Some(partition) => RunScope::Partition(partition),
            None => RunScope::All,
        };

        loop {
            let now = Local::now().naive_local();
            let outcome = engine.run(scope.clone(), now);

            let Some(secs) = self.every else {
                let summaries = outcome.context("run failed")?;
                self.report(&summaries)?;
                let failed = summaries.iter().filter(|s| s.is_failure()).count();
                if failed > 0 {
                    bail!("{failed} partition(s) failed");
                }
                return Ok(());
            };

            match outcome {
                Ok(summaries) => self.report(&summaries)?,
                Err(err) => tracing::error!(error = %err, "run failed"),
            }
            tracing::info!(next_in_secs = secs, "waiting for next run");
            std::thread::sleep(Duration::from_secs(secs));
        }
    }

    fn report(&self, summaries: &[RunSummary]) -> Result<()> {
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(summaries).context("failed to serialize run JSON")?
            );
        } else {
            print_table(summaries);
        }
        Ok(())
    }
}

#[derive(Tabled)]
struct RunTableRow {
    #[tabled(rename = "partition")]
    partition: String,
    #[tabled(rename = "new")]
    new_found: usize,
    #[tabled(rename = "downloaded")]
    downloaded: usize,
    #[tabled(rename = "evicted local")]
    evicted_local: usize,
    #[tabled(rename = "evicted remote")]
    evicted_remote: usize,
    #[tabled(rename = "unused deleted")]
    unused_deleted: usize,
    #[tabled(rename = "artifact")]
    artifact: String,
    #[tabled(rename = "time")]
    duration: String,
}

fn print_table(summaries: &[RunSummary]) {
    if summaries.is_empty() {
        println!("No partitions found under the root container.");
        return;
    }

    let rows: Vec<RunTableRow> = summaries
        .iter()
        .map(|s| RunTableRow {
            partition: s.partition.to_string(),
            new_found: s.new_found,
            downloaded: s.downloaded,
            evicted_local: s.evicted_local,
            evicted_remote: s.evicted_remote,
            unused_deleted: s.unused_deleted,
            artifact: artifact_cell(&s.artifact),
            duration: format!("{:.1}s", s.duration_ms as f64 / 1000.0),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    for summary in summaries.iter().filter(|s| !s.errors.is_empty()) {
        println!("{}", summary.partition.to_string().bold());
        for line in &summary.errors {
            println!("  {} {line}", "✗".red());
        }
    }
}

fn artifact_cell(status: &ArtifactStatus) -> String {
    let label = match status {
        ArtifactStatus::Published { name, .. }
        | ArtifactStatus::Unchanged { name }
        | ArtifactStatus::AlreadyPublished { name } => format!("{} {name}", status.label()),
        _ => status.label().to_string(),
    };
    match status {
        ArtifactStatus::Published { .. } => label.green().to_string(),
        ArtifactStatus::Unchanged { .. }
        | ArtifactStatus::AlreadyPublished { .. }
        | ArtifactStatus::NoInputs => label.yellow().to_string(),
        _ => label.red().to_string(),
    }
}

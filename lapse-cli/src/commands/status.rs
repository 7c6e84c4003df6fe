//! `lapse status`: local mirror and publication visibility.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use lapse_core::{config, Partition};
use lapse_sync::{run_state, LocalMirror};

/// Arguments for `lapse status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Config file to use instead of ~/.lapse/config.yaml.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let cfg = config::load(self.config.as_deref()).context("configuration is invalid")?;
        let report = build_report(&cfg.mirror_root, cfg.local_max_count)?;
        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to serialize status JSON")?
            );
            return Ok(());
        }
        print_table(&report);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct StatusReport {
    mirror_root: PathBuf,
    local_max_count: usize,
    partitions: Vec<PartitionStatus>,
}

#[derive(Debug, Serialize)]
struct PartitionStatus {
    partition: String,
    images: usize,
    total_bytes: u64,
    oldest: Option<DateTime<Utc>>,
    newest: Option<DateTime<Utc>>,
    last_artifact: Option<String>,
    last_published_at: Option<DateTime<Utc>>,
}

#[derive(Tabled)]
struct StatusTableRow {
    #[tabled(rename = "partition")]
    partition: String,
    #[tabled(rename = "images")]
    images: String,
    #[tabled(rename = "size")]
    size: String,
    #[tabled(rename = "newest image")]
    newest: String,
    #[tabled(rename = "last artifact")]
    last_artifact: String,
}

fn build_report(mirror_root: &Path, local_max_count: usize) -> Result<StatusReport> {
    let mirror = LocalMirror::new(mirror_root);
    let partitions = mirror
        .partitions()
        .with_context(|| format!("failed to scan mirror at {}", mirror_root.display()))?;

    let mut rows = Vec::with_capacity(partitions.len());
    for partition in &partitions {
        rows.push(partition_status(&mirror, partition)?);
    }
    Ok(StatusReport {
        mirror_root: mirror_root.to_path_buf(),
        local_max_count,
        partitions: rows,
    })
}

fn partition_status(mirror: &LocalMirror, partition: &Partition) -> Result<PartitionStatus> {
    let entries = mirror
        .list(partition)
        .with_context(|| format!("failed to list {partition}"))?;
    let state = run_state::load(mirror.root(), partition)
        .with_context(|| format!("failed to load run state for {partition}"))?;
    let published = state.published;
    Ok(PartitionStatus {
        partition: partition.to_string(),
        images: entries.len(),
        total_bytes: entries.iter().map(|e| e.size_bytes).sum(),
        oldest: entries.iter().map(|e| e.modified_at).min(),
        newest: entries.iter().map(|e| e.modified_at).max(),
        last_artifact: published.as_ref().map(|p| p.name.clone()),
        last_published_at: published.map(|p| p.published_at),
    })
}

fn print_table(report: &StatusReport) {
    println!(
        "Lapse v{} | {} | {} partitions",
        env!("CARGO_PKG_VERSION"),
        report.mirror_root.display(),
        report.partitions.len(),
    );
    if report.partitions.is_empty() {
        println!("No partitions in the local mirror yet. Run `lapse run` first.");
        return;
    }

    let rows: Vec<StatusTableRow> = report
        .partitions
        .iter()
        .map(|p| {
            let count = format!("{}/{}", p.images, report.local_max_count);
            StatusTableRow {
                partition: p.partition.clone(),
                images: if p.images > report.local_max_count {
                    count.red().to_string()
                } else {
                    count
                },
                size: format_bytes(p.total_bytes),
                newest: p.newest.map(format_age).unwrap_or_else(|| "-".to_string()),
                last_artifact: match (&p.last_artifact, p.last_published_at) {
                    (Some(name), Some(at)) => format!("{name} ({})", format_age(at)),
                    _ => "never".bright_black().to_string(),
                },
            }
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn format_age(at: DateTime<Utc>) -> String {
    let secs = (Utc::now() - at).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}

//! Per-partition run pipeline used by `lapse run`.
//!
//! ```text
//! resolve containers
//!   └─ [sync_enabled] reconcile ─► evict local ─► evict remote
//!        └─ list local inputs ── empty ──► NoInputs (halt)
//!             └─ frame sequence ─► already published? ─► unchanged?
//!                  └─ identify previous ─► replace ─► save run state
//!                       └─ [cleanup_unused_inputs] unused cleanup
//! ```
//!
//! Steps run strictly in this order. A failed step is logged and recorded in
//! the [`RunSummary`]; independent later steps still run, but nothing after
//! a failed replacement is attempted. Partitions run one after another.

use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

use lapse_core::{LapseConfig, Partition};

use crate::capacity::{enforce, LocalImages, RemoteImages};
use crate::cleanup::cleanup_unused;
use crate::encoder::VideoEncoder;
use crate::error::{io_err, SyncError};
use crate::lister::{PartitionTarget, Remote};
use crate::mirror::LocalMirror;
use crate::reconcile::reconcile;
use crate::replacer::{frame_sequence, ArtifactReplacer, ReplaceJob, Supersede};
use crate::retry::{Cancellation, RetryPolicy};
use crate::run_state::{self, PublishedArtifact, RunState};
use crate::store::RemoteStore;

/// Scope for a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunScope {
    /// Every partition discovered under the root container.
    All,
    /// A single `domain/camera` partition.
    Partition(Partition),
}

/// `timelapse_YYYYMMDD_HHMMSS.mp4` from the run's local start time.
pub fn artifact_name(now: &NaiveDateTime) -> String {
    format!("timelapse_{}.mp4", now.format("%Y%m%d_%H%M%S"))
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// Where the artifact step ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ArtifactStatus {
    /// The run stopped before reaching the artifact step.
    NotReached,
    Published {
        name: String,
        remote_id: String,
        bytes: u64,
        inputs: usize,
        superseded: Option<String>,
        old: Supersede,
    },
    /// Inputs match the last published artifact; nothing was encoded.
    Unchanged { name: String },
    /// An artifact with this run's name already exists remotely.
    AlreadyPublished { name: String },
    NoInputs,
    EncodeFailed { reason: String },
    UploadFailed { reason: String },
    Failed { reason: String },
    Cancelled,
}

impl ArtifactStatus {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ArtifactStatus::NotReached
                | ArtifactStatus::EncodeFailed { .. }
                | ArtifactStatus::UploadFailed { .. }
                | ArtifactStatus::Failed { .. }
                | ArtifactStatus::Cancelled
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ArtifactStatus::NotReached => "not reached",
            ArtifactStatus::Published { .. } => "published",
            ArtifactStatus::Unchanged { .. } => "unchanged",
            ArtifactStatus::AlreadyPublished { .. } => "already published",
            ArtifactStatus::NoInputs => "no inputs",
            ArtifactStatus::EncodeFailed { .. } => "encode failed",
            ArtifactStatus::UploadFailed { .. } => "upload failed",
            ArtifactStatus::Failed { .. } => "failed",
            ArtifactStatus::Cancelled => "cancelled",
        }
    }
}

/// Structured result of one partition run, produced even on failure.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub partition: Partition,
    pub started_at: DateTime<Utc>,
    pub new_found: usize,
    pub downloaded: usize,
    pub download_failed: usize,
    pub evicted_local: usize,
    pub evicted_remote: usize,
    pub eviction_failed: usize,
    pub unused_deleted: usize,
    pub artifact: ArtifactStatus,
    /// One line per recovered or fatal failure, in order.
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl RunSummary {
    fn new(partition: Partition) -> Self {
        Self {
            partition,
            started_at: Utc::now(),
            new_found: 0,
            downloaded: 0,
            download_failed: 0,
            evicted_local: 0,
            evicted_remote: 0,
            eviction_failed: 0,
            unused_deleted: 0,
            artifact: ArtifactStatus::NotReached,
            errors: Vec::new(),
            duration_ms: 0,
        }
    }

    fn record(&mut self, step: &str, err: &SyncError) {
        tracing::warn!(partition = %self.partition, step, error = %err, "step failed");
        self.errors.push(format!("{step}: {err}"));
    }

    fn record_items(&mut self, step: &str, failed: &[(String, String)]) {
        for (name, reason) in failed {
            self.errors.push(format!("{step} {name}: {reason}"));
        }
    }

    /// Record a failure that ends the run.
    fn halt(&mut self, step: &str, err: &SyncError) {
        self.record(step, err);
        self.artifact = if err.is_cancelled() {
            ArtifactStatus::Cancelled
        } else {
            ArtifactStatus::Failed {
                reason: format!("{step}: {err}"),
            }
        };
    }

    pub fn is_failure(&self) -> bool {
        self.artifact.is_failure()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The configured pipeline: one store, one encoder, one cancellation token.
pub struct Engine<'a> {
    config: &'a LapseConfig,
    store: &'a dyn RemoteStore,
    encoder: &'a dyn VideoEncoder,
    retry: RetryPolicy,
    cancel: Cancellation,
    mirror: LocalMirror,
}

impl<'a> Engine<'a> {
    pub fn new(
        config: &'a LapseConfig,
        store: &'a dyn RemoteStore,
        encoder: &'a dyn VideoEncoder,
    ) -> Self {
        Self {
            config,
            store,
            encoder,
            retry: RetryPolicy::from_settings(&config.retry),
            cancel: Cancellation::new(),
            mirror: LocalMirror::new(&config.mirror_root),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn mirror(&self) -> &LocalMirror {
        &self.mirror
    }

    /// Camera folders under the root container.
    pub fn discover(&self) -> Result<Vec<PartitionTarget>, SyncError> {
        Remote::new(self.store, &self.retry, &self.cancel)
            .discover_partitions(&self.config.root_container)
    }

    /// Run the pipeline for `scope`.
    ///
    /// Discovery failures are returned; everything after discovery is
    /// reported per partition in the summaries. `now` is the local wall
    /// clock used to name artifacts.
    pub fn run(&self, scope: RunScope, now: NaiveDateTime) -> Result<Vec<RunSummary>, SyncError> {
        let mut targets = self.discover()?;
        if let RunScope::Partition(wanted) = &scope {
            targets.retain(|t| &t.partition == wanted);
            if targets.is_empty() {
                return Err(SyncError::UnknownPartition {
                    partition: wanted.to_string(),
                });
            }
        }

        let mut summaries = Vec::with_capacity(targets.len());
        for target in &targets {
            if self.cancel.is_cancelled() {
                tracing::warn!(partition = %target.partition, "run cancelled; skipping");
                let mut summary = RunSummary::new(target.partition.clone());
                summary.artifact = ArtifactStatus::Cancelled;
                summaries.push(summary);
                continue;
            }
            summaries.push(self.run_partition(target, now));
        }
        Ok(summaries)
    }

    /// Run every step for one partition. Never fails; see [`RunSummary`].
    pub fn run_partition(&self, target: &PartitionTarget, now: NaiveDateTime) -> RunSummary {
        let started = Instant::now();
        let cancel = match self.config.run_deadline_secs {
            Some(secs) => self.cancel.with_timeout(Duration::from_secs(secs)),
            None => self.cancel.clone(),
        };
        let remote = Remote::new(self.store, &self.retry, &cancel);
        let mut summary = RunSummary::new(target.partition.clone());
        tracing::info!(partition = %target.partition, "run started");

        self.run_steps(&remote, target, now, &mut summary);

        summary.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            partition = %summary.partition,
            new = summary.new_found,
            downloaded = summary.downloaded,
            evicted_local = summary.evicted_local,
            evicted_remote = summary.evicted_remote,
            unused_deleted = summary.unused_deleted,
            artifact = summary.artifact.label(),
            duration_ms = summary.duration_ms,
            "run finished"
        );
        summary
    }

    fn run_steps(
        &self,
        remote: &Remote<'_>,
        target: &PartitionTarget,
        now: NaiveDateTime,
        summary: &mut RunSummary,
    ) {
        let config = self.config;
        let partition = &target.partition;

        // 1. Containers.
        let containers = match remote.resolve_containers(
            &target.camera_id,
            &config.image_folder_name,
            &config.artifact_folder_name,
        ) {
            Ok(c) => c,
            Err(err) => return summary.halt("resolve", &err),
        };

        // 2. Reconcile, then evict each store independently.
        if config.sync_enabled {
            match reconcile(remote, &self.mirror, partition, &containers.images) {
                Ok(report) => {
                    summary.new_found = report.new_objects.len();
                    summary.downloaded = report.downloaded;
                    summary.download_failed = report.failed.len();
                    summary.record_items("download", &report.failed);
                }
                Err(err) if err.is_cancelled() => return summary.halt("reconcile", &err),
                Err(err) => summary.record("reconcile", &err),
            }

            let local = LocalImages {
                mirror: &self.mirror,
                partition,
            };
            match enforce(&local, partition, &config.local_policy()) {
                Ok(report) => {
                    summary.evicted_local = report.removed;
                    summary.eviction_failed += report.failed.len();
                    summary.record_items("evict local", &report.failed);
                }
                Err(err) => summary.record("evict local", &err),
            }

            let remote_images = RemoteImages {
                remote: *remote,
                container: &containers.images,
            };
            match enforce(&remote_images, partition, &config.remote_policy()) {
                Ok(report) => {
                    summary.evicted_remote = report.removed;
                    summary.eviction_failed += report.failed.len();
                    summary.record_items("evict remote", &report.failed);
                }
                Err(err) if err.is_cancelled() => return summary.halt("evict remote", &err),
                Err(err) => summary.record("evict remote", &err),
            }
        }

        // 3. Usable local inputs.
        let entries = match self.mirror.list(partition) {
            Ok(entries) => entries,
            Err(err) => return summary.halt("list local", &err),
        };
        if entries.is_empty() {
            tracing::warn!(partition = %partition, "no local inputs; skipping artifact");
            summary.artifact = ArtifactStatus::NoInputs;
            return;
        }
        let frames = frame_sequence(entries, config.max_inputs_per_artifact);
        let digest = frames.digest();

        // 4. Same-name artifact already published.
        let name = artifact_name(&now);
        match remote.artifact_exists(&containers.artifacts, &name) {
            Ok(true) => {
                tracing::info!(partition = %partition, name = %name, "artifact already published");
                summary.artifact = ArtifactStatus::AlreadyPublished { name };
                return;
            }
            Ok(false) => {}
            Err(err) => return summary.halt("check artifact", &err),
        }

        // 5. Unchanged inputs.
        let mut state = match run_state::load(&config.mirror_root, partition) {
            Ok(state) => state,
            Err(err) => {
                summary.record("load state", &err);
                RunState::default()
            }
        };
        let unchanged = match (&state.published, config.skip_unchanged) {
            (Some(published), true) if published.inputs_digest == digest => {
                match self.still_published(remote, published) {
                    Ok(present) => present.then(|| published.name.clone()),
                    Err(err) => return summary.halt("check published", &err),
                }
            }
            _ => None,
        };

        if let Some(name) = unchanged {
            tracing::info!(partition = %partition, name = %name, "inputs unchanged; skipping encode");
            summary.artifact = ArtifactStatus::Unchanged { name };
        } else {
            // 6. Previous artifact, identified before anything is uploaded.
            let previous = match remote.latest_artifact(&containers.artifacts) {
                Ok(previous) => previous,
                Err(err) if err.is_cancelled() => return summary.halt("identify previous", &err),
                Err(err) => {
                    summary.record("identify previous", &err);
                    None
                }
            };

            // 7. Replace.
            let work = match self.work_dir() {
                Ok(work) => work,
                Err(err) => return summary.halt("work dir", &err),
            };
            let job = ReplaceJob {
                partition,
                frames: &frames,
                container: &containers.artifacts,
                artifact_name: &name,
                work_dir: work.path(),
                frame_rate: config.frame_rate,
                previous: previous.as_ref(),
            };
            let mut replacer = ArtifactReplacer::new(*remote, self.encoder);
            if !config.delete_previous_artifact {
                replacer = replacer.keep_previous();
            }
            let replacement = match replacer.replace(&job) {
                Ok(replacement) => replacement,
                Err(err) => {
                    summary.record("replace", &err);
                    summary.artifact = match &err {
                        e if e.is_cancelled() => ArtifactStatus::Cancelled,
                        SyncError::EncodeFailed(e) => ArtifactStatus::EncodeFailed {
                            reason: e.to_string(),
                        },
                        SyncError::UploadFailed { source, .. } => ArtifactStatus::UploadFailed {
                            reason: source.to_string(),
                        },
                        SyncError::NoInputs { .. } => ArtifactStatus::NoInputs,
                        e => ArtifactStatus::Failed {
                            reason: e.to_string(),
                        },
                    };
                    return;
                }
            };
            if let Supersede::Failed(reason) = &replacement.old {
                summary
                    .errors
                    .push(format!("delete previous artifact: {reason}"));
            }

            // 8. Remember what was published.
            let remote_id = replacement.artifact.remote_id.clone().unwrap_or_default();
            state.published = Some(PublishedArtifact {
                name: name.clone(),
                remote_id: remote_id.clone(),
                inputs_digest: digest,
                input_count: frames.len(),
                published_at: Utc::now(),
            });
            state.updated_at = Some(Utc::now());
            if let Err(err) = run_state::save(&config.mirror_root, partition, &state) {
                summary.record("save state", &err);
            }
            summary.artifact = ArtifactStatus::Published {
                name,
                remote_id,
                bytes: replacement.bytes,
                inputs: frames.len(),
                superseded: replacement.superseded,
                old: replacement.old,
            };
        }

        // 9. Unused remote inputs.
        if config.cleanup_unused_inputs {
            match cleanup_unused(
                remote,
                partition,
                &containers.images,
                frames.names(),
                config.max_remote_keep,
            ) {
                Ok(report) => {
                    summary.unused_deleted = report.deleted;
                    summary.record_items("cleanup", &report.failed);
                }
                Err(err) => summary.record("cleanup", &err),
            }
        }
    }

    /// Whether the recorded artifact still exists and is not trashed.
    fn still_published(
        &self,
        remote: &Remote<'_>,
        published: &PublishedArtifact,
    ) -> Result<bool, SyncError> {
        let found = remote
            .retry
            .execute("get", &published.name, remote.cancel, || {
                remote.store.get(&published.remote_id)
            });
        match found {
            Ok(stored) => Ok(!stored.trashed),
            Err(SyncError::NotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Scratch directory for one encode, removed on drop.
    fn work_dir(&self) -> Result<tempfile::TempDir, SyncError> {
        let base = match &self.config.work_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir(),
        };
        std::fs::create_dir_all(&base).map_err(|e| io_err(&base, e))?;
        tempfile::Builder::new()
            .prefix("lapse-")
            .tempdir_in(&base)
            .map_err(|e| io_err(&base, e))
    }
}

//! Artifact replacer: build, upload, and only then retire the old artifact.
//!
//! ```text
//! Idle ─► Building ─► Built ─► Uploading ─► Uploaded ─► SwappingOld ─► Done
//!            │                     │
//!            └──────► Failed ◄─────┘
//! ```
//!
//! The previous artifact is identified by the caller before the run and is
//! touched only in `SwappingOld`, after the new artifact is confirmed
//! uploaded. A failure there is logged and reported, never escalated.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use serde::Serialize;

use lapse_core::{Artifact, LocalEntry, Partition, RemoteObject};

use crate::encoder::{ensure_output, VideoEncoder};
use crate::error::{io_err, SyncError};
use crate::lister::Remote;
use crate::retry::Removal;
use crate::run_state::digest_inputs;
use crate::store::{NewObject, StoreError, ARTIFACT_MIME};

/// Replacer lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceState {
    Idle,
    Building,
    Built,
    Uploading,
    Uploaded,
    SwappingOld,
    Done,
    Failed,
}

impl fmt::Display for ReplaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplaceState::Idle => "idle",
            ReplaceState::Building => "building",
            ReplaceState::Built => "built",
            ReplaceState::Uploading => "uploading",
            ReplaceState::Uploaded => "uploaded",
            ReplaceState::SwappingOld => "swapping_old",
            ReplaceState::Done => "done",
            ReplaceState::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Frame sequence
// ---------------------------------------------------------------------------

/// Ordered encoder input: local entries sorted by name, capped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameSequence {
    pub frames: Vec<LocalEntry>,
    /// Entries beyond the cap.
    pub dropped: usize,
}

impl FrameSequence {
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.frames.iter().map(|e| e.name.as_str())
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.frames.iter().map(|e| e.path.clone()).collect()
    }

    pub fn digest(&self) -> String {
        digest_inputs(self.names())
    }
}

/// Sort `entries` by name and keep the first `cap`.
pub fn frame_sequence(mut entries: Vec<LocalEntry>, cap: usize) -> FrameSequence {
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    let dropped = entries.len().saturating_sub(cap);
    entries.truncate(cap);
    FrameSequence {
        frames: entries,
        dropped,
    }
}

// ---------------------------------------------------------------------------
// Replacement
// ---------------------------------------------------------------------------

/// Everything one replacement needs.
#[derive(Debug)]
pub struct ReplaceJob<'a> {
    pub partition: &'a Partition,
    pub frames: &'a FrameSequence,
    /// Remote artifact folder.
    pub container: &'a str,
    pub artifact_name: &'a str,
    /// Scratch directory for the encoded file.
    pub work_dir: &'a Path,
    pub frame_rate: u32,
    /// Previously published artifact, identified before this run.
    pub previous: Option<&'a RemoteObject>,
}

/// What happened to the previously published artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum Supersede {
    NoPrevious,
    Deleted,
    AlreadyAbsent,
    /// Deletion disabled by configuration.
    Kept,
    /// The store returned the old id for the new upload; nothing to delete.
    SameObject,
    /// Deletion failed; the old artifact may still exist.
    Failed(String),
}

/// A completed replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replacement {
    pub artifact: Artifact,
    pub bytes: u64,
    /// Name of the artifact this one superseded.
    pub superseded: Option<String>,
    pub old: Supersede,
}

/// Drives one partition's artifact through [`ReplaceState`].
pub struct ArtifactReplacer<'a> {
    remote: Remote<'a>,
    encoder: &'a dyn VideoEncoder,
    delete_previous: bool,
    state: ReplaceState,
    trail: Vec<ReplaceState>,
}

impl<'a> ArtifactReplacer<'a> {
    pub fn new(remote: Remote<'a>, encoder: &'a dyn VideoEncoder) -> Self {
        Self {
            remote,
            encoder,
            delete_previous: true,
            state: ReplaceState::Idle,
            trail: vec![ReplaceState::Idle],
        }
    }

    /// Leave the previous artifact in place after upload.
    pub fn keep_previous(mut self) -> Self {
        self.delete_previous = false;
        self
    }

    pub fn state(&self) -> ReplaceState {
        self.state
    }

    /// Every state entered so far, starting with `Idle`.
    pub fn trail(&self) -> &[ReplaceState] {
        &self.trail
    }

    fn enter(&mut self, partition: &Partition, next: ReplaceState) {
        tracing::debug!(partition = %partition, from = %self.state, to = %next, "replacer");
        self.state = next;
        self.trail.push(next);
    }

    fn fail(&mut self, partition: &Partition, err: SyncError) -> SyncError {
        tracing::error!(partition = %partition, state = %self.state, error = %err, "replacement failed");
        self.enter(partition, ReplaceState::Failed);
        err
    }

    pub fn replace(&mut self, job: &ReplaceJob<'_>) -> Result<Replacement, SyncError> {
        let partition = job.partition;
        if job.frames.is_empty() {
            return Err(self.fail(
                partition,
                SyncError::NoInputs {
                    partition: partition.to_string(),
                },
            ));
        }

        // Build.
        self.enter(partition, ReplaceState::Building);
        if job.frames.dropped > 0 {
            tracing::warn!(
                partition = %partition,
                used = job.frames.len(),
                dropped = job.frames.dropped,
                "input cap reached; trailing frames left out"
            );
        }
        let output = job.work_dir.join(job.artifact_name);
        let built = self
            .encoder
            .encode(&job.frames.paths(), job.frame_rate, &output)
            .and_then(|()| ensure_output(&output));
        let bytes = match built {
            Ok(bytes) => bytes,
            Err(err) => return Err(self.fail(partition, SyncError::from(err))),
        };
        self.enter(partition, ReplaceState::Built);

        // Upload.
        self.enter(partition, ReplaceState::Uploading);
        let remote_id = match self.upload(job, &output, bytes) {
            Ok(id) => id,
            Err(err) => {
                let err = SyncError::UploadFailed {
                    name: job.artifact_name.to_string(),
                    source: Box::new(err),
                };
                return Err(self.fail(partition, err));
            }
        };
        self.enter(partition, ReplaceState::Uploaded);
        tracing::info!(
            partition = %partition,
            name = job.artifact_name,
            id = %remote_id,
            bytes,
            "artifact uploaded"
        );

        // Retire the old artifact.
        self.enter(partition, ReplaceState::SwappingOld);
        let old = match job.previous {
            None => Supersede::NoPrevious,
            Some(_) if !self.delete_previous => Supersede::Kept,
            Some(prev) if prev.id == remote_id => Supersede::SameObject,
            Some(prev) => match self.remote.delete(prev) {
                Ok(Removal::Removed) => {
                    tracing::info!(partition = %partition, name = %prev.name, "previous artifact deleted");
                    Supersede::Deleted
                }
                Ok(Removal::AlreadyAbsent) => Supersede::AlreadyAbsent,
                Err(err) => {
                    tracing::warn!(
                        partition = %partition,
                        name = %prev.name,
                        error = %err,
                        "could not delete previous artifact"
                    );
                    Supersede::Failed(err.to_string())
                }
            },
        };
        self.enter(partition, ReplaceState::Done);

        Ok(Replacement {
            artifact: Artifact {
                name: job.artifact_name.to_string(),
                local_path: output,
                remote_id: Some(remote_id),
            },
            bytes,
            superseded: job.previous.map(|p| p.name.clone()),
            old,
        })
    }

    fn upload(&self, job: &ReplaceJob<'_>, output: &Path, len: u64) -> Result<String, SyncError> {
        let meta = NewObject {
            name: job.artifact_name.to_string(),
            mime_type: ARTIFACT_MIME.to_string(),
            parent: job.container.to_string(),
        };
        if !output.exists() {
            return Err(io_err(output, std::io::ErrorKind::NotFound.into()));
        }
        let store = self.remote.store;
        self.remote
            .retry
            .execute("upload", job.artifact_name, self.remote.cancel, || {
                // Reopen per attempt; a failed attempt may have consumed the reader.
                let mut file = File::open(output).map_err(|e| StoreError::from_io(&e))?;
                store.upload(&meta, &mut file, len)
            })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tempfile::TempDir;

    use super::*;
    use crate::encoder::{Script, ScriptedEncoder};
    use crate::retry::{Cancellation, RetryPolicy};
    use crate::store::memory::StoreOp;
    use crate::store::{MemoryStore, RemoteStore};

    fn entry(dir: &Path, name: &str) -> LocalEntry {
        LocalEntry {
            name: name.to_string(),
            path: dir.join(name),
            size_bytes: 1,
            modified_at: Utc::now(),
        }
    }

    #[test]
    fn frame_sequence_sorts_by_name_and_caps() {
        let dir = Path::new("/m");
        let seq = frame_sequence(
            vec![entry(dir, "c.jpg"), entry(dir, "a.jpg"), entry(dir, "b.jpg")],
            2,
        );
        assert_eq!(seq.names().collect::<Vec<_>>(), vec!["a.jpg", "b.jpg"]);
        assert_eq!(seq.dropped, 1);
    }

    struct Fixture {
        store: MemoryStore,
        folder: String,
        previous: RemoteObject,
        work: TempDir,
        frames: FrameSequence,
        retry: RetryPolicy,
        cancel: Cancellation,
        partition: Partition,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let root = store.add_folder(None, "timelapse");
        let prev_id = store.add_object(&root, "timelapse_old.mp4", "video/mp4", b"old", None);
        let previous = store.get(&prev_id).unwrap().object;
        let work = TempDir::new().unwrap();
        let frames = frame_sequence(vec![entry(work.path(), "a.jpg")], 10);
        Fixture {
            store,
            folder: root,
            previous,
            work,
            frames,
            retry: RetryPolicy::immediate(3),
            cancel: Cancellation::new(),
            partition: Partition::new("farm", "Cam1"),
        }
    }

    impl Fixture {
        fn job(&self) -> ReplaceJob<'_> {
            ReplaceJob {
                partition: &self.partition,
                frames: &self.frames,
                container: &self.folder,
                artifact_name: "timelapse_new.mp4",
                work_dir: self.work.path(),
                frame_rate: 24,
                previous: Some(&self.previous),
            }
        }

        fn remote(&self) -> Remote<'_> {
            Remote::new(&self.store, &self.retry, &self.cancel)
        }
    }

    #[test]
    fn happy_path_uploads_before_deleting() {
        let fx = fixture();
        let encoder = ScriptedEncoder::succeeding();
        let mut replacer = ArtifactReplacer::new(fx.remote(), &encoder);
        let done = replacer.replace(&fx.job()).unwrap();

        assert_eq!(done.old, Supersede::Deleted);
        assert_eq!(fx.store.child_names(&fx.folder), vec!["timelapse_new.mp4"]);
        let ops: Vec<_> = fx
            .store
            .calls()
            .into_iter()
            .filter(|c| matches!(c.op, StoreOp::Upload | StoreOp::Delete))
            .map(|c| c.op)
            .collect();
        assert_eq!(ops, vec![StoreOp::Upload, StoreOp::Delete]);
        assert_eq!(
            replacer.trail(),
            &[
                ReplaceState::Idle,
                ReplaceState::Building,
                ReplaceState::Built,
                ReplaceState::Uploading,
                ReplaceState::Uploaded,
                ReplaceState::SwappingOld,
                ReplaceState::Done,
            ]
        );
    }

    #[test]
    fn upload_failure_keeps_previous_artifact() {
        let fx = fixture();
        fx.store
            .fail_always(StoreOp::Upload, None, StoreError::permission_denied("quota"));
        let encoder = ScriptedEncoder::succeeding();
        let mut replacer = ArtifactReplacer::new(fx.remote(), &encoder);
        let err = replacer.replace(&fx.job()).unwrap_err();

        assert!(matches!(err, SyncError::UploadFailed { .. }), "got {err:?}");
        assert_eq!(replacer.state(), ReplaceState::Failed);
        assert!(fx.store.contains(&fx.previous.id));
        assert!(fx.store.calls_of(StoreOp::Delete).is_empty());
    }

    #[test]
    fn transient_upload_failure_is_retried() {
        let fx = fixture();
        fx.store
            .fail_times(StoreOp::Upload, None, 2, StoreError::transient("broken pipe"));
        let encoder = ScriptedEncoder::succeeding();
        let mut replacer = ArtifactReplacer::new(fx.remote(), &encoder);
        let done = replacer.replace(&fx.job()).unwrap();
        assert_eq!(fx.store.calls_of(StoreOp::Upload).len(), 3);
        let id = done.artifact.remote_id.unwrap();
        assert_eq!(fx.store.data(&id).unwrap(), b"video");
    }

    #[test]
    fn empty_encoder_output_is_encode_failure() {
        let fx = fixture();
        let encoder = ScriptedEncoder::new(Script::Empty);
        let mut replacer = ArtifactReplacer::new(fx.remote(), &encoder);
        let err = replacer.replace(&fx.job()).unwrap_err();
        assert!(matches!(err, SyncError::EncodeFailed(_)), "got {err:?}");
        assert!(fx.store.calls_of(StoreOp::Upload).is_empty());
        assert!(fx.store.contains(&fx.previous.id));
    }

    #[test]
    fn failed_old_deletion_is_not_escalated() {
        let fx = fixture();
        fx.store.fail_always(
            StoreOp::Delete,
            Some(&fx.previous.id),
            StoreError::permission_denied("not owner"),
        );
        let encoder = ScriptedEncoder::succeeding();
        let mut replacer = ArtifactReplacer::new(fx.remote(), &encoder);
        let done = replacer.replace(&fx.job()).unwrap();
        assert!(matches!(done.old, Supersede::Failed(_)));
        assert_eq!(replacer.state(), ReplaceState::Done);
    }

    #[test]
    fn already_deleted_previous_is_success() {
        let fx = fixture();
        fx.store.delete(&fx.previous.id).unwrap();
        let encoder = ScriptedEncoder::succeeding();
        let mut replacer = ArtifactReplacer::new(fx.remote(), &encoder);
        let done = replacer.replace(&fx.job()).unwrap();
        assert_eq!(done.old, Supersede::AlreadyAbsent);
    }

    #[test]
    fn keep_previous_leaves_old_artifact() {
        let fx = fixture();
        let encoder = ScriptedEncoder::succeeding();
        let mut replacer = ArtifactReplacer::new(fx.remote(), &encoder).keep_previous();
        let done = replacer.replace(&fx.job()).unwrap();
        assert_eq!(done.old, Supersede::Kept);
        assert!(fx.store.contains(&fx.previous.id));
    }
}

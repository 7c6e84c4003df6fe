//! Run state: per-partition record of the last published artifact.
//!
//! Persists a `RunState` JSON document at
//! `<mirror_root>/.lapse/state/<domain>/<camera>.json`.
//! Writes use the atomic `.tmp` + rename pattern.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use lapse_core::Partition;

use crate::error::{io_err, SyncError};

/// The artifact a partition's last successful replacement published.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishedArtifact {
    pub name: String,
    pub remote_id: String,
    /// SHA-256 over the ordered input names (see [`digest_inputs`]).
    pub inputs_digest: String,
    pub input_count: usize,
    pub published_at: DateTime<Utc>,
}

/// On-disk state payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    #[serde(default)]
    pub published: Option<PublishedArtifact>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// `<mirror_root>/.lapse/state/<domain>/<camera>.json`
pub fn state_path(mirror_root: &Path, partition: &Partition) -> PathBuf {
    partition.state_file_under(&mirror_root.join(".lapse").join("state"))
}

/// Load the state for `partition`; empty if the file does not exist yet.
pub fn load(mirror_root: &Path, partition: &Partition) -> Result<RunState, SyncError> {
    let path = state_path(mirror_root, partition);
    if !path.exists() {
        return Ok(RunState::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    Ok(serde_json::from_str(&contents)?)
}

/// Save the state for `partition` atomically.
pub fn save(mirror_root: &Path, partition: &Partition, state: &RunState) -> Result<(), SyncError> {
    let path = state_path(mirror_root, partition);
    let Some(dir) = path.parent() else {
        return Err(io_err(path, std::io::Error::other("invalid run state path")));
    };
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let json = serde_json::to_string_pretty(state)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, &path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(&path, e));
    }
    Ok(())
}

/// Hex SHA-256 over the input names, one per line, in order.
pub fn digest_inputs<'a, I>(names: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut h = Sha256::new();
    for name in names {
        h.update(name.as_bytes());
        h.update(b"\n");
    }
    hex::encode(h.finalize())
}

//! Domain types shared by the sync engine and the CLI.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.
//! Timestamps are `DateTime<Utc>` regardless of the source clock.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed name for a domain (site / location) folder.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DomainName(pub String);

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for DomainName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for DomainName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A strongly-typed name for a camera folder inside a domain.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CameraName(pub String);

impl fmt::Display for CameraName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for CameraName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CameraName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Partition
// ---------------------------------------------------------------------------

/// A `(domain, camera)` pair scoping one independent pipeline instance.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub domain: DomainName,
    pub camera: CameraName,
}

impl Partition {
    pub fn new(domain: impl Into<DomainName>, camera: impl Into<CameraName>) -> Self {
        Self {
            domain: domain.into(),
            camera: camera.into(),
        }
    }

    /// `<root>/<domain>/<camera>`. Pure, no I/O.
    pub fn dir_under(&self, root: &Path) -> PathBuf {
        root.join(&self.domain.0).join(&self.camera.0)
    }

    /// `<dir>/<domain>/<camera>.json`, the per-partition state file.
    pub fn state_file_under(&self, dir: &Path) -> PathBuf {
        dir.join(&self.domain.0).join(format!("{}.json", self.camera.0))
    }

    /// Both names can be used as single path components.
    pub fn is_safe(&self) -> bool {
        is_safe_name(&self.domain.0) && is_safe_name(&self.camera.0)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.camera)
    }
}

impl FromStr for Partition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((domain, camera)) = s.split_once('/') else {
            return Err(format!("invalid partition '{s}'; expected <domain>/<camera>"));
        };
        if domain.is_empty() || camera.is_empty() || camera.contains('/') {
            return Err(format!("invalid partition '{s}'; expected <domain>/<camera>"));
        }
        let partition = Partition::new(domain, camera);
        if !partition.is_safe() {
            return Err(format!(
                "invalid partition '{s}'; names must not contain '..' or path separators"
            ));
        }
        Ok(partition)
    }
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

/// An object held by the remote store. Identity is `id`; `name` may repeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteObject {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl RemoteObject {
    pub fn stem(&self) -> &str {
        stem(&self.name)
    }
}

/// A file in the local mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEntry {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified_at: DateTime<Utc>,
}

impl LocalEntry {
    pub fn stem(&self) -> &str {
        stem(&self.name)
    }
}

/// Maximum entry count enforced on one store for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityPolicy {
    pub max_count: usize,
}

impl CapacityPolicy {
    pub fn new(max_count: usize) -> Self {
        Self { max_count }
    }

    /// Number of entries that must go for `count` entries to fit.
    pub fn overflow(&self, count: usize) -> usize {
        count.saturating_sub(self.max_count)
    }
}

/// The derived output produced for a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub local_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
}

/// A store-supplied name that can be used as one path component as-is.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && !name.contains("..")
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

/// Name with its final extension removed; the cross-store identity key.
///
/// A leading dot does not start an extension (`.hidden` stays `.hidden`).
pub fn stem(name: &str) -> &str {
    match name.rfind('.') {
        None | Some(0) => name,
        Some(idx) => &name[..idx],
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

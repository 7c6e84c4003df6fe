//! Local mirror inspector.
//!
//! Layout: `<root>/<domain>/<camera>/<image files>`. Only files with an
//! image extension count as entries; in-flight downloads
//! (`<name>.lapse.tmp`) never do.
//!
//! ## `install` protocol
//!
//! 1. Create the partition directory.
//! 2. Write bytes to `<name>.lapse.tmp`.
//! 3. Rename onto `<name>` (atomic on POSIX).
//! 4. On any failure, remove the temp file.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use lapse_core::{LocalEntry, Partition};

use crate::error::{io_err, SyncError};
use crate::retry::Removal;

pub use lapse_core::is_safe_name;

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "tiff", "tif"];

const TMP_SUFFIX: &str = ".lapse.tmp";

/// Whether `name` carries one of [`IMAGE_EXTENSIONS`] (case-insensitive).
pub fn is_image_name(name: &str) -> bool {
    if name.ends_with(TMP_SUFFIX) {
        return false;
    }
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// The on-disk cache rooted at `mirror_root`.
#[derive(Debug, Clone)]
pub struct LocalMirror {
    root: PathBuf,
}

impl LocalMirror {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_dir(&self, partition: &Partition) -> PathBuf {
        partition.dir_under(&self.root)
    }

    /// Image entries of one partition; a missing directory is empty.
    pub fn list(&self, partition: &Partition) -> Result<Vec<LocalEntry>, SyncError> {
        let dir = self.partition_dir(partition);
        let read = match std::fs::read_dir(&dir) {
            Ok(read) => read,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(&dir, e)),
        };
        let mut entries = Vec::new();
        for item in read {
            let item = item.map_err(|e| io_err(&dir, e))?;
            let Ok(name) = item.file_name().into_string() else {
                continue;
            };
            if !is_image_name(&name) {
                continue;
            }
            let path = item.path();
            let meta = match item.metadata() {
                Ok(meta) => meta,
                // Removed between read_dir and stat.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_err(&path, e)),
            };
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().map_err(|e| io_err(&path, e))?;
            entries.push(LocalEntry {
                name,
                path,
                size_bytes: meta.len(),
                modified_at: DateTime::<Utc>::from(modified),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Atomically place `bytes` at `<partition>/<name>`.
    pub fn install(
        &self,
        partition: &Partition,
        name: &str,
        bytes: &[u8],
    ) -> Result<PathBuf, SyncError> {
        let dir = self.partition_dir(partition);
        std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        let path = dir.join(name);
        let tmp = dir.join(format!("{name}{TMP_SUFFIX}"));
        if let Err(e) = std::fs::write(&tmp, bytes) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(&tmp, e));
        }
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(&path, e));
        }
        tracing::debug!(path = %path.display(), bytes = bytes.len(), "installed");
        Ok(path)
    }

    /// Delete one entry; an already missing file is success.
    pub fn remove(&self, entry: &LocalEntry) -> Result<Removal, SyncError> {
        match std::fs::remove_file(&entry.path) {
            Ok(()) => Ok(Removal::Removed),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Removal::AlreadyAbsent),
            Err(e) => Err(io_err(&entry.path, e)),
        }
    }

    /// Every `<domain>/<camera>` directory present on disk, sorted.
    ///
    /// Dot-directories (the `.lapse` state directory among them) are skipped.
    pub fn partitions(&self) -> Result<Vec<Partition>, SyncError> {
        let mut found = Vec::new();
        for domain in subdirs(&self.root)? {
            for camera in subdirs(&self.root.join(&domain))? {
                found.push(Partition::new(domain.as_str(), camera));
            }
        }
        found.sort();
        Ok(found)
    }
}

fn subdirs(dir: &Path) -> Result<Vec<String>, SyncError> {
    let read = match std::fs::read_dir(dir) {
        Ok(read) => read,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(io_err(dir, e)),
    };
    let mut names = Vec::new();
    for item in read {
        let item = item.map_err(|e| io_err(dir, e))?;
        let is_dir = item.file_type().map(|t| t.is_dir()).unwrap_or(false);
        match item.file_name().into_string() {
            Ok(name) if is_dir && !name.starts_with('.') => names.push(name),
            _ => {}
        }
    }
    Ok(names)
}

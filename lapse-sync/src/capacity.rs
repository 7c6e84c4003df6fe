//! Capacity enforcement: trim a store to `max_count` entries, oldest first.
//!
//! The same algorithm runs against the local mirror and the remote image
//! container through [`EvictionTarget`]; the two runs are independent.

use chrono::{DateTime, Utc};
use serde::Serialize;

use lapse_core::{CapacityPolicy, LocalEntry, Partition, RemoteObject};

use crate::error::SyncError;
use crate::lister::Remote;
use crate::mirror::LocalMirror;
use crate::retry::Removal;

/// A store whose entries can be listed and evicted one by one.
pub trait EvictionTarget {
    type Entry;

    /// `local` or `remote`, for logs.
    fn label(&self) -> &'static str;
    fn entries(&self) -> Result<Vec<Self::Entry>, SyncError>;
    fn modified_at(entry: &Self::Entry) -> DateTime<Utc>;
    fn name(entry: &Self::Entry) -> &str;
    fn evict(&self, entry: &Self::Entry) -> Result<Removal, SyncError>;
}

/// Counts from one enforcement pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub examined: usize,
    pub overflow: usize,
    /// Entries deleted, including ones found already gone.
    pub removed: usize,
    pub already_absent: usize,
    /// `(name, reason)` for deletions that failed.
    pub failed: Vec<(String, String)>,
}

/// The `overflow` oldest entries, ordered by `(modified_at, name)`.
pub fn select_overflow<T: EvictionTarget>(
    mut entries: Vec<T::Entry>,
    policy: &CapacityPolicy,
) -> Vec<T::Entry> {
    let overflow = policy.overflow(entries.len());
    entries.sort_by(|a, b| {
        T::modified_at(a)
            .cmp(&T::modified_at(b))
            .then_with(|| T::name(a).cmp(T::name(b)))
    });
    entries.truncate(overflow);
    entries
}

/// Evict the oldest entries of `target` until it fits `policy`.
///
/// A failed deletion is logged and counted, and the pass continues.
/// Cancellation stops the pass and is returned.
pub fn enforce<T: EvictionTarget>(
    target: &T,
    partition: &Partition,
    policy: &CapacityPolicy,
) -> Result<EvictionReport, SyncError> {
    let entries = target.entries()?;
    let examined = entries.len();
    let victims = select_overflow::<T>(entries, policy);
    let mut report = EvictionReport {
        examined,
        overflow: victims.len(),
        ..EvictionReport::default()
    };
    if victims.is_empty() {
        tracing::debug!(partition = %partition, store = target.label(), count = examined, "within capacity");
        return Ok(report);
    }

    for victim in &victims {
        let name = T::name(victim);
        match target.evict(victim) {
            Ok(Removal::Removed) => report.removed += 1,
            Ok(Removal::AlreadyAbsent) => {
                report.removed += 1;
                report.already_absent += 1;
            }
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                tracing::warn!(
                    partition = %partition,
                    store = target.label(),
                    name,
                    error = %err,
                    "eviction failed"
                );
                report.failed.push((name.to_string(), err.to_string()));
            }
        }
    }

    tracing::info!(
        partition = %partition,
        store = target.label(),
        examined,
        max = policy.max_count,
        removed = report.removed,
        failed = report.failed.len(),
        "enforced capacity"
    );
    Ok(report)
}

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

/// Image files of one partition in the local mirror.
pub struct LocalImages<'a> {
    pub mirror: &'a LocalMirror,
    pub partition: &'a Partition,
}

impl EvictionTarget for LocalImages<'_> {
    type Entry = LocalEntry;

    fn label(&self) -> &'static str {
        "local"
    }

    fn entries(&self) -> Result<Vec<LocalEntry>, SyncError> {
        self.mirror.list(self.partition)
    }

    fn modified_at(entry: &LocalEntry) -> DateTime<Utc> {
        entry.modified_at
    }

    fn name(entry: &LocalEntry) -> &str {
        &entry.name
    }

    fn evict(&self, entry: &LocalEntry) -> Result<Removal, SyncError> {
        self.mirror.remove(entry)
    }
}

/// Images in one remote input container.
pub struct RemoteImages<'a> {
    pub remote: Remote<'a>,
    pub container: &'a str,
}

impl EvictionTarget for RemoteImages<'_> {
    type Entry = RemoteObject;

    fn label(&self) -> &'static str {
        "remote"
    }

    fn entries(&self) -> Result<Vec<RemoteObject>, SyncError> {
        self.remote.list_images(self.container)
    }

    fn modified_at(entry: &RemoteObject) -> DateTime<Utc> {
        entry.modified_at
    }

    fn name(entry: &RemoteObject) -> &str {
        &entry.name
    }

    fn evict(&self, entry: &RemoteObject) -> Result<Removal, SyncError> {
        self.remote.delete(entry)
    }
}

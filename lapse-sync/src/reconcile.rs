//! Remote → local reconciliation.
//!
//! The remote container is authoritative and the mirror is a cache, so
//! reconciliation only ever adds local files. Identity is the stem: a remote
//! `img_001.jpg` is already present when the mirror holds `img_001.png`.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use lapse_core::{LocalEntry, Partition, RemoteObject};

use crate::error::SyncError;
use crate::lister::Remote;
use crate::mirror::{is_image_name, is_safe_name, LocalMirror};

/// Upper bound on the buffer reserved from a store-reported size.
const PREALLOC_LIMIT: u64 = 16 * 1024 * 1024;

/// Outcome of one reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub remote_count: usize,
    /// Names of remote objects whose stem was missing locally.
    pub new_objects: Vec<String>,
    pub downloaded: usize,
    /// `(name, reason)` for every object that could not be downloaded.
    pub failed: Vec<(String, String)>,
}

/// Remote objects whose stem has no local counterpart.
///
/// Several remote objects may share a stem; only the most recently modified
/// one is kept. Output is sorted by name.
pub fn find_new(remote: &[RemoteObject], local: &[LocalEntry]) -> Vec<RemoteObject> {
    let local_stems: HashSet<&str> = local.iter().map(|e| e.stem()).collect();
    let mut by_stem: HashMap<&str, &RemoteObject> = HashMap::new();
    for object in remote {
        let stem = object.stem();
        if local_stems.contains(stem) {
            continue;
        }
        by_stem
            .entry(stem)
            .and_modify(|kept| {
                if object.modified_at > kept.modified_at {
                    *kept = object;
                }
            })
            .or_insert(object);
    }
    let mut fresh: Vec<RemoteObject> = by_stem.into_values().cloned().collect();
    fresh.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    fresh
}

/// The reason a remote name can never become a mirror entry, or `None`.
///
/// Accepted names are exactly those [`LocalMirror::list`] reports back.
pub fn rejection(name: &str) -> Option<&'static str> {
    if !is_safe_name(name) {
        Some("unsafe file name")
    } else if !is_image_name(name) {
        Some("no image file extension")
    } else {
        None
    }
}

/// Download every new remote image of `partition` into the mirror.
///
/// Objects the mirror could not list back (see [`rejection`]) are recorded
/// as failed and never downloaded. Listing failures abort; individual
/// download failures are logged, recorded in [`ReconcileReport::failed`] and
/// skipped. Cancellation aborts the batch.
pub fn reconcile(
    remote: &Remote<'_>,
    mirror: &LocalMirror,
    partition: &Partition,
    images_container: &str,
) -> Result<ReconcileReport, SyncError> {
    let remote_list = remote.list_images(images_container)?;
    let remote_count = remote_list.len();
    let (candidates, rejected): (Vec<RemoteObject>, Vec<RemoteObject>) = remote_list
        .into_iter()
        .partition(|o| rejection(&o.name).is_none());
    let local_list = mirror.list(partition)?;
    let fresh = find_new(&candidates, &local_list);

    let mut report = ReconcileReport {
        remote_count,
        new_objects: fresh.iter().map(|o| o.name.clone()).collect(),
        ..ReconcileReport::default()
    };
    tracing::info!(
        partition = %partition,
        remote = remote_count,
        local = local_list.len(),
        new = fresh.len(),
        rejected = rejected.len(),
        "reconciling"
    );

    for object in &rejected {
        let reason = rejection(&object.name).unwrap_or("rejected");
        tracing::warn!(
            partition = %partition,
            name = %object.name,
            reason,
            "skipping remote object"
        );
        report.failed.push((object.name.clone(), reason.to_string()));
    }

    for object in &fresh {
        match download_one(remote, mirror, partition, object) {
            Ok(()) => report.downloaded += 1,
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                tracing::warn!(partition = %partition, name = %object.name, error = %err, "download failed");
                report.failed.push((object.name.clone(), err.to_string()));
            }
        }
    }

    tracing::info!(
        partition = %partition,
        downloaded = report.downloaded,
        failed = report.failed.len(),
        "reconciled"
    );
    Ok(report)
}

fn download_one(
    remote: &Remote<'_>,
    mirror: &LocalMirror,
    partition: &Partition,
    object: &RemoteObject,
) -> Result<(), SyncError> {
    let bytes = remote
        .retry
        .execute("download", &object.name, remote.cancel, || {
            let mut buf = Vec::with_capacity(prealloc(object.size_bytes));
            remote.store.download(&object.id, &mut buf)?;
            Ok(buf)
        })?;
    mirror.install(partition, &object.name, &bytes)?;
    tracing::debug!(partition = %partition, name = %object.name, bytes = bytes.len(), "downloaded");
    Ok(())
}

fn prealloc(size_bytes: u64) -> usize {
    usize::try_from(size_bytes.min(PREALLOC_LIMIT)).unwrap_or(0)
}

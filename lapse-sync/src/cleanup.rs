//! Unused remote input cleanup.
//!
//! After a replacement, remote images that did not feed the current artifact
//! are deleted, oldest first, until the container holds at most
//! `max_keep` images or no unused image is left. Images that fed the
//! artifact (matched by stem) are never touched here.

use std::collections::HashSet;

use serde::Serialize;

use lapse_core::{stem, Partition, RemoteObject};

use crate::error::SyncError;
use crate::lister::Remote;
use crate::retry::Removal;

/// Counts from one cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub examined: usize,
    pub unused: usize,
    pub planned: usize,
    /// Deleted, including ones found already gone.
    pub deleted: usize,
    pub already_absent: usize,
    pub failed: Vec<(String, String)>,
}

/// Objects to delete: `min(total − max_keep, unused)` oldest unused ones.
pub fn plan_unused_cleanup(
    objects: Vec<RemoteObject>,
    used_stems: &HashSet<&str>,
    max_keep: usize,
) -> (usize, Vec<RemoteObject>) {
    let excess = objects.len().saturating_sub(max_keep);
    let mut unused: Vec<RemoteObject> = objects
        .into_iter()
        .filter(|o| !used_stems.contains(o.stem()))
        .collect();
    let unused_count = unused.len();
    unused.sort_by(|a, b| {
        a.modified_at
            .cmp(&b.modified_at)
            .then_with(|| a.name.cmp(&b.name))
    });
    unused.truncate(excess);
    (unused_count, unused)
}

/// Delete unused remote inputs of `partition` beyond `max_keep`.
pub fn cleanup_unused<'n, I>(
    remote: &Remote<'_>,
    partition: &Partition,
    container: &str,
    used_names: I,
    max_keep: usize,
) -> Result<CleanupReport, SyncError>
where
    I: IntoIterator<Item = &'n str>,
{
    let used_stems: HashSet<&str> = used_names.into_iter().map(stem).collect();
    let objects = remote.list_images(container)?;
    let examined = objects.len();
    let (unused, victims) = plan_unused_cleanup(objects, &used_stems, max_keep);
    let mut report = CleanupReport {
        examined,
        unused,
        planned: victims.len(),
        ..CleanupReport::default()
    };

    for victim in &victims {
        match remote.delete(victim) {
            Ok(Removal::Removed) => report.deleted += 1,
            Ok(Removal::AlreadyAbsent) => {
                report.deleted += 1;
                report.already_absent += 1;
            }
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                tracing::warn!(partition = %partition, name = %victim.name, error = %err, "cleanup delete failed");
                report.failed.push((victim.name.clone(), err.to_string()));
            }
        }
    }

    tracing::info!(
        partition = %partition,
        examined,
        unused = report.unused,
        deleted = report.deleted,
        failed = report.failed.len(),
        "cleaned up unused inputs"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;

    fn obj(i: usize) -> RemoteObject {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(i as i64);
        RemoteObject {
            id: format!("id-{i}"),
            name: format!("img_{i:03}.jpg"),
            mime_type: "image/jpeg".to_string(),
            size_bytes: 1,
            created_at: at,
            modified_at: at,
        }
    }

    #[test]
    fn excess_is_bounded_by_unused_count() {
        let objects: Vec<_> = (0..10).map(obj).collect();
        let names: Vec<String> = (0..8).map(|i| format!("img_{i:03}.png")).collect();
        let used: HashSet<&str> = names.iter().map(|n| stem(n)).collect();
        let (unused, plan) = plan_unused_cleanup(objects, &used, 5);
        assert_eq!(unused, 2);
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn oldest_unused_go_first() {
        let objects: Vec<_> = (0..6).map(obj).collect();
        let used: HashSet<&str> = ["img_000", "img_005"].into_iter().collect();
        let (_, plan) = plan_unused_cleanup(objects, &used, 3);
        let names: Vec<_> = plan.iter().map(|o| o.name.as_str()).collect();
        assert_eq!(names, vec!["img_001.jpg", "img_002.jpg", "img_003.jpg"]);
    }

    #[test]
    fn nothing_planned_within_limit() {
        let objects: Vec<_> = (0..3).map(obj).collect();
        let (unused, plan) = plan_unused_cleanup(objects, &HashSet::new(), 3);
        assert_eq!(unused, 3);
        assert!(plan.is_empty());
    }
}

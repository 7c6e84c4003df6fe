//! Remote lister and container layout.
//!
//! ```text
//! root/
//!   <domain>/
//!     <camera>/
//!       image/       inputs
//!       timelapse/   published artifacts
//! ```
//!
//! Every call goes through the retry policy with the run's cancellation
//! token. Listings are fully materialized: pages are followed until the
//! store stops returning a continuation token.

use lapse_core::{is_safe_name, Partition, RemoteObject};

use crate::error::SyncError;
use crate::retry::{Cancellation, Removal, RetryPolicy};
use crate::store::{ObjectQuery, RemoteStore, FOLDER_MIME, IMAGE_MIMES, VIDEO_MIMES};

/// Store handle bundled with the retry policy and cancellation token.
#[derive(Clone, Copy)]
pub struct Remote<'a> {
    pub store: &'a dyn RemoteStore,
    pub retry: &'a RetryPolicy,
    pub cancel: &'a Cancellation,
}

/// A discovered camera folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTarget {
    pub partition: Partition,
    pub camera_id: String,
}

/// Input and artifact folders of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Containers {
    pub images: String,
    pub artifacts: String,
}

impl<'a> Remote<'a> {
    pub fn new(
        store: &'a dyn RemoteStore,
        retry: &'a RetryPolicy,
        cancel: &'a Cancellation,
    ) -> Self {
        Self {
            store,
            retry,
            cancel,
        }
    }

    /// Every object matching `query`, across all pages.
    pub fn list_all(&self, query: &ObjectQuery) -> Result<Vec<RemoteObject>, SyncError> {
        let label = query.parent.as_deref().unwrap_or("<root>");
        let mut objects = Vec::new();
        let mut token: Option<String> = None;
        let mut pages = 0usize;
        loop {
            let page = self.retry.execute("list", label, self.cancel, || {
                self.store.list(query, token.as_deref())
            })?;
            pages += 1;
            tracing::debug!(
                container = label,
                page = pages,
                objects = page.objects.len(),
                "listed page"
            );
            objects.extend(page.objects);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(objects)
    }

    pub fn list_images(&self, container: &str) -> Result<Vec<RemoteObject>, SyncError> {
        self.list_all(&ObjectQuery::children_of(container).with_mime_types(IMAGE_MIMES))
    }

    pub fn list_artifacts(&self, container: &str) -> Result<Vec<RemoteObject>, SyncError> {
        self.list_all(&ObjectQuery::children_of(container).with_mime_types(VIDEO_MIMES))
    }

    /// The most recently modified video in `container`, if any.
    pub fn latest_artifact(&self, container: &str) -> Result<Option<RemoteObject>, SyncError> {
        Ok(self
            .list_artifacts(container)?
            .into_iter()
            .max_by(|a, b| a.modified_at.cmp(&b.modified_at).then_with(|| a.name.cmp(&b.name))))
    }

    /// Whether a non-trashed object called `name` already sits in `container`.
    pub fn artifact_exists(&self, container: &str, name: &str) -> Result<bool, SyncError> {
        let query = ObjectQuery::children_of(container).named(name);
        Ok(!self.list_all(&query)?.is_empty())
    }

    pub fn subfolders(&self, parent: &str) -> Result<Vec<RemoteObject>, SyncError> {
        let mut folders =
            self.list_all(&ObjectQuery::children_of(parent).with_mime_types(&[FOLDER_MIME]))?;
        folders.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(folders)
    }

    pub fn find_folder(&self, parent: &str, name: &str) -> Result<Option<String>, SyncError> {
        let query = ObjectQuery::children_of(parent)
            .with_mime_types(&[FOLDER_MIME])
            .named(name);
        Ok(self.list_all(&query)?.into_iter().next().map(|f| f.id))
    }

    pub fn find_or_create_folder(&self, parent: &str, name: &str) -> Result<String, SyncError> {
        if let Some(id) = self.find_folder(parent, name)? {
            return Ok(id);
        }
        let id = self.retry.execute("create_folder", name, self.cancel, || {
            self.store.create_folder(parent, name)
        })?;
        tracing::info!(parent, name, id = %id, "created folder");
        Ok(id)
    }

    /// Walk root → domains → cameras.
    ///
    /// Folders whose names cannot be used as a single local path component
    /// are logged and skipped along with everything beneath them.
    pub fn discover_partitions(&self, root: &str) -> Result<Vec<PartitionTarget>, SyncError> {
        let mut targets = Vec::new();
        for domain in self.subfolders(root)? {
            if !is_safe_name(&domain.name) {
                tracing::warn!(
                    folder = %domain.name,
                    id = %domain.id,
                    "skipping unsafe domain folder"
                );
                continue;
            }
            for camera in self.subfolders(&domain.id)? {
                if !is_safe_name(&camera.name) {
                    tracing::warn!(
                        domain = %domain.name,
                        folder = %camera.name,
                        id = %camera.id,
                        "skipping unsafe camera folder"
                    );
                    continue;
                }
                targets.push(PartitionTarget {
                    partition: Partition::new(domain.name.as_str(), camera.name.as_str()),
                    camera_id: camera.id,
                });
            }
        }
        tracing::info!(root, partitions = targets.len(), "discovered partitions");
        Ok(targets)
    }

    /// Input and artifact folders under a camera, created when missing.
    pub fn resolve_containers(
        &self,
        camera_id: &str,
        image_folder: &str,
        artifact_folder: &str,
    ) -> Result<Containers, SyncError> {
        Ok(Containers {
            images: self.find_or_create_folder(camera_id, image_folder)?,
            artifacts: self.find_or_create_folder(camera_id, artifact_folder)?,
        })
    }

    /// Delete through the retry policy; a missing object is success.
    pub fn delete(&self, object: &RemoteObject) -> Result<Removal, SyncError> {
        self.retry
            .execute_delete("delete", &object.name, self.cancel, || self.store.delete(&object.id))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::store::memory::StoreOp;
    use crate::store::{MemoryStore, StoreError};

    fn remote_parts() -> (RetryPolicy, Cancellation) {
        (RetryPolicy::immediate(3), Cancellation::new())
    }

    #[test]
    fn list_all_follows_every_page() {
        let store = MemoryStore::new().with_page_size(3);
        let root = store.add_folder(None, "root");
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        for i in 0..10 {
            store.add_image(&root, &format!("img_{i:02}.jpg"), at);
        }
        let (retry, cancel) = remote_parts();
        let remote = Remote::new(&store, &retry, &cancel);
        assert_eq!(remote.list_images(&root).unwrap().len(), 10);
        assert_eq!(store.calls_of(StoreOp::List).len(), 4);
    }

    #[test]
    fn transient_page_failure_is_retried() {
        let store = MemoryStore::new().with_page_size(2);
        let root = store.add_folder(None, "root");
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        for i in 0..3 {
            store.add_image(&root, &format!("img_{i}.jpg"), at);
        }
        store.fail_times(StoreOp::List, None, 2, StoreError::transient("eof"));
        let (retry, cancel) = remote_parts();
        let remote = Remote::new(&store, &retry, &cancel);
        assert_eq!(remote.list_images(&root).unwrap().len(), 3);
    }

    #[test]
    fn latest_artifact_is_newest_video() {
        let store = MemoryStore::new();
        let root = store.add_folder(None, "timelapse");
        let old = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let new = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        store.add_object(&root, "old.mp4", "video/mp4", b"o", Some(old));
        let newest = store.add_object(&root, "new.mov", "video/mov", b"n", Some(new));
        store.add_object(&root, "notes.txt", "text/plain", b"t", Some(new));
        let (retry, cancel) = remote_parts();
        let remote = Remote::new(&store, &retry, &cancel);
        let latest = remote.latest_artifact(&root).unwrap().expect("one video");
        assert_eq!(latest.id, newest);
    }

    #[test]
    fn discovery_creates_missing_containers() {
        let store = MemoryStore::new();
        let root = store.add_folder(None, "root");
        let farm = store.add_folder(Some(&root), "farm");
        let cam = store.add_folder(Some(&farm), "Cam1");
        store.add_folder(Some(&cam), "image");
        let (retry, cancel) = remote_parts();
        let remote = Remote::new(&store, &retry, &cancel);

        let targets = remote.discover_partitions(&root).unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].partition, Partition::new("farm", "Cam1"));

        let containers = remote
            .resolve_containers(&targets[0].camera_id, "image", "timelapse")
            .unwrap();
        assert_eq!(store.calls_of(StoreOp::CreateFolder), vec!["timelapse"]);
        assert_eq!(store.child_names(&cam), vec!["image", "timelapse"]);

        let again = remote
            .resolve_containers(&targets[0].camera_id, "image", "timelapse")
            .unwrap();
        assert_eq!(again, containers);
        assert_eq!(store.calls_of(StoreOp::CreateFolder).len(), 1);
    }

    #[test]
    fn discovery_skips_folders_that_escape_the_mirror() {
        let store = MemoryStore::new();
        let root = store.add_folder(None, "root");
        let up = store.add_folder(Some(&root), "..");
        store.add_folder(Some(&up), "victim");
        let farm = store.add_folder(Some(&root), "farm");
        store.add_folder(Some(&farm), "Cam1");
        store.add_folder(Some(&farm), "..");
        store.add_folder(Some(&farm), r"a\b");
        let (retry, cancel) = remote_parts();
        let remote = Remote::new(&store, &retry, &cancel);

        let targets = remote.discover_partitions(&root).unwrap();
        let partitions: Vec<_> = targets.iter().map(|t| t.partition.clone()).collect();
        assert_eq!(partitions, vec![Partition::new("farm", "Cam1")]);
    }
}

//! In-memory [`RemoteStore`] with failure injection and a call journal.
//!
//! Objects get sequential ids (`obj-0001`, …) and timestamps from a fake
//! clock that advances one second per created object, so "newest" is
//! deterministic. Listings are ordered by id and paged by `page_size`.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, TimeZone, Utc};

use lapse_core::RemoteObject;

use super::{NewObject, ObjectQuery, Page, RemoteStore, StoreError, StoredObject, FOLDER_MIME};

/// Store operations, as recorded in the journal and targeted by injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    List,
    Get,
    Download,
    Upload,
    CreateFolder,
    Delete,
}

/// One journal entry: the operation and its id / name / parent argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: StoreOp,
    pub subject: String,
}

#[derive(Debug, Clone)]
struct Node {
    object: RemoteObject,
    parent: Option<String>,
    trashed: bool,
    data: Vec<u8>,
}

#[derive(Debug)]
struct Injection {
    op: StoreOp,
    subject: Option<String>,
    /// `None` fails forever.
    remaining: Option<usize>,
    error: StoreError,
}

#[derive(Debug)]
struct Inner {
    nodes: BTreeMap<String, Node>,
    next_id: u64,
    clock: DateTime<Utc>,
    page_size: usize,
    injections: Vec<Injection>,
    journal: Vec<Call>,
}

/// Thread-safe in-memory object container.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let clock = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self {
            inner: Mutex::new(Inner {
                nodes: BTreeMap::new(),
                next_id: 1,
                clock,
                page_size: 100,
                injections: Vec::new(),
                journal: Vec::new(),
            }),
        }
    }

    /// Objects per listing page (minimum 1).
    pub fn with_page_size(self, page_size: usize) -> Self {
        self.lock().page_size = page_size.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -- seeding ------------------------------------------------------------

    /// Add a folder; `parent = None` creates a root container.
    pub fn add_folder(&self, parent: Option<&str>, name: &str) -> String {
        self.lock().insert(parent, name, FOLDER_MIME, Vec::new(), None)
    }

    /// Add an object with explicit bytes and optional modification time.
    pub fn add_object(
        &self,
        parent: &str,
        name: &str,
        mime_type: &str,
        data: &[u8],
        modified_at: Option<DateTime<Utc>>,
    ) -> String {
        self.lock()
            .insert(Some(parent), name, mime_type, data.to_vec(), modified_at)
    }

    /// Add a JPEG whose content is its own name.
    pub fn add_image(&self, parent: &str, name: &str, modified_at: DateTime<Utc>) -> String {
        self.add_object(parent, name, "image/jpeg", name.as_bytes(), Some(modified_at))
    }

    pub fn trash(&self, id: &str) {
        if let Some(node) = self.lock().nodes.get_mut(id) {
            node.trashed = true;
        }
    }

    // -- failure injection --------------------------------------------------

    /// Fail the next `times` calls of `op` (on `subject`, if given).
    pub fn fail_times(&self, op: StoreOp, subject: Option<&str>, times: usize, error: StoreError) {
        self.lock().injections.push(Injection {
            op,
            subject: subject.map(str::to_string),
            remaining: Some(times),
            error,
        });
    }

    /// Fail every call of `op` (on `subject`, if given).
    pub fn fail_always(&self, op: StoreOp, subject: Option<&str>, error: StoreError) {
        self.lock().injections.push(Injection {
            op,
            subject: subject.map(str::to_string),
            remaining: None,
            error,
        });
    }

    // -- inspection ---------------------------------------------------------

    pub fn calls(&self) -> Vec<Call> {
        self.lock().journal.clone()
    }

    pub fn calls_of(&self, op: StoreOp) -> Vec<String> {
        self.lock()
            .journal
            .iter()
            .filter(|c| c.op == op)
            .map(|c| c.subject.clone())
            .collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().nodes.get(id).is_some_and(|n| !n.trashed)
    }

    pub fn data(&self, id: &str) -> Option<Vec<u8>> {
        self.lock().nodes.get(id).map(|n| n.data.clone())
    }

    /// Non-trashed children of `parent`, ordered by id.
    pub fn children(&self, parent: &str) -> Vec<RemoteObject> {
        self.lock()
            .nodes
            .values()
            .filter(|n| !n.trashed && n.parent.as_deref() == Some(parent))
            .map(|n| n.object.clone())
            .collect()
    }

    pub fn child_names(&self, parent: &str) -> Vec<String> {
        let mut names: Vec<_> = self.children(parent).into_iter().map(|o| o.name).collect();
        names.sort();
        names
    }
}

impl Inner {
    fn insert(
        &mut self,
        parent: Option<&str>,
        name: &str,
        mime_type: &str,
        data: Vec<u8>,
        modified_at: Option<DateTime<Utc>>,
    ) -> String {
        let id = format!("obj-{:04}", self.next_id);
        self.next_id += 1;
        self.clock += Duration::seconds(1);
        let object = RemoteObject {
            id: id.clone(),
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            size_bytes: data.len() as u64,
            created_at: self.clock,
            modified_at: modified_at.unwrap_or(self.clock),
        };
        self.nodes.insert(
            id.clone(),
            Node {
                object,
                parent: parent.map(str::to_string),
                trashed: false,
                data,
            },
        );
        id
    }

    /// Journal the call, then consume a matching injection if any.
    fn enter(&mut self, op: StoreOp, subject: &str) -> Result<(), StoreError> {
        self.journal.push(Call {
            op,
            subject: subject.to_string(),
        });
        let hit = self.injections.iter_mut().position(|inj| {
            inj.op == op
                && inj.subject.as_deref().map_or(true, |s| s == subject)
                && inj.remaining != Some(0)
        });
        let Some(idx) = hit else {
            return Ok(());
        };
        let injection = &mut self.injections[idx];
        if let Some(remaining) = injection.remaining.as_mut() {
            *remaining -= 1;
        }
        Err(injection.error.clone())
    }

    fn live(&self, id: &str) -> Result<&Node, StoreError> {
        self.nodes
            .get(id)
            .filter(|n| !n.trashed)
            .ok_or_else(|| StoreError::not_found(format!("object {id}")))
    }
}

impl RemoteStore for MemoryStore {
    fn list(&self, query: &ObjectQuery, page_token: Option<&str>) -> Result<Page, StoreError> {
        let mut inner = self.lock();
        inner.enter(StoreOp::List, query.parent.as_deref().unwrap_or(""))?;
        let offset = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| StoreError::other(format!("bad page token {token:?}")))?,
            None => 0,
        };
        let matching: Vec<_> = inner
            .nodes
            .values()
            .filter(|n| query.matches(&n.object, n.parent.as_deref(), n.trashed))
            .map(|n| n.object.clone())
            .collect();
        let end = (offset + inner.page_size).min(matching.len());
        let objects = matching.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        let next_token = (end < matching.len()).then(|| end.to_string());
        Ok(Page {
            objects,
            next_token,
        })
    }

    fn get(&self, id: &str) -> Result<StoredObject, StoreError> {
        let mut inner = self.lock();
        inner.enter(StoreOp::Get, id)?;
        let node = inner
            .nodes
            .get(id)
            .ok_or_else(|| StoreError::not_found(format!("object {id}")))?;
        Ok(StoredObject {
            object: node.object.clone(),
            trashed: node.trashed,
        })
    }

    fn download(&self, id: &str, sink: &mut dyn Write) -> Result<u64, StoreError> {
        let data = {
            let mut inner = self.lock();
            inner.enter(StoreOp::Download, id)?;
            inner.live(id)?.data.clone()
        };
        sink.write_all(&data)
            .map_err(|e| StoreError::from_io(&e))?;
        Ok(data.len() as u64)
    }

    fn upload(
        &self,
        meta: &NewObject,
        source: &mut dyn Read,
        len: u64,
    ) -> Result<String, StoreError> {
        let mut data = Vec::with_capacity(len as usize);
        {
            let mut inner = self.lock();
            inner.enter(StoreOp::Upload, &meta.name)?;
            inner.live(&meta.parent)?;
        }
        source
            .read_to_end(&mut data)
            .map_err(|e| StoreError::from_io(&e))?;
        let id = self
            .lock()
            .insert(Some(&meta.parent), &meta.name, &meta.mime_type, data, None);
        Ok(id)
    }

    fn create_folder(&self, parent: &str, name: &str) -> Result<String, StoreError> {
        let mut inner = self.lock();
        inner.enter(StoreOp::CreateFolder, name)?;
        inner.live(parent)?;
        Ok(inner.insert(Some(parent), name, FOLDER_MIME, Vec::new(), None))
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.enter(StoreOp::Delete, id)?;
        inner
            .nodes
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(format!("object {id}")))
    }
}

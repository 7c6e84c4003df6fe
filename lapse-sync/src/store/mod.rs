//! Remote object store port.
//!
//! The engine talks to the remote container only through [`RemoteStore`].
//! Bindings classify every failure into an [`ErrorClass`] from structured
//! signals (HTTP status, API reason codes, I/O error kinds), so nothing above
//! this layer inspects error text.

use std::fmt;
use std::io::{Read, Write};

use serde::Serialize;
use thiserror::Error;

use lapse_core::RemoteObject;

pub mod drive;
pub mod memory;

pub use drive::DriveStore;
pub use memory::MemoryStore;

pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
pub const IMAGE_MIMES: &[&str] = &["image/jpeg", "image/png", "image/jpg"];
pub const VIDEO_MIMES: &[&str] = &["video/mp4", "video/avi", "video/mov", "video/wmv"];
pub const ARTIFACT_MIME: &str = "video/mp4";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// How a store failure should be treated by the retry layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network / TLS reset, timeout, rate limit, server-side hiccup.
    Transient,
    NotFound,
    PermissionDenied,
    Other,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::NotFound => write!(f, "not found"),
            ErrorClass::PermissionDenied => write!(f, "permission denied"),
            ErrorClass::Other => write!(f, "error"),
        }
    }
}

/// A classified failure reported by a store binding.
#[derive(Debug, Clone, Error)]
#[error("{class}: {message}")]
pub struct StoreError {
    pub class: ErrorClass,
    pub message: String,
}

impl StoreError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::NotFound, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::PermissionDenied, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Other, message)
    }

    /// Classify a local I/O failure met while streaming bytes to or from
    /// the store. Connection-level kinds are transient.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        let class = match err.kind() {
            ConnectionReset | ConnectionAborted | ConnectionRefused | BrokenPipe | TimedOut
            | UnexpectedEof | Interrupted | WouldBlock => ErrorClass::Transient,
            NotFound => ErrorClass::NotFound,
            PermissionDenied => ErrorClass::PermissionDenied,
            _ => ErrorClass::Other,
        };
        Self::new(class, err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Listing filter: parent container, MIME types, exact name, trashed flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectQuery {
    pub parent: Option<String>,
    /// Any-of; empty matches every type.
    pub mime_types: Vec<String>,
    pub name: Option<String>,
    pub include_trashed: bool,
}

impl ObjectQuery {
    pub fn children_of(parent: impl Into<String>) -> Self {
        Self {
            parent: Some(parent.into()),
            ..Self::default()
        }
    }

    pub fn with_mime_types(mut self, mimes: &[&str]) -> Self {
        self.mime_types = mimes.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Whether an object with these attributes satisfies the query.
    pub fn matches(&self, object: &RemoteObject, parent: Option<&str>, trashed: bool) -> bool {
        if trashed && !self.include_trashed {
            return false;
        }
        if let Some(want) = self.parent.as_deref() {
            if parent != Some(want) {
                return false;
            }
        }
        if !self.mime_types.is_empty() && !self.mime_types.iter().any(|m| *m == object.mime_type)
        {
            return false;
        }
        if let Some(name) = self.name.as_deref() {
            if object.name != name {
                return false;
            }
        }
        true
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub objects: Vec<RemoteObject>,
    /// Continuation token; `None` on the last page.
    pub next_token: Option<String>,
}

/// Metadata for an object about to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewObject {
    pub name: String,
    pub mime_type: String,
    pub parent: String,
}

/// Metadata returned by [`RemoteStore::get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub object: RemoteObject,
    pub trashed: bool,
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// Blocking client for a remote object container.
///
/// Every call is a single attempt; retries belong to the caller.
pub trait RemoteStore {
    /// One page of objects matching `query`.
    fn list(&self, query: &ObjectQuery, page_token: Option<&str>) -> Result<Page, StoreError>;

    fn get(&self, id: &str) -> Result<StoredObject, StoreError>;

    /// Stream the object's bytes into `sink`; returns the byte count.
    fn download(&self, id: &str, sink: &mut dyn Write) -> Result<u64, StoreError>;

    /// Create an object from `len` bytes of `source`; returns the new id.
    fn upload(&self, meta: &NewObject, source: &mut dyn Read, len: u64)
        -> Result<String, StoreError>;

    /// Create a folder under `parent`; returns the new id.
    fn create_folder(&self, parent: &str, name: &str) -> Result<String, StoreError>;

    /// Remove the object. A missing object reports [`ErrorClass::NotFound`].
    fn delete(&self, id: &str) -> Result<(), StoreError>;
}

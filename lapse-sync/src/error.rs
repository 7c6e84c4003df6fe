//! Error types for lapse-sync.

use std::path::PathBuf;

use thiserror::Error;

use lapse_core::ConfigError;

use crate::encoder::EncodeError;
use crate::store::{ErrorClass, StoreError};

/// All errors that can arise from sync, eviction, and replacement.
///
/// Remote failures arrive here only after passing through
/// [`crate::retry::RetryPolicy`], which maps the store's [`ErrorClass`] onto
/// the first five variants.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A transient failure outlived every retry attempt.
    #[error("{op} {target}: still failing after {attempts} attempt(s): {source}")]
    TransientExhausted {
        op: &'static str,
        target: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// The target does not exist (a miss for reads).
    #[error("{op} {target}: not found")]
    NotFound {
        op: &'static str,
        target: String,
        #[source]
        source: StoreError,
    },

    /// The store refused the operation; never retried.
    #[error("{op} {target}: permission denied: {source}")]
    PermissionDenied {
        op: &'static str,
        target: String,
        #[source]
        source: StoreError,
    },

    /// Unclassified store failure; never retried.
    #[error("{op} {target}: {source}")]
    Store {
        op: &'static str,
        target: String,
        #[source]
        source: StoreError,
    },

    /// The run was cancelled or hit its deadline.
    #[error("{op} {target}: cancelled")]
    Cancelled { op: &'static str, target: String },

    /// The encoder failed or produced an empty artifact.
    #[error("encode failed: {0}")]
    EncodeFailed(#[from] EncodeError),

    /// The new artifact could not be uploaded; the old one is untouched.
    #[error("upload of {name} failed: {source}")]
    UploadFailed {
        name: String,
        #[source]
        source: Box<SyncError>,
    },

    /// No local image is available to build an artifact from.
    #[error("no usable local inputs for {partition}")]
    NoInputs { partition: String },

    /// A requested partition does not exist under the root container.
    #[error("unknown partition {partition}")]
    UnknownPartition { partition: String },

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Run state JSON serialization/deserialization error.
    #[error("run state JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// Store classification behind this error, if it came from the store.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            SyncError::TransientExhausted { .. } => Some(ErrorClass::Transient),
            SyncError::NotFound { .. } => Some(ErrorClass::NotFound),
            SyncError::PermissionDenied { .. } => Some(ErrorClass::PermissionDenied),
            SyncError::Store { .. } => Some(ErrorClass::Other),
            SyncError::UploadFailed { source, .. } => source.class(),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            SyncError::Cancelled { .. } => true,
            SyncError::UploadFailed { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}

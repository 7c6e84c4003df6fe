//! # lapse-sync
//!
//! Synchronization, capacity enforcement and safe artifact replacement.
//!
//! Call [`Engine::run`] to process every partition under the configured root
//! container, or use the building blocks directly:
//!
//! - [`retry`]: bounded exponential backoff with cancellation
//! - [`store`]: the [`RemoteStore`] port, Drive and in-memory bindings
//! - [`lister`]: paged listings and container layout
//! - [`mirror`]: the local mirror
//! - [`reconcile`]: remote → local download of new objects
//! - [`capacity`]: oldest-first eviction
//! - [`replacer`]: build, upload, then retire the old artifact
//! - [`cleanup`]: unused remote input cleanup
//! - [`run_state`]: last published artifact per partition

pub mod capacity;
pub mod cleanup;
pub mod encoder;
pub mod error;
pub mod lister;
pub mod mirror;
pub mod pipeline;
pub mod reconcile;
pub mod replacer;
pub mod retry;
pub mod run_state;
pub mod store;

pub use encoder::{EncodeError, FfmpegEncoder, ScriptedEncoder, VideoEncoder};
pub use error::SyncError;
pub use mirror::LocalMirror;
pub use pipeline::{artifact_name, ArtifactStatus, Engine, RunScope, RunSummary};
pub use retry::{Cancellation, Removal, RetryPolicy};
pub use store::{DriveStore, ErrorClass, MemoryStore, RemoteStore, StoreError};

//! Lapse core library: domain types and configuration.
//!
//! Public API surface:
//! - [`types`]: partitions, remote objects, local entries, artifacts
//! - [`config`]: [`LapseConfig`] load / overlay / validate
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod types;

pub use config::{LapseConfig, RetrySettings};
pub use error::ConfigError;
pub use types::{
    is_safe_name, stem, Artifact, CameraName, CapacityPolicy, DomainName, LocalEntry, Partition,
    RemoteObject,
};

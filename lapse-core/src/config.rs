//! Process configuration.
//!
//! # Resolution order
//!
//! 1. Built-in defaults ([`LapseConfig::default`]).
//! 2. YAML file: `--config <path>` if given (must exist), else
//!    `~/.lapse/config.yaml` (optional).
//! 3. `LAPSE_*` environment variables.
//! 4. [`LapseConfig::validate`].
//!
//! # API pattern
//!
//! - `resolve_at(home, explicit, vars)`: explicit home and env; used in tests
//! - `load(explicit)`: derives home from `dirs::home_dir()` and reads the
//!   process environment, delegates to `resolve_at`

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{invalid, ConfigError};
use crate::types::CapacityPolicy;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Backoff settings for remote-store calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each further attempt.
    pub base_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
        }
    }
}

/// Everything a run needs, built once at startup and passed by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LapseConfig {
    /// Remote container holding one folder per domain.
    pub root_container: String,
    /// Local mirror root; partitions live in `<mirror_root>/<domain>/<camera>`.
    pub mirror_root: PathBuf,
    /// Per-camera remote folder holding source images.
    pub image_folder_name: String,
    /// Per-camera remote folder holding published artifacts.
    pub artifact_folder_name: String,
    pub local_max_count: usize,
    pub remote_max_count: usize,
    /// Upper bound kept by the unused-input cleanup step.
    pub max_remote_keep: usize,
    pub max_inputs_per_artifact: usize,
    pub frame_rate: u32,
    /// Reconcile and evict before building the artifact.
    pub sync_enabled: bool,
    pub delete_previous_artifact: bool,
    pub cleanup_unused_inputs: bool,
    /// Skip re-encoding when the input set matches the last published artifact.
    pub skip_unchanged: bool,
    pub retry: RetrySettings,
    /// Hard deadline for one partition run; retries stop waiting past it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_deadline_secs: Option<u64>,
    pub ffmpeg_path: PathBuf,
    /// Scratch directory for encoder output; system temp dir when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<PathBuf>,
}

impl Default for LapseConfig {
    fn default() -> Self {
        Self {
            root_container: String::new(),
            mirror_root: PathBuf::from("image"),
            image_folder_name: "image".to_string(),
            artifact_folder_name: "timelapse".to_string(),
            local_max_count: 21_000,
            remote_max_count: 21_000,
            max_remote_keep: 100,
            max_inputs_per_artifact: 21_000,
            frame_rate: 24,
            sync_enabled: true,
            delete_previous_artifact: true,
            cleanup_unused_inputs: true,
            skip_unchanged: false,
            retry: RetrySettings::default(),
            run_deadline_secs: None,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            work_dir: None,
        }
    }
}

impl LapseConfig {
    pub fn local_policy(&self) -> CapacityPolicy {
        CapacityPolicy::new(self.local_max_count)
    }

    pub fn remote_policy(&self) -> CapacityPolicy {
        CapacityPolicy::new(self.remote_max_count)
    }

    /// Check cross-field and range constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root_container.trim().is_empty() {
            return Err(invalid(
                "root_container",
                "must be set (config file or LAPSE_ROOT_CONTAINER)",
            ));
        }
        if self.mirror_root.as_os_str().is_empty() {
            return Err(invalid("mirror_root", "must not be empty"));
        }
        for (field, value) in [
            ("image_folder_name", &self.image_folder_name),
            ("artifact_folder_name", &self.artifact_folder_name),
        ] {
            if value.is_empty() || value.contains('/') {
                return Err(invalid(field, "must be a single non-empty folder name"));
            }
        }
        if self.image_folder_name == self.artifact_folder_name {
            return Err(invalid(
                "artifact_folder_name",
                "must differ from image_folder_name",
            ));
        }
        if self.frame_rate == 0 {
            return Err(invalid("frame_rate", "must be at least 1"));
        }
        if self.max_inputs_per_artifact == 0 {
            return Err(invalid("max_inputs_per_artifact", "must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.run_deadline_secs == Some(0) {
            return Err(invalid("run_deadline_secs", "must be positive when set"));
        }
        Ok(())
    }

    /// Overlay `LAPSE_*` variables from `vars` onto `self`.
    ///
    /// Unknown `LAPSE_*` names are ignored so unrelated tooling can share
    /// the prefix.
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "LAPSE_ROOT_CONTAINER" => self.root_container = value.to_string(),
                "LAPSE_MIRROR_ROOT" => self.mirror_root = PathBuf::from(value),
                "LAPSE_IMAGE_FOLDER_NAME" => self.image_folder_name = value.to_string(),
                "LAPSE_ARTIFACT_FOLDER_NAME" => self.artifact_folder_name = value.to_string(),
                "LAPSE_LOCAL_MAX_COUNT" => self.local_max_count = parse_num(key, value)?,
                "LAPSE_REMOTE_MAX_COUNT" => self.remote_max_count = parse_num(key, value)?,
                "LAPSE_MAX_REMOTE_KEEP" => self.max_remote_keep = parse_num(key, value)?,
                "LAPSE_MAX_INPUTS_PER_ARTIFACT" => {
                    self.max_inputs_per_artifact = parse_num(key, value)?
                }
                "LAPSE_FRAME_RATE" => self.frame_rate = parse_num(key, value)?,
                "LAPSE_SYNC_ENABLED" => self.sync_enabled = parse_bool(key, value)?,
                "LAPSE_DELETE_PREVIOUS_ARTIFACT" => {
                    self.delete_previous_artifact = parse_bool(key, value)?
                }
                "LAPSE_CLEANUP_UNUSED_INPUTS" => {
                    self.cleanup_unused_inputs = parse_bool(key, value)?
                }
                "LAPSE_SKIP_UNCHANGED" => self.skip_unchanged = parse_bool(key, value)?,
                "LAPSE_RETRY_MAX_ATTEMPTS" => self.retry.max_attempts = parse_num(key, value)?,
                "LAPSE_RETRY_BASE_DELAY_MS" => self.retry.base_delay_ms = parse_num(key, value)?,
                "LAPSE_RUN_DEADLINE_SECS" => {
                    self.run_deadline_secs = if value.is_empty() {
                        None
                    } else {
                        Some(parse_num(key, value)?)
                    }
                }
                "LAPSE_FFMPEG" => self.ffmpeg_path = PathBuf::from(value),
                "LAPSE_WORK_DIR" => {
                    self.work_dir = (!value.is_empty()).then(|| PathBuf::from(value))
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn parse_num<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
        expected: "a non-negative integer",
    })
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var: var.to_string(),
            value: value.to_string(),
            expected: "true or false",
        }),
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// `<home>/.lapse/config.yaml`. Pure, no I/O.
pub fn default_path_at(home: &Path) -> PathBuf {
    home.join(".lapse").join("config.yaml")
}

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Parse a YAML config file. Missing fields take their defaults.
pub fn from_yaml_file(path: &Path) -> Result<LapseConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if contents.trim().is_empty() {
        return Ok(LapseConfig::default());
    }
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Resolve the effective configuration against an explicit home and env.
pub fn resolve_at<I, K, V>(
    home: &Path,
    explicit: Option<&Path>,
    vars: I,
) -> Result<LapseConfig, ConfigError>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut config = match explicit {
        Some(path) => from_yaml_file(path)?,
        None => {
            let path = default_path_at(home);
            if path.exists() {
                from_yaml_file(&path)?
            } else {
                LapseConfig::default()
            }
        }
    };
    config.apply_env(vars)?;
    config.validate()?;
    Ok(config)
}

/// `resolve_at` convenience wrapper over the real home and environment.
pub fn load(explicit: Option<&Path>) -> Result<LapseConfig, ConfigError> {
    let home = match explicit {
        // The home directory is irrelevant when the path is explicit.
        Some(_) => PathBuf::new(),
        None => home()?,
    };
    resolve_at(&home, explicit, std::env::vars())
}

/// Render the effective configuration as YAML.
pub fn to_yaml(config: &LapseConfig) -> Result<String, ConfigError> {
    Ok(serde_yaml::to_string(config)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> LapseConfig {
        LapseConfig {
            root_container: "root-id".to_string(),
            ..LapseConfig::default()
        }
    }

    #[test]
    fn defaults_follow_the_capture_setup() {
        let cfg = LapseConfig::default();
        assert_eq!(cfg.frame_rate, 24);
        assert_eq!(cfg.max_remote_keep, 100);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert!(cfg.delete_previous_artifact);
    }

    #[test]
    fn default_config_needs_a_root_container() {
        let err = LapseConfig::default().validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "root_container", .. }));
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn env_overrides_are_applied() {
        let mut cfg = valid();
        cfg.apply_env([
            ("LAPSE_LOCAL_MAX_COUNT", "40"),
            ("LAPSE_SYNC_ENABLED", "false"),
            ("LAPSE_WORK_DIR", "/scratch"),
            ("LAPSE_UNRELATED", "x"),
        ])
        .unwrap();
        assert_eq!(cfg.local_max_count, 40);
        assert!(!cfg.sync_enabled);
        assert_eq!(cfg.work_dir, Some(PathBuf::from("/scratch")));
    }

    #[test]
    fn malformed_env_value_is_rejected() {
        let mut cfg = valid();
        let err = cfg.apply_env([("LAPSE_FRAME_RATE", "fast")]).unwrap_err();
        assert!(err.to_string().contains("LAPSE_FRAME_RATE"), "got: {err}");
    }

    #[test]
    fn identical_folder_names_are_rejected() {
        let cfg = LapseConfig {
            artifact_folder_name: "image".to_string(),
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_frame_rate_is_rejected() {
        let cfg = LapseConfig {
            frame_rate: 0,
            ..valid()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::Invalid { field: "frame_rate", .. })
        ));
    }
}

//! Config resolution: file discovery, env overlay, parse errors, validation.

use std::path::PathBuf;

use assert_fs::prelude::*;
use predicates::prelude::*;
use lapse_core::{
    config::{self, default_path_at, resolve_at},
    ConfigError, LapseConfig,
};
use rstest::rstest;

const NO_ENV: [(&str, &str); 0] = [];

// ---------------------------------------------------------------------------
// 1. File discovery
// ---------------------------------------------------------------------------

#[test]
fn default_file_is_optional_when_env_supplies_root() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let cfg = resolve_at(home.path(), None, [("LAPSE_ROOT_CONTAINER", "root-id")])
        .expect("resolve");
    assert_eq!(cfg.root_container, "root-id");
    assert_eq!(cfg.mirror_root, PathBuf::from("image"));
}

#[test]
fn default_file_under_home_is_loaded() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let file = home.child(".lapse").child("config.yaml");
    file.write_str("root_container: abc\nlocal_max_count: 12\n")
        .expect("write");
    assert_eq!(file.path(), default_path_at(home.path()));
    file.assert(predicate::path::is_file());

    let cfg = resolve_at(home.path(), None, NO_ENV).expect("resolve");
    assert_eq!(cfg.root_container, "abc");
    assert_eq!(cfg.local_max_count, 12);
    assert_eq!(cfg.remote_max_count, LapseConfig::default().remote_max_count);
}

#[test]
fn explicit_missing_file_is_an_error() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let missing = home.path().join("nope.yaml");
    let err = resolve_at(home.path(), Some(&missing), NO_ENV).unwrap_err();
    assert!(matches!(err, ConfigError::NotFound { .. }), "got: {err}");
    assert!(predicate::str::contains("nope.yaml").eval(&err.to_string()));
}

#[test]
fn env_wins_over_file() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let file = home.child("lapse.yaml");
    file.write_str("root_container: from-file\nframe_rate: 30\n")
        .expect("write");

    let cfg = resolve_at(
        home.path(),
        Some(file.path()),
        [("LAPSE_FRAME_RATE", "12"), ("HOME", "/ignored")],
    )
    .expect("resolve");
    assert_eq!(cfg.root_container, "from-file");
    assert_eq!(cfg.frame_rate, 12);
}

// ---------------------------------------------------------------------------
// 2. Parse errors
// ---------------------------------------------------------------------------

#[test]
fn corrupt_yaml_reports_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let file = home.child("broken.yaml");
    file.write_str(": : corrupt : yaml : !!!\n  - broken: [unclosed")
        .expect("write");

    let err = resolve_at(home.path(), Some(file.path()), NO_ENV).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
    assert!(predicate::str::contains("broken.yaml").eval(&err.to_string()));
}

#[test]
fn unknown_field_is_a_parse_error() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let file = home.child("typo.yaml");
    file.write_str("root_container: abc\nmax_cout: 4\n").expect("write");

    let err = resolve_at(home.path(), Some(file.path()), NO_ENV).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
}

// ---------------------------------------------------------------------------
// 3. Validation
// ---------------------------------------------------------------------------

#[rstest]
#[case("LAPSE_FRAME_RATE", "0")]
#[case("LAPSE_MAX_INPUTS_PER_ARTIFACT", "0")]
#[case("LAPSE_RETRY_MAX_ATTEMPTS", "0")]
#[case("LAPSE_IMAGE_FOLDER_NAME", "a/b")]
#[case("LAPSE_RUN_DEADLINE_SECS", "0")]
fn out_of_range_values_are_invalid(#[case] var: &str, #[case] value: &str) {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let err = resolve_at(
        home.path(),
        None,
        [("LAPSE_ROOT_CONTAINER", "root"), (var, value)],
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::Invalid { .. }), "got: {err}");
}

#[rstest]
#[case("LAPSE_SYNC_ENABLED", "maybe")]
#[case("LAPSE_LOCAL_MAX_COUNT", "-1")]
fn unparsable_env_values_name_the_variable(#[case] var: &str, #[case] value: &str) {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let err = resolve_at(
        home.path(),
        None,
        [("LAPSE_ROOT_CONTAINER", "root"), (var, value)],
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::InvalidEnv { .. }), "got: {err}");
    assert!(err.to_string().contains(var));
}

#[test]
fn effective_config_renders_as_yaml() {
    let cfg = LapseConfig {
        root_container: "root".to_string(),
        ..LapseConfig::default()
    };
    let yaml = config::to_yaml(&cfg).expect("yaml");
    assert!(predicate::str::contains("root_container: root").eval(yaml.as_str()));
    let back: LapseConfig = serde_yaml::from_str(&yaml).expect("reparse");
    assert_eq!(back, cfg);
}

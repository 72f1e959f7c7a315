//! Coverage for config parsing and environment overrides.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use edgeward::config::{EdgewardConfig, CONFIG_PATH_ENV};

fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
        .collect();
    move |key: &str| map.get(key).cloned()
}

#[test]
fn parse_partial_config_keeps_defaults() {
    let toml_str = r#"
[database]
path = "/var/lib/edgeward/state.db"

[cascade]
batch_size = 10

[posture]
mfa_grace_period_secs = 60
"#;
    let config = EdgewardConfig::from_toml(toml_str).expect("config should parse");
    assert_eq!(
        config.database.path.as_deref(),
        Some("/var/lib/edgeward/state.db")
    );
    assert_eq!(config.database.max_connections, 8);
    assert_eq!(config.cascade.batch_size, 10);
    assert_eq!(config.cascade.interval_secs, 5);
    assert_eq!(config.posture.mfa_grace(), chrono::Duration::seconds(60));
    assert_eq!(config.activity.interval(), Duration::from_secs(90));
    assert_eq!(config.logging.level, "info");
}

#[test]
fn empty_config_is_default() {
    let config = EdgewardConfig::from_toml("").expect("empty config should parse");
    assert_eq!(config.activity.batch_size, 250);
    assert_eq!(config.posture.enforcement_interval(), Duration::from_secs(5));
}

#[test]
fn mistyped_values_are_rejected() {
    let toml_str = r#"
[activity]
batch_size = "lots"
"#;
    assert!(EdgewardConfig::from_toml(toml_str).is_err());
}

#[test]
fn env_overrides_file_values() {
    let mut config = EdgewardConfig::from_toml(
        r#"
[activity]
batch_size = 10
interval_secs = 30
"#,
    )
    .expect("parse");

    config.apply_overrides(env_of(&[
        ("EDGEWARD_ACTIVITY_BATCH_SIZE", "500"),
        ("EDGEWARD_DB_PATH", "/tmp/edgeward.db"),
        ("EDGEWARD_LOG_LEVEL", "debug"),
        ("EDGEWARD_LOGS_DIR", "/var/log/edgeward"),
    ]));

    assert_eq!(config.activity.batch_size, 500);
    assert_eq!(config.activity.interval_secs, 30);
    assert_eq!(config.database.path.as_deref(), Some("/tmp/edgeward.db"));
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.logging.logs_dir, PathBuf::from("/var/log/edgeward"));
}

#[test]
fn invalid_numeric_override_is_ignored() {
    let mut config = EdgewardConfig::default();
    config.apply_overrides(env_of(&[
        ("EDGEWARD_CASCADE_INTERVAL_SECS", "soon"),
        ("EDGEWARD_POSTURE_ENFORCEMENT_INTERVAL_SECS", "15"),
    ]));
    assert_eq!(config.cascade.interval_secs, 5);
    assert_eq!(config.posture.enforcement_interval_secs, 15);
}

#[test]
fn config_path_comes_from_env() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let file = tmp.path().join("edgeward.toml");
    std::fs::write(&file, "[cascade]\ninterval_secs = 2\n").expect("write config");

    let path = EdgewardConfig::config_path_with(env_of(&[(
        CONFIG_PATH_ENV,
        file.to_str().expect("utf-8 path"),
    )]));
    assert_eq!(path, file);

    let contents = std::fs::read_to_string(&path).expect("read config");
    let config = EdgewardConfig::from_toml(&contents).expect("parse");
    assert_eq!(config.cascade.interval_secs, 2);
}

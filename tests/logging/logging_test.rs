//! Tests for `src/logging.rs`.

use edgeward::config::LoggingConfig;
use edgeward::logging::{env_filter, LoggingGuard};

#[test]
fn logging_guard_is_send() {
    fn assert_send<T: Send>() {}
    assert_send::<LoggingGuard>();
}

#[test]
fn init_production_creates_logs_dir() {
    let tmp = tempfile::tempdir().expect("should create temp dir");
    let logs_dir = tmp.path().join("logs");
    assert!(!logs_dir.exists());

    let config = LoggingConfig {
        level: "debug".to_owned(),
        logs_dir: logs_dir.clone(),
    };
    // A second global subscriber in the same process is an error, but the
    // directory is created before that.
    let _result = edgeward::logging::init_production(&config);
    assert!(logs_dir.exists(), "logs directory should be created");
}

#[test]
fn invalid_level_falls_back() {
    let filter = env_filter("[[[not a filter");
    assert!(!filter.to_string().is_empty());
}

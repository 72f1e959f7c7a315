//! Configuration loading.
//!
//! Loads edgeward configuration from `./edgeward.toml` (or
//! `$EDGEWARD_CONFIG_PATH`). Environment variables override file values;
//! file values override defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Env var naming the config file.
pub const CONFIG_PATH_ENV: &str = "EDGEWARD_CONFIG_PATH";

/// Config file used when [`CONFIG_PATH_ENV`] is unset.
pub const DEFAULT_CONFIG_FILE: &str = "edgeward.toml";

// ── Top-level config ────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EdgewardConfig {
    /// Storage settings (`[database]`).
    pub database: DatabaseConfig,
    /// Heartbeat flushing (`[activity]`).
    pub activity: ActivityConfig,
    /// Deferred session cleanup (`[cascade]`).
    pub cascade: CascadeConfig,
    /// Posture history and enforcement (`[posture]`).
    pub posture: PostureConfig,
    /// Log output (`[logging]`).
    pub logging: LoggingConfig,
}

impl EdgewardConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from the TOML file only. A missing file yields defaults.
    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config file {}: {e}",
                path.display()
            )),
        }
    }

    /// Resolve the config path using a custom env resolver.
    pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver so tests need not mutate the process environment.
    /// Unparseable numeric values are logged and ignored.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        // Database.
        if let Some(v) = env("EDGEWARD_DB_PATH") {
            self.database.path = Some(v);
        }
        override_parsed(&env, "EDGEWARD_DB_MAX_CONNECTIONS", &mut self.database.max_connections);
        override_parsed(&env, "EDGEWARD_DB_BUSY_TIMEOUT_MS", &mut self.database.busy_timeout_ms);

        // Activity.
        override_parsed(&env, "EDGEWARD_ACTIVITY_BATCH_SIZE", &mut self.activity.batch_size);
        override_parsed(&env, "EDGEWARD_ACTIVITY_INTERVAL_SECS", &mut self.activity.interval_secs);

        // Cascade.
        override_parsed(&env, "EDGEWARD_CASCADE_INTERVAL_SECS", &mut self.cascade.interval_secs);
        override_parsed(&env, "EDGEWARD_CASCADE_BATCH_SIZE", &mut self.cascade.batch_size);

        // Posture.
        override_parsed(
            &env,
            "EDGEWARD_POSTURE_ENFORCEMENT_INTERVAL_SECS",
            &mut self.posture.enforcement_interval_secs,
        );

        // Logging.
        if let Some(v) = env("EDGEWARD_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = env("EDGEWARD_LOGS_DIR") {
            self.logging.logs_dir = PathBuf::from(v);
        }
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or has mistyped values.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: EdgewardConfig =
            toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }
}

fn override_parsed<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    slot: &mut T,
) {
    if let Some(v) = env(var) {
        match v.parse() {
            Ok(n) => *slot = n,
            Err(_) => tracing::warn!(var, value = %v, "ignoring invalid env override"),
        }
    }
}

// ── Database config ─────────────────────────────────────────────

/// SQLite storage settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file. `None` keeps everything in memory.
    pub path: Option<String>,
    /// Pool size for file databases.
    pub max_connections: u32,
    /// How long a connection waits on a locked database.
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_connections: 8,
            busy_timeout_ms: 5_000,
        }
    }
}

// ── Activity config ─────────────────────────────────────────────

/// Api session heartbeat batching.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    /// Pending heartbeats that trigger an early flush.
    pub batch_size: usize,
    /// Seconds between periodic flushes.
    pub interval_secs: u64,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            batch_size: 250,
            interval_secs: 90,
        }
    }
}

impl ActivityConfig {
    /// Flush interval, never zero.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

// ── Cascade config ──────────────────────────────────────────────

/// Eventual event processing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    /// Seconds between polls for pending events.
    pub interval_secs: u64,
    /// Events handled per pass.
    pub batch_size: u32,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            batch_size: 100,
        }
    }
}

impl CascadeConfig {
    /// Poll interval, never zero.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

// ── Posture config ──────────────────────────────────────────────

/// Posture cache and enforcement.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostureConfig {
    /// Failed session requests remembered per identity.
    pub max_failure_history: usize,
    /// Seconds between full enforcement sweeps.
    pub enforcement_interval_secs: u64,
    /// Sessions loaded per sweep page.
    pub sweep_chunk: u32,
    /// Seconds after a wake or unlock before MFA must be repeated.
    pub mfa_grace_period_secs: i64,
}

impl Default for PostureConfig {
    fn default() -> Self {
        Self {
            max_failure_history: 100,
            enforcement_interval_secs: 5,
            sweep_chunk: 1_000,
            mfa_grace_period_secs: 300,
        }
    }
}

impl PostureConfig {
    /// Sweep interval, never zero.
    pub fn enforcement_interval(&self) -> Duration {
        Duration::from_secs(self.enforcement_interval_secs.max(1))
    }

    /// MFA grace period.
    pub fn mfa_grace(&self) -> chrono::Duration {
        chrono::Duration::try_seconds(self.mfa_grace_period_secs.max(0))
            .unwrap_or_else(|| chrono::Duration::minutes(5))
    }
}

// ── Logging config ──────────────────────────────────────────────

/// Log output.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for rotated JSON logs.
    pub logs_dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            logs_dir: PathBuf::from("logs"),
        }
    }
}

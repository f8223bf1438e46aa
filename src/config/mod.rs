//! Configuration management module for TaskForge.
//!
//! This module provides the coordinator's configuration types and the
//! loading pipeline that merges built-in defaults, an optional TOML file,
//! and environment-variable overrides.
//!
//! # Key Components
//!
//! - [`CoordinatorConfig`] - Main configuration structure containing all
//!   settings
//! - [`EnvironmentProvider`] - Environment access trait with production and
//!   test implementations
//! - [`validator`] - Section validators run before a coordinator is created
//!
//! # Loading order
//!
//! 1. Built-in defaults ([`CoordinatorConfig::default`])
//! 2. TOML file, when a path is given (section per struct field)
//! 3. Environment overrides: `TASKFORGE_PORT`, `TASKFORGE_LOW_PORT`,
//!    `TASKFORGE_HIGH_PORT`, `TASKFORGE_NAME`, `TASKFORGE_PRIORITY`,
//!    `TASKFORGE_CATALOG_HOSTS` (comma-separated `host:port` list)
//!
//! # Examples
//!
//! ```rust
//! use taskforge::config::{CoordinatorConfig, SystemEnvironmentProvider};
//!
//! # fn main() -> taskforge::Result<()> {
//! let config = CoordinatorConfig::load(None, &SystemEnvironmentProvider::new())?;
//! assert!(config.port.low_port <= config.port.high_port);
//! # Ok(())
//! # }
//! ```

use crate::Result;
use crate::core::scheduler::SchedulePolicy;
use crate::error::TaskForgeError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub mod environment;
pub mod validator;

pub use environment::{EnvironmentProvider, SystemEnvironmentProvider, TestEnvironmentProvider};

/// Listening-port selection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PortConfig {
    /// Exact port to bind. Zero means scan `low_port..=high_port`.
    pub port: u16,
    /// Lowest port tried when scanning.
    pub low_port: u16,
    /// Highest port tried when scanning.
    pub high_port: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        PortConfig {
            port: 0,
            low_port: 9123,
            high_port: 9223,
        }
    }
}

/// Catalog announcement settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CatalogConfig {
    /// `host:port` datagram destinations. Empty disables announcements.
    pub hosts: Vec<String>,
    /// Seconds between announcements.
    pub interval_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        CatalogConfig {
            hosts: Vec::new(),
            interval_secs: 60,
        }
    }
}

/// Message and keepalive timeouts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Timeout for single-line control messages, seconds.
    pub short_secs: u64,
    /// Timeout for incomplete message continuations, seconds.
    pub long_secs: u64,
    /// Idle interval after which a keepalive probe is sent, seconds.
    pub keepalive_interval_secs: u64,
    /// Silence after which a worker is considered lost, seconds.
    pub keepalive_timeout_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            short_secs: 5,
            long_secs: 60,
            keepalive_interval_secs: 120,
            keepalive_timeout_secs: 900,
        }
    }
}

/// File-transfer tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TransferConfig {
    /// Minimum seconds allowed for any single transfer.
    pub min_timeout_secs: u64,
    /// A transfer taking this multiple of the expected time is aborted.
    pub outlier_factor: u64,
    /// Assumed transfer rate before observations, bytes per second.
    pub default_rate_bytes_per_sec: u64,
    /// Artificial bandwidth cap, bytes per second. Zero disables it.
    pub bandwidth_limit_bytes_per_sec: u64,
    /// Minimum free disk space required to accept an output, megabytes.
    pub disk_avail_threshold_mb: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            min_timeout_secs: 10,
            outlier_factor: 10,
            default_rate_bytes_per_sec: 1_000_000,
            bandwidth_limit_bytes_per_sec: 0,
            disk_avail_threshold_mb: 100,
        }
    }
}

/// Scheduler and main-loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Global worker-selection policy.
    pub policy: SchedulePolicy,
    /// Overcommit factor applied to worker totals.
    pub submit_multiplier: f64,
    /// Minimum waiting tasks before `hungry()` reports zero.
    pub hungry_minimum: u64,
    /// Harvest every available result per iteration instead of one.
    pub wait_retrieve_many: bool,
    /// Bound on connections accepted per loop iteration.
    pub max_new_workers_per_cycle: u64,
    /// Seconds between large-task checks.
    pub large_task_check_interval_secs: u64,
    /// Default fast-abort multiplier. Zero disables fast-abort.
    pub fast_abort_multiplier: f64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        SchedulingConfig {
            policy: SchedulePolicy::Rand,
            submit_multiplier: 1.0,
            hungry_minimum: 10,
            wait_retrieve_many: false,
            max_new_workers_per_cycle: 10,
            large_task_check_interval_secs: 180,
            fast_abort_multiplier: 0.0,
        }
    }
}

/// Authentication settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct SecurityConfig {
    /// File holding the shared secret workers must prove knowledge of.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_file: Option<PathBuf>,
}

/// Observability log locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    /// Performance log path; `None` disables it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub perf_log: Option<PathBuf>,
    /// Transaction log path; `None` disables it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_log: Option<PathBuf>,
    /// Seconds between performance log rows.
    pub perf_interval_secs: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            perf_log: None,
            transaction_log: None,
            perf_interval_secs: 15,
        }
    }
}

/// Full coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Project name announced to the catalog, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Priority relative to other coordinators with the same name.
    pub priority: i64,
    /// Listening-port selection.
    pub port: PortConfig,
    /// Catalog announcements.
    pub catalog: CatalogConfig,
    /// Message and keepalive timeouts.
    pub timeouts: TimeoutConfig,
    /// File-transfer tuning.
    pub transfer: TransferConfig,
    /// Scheduler and main-loop tuning.
    pub scheduling: SchedulingConfig,
    /// Authentication settings.
    pub security: SecurityConfig,
    /// Observability log locations.
    pub logs: LogConfig,
}

impl CoordinatorConfig {
    /// Default location of the configuration file,
    /// `$CONFIG_DIR/taskforge/config.toml`.
    pub fn default_file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("taskforge").join("config.toml"))
    }

    /// Load configuration from defaults, an optional TOML file, and
    /// environment overrides, then validate it.
    pub fn load(file: Option<&Path>, env: &dyn EnvironmentProvider) -> Result<Self> {
        let defaults = config::Config::try_from(&CoordinatorConfig::default())
            .map_err(|e| TaskForgeError::config(e.to_string()))?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let mut loaded: CoordinatorConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TaskForgeError::config(e.to_string()))?;
        loaded.apply_environment(env)?;
        validator::validate(&loaded)?;
        Ok(loaded)
    }

    /// Apply the recognized `TASKFORGE_*` overrides.
    pub fn apply_environment(&mut self, env: &dyn EnvironmentProvider) -> Result<()> {
        fn parsed<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value.parse().map_err(|_| {
                TaskForgeError::config(format!("cannot parse {}='{}'", key, value))
            })
        }
        if let Some(v) = env.get_var("TASKFORGE_PORT") {
            self.port.port = parsed("TASKFORGE_PORT", &v)?;
        }
        if let Some(v) = env.get_var("TASKFORGE_LOW_PORT") {
            self.port.low_port = parsed("TASKFORGE_LOW_PORT", &v)?;
        }
        if let Some(v) = env.get_var("TASKFORGE_HIGH_PORT") {
            self.port.high_port = parsed("TASKFORGE_HIGH_PORT", &v)?;
        }
        if let Some(v) = env.get_var("TASKFORGE_NAME") {
            self.name = Some(v);
        }
        if let Some(v) = env.get_var("TASKFORGE_PRIORITY") {
            self.priority = parsed("TASKFORGE_PRIORITY", &v)?;
        }
        if let Some(v) = env.get_var("TASKFORGE_CATALOG_HOSTS") {
            self.catalog.hosts = v
                .split(',')
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = CoordinatorConfig::default();
        validator::validate(&config).unwrap();
        assert_eq!(config.timeouts.short_secs, 5);
        assert_eq!(config.port.low_port, 9123);
        assert_eq!(config.scheduling.policy, SchedulePolicy::Rand);
    }

    #[test]
    fn environment_overrides_apply() {
        let mut env = TestEnvironmentProvider::new();
        env.set_var("TASKFORGE_PORT", "9500");
        env.set_var("TASKFORGE_NAME", "nightly-build");
        env.set_var("TASKFORGE_PRIORITY", "7");
        env.set_var("TASKFORGE_CATALOG_HOSTS", "cat1:9097, cat2:9097");

        let config = CoordinatorConfig::load(None, &env).unwrap();
        assert_eq!(config.port.port, 9500);
        assert_eq!(config.name.as_deref(), Some("nightly-build"));
        assert_eq!(config.priority, 7);
        assert_eq!(config.catalog.hosts, vec!["cat1:9097", "cat2:9097"]);
    }

    #[test]
    fn malformed_environment_value_is_a_config_error() {
        let mut env = TestEnvironmentProvider::new();
        env.set_var("TASKFORGE_PORT", "not-a-port");
        let err = CoordinatorConfig::load(None, &env).unwrap_err();
        assert!(matches!(err, TaskForgeError::Config { .. }));
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[timeouts]\nshort_secs = 9\n\n[scheduling]\npolicy = \"files\"\n",
        )
        .unwrap();

        let config =
            CoordinatorConfig::load(Some(&path), &TestEnvironmentProvider::new()).unwrap();
        assert_eq!(config.timeouts.short_secs, 9);
        assert_eq!(config.scheduling.policy, SchedulePolicy::Files);
        // untouched sections keep defaults
        assert_eq!(config.timeouts.long_secs, 60);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = CoordinatorConfig::default();
        let text = toml::to_string(&config).unwrap();
        let back: CoordinatorConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, config);
    }
}

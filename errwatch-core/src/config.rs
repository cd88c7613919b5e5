//! Settings for exception stores.
//!
//! Loaded from a TOML file. Every store must be named and carry a
//! connection string; the global thresholds fall back to documented
//! defaults.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ConfigError;

/// Default number of rows kept per application in the error summary.
pub const DEFAULT_PER_APP_SUMMARY_COUNT: usize = 1000;

/// Default window, in seconds, for the "recent" exception count.
pub const DEFAULT_RECENT_SECONDS: u64 = 600;

/// Lower bound on the interval between two polls of the same entry.
pub const MIN_SECONDS_BETWEEN_POLLS: u64 = 1;

/// Upper bound on the recent window: ten years.
pub const MAX_RECENT_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

/// Environment variable naming the settings file.
pub const CONFIG_PATH_ENV: &str = "ERRWATCH_CONFIG";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExceptionsSettings {
    #[serde(default = "default_recent_seconds")]
    pub recent_seconds: u64,
    #[serde(default = "default_per_app_summary_count")]
    pub per_app_summary_count: usize,
    pub stores: Vec<StoreSettings>,
}

/// Which backend a store talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreProvider {
    #[default]
    Postgres,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreSettings {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub connection_string: String,
    #[serde(default)]
    pub provider: StoreProvider,
    pub poll_interval_seconds: u64,
    #[serde(default)]
    pub query_timeout_ms: Option<u64>,
}

fn default_recent_seconds() -> u64 {
    DEFAULT_RECENT_SECONDS
}

fn default_per_app_summary_count() -> usize {
    DEFAULT_PER_APP_SUMMARY_COUNT
}

impl StoreSettings {
    /// Poll interval, never below the minimum seconds between polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds.max(MIN_SECONDS_BETWEEN_POLLS))
    }

    /// Per-operation command timeout, also used as the connect deadline.
    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn description(&self) -> &str {
        self.description.as_deref().unwrap_or(&self.name)
    }
}

impl ExceptionsSettings {
    /// Load from `--config <path>` or `ERRWATCH_CONFIG`, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let settings = Self::from_path(&path)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })
    }

    pub fn recent_window(&self) -> Duration {
        Duration::from_secs(self.recent_seconds)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stores.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "stores".to_string(),
                reason: "at least one store is required".to_string(),
            });
        }
        if self.recent_seconds > MAX_RECENT_SECONDS {
            return Err(ConfigError::InvalidValue {
                field: "recent_seconds".to_string(),
                reason: format!("must be <= {MAX_RECENT_SECONDS}"),
            });
        }
        if self.per_app_summary_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "per_app_summary_count".to_string(),
                reason: "must be > 0".to_string(),
            });
        }

        let mut names = HashSet::new();
        for store in &self.stores {
            if store.name.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "stores.name".to_string(),
                    reason: "must not be empty".to_string(),
                });
            }
            if !names.insert(store.name.as_str()) {
                return Err(ConfigError::InvalidValue {
                    field: "stores.name".to_string(),
                    reason: format!("duplicate store name '{}'", store.name),
                });
            }
            if store.provider == StoreProvider::Postgres
                && store.connection_string.trim().is_empty()
            {
                return Err(ConfigError::InvalidValue {
                    field: format!("stores.{}.connection_string", store.name),
                    reason: "must not be empty".to_string(),
                });
            }
            if store.poll_interval_seconds < MIN_SECONDS_BETWEEN_POLLS {
                return Err(ConfigError::InvalidValue {
                    field: format!("stores.{}.poll_interval_seconds", store.name),
                    reason: format!("must be >= {}", MIN_SECONDS_BETWEEN_POLLS),
                });
            }
            if store.query_timeout_ms == Some(0) {
                return Err(ConfigError::InvalidValue {
                    field: format!("stores.{}.query_timeout_ms", store.name),
                    reason: "must be > 0 when set".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
        if let Some(value) = arg.strip_prefix("--config=") {
            return Some(PathBuf::from(value));
        }
    }
    None
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from)
}

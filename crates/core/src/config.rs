// crates/core/src/config.rs
//! Runtime configuration.
//!
//! Layering, lowest to highest precedence: built-in defaults, the TOML config
//! file, `DARKHORSES_*` environment variables, then CLI flags (applied by the
//! binary after `Config::load`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_COVERAGE_THRESHOLD: f64 = 95.0;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub plan: PlanConfig,
    pub runner: RunnerConfig,
    pub upstream: UpstreamConfig,
    pub verify: VerifyConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `None` means the default cache location.
    pub path: Option<PathBuf>,
    /// Client-side bound on a single schema step.
    pub statement_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            statement_timeout_ms: 60_000,
        }
    }
}

impl DatabaseConfig {
    pub fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    pub path: Option<PathBuf>,
}

/// Knobs for the backfill batch loop.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Upper bound for one batch (select + transform + commit).
    pub batch_timeout_ms: u64,
    /// Timeouts tolerated for one batch before the job fails.
    pub max_timeout_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Rate-limit signals tolerated for one batch before the job fails.
    pub max_rate_limit_retries: u32,
    /// Lifetime of the per-(table, columns) lease; renewed every batch.
    pub lease_ttl_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            batch_timeout_ms: 30_000,
            max_timeout_retries: 6,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            max_rate_limit_retries: 8,
            lease_ttl_secs: 300,
        }
    }
}

impl RunnerConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// Configuration for the racing data API.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// Externally imposed request budget. `None` disables pacing.
    pub requests_per_second: Option<f64>,
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            requests_per_second: Some(2.0),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    pub coverage_threshold: f64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            coverage_threshold: DEFAULT_COVERAGE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// When set, logs are also written to a daily-rolling file here.
    pub log_dir: Option<PathBuf>,
}

impl Config {
    /// Load the config file (if any) and apply environment overrides.
    ///
    /// An explicit `path` that does not exist is an error; the default
    /// location is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match crate::paths::config_path() {
                Some(p) if p.exists() => Self::from_file(&p)?,
                _ => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&text).map_err(|e| ConfigError::Malformed {
            path: path.to_owned(),
            message: e.to_string(),
        })
    }

    /// Apply `DARKHORSES_*` overrides from the given lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DARKHORSES_DB") {
            self.database.path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("DARKHORSES_PLAN") {
            self.plan.path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("DARKHORSES_API_URL") {
            self.upstream.base_url = Some(v);
        }
        if let Some(v) = lookup("DARKHORSES_API_KEY") {
            self.upstream.api_key = Some(v);
        }
        if let Some(v) = lookup("DARKHORSES_API_RPS") {
            let rps: f64 = v.parse().map_err(|_| ConfigError::InvalidValue {
                key: "DARKHORSES_API_RPS".into(),
                value: v.clone(),
            })?;
            // 0 means "no budget"
            self.upstream.requests_per_second = (rps > 0.0).then_some(rps);
        }
        Ok(())
    }

    /// Database path, falling back to the cache directory.
    pub fn db_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.database.path {
            Some(p) => Ok(p.clone()),
            None => crate::paths::db_path().ok_or(ConfigError::NoCacheDir),
        }
    }

    pub fn plan_path(&self) -> PathBuf {
        self.plan
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from(crate::paths::DEFAULT_PLAN_FILE))
    }
}

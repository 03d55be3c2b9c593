// src/config.rs

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::core::dispatch::DispatchSettings;
use crate::core::health::HealthPolicy;
use crate::core::sandbox::SandboxConfig;
use crate::logging::{LoggingConfig, PROJECT_NAME, get_config_dir};

lazy_static! {
    pub static ref CONFIG_ENV_PREFIX: String = format!("{}_", PROJECT_NAME.as_str());
    pub static ref CONFIG_FILE: String = "config.json".to_string();
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("environment override {key}={value} is not valid: {reason}")]
    InvalidOverride { key: String, value: String, reason: String },

    #[error("invalid configuration: {field} {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Engine-wide tunables. Every field has a default, so a config file only
/// needs the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Module invocations allowed to run at once within one scan.
    pub max_concurrency: usize,
    /// How long an aborted scan waits for in-flight invocations.
    pub abort_grace_period_ms: u64,
    /// Finished scans whose final status the engine keeps answering for.
    pub retained_scans: usize,
    pub sandbox: SandboxConfig,
    pub health: HealthPolicy,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            abort_grace_period_ms: 5_000,
            retained_scans: 32,
            sandbox: SandboxConfig::default(),
            health: HealthPolicy::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads the configuration the binary runs with.
    ///
    /// The file is `path` when given, else `config.json` in the platform
    /// config directory when it exists; otherwise defaults are used.
    /// `VANGUARD_ENGINE_*` variables are applied on top, then the result is
    /// validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = get_config_dir().join(CONFIG_FILE.as_str());
                if default_path.is_file() {
                    Self::from_file(&default_path)?
                } else {
                    debug!(path = %default_path.display(), "No config file found; using defaults.");
                    Self::default()
                }
            }
        };
        config.apply_overrides(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "Configuration loaded.");
        Ok(config)
    }

    /// Applies `VANGUARD_ENGINE_<FIELD>` overrides from `vars`. Variables with
    /// the prefix but no matching field are ignored.
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            let Some(field) = key.strip_prefix(CONFIG_ENV_PREFIX.as_str()) else {
                continue;
            };
            match field {
                "MAX_CONCURRENCY" => self.max_concurrency = parse(key, value)?,
                "ABORT_GRACE_PERIOD_MS" => self.abort_grace_period_ms = parse(key, value)?,
                "RETAINED_SCANS" => self.retained_scans = parse(key, value)?,
                "DEFAULT_TIMEOUT_MS" => self.sandbox.default_timeout_ms = parse(key, value)?,
                "SLOW_TIMEOUT_MS" => self.sandbox.slow_timeout_ms = parse(key, value)?,
                "SETUP_TIMEOUT_MS" => self.sandbox.setup_timeout_ms = parse(key, value)?,
                "MAX_EMISSIONS" => self.sandbox.max_emissions = parse(key, value)?,
                "MAX_CONSECUTIVE_FAILURES" => self.health.max_consecutive_failures = parse(key, value)?,
                "FAILURE_RATE_THRESHOLD" => self.health.failure_rate_threshold = parse(key, value)?,
                "MIN_INVOCATIONS_FOR_RATE" => self.health.min_invocations_for_rate = parse(key, value)?,
                "LATENCY_WINDOW" => self.health.latency_window = parse(key, value)?,
                "LOG_DIR" => self.logging.directory = Some(PathBuf::from(value)),
                _ => continue,
            }
            debug!(key, value, "Configuration override applied.");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| Err(ConfigError::Invalid { field, reason: reason.to_string() });
        if self.max_concurrency == 0 {
            return invalid("max_concurrency", "must be at least 1");
        }
        if !(self.health.failure_rate_threshold > 0.0 && self.health.failure_rate_threshold <= 1.0) {
            return invalid("health.failure_rate_threshold", "must be in (0, 1]");
        }
        if self.health.max_consecutive_failures == 0 {
            return invalid("health.max_consecutive_failures", "must be at least 1");
        }
        for (field, value) in [
            ("sandbox.default_timeout_ms", self.sandbox.default_timeout_ms),
            ("sandbox.slow_timeout_ms", self.sandbox.slow_timeout_ms),
            ("sandbox.setup_timeout_ms", self.sandbox.setup_timeout_ms),
        ] {
            if value == 0 {
                return invalid(field, "must be greater than zero");
            }
        }
        Ok(())
    }

    pub fn abort_grace_period(&self) -> Duration {
        Duration::from_millis(self.abort_grace_period_ms)
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            max_concurrency: self.max_concurrency,
            abort_grace_period: self.abort_grace_period(),
            sandbox: self.sandbox.clone(),
            health: self.health.clone(),
        }
    }
}

fn parse<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidOverride {
        key: key.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

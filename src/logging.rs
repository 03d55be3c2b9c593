// src/logging.rs

use color_eyre::eyre::Result;
use directories::ProjectDirs;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing_error::ErrorLayer;
use tracing_subscriber::{self, EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

lazy_static! {
    pub static ref PROJECT_NAME: String = env!("CARGO_CRATE_NAME").to_uppercase();
    /// `VANGUARD_ENGINE_LOGLEVEL`: filter used when `RUST_LOG` is unset.
    pub static ref LOG_ENV: String = format!("{}_LOGLEVEL", PROJECT_NAME.as_str());
    pub static ref LOG_FILE: String = format!("{}.log", env!("CARGO_PKG_NAME"));
}

/// The `logging` section of the engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for the log file; the platform data directory when unset.
    pub directory: Option<PathBuf>,
    /// `EnvFilter` directive used when neither `RUST_LOG` nor
    /// `VANGUARD_ENGINE_LOGLEVEL` is set.
    pub level: Option<String>,
    /// Keep earlier runs' lines instead of truncating the file.
    pub append: bool,
}

impl LoggingConfig {
    pub fn log_path(&self) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(get_data_dir)
            .join(LOG_FILE.as_str())
    }

    /// Picks the filter directive: `RUST_LOG`, then the project variable, then
    /// the configured level, then `vanguard_engine=info`.
    pub fn filter_directive(&self, rust_log: Option<String>, project_level: Option<String>) -> String {
        rust_log
            .or(project_level)
            .or_else(|| self.level.clone())
            .unwrap_or_else(|| format!("{}=info", env!("CARGO_CRATE_NAME")))
    }
}

pub(crate) fn project_directory() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "vanguard-rs", env!("CARGO_PKG_NAME"))
}

pub fn get_data_dir() -> PathBuf {
    if let Some(proj_dirs) = project_directory() {
        proj_dirs.data_local_dir().to_path_buf()
    } else {
        PathBuf::from(".").join(".data")
    }
}

pub fn get_config_dir() -> PathBuf {
    if let Some(proj_dirs) = project_directory() {
        proj_dirs.config_local_dir().to_path_buf()
    } else {
        PathBuf::from(".").join(".config")
    }
}

/// Initializes file-based logging using the tracing subscriber and returns
/// the path of the log file.
///
/// Stdout is left to the binary's JSON output; everything the engine logs
/// goes to the file.
pub fn initialize_logging(config: &LoggingConfig) -> Result<PathBuf> {
    let log_path = config.log_path();
    if let Some(directory) = log_path.parent() {
        std::fs::create_dir_all(directory)?;
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .append(config.append)
        .truncate(!config.append)
        .open(&log_path)?;

    let file_log_level =
        config.filter_directive(std::env::var("RUST_LOG").ok(), std::env::var(LOG_ENV.as_str()).ok());

    let file_subscriber = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_target(false)
        .with_ansi(false)
        .with_filter(EnvFilter::new(file_log_level));

    tracing_subscriber::registry()
        .with(file_subscriber)
        .with(ErrorLayer::default())
        .init();

    Ok(log_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Some("debug"), Some("warn"), Some("error"), "debug")]
    #[case(None, Some("warn"), Some("error"), "warn")]
    #[case(None, None, Some("error"), "error")]
    #[case(None, None, None, "vanguard_engine=info")]
    fn filter_precedence(
        #[case] rust_log: Option<&str>,
        #[case] project: Option<&str>,
        #[case] configured: Option<&str>,
        #[case] expected: &str,
    ) {
        let config = LoggingConfig { level: configured.map(str::to_string), ..LoggingConfig::default() };
        let directive = config.filter_directive(rust_log.map(str::to_string), project.map(str::to_string));
        assert_eq!(directive, expected);
    }

    #[test]
    fn configured_directory_holds_the_log_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = LoggingConfig { directory: Some(dir.path().to_path_buf()), ..LoggingConfig::default() };
        assert_eq!(config.log_path(), dir.path().join("vanguard-engine.log"));
    }
}

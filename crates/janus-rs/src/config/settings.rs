//! Locating and parsing the configuration document.
//!
//! The path comes from `JANUS_CONFIG_PATH`, defaulting to `janus.json` in
//! the working directory. A missing file is not an error: the defaults
//! describe a runnable single-worker setup, which keeps the zero-config
//! path working for development.

use log::{info, warn};
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::models::settings::Settings;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "JANUS_CONFIG_PATH";

const DEFAULT_CONFIG_PATH: &str = "janus.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read configuration at {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration at {path} is not valid JSON: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Resolved configuration file location.
pub fn config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Loads and hard-validates the settings document.
pub fn load_settings() -> Result<Settings, ConfigError> {
    let path = config_path();
    let settings = if path.exists() {
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let settings: Settings =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        info!("Loaded configuration from {}", path.display());
        settings
    } else {
        warn!(
            "No configuration at {}, using defaults",
            path.display()
        );
        Settings::default()
    };

    settings.validate().map_err(ConfigError::Invalid)?;
    Ok(settings)
}

static FROZEN: OnceCell<Arc<Settings>> = OnceCell::new();

/// Installs the process-wide configuration, exactly once.
///
/// The configuration is frozen at `start`; a second installation attempt is
/// a programming error and reported as such rather than silently replacing
/// what the rest of the process has already read.
pub fn freeze(settings: Arc<Settings>) -> Result<(), ConfigError> {
    FROZEN
        .set(settings)
        .map_err(|_| ConfigError::Invalid("configuration is already frozen".to_string()))
}

/// The frozen process-wide configuration, if `freeze` has run.
pub fn frozen() -> Option<Arc<Settings>> {
    FROZEN.get().cloned()
}

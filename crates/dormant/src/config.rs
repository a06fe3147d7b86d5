//! CLI configuration file.
//!
//! Optional TOML file; every field falls back to the registry defaults.
//!
//! ```toml
//! [registry]
//! max_jobs = 200
//! store_path = "/var/lib/dormant/jobs.json"
//! ```

use std::path::{Path, PathBuf};

use dormant_registry::RegistryConfig;
use serde::Deserialize;
use thiserror::Error;

/// Errors from loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    registry: RegistryConfig,
}

/// Default location of the configuration file.
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dormant")
        .join("config.toml")
}

/// Load the registry configuration.
///
/// A missing file at the default location yields defaults; a missing file
/// that was asked for explicitly is an error.
pub fn load(path: Option<&Path>) -> Result<RegistryConfig, ConfigError> {
    let (path, explicit) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (default_path(), false),
    };

    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(RegistryConfig::default());
        }
        Err(source) => return Err(ConfigError::Io { path, source }),
    };

    parse(&contents).map_err(|source| ConfigError::Toml { path, source })
}

fn parse(contents: &str) -> Result<RegistryConfig, toml::de::Error> {
    let file: ConfigFile = toml::from_str(contents)?;
    Ok(file.registry)
}

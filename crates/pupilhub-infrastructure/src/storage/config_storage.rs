//! TOML config file storage.
//!
//! Reads `config.toml` into [`HubConfig`]. Unknown keys are ignored and
//! missing keys take their defaults, so hand-edited partial files work.

use super::atomic_write::read_if_present;
use pupilhub_core::{HubConfig, HubError};
use std::path::{Path, PathBuf};

/// Errors that can occur during config storage operations.
#[derive(Debug)]
pub enum ConfigStorageError {
    /// File I/O error.
    IoError(std::io::Error),
    /// TOML parsing error.
    TomlParseError(toml::de::Error),
}

impl std::fmt::Display for ConfigStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigStorageError::IoError(e) => write!(f, "I/O error: {}", e),
            ConfigStorageError::TomlParseError(e) => write!(f, "TOML parse error: {}", e),
        }
    }
}

impl std::error::Error for ConfigStorageError {}

impl From<std::io::Error> for ConfigStorageError {
    fn from(e: std::io::Error) -> Self {
        ConfigStorageError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigStorageError {
    fn from(e: toml::de::Error) -> Self {
        ConfigStorageError::TomlParseError(e)
    }
}

impl From<ConfigStorageError> for HubError {
    fn from(e: ConfigStorageError) -> Self {
        HubError::config(e.to_string())
    }
}

/// Handle to the TOML config file.
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the configuration.
    ///
    /// # Returns
    ///
    /// - `Ok(HubConfig)`: Parsed config, or defaults when the file is missing
    ///   or empty
    /// - `Err`: Failed to read or parse the file
    pub fn load(&self) -> Result<HubConfig, ConfigStorageError> {
        match read_if_present(&self.path)? {
            Some(content) => Ok(toml::from_str(&content)?),
            None => {
                tracing::debug!(path = %self.path.display(), "No config file, using defaults");
                Ok(HubConfig::default())
            }
        }
    }
}

//! Platform paths for PupilHub configuration and data.

use std::path::PathBuf;

/// Errors that can occur during path resolution.
#[derive(Debug)]
pub enum PathError {
    /// Platform directory could not be determined.
    HomeDirNotFound,
}

impl std::fmt::Display for PathError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathError::HomeDirNotFound => write!(f, "Cannot find home directory"),
        }
    }
}

impl std::error::Error for PathError {}

impl From<PathError> for pupilhub_core::HubError {
    fn from(e: PathError) -> Self {
        pupilhub_core::HubError::config(e.to_string())
    }
}

/// Directory layout.
///
/// ```text
/// ~/.config/pupilhub/          # Config directory
/// └── config.toml              # Endpoints, timing, markers, cache tuning
///
/// ~/.local/share/pupilhub/     # Data directory
/// └── storage/                 # One JSON file per store key
///     └── pupilhub_data.json
/// ```
pub struct HubPaths;

impl HubPaths {
    const APP_DIR: &'static str = "pupilhub";

    pub fn config_dir() -> Result<PathBuf, PathError> {
        dirs::config_dir()
            .map(|dir| dir.join(Self::APP_DIR))
            .ok_or(PathError::HomeDirNotFound)
    }

    pub fn data_dir() -> Result<PathBuf, PathError> {
        dirs::data_dir()
            .map(|dir| dir.join(Self::APP_DIR))
            .ok_or(PathError::HomeDirNotFound)
    }

    pub fn config_file() -> Result<PathBuf, PathError> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Directory backing [`crate::JsonFileStore`].
    pub fn storage_dir() -> Result<PathBuf, PathError> {
        Ok(Self::data_dir()?.join("storage"))
    }
}

//! Library configuration management.
//!
//! Handles loading and saving the settings of an offline library: where it
//! lives on disk, which tier to download by default and what the user is
//! entitled to.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::artwork::DEFAULT_FETCH_TIMEOUT_SECS;
use crate::error::{Error, Result};
use crate::logging::LoggingConfig;
use crate::quality::Quality;
use crate::store::{read_error, write_json_atomic};

const APP_DIR: &str = "offtrack";
const CONFIG_FILE: &str = "config.json";

const fn default_true() -> bool {
    true
}

const fn default_cover_timeout() -> u64 {
    DEFAULT_FETCH_TIMEOUT_SECS
}

const fn default_quality() -> Quality {
    Quality::Mp3_320
}

/// Library configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LibraryConfig {
    /// Root directory of the library.
    pub library_directory: PathBuf,
    /// Tier requested when the caller does not name one.
    #[serde(default = "default_quality")]
    pub default_quality: Quality,
    /// Tiers the user may download. Empty means unknown (no clamping).
    #[serde(default)]
    pub entitled_qualities: Vec<Quality>,
    /// Fetch missing album covers when committing downloads.
    #[serde(default = "default_true")]
    pub fetch_missing_covers: bool,
    /// Timeout for cover requests, in seconds.
    #[serde(default = "default_cover_timeout")]
    pub cover_fetch_timeout_secs: u64,
    /// Directory holding downloads from before the current layout.
    #[serde(default)]
    pub legacy_directory: Option<PathBuf>,
    /// Log output for hosts that call [`crate::logging::init`].
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            library_directory: default_library_directory(),
            default_quality: default_quality(),
            entitled_qualities: Vec::new(),
            fetch_missing_covers: true,
            cover_fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            legacy_directory: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl LibraryConfig {
    /// Load configuration from the default location, or create defaults if
    /// not found.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_file_path())
    }

    /// Load configuration from `path`, or create defaults there if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("Config file not found, using defaults");
            let config = Self::default();
            if let Err(e) = config.save_to(path) {
                warn!("Failed to save default config: {}", e);
            }
            return Ok(config);
        }

        let content = fs::read_to_string(path).map_err(|e| read_error(path, e))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| Error::Configuration(format!("Failed to parse config file: {e}")))?;

        info!("Loaded config from {}", path.display());
        debug!("Library directory: {}", config.library_directory.display());
        Ok(config)
    }

    /// Save configuration to the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_file_path())
    }

    /// Save configuration to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)?;
        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Update the library directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is not usable.
    pub fn set_library_directory(&mut self, path: PathBuf) -> Result<()> {
        validate_library_directory(&path)?;
        self.library_directory = path;
        info!(
            "Updated library directory to: {}",
            self.library_directory.display()
        );
        Ok(())
    }

    /// Path of the default config file.
    #[must_use]
    pub fn config_file_path() -> PathBuf {
        config_file_path()
    }
}

/// Default library directory.
#[must_use]
pub fn default_library_directory() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("library")
}

fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join(APP_DIR)
        .join(CONFIG_FILE)
}

/// Check that `path` can hold a library: absolute, and a directory if it
/// already exists.
///
/// # Errors
///
/// Returns [`Error::Configuration`] describing the problem.
pub fn validate_library_directory(path: &Path) -> Result<()> {
    if !path.is_absolute() {
        return Err(Error::Configuration(
            "Library directory must be an absolute path".to_string(),
        ));
    }
    if path.exists() && !path.is_dir() {
        return Err(Error::Configuration(format!(
            "Path exists but is not a directory: {}",
            path.display()
        )));
    }
    Ok(())
}

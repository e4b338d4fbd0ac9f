//! Settings file handling
//!
//! Settings come from an optional TOML file. Command-line flags override them
//! when the engine configs are built; nothing here is global.

use crate::backup::expiry_after;
use crate::chunk::DEFAULT_BLOCK_SIZE;
use crate::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name looked up in the working directory
pub const LOCAL_CONFIG_FILE: &str = "blockvault.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Metadata index database file
    pub database: PathBuf,
    /// Root of the encrypted block store
    pub block_path: PathBuf,
    pub block_size: usize,
    pub workers: usize,
    pub exclude_patterns: Vec<String>,
    /// Days until new backups expire; unset means never
    pub retention_days: Option<u32>,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: PathBuf::from("backup.db"),
            block_path: PathBuf::from("./blocks"),
            block_size: DEFAULT_BLOCK_SIZE,
            workers: 4,
            exclude_patterns: Vec::new(),
            retention_days: None,
            logging: LoggingSettings::default(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl Settings {
    /// Load settings from `explicit` if given, otherwise from the first file
    /// found in the default locations, otherwise defaults.
    ///
    /// An explicitly named file must exist.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        for candidate in Self::search_paths() {
            if candidate.is_file() {
                return Self::from_file(&candidate);
            }
        }

        debug!("No settings file found, using defaults");
        Ok(Self::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let settings = Self::from_toml(&content).map_err(|e| match e {
            Error::Config { reason } => Error::config(format!("{}: {}", path.display(), reason)),
            other => other,
        })?;
        debug!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Self = toml::from_str(content)
            .map_err(|e| Error::config(format!("Failed to parse settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::config(format!("Failed to serialize settings: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::config("block_size must be greater than zero"));
        }
        if self.workers == 0 {
            return Err(Error::config("workers must be greater than zero"));
        }
        if let Some(days) = self.retention_days {
            expiry_after(Utc::now(), days)?;
        }
        Ok(())
    }

    /// `./blockvault.toml`, then `~/.blockvault/config.toml`
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(LOCAL_CONFIG_FILE)];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".blockvault").join("config.toml"));
        }
        paths
    }
}

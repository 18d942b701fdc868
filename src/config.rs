//! # Configuration Management Module
//!
//! Persistent engine settings stored in platform-appropriate locations.
//! Handles loading, saving, and providing defaults for configuration options.
//!
//! ## Settings
//! - `manufacturer_company_id`: company whose manufacturer data is copied
//!   into device updates
//! - `connect_settle_ms` / `service_settle_ms` / `characteristic_settle_ms`:
//!   settle pauses between a parent resolution and its child query
//!
//! ## Storage Location
//! - macOS: ~/Library/Application Support/blepoll/config.toml
//! - Linux: ~/.config/blepoll/config.toml
//! - Windows: %APPDATA%\blepoll\config.toml

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Company identifier whose manufacturer data is surfaced in
    /// [`crate::types::DeviceUpdate`].
    pub manufacturer_company_id: u16,
    /// Pause after a device connects before its handle is served to child
    /// queries. The stack needs the settle time or the first service query
    /// comes back empty.
    pub connect_settle_ms: u64,
    /// Pause before enumerating services of a freshly resolved device.
    pub service_settle_ms: u64,
    /// Pause before enumerating characteristics of a freshly resolved
    /// service.
    pub characteristic_settle_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            manufacturer_company_id: 0xFFFF,
            connect_settle_ms: 1000,
            service_settle_ms: 1,
            characteristic_settle_ms: 100,
        }
    }
}

impl EngineConfig {
    /// Get the path to the config file
    fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("blepoll")
            .join("config.toml")
    }

    /// Load config from the default location, or create it if missing
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load config from a specific file, creating it with defaults if it
    /// doesn't exist
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config = toml::from_str(&contents).map_err(ConfigError::ParseFailed)?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save_to(path)?;
                Ok(config)
            }
            Err(e) => Err(ConfigError::ReadFailed(e)),
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    /// Save config to a specific file
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::WriteFailed)?;
        }

        let toml_string = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        fs::write(path, toml_string).map_err(ConfigError::WriteFailed)?;

        Ok(())
    }
}

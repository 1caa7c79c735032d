//! Settings storage
//!
//! Persists the engine defaults: the initial [`LlmConfig`], the fatal-error
//! policy of the load ladder and logging preferences.

use crate::inference::{FatalErrorPolicy, LlmConfig};
use crate::storage::{get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Configuration the engine starts from
    pub llm: LlmConfig,
    /// Whether a fatal GPU failure still tries CPU-only
    pub fatal_error_policy: FatalErrorPolicy,
    /// Silence llama.cpp's own logging
    pub quiet_native_logs: bool,
    /// `tracing` filter used when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            fatal_error_policy: FatalErrorPolicy::default(),
            quiet_native_logs: true,
            log_filter: "localm_engine=info".to_string(),
        }
    }
}

/// Get the settings file path
pub fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from the default location
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> EngineSettings {
    match get_settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            tracing::warn!("Failed to locate settings, using defaults: {}", e);
            EngineSettings::default()
        }
    }
}

/// Load settings from `path`, falling back to defaults
pub fn load_settings_from(path: &Path) -> EngineSettings {
    match read_settings(path) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            EngineSettings::default()
        }
    }
}

fn read_settings(path: &Path) -> Result<EngineSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(EngineSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let settings: EngineSettings = serde_json::from_str(&json)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to the default location
pub fn save_settings(settings: &EngineSettings) -> Result<(), StorageError> {
    save_settings_to(settings, &get_settings_path()?)
}

/// Save settings to `path`, creating its parent directory if needed
pub fn save_settings_to(settings: &EngineSettings, path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}

//! Settings storage
//!
//! Manages persistence of engine configuration.

use crate::storage::{get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Which device the engine may select at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// Use an accelerator when one is available, else the CPU
    #[default]
    Auto,
    /// Always run on the CPU
    Cpu,
}

/// Engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Directory where model files (.gguf) are stored
    pub models_directory: PathBuf,
    /// Device selection policy
    pub device: DevicePreference,
    /// Number of layers to offload when running on an accelerator
    pub gpu_layers: u32,
    /// Context window used for a forward pass
    pub context_size: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            models_directory: get_data_dir()
                .ok()
                .map(|d| d.join("models"))
                .unwrap_or_else(|| PathBuf::from("./models")),
            device: DevicePreference::Auto,
            gpu_layers: 99, // Offload all layers by default
            context_size: 4096,
        }
    }
}

impl EngineSettings {
    /// Clamp values into usable ranges
    pub fn validate(&mut self) {
        if self.context_size == 0 {
            self.context_size = 4096;
        }
        // llama.cpp rejects contexts smaller than one batch
        self.context_size = self.context_size.max(512);
    }
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from the default location
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> EngineSettings {
    let loaded = get_settings_path().and_then(|path| load_settings_from(&path));
    match loaded {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            EngineSettings::default()
        }
    }
}

/// Load settings from a specific file
pub fn load_settings_from(path: &Path) -> Result<EngineSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(EngineSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: EngineSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to the default location
pub fn save_settings(settings: &EngineSettings) -> Result<(), StorageError> {
    save_settings_to(settings, &get_settings_path()?)
}

/// Save settings to a specific file
pub fn save_settings_to(settings: &EngineSettings, path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = EngineSettings::default();
        assert_eq!(settings.device, DevicePreference::Auto);
        assert_eq!(settings.gpu_layers, 99);
        assert_eq!(settings.context_size, 4096);
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = EngineSettings::default();

        settings.context_size = 0;
        settings.validate();
        assert_eq!(settings.context_size, 4096);

        settings.context_size = 16;
        settings.validate();
        assert_eq!(settings.context_size, 512);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let json = r#"{ "device": "cpu" }"#;
        let settings: EngineSettings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.device, DevicePreference::Cpu);
        assert_eq!(settings.gpu_layers, 99);
    }

    #[test]
    fn test_settings_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = EngineSettings::default();
        settings.device = DevicePreference::Cpu;
        settings.models_directory = dir.path().join("models");
        save_settings_to(&settings, &path).unwrap();

        let loaded = load_settings_from(&path).unwrap();
        assert_eq!(loaded.device, DevicePreference::Cpu);
        assert_eq!(loaded.models_directory, settings.models_directory);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let loaded = load_settings_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(loaded.context_size, 4096);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            load_settings_from(&path),
            Err(StorageError::JsonError(_))
        ));
    }
}

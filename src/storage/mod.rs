//! Persistent storage
//!
//! Engine settings and the local GGUF model directory.

use std::path::PathBuf;
use thiserror::Error;

pub mod gguf;
pub mod models;
pub mod settings;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Invalid model file {}: {source}", .path.display())]
    InvalidModel {
        path: PathBuf,
        #[source]
        source: gguf::ModelError,
    },
}

/// Get the application data directory
///
/// Returns the platform-specific application data directory:
/// - Windows: `C:\Users\{user}\AppData\Roaming\Shardline\Shardline`
/// - macOS: `/Users/{user}/Library/Application Support/com.Shardline.Shardline`
/// - Linux: `/home/{user}/.local/share/shardline`
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("com", "Shardline", "Shardline")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| StorageError::DataDirError("Could not determine data directory".to_string()))
}

/// Initialize the storage directory structure
///
/// Creates `{data_dir}/models/`; `settings.json` is written by the settings module.
pub fn init_storage() -> Result<PathBuf, StorageError> {
    let data_dir = get_data_dir()?;

    let models_dir = data_dir.join("models");
    std::fs::create_dir_all(&models_dir)?;

    tracing::info!("Initialized storage at: {}", data_dir.display());

    Ok(data_dir)
}

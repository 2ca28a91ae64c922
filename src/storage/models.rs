//! Local model files
//!
//! Maps model identifiers to GGUF files in the models directory.

use crate::storage::gguf::{validate_gguf, GgufMetadata};
use crate::storage::StorageError;
use std::fs;
use std::path::{Path, PathBuf};

/// A GGUF model file found on disk
#[derive(Debug, Clone)]
pub struct ModelFile {
    /// Full path to the model file
    pub path: PathBuf,
    /// File name without the `.gguf` extension
    pub model_id: String,
    /// File size in bytes
    pub size_bytes: u64,
}

impl ModelFile {
    fn from_path(path: PathBuf) -> Result<Self, std::io::Error> {
        let metadata = fs::metadata(&path)?;
        let model_id = path
            .file_stem()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        Ok(Self {
            path,
            model_id,
            size_bytes: metadata.len(),
        })
    }
}

fn is_gguf(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("gguf"))
        .unwrap_or(false)
}

/// Scan a directory for GGUF model files, sorted by model id
pub fn scan_models_directory(directory: &Path) -> Result<Vec<ModelFile>, StorageError> {
    if !directory.is_dir() {
        tracing::warn!("Models directory does not exist: {}", directory.display());
        return Ok(vec![]);
    }

    let mut models = vec![];

    for entry in fs::read_dir(directory)? {
        let path = entry?.path();
        if !path.is_file() || !is_gguf(&path) {
            continue;
        }
        match ModelFile::from_path(path.clone()) {
            Ok(model) => {
                tracing::debug!("Found model: {}", model.model_id);
                models.push(model);
            }
            Err(e) => {
                tracing::warn!("Failed to read model file {:?}: {}", path, e);
            }
        }
    }

    models.sort_by(|a, b| a.model_id.cmp(&b.model_id));
    Ok(models)
}

/// Resolve a model id to a validated GGUF file.
///
/// Model ids may carry an organisation prefix (`org/name`); only the last
/// path component is matched against file names. Returns `Ok(None)` when no
/// file matches.
pub fn resolve_model(
    directory: &Path,
    model_id: &str,
) -> Result<Option<(ModelFile, GgufMetadata)>, StorageError> {
    let name = model_id.rsplit('/').next().unwrap_or(model_id);

    let found = scan_models_directory(directory)?
        .into_iter()
        .find(|m| m.model_id.eq_ignore_ascii_case(name));

    let Some(model) = found else {
        return Ok(None);
    };

    let metadata = validate_gguf(&model.path).map_err(|source| StorageError::InvalidModel {
        path: model.path.clone(),
        source,
    })?;

    Ok(Some((model, metadata)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::gguf::{write_test_header, GGUF_MAGIC};
    use std::fs::File;
    use tempfile::TempDir;

    fn write_model(dir: &Path, name: &str) {
        let mut file = File::create(dir.join(name)).unwrap();
        write_test_header(&mut file, GGUF_MAGIC, 3);
    }

    #[test]
    fn test_scan_models_directory() {
        let temp_dir = TempDir::new().unwrap();
        write_model(temp_dir.path(), "model2.gguf");
        write_model(temp_dir.path(), "model1.gguf");
        File::create(temp_dir.path().join("not_a_model.txt")).unwrap();

        let models = scan_models_directory(temp_dir.path()).unwrap();

        assert_eq!(models.len(), 2);
        assert_eq!(models[0].model_id, "model1");
        assert_eq!(models[1].model_id, "model2");
        assert_eq!(models[0].size_bytes, 24);
    }

    #[test]
    fn test_scan_nonexistent_directory() {
        let models = scan_models_directory(Path::new("/this/path/does/not/exist")).unwrap();
        assert!(models.is_empty());
    }

    #[test]
    fn test_resolve_strips_org_prefix() {
        let temp_dir = TempDir::new().unwrap();
        write_model(temp_dir.path(), "SmolLM2-135M.gguf");

        let (model, metadata) = resolve_model(temp_dir.path(), "HuggingFaceTB/SmolLM2-135M")
            .unwrap()
            .unwrap();
        assert_eq!(model.model_id, "SmolLM2-135M");
        assert_eq!(metadata.version, 3);
    }

    #[test]
    fn test_resolve_missing_model() {
        let temp_dir = TempDir::new().unwrap();
        assert!(resolve_model(temp_dir.path(), "absent").unwrap().is_none());
    }

    #[test]
    fn test_resolve_rejects_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut file = File::create(temp_dir.path().join("broken.gguf")).unwrap();
        write_test_header(&mut file, 0xDEADBEEF, 3);

        assert!(matches!(
            resolve_model(temp_dir.path(), "broken"),
            Err(StorageError::InvalidModel { .. })
        ));
    }
}

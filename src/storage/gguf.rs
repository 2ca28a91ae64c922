//! GGUF header validation
//!
//! Cheap checks run before a model file is handed to the execution backend.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x46554747;

/// Size of the fixed header: magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
const HEADER_LEN: u64 = 24;

/// Errors that can occur while validating a model file
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("Invalid GGUF file: magic bytes mismatch (expected 0x{:08X}, got 0x{:08X})", GGUF_MAGIC, .0)]
    InvalidMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),

    #[error("File too small to be valid GGUF")]
    FileTooSmall,
}

/// Metadata extracted from a GGUF file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GgufMetadata {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

fn read_u32(file: &mut File) -> Result<u32, ModelError> {
    let mut buf = [0u8; 4];
    file.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(file: &mut File) -> Result<u64, ModelError> {
    let mut buf = [0u8; 8];
    file.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Validates that a file is a GGUF v2/v3 model and extracts its header.
pub fn validate_gguf<P: AsRef<Path>>(path: P) -> Result<GgufMetadata, ModelError> {
    let mut file = File::open(path)?;

    let file_size = file.seek(SeekFrom::End(0))?;
    if file_size < HEADER_LEN {
        return Err(ModelError::FileTooSmall);
    }
    file.seek(SeekFrom::Start(0))?;

    let magic = read_u32(&mut file)?;
    if magic != GGUF_MAGIC {
        return Err(ModelError::InvalidMagic(magic));
    }

    let version = read_u32(&mut file)?;
    if !(2..=3).contains(&version) {
        return Err(ModelError::UnsupportedVersion(version));
    }

    Ok(GgufMetadata {
        version,
        tensor_count: read_u64(&mut file)?,
        metadata_kv_count: read_u64(&mut file)?,
    })
}

#[cfg(test)]
pub(crate) fn write_test_header(file: &mut impl std::io::Write, magic: u32, version: u32) {
    file.write_all(&magic.to_le_bytes()).unwrap();
    file.write_all(&version.to_le_bytes()).unwrap();
    file.write_all(&10u64.to_le_bytes()).unwrap();
    file.write_all(&5u64.to_le_bytes()).unwrap();
    file.flush().unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_validate_gguf_valid() {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        write_test_header(&mut file, GGUF_MAGIC, 3);

        let metadata = validate_gguf(file.path()).unwrap();
        assert_eq!(metadata.version, 3);
        assert_eq!(metadata.tensor_count, 10);
        assert_eq!(metadata.metadata_kv_count, 5);
    }

    #[test]
    fn test_validate_gguf_invalid_magic() {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        write_test_header(&mut file, 0xDEADBEEF, 3);

        let result = validate_gguf(file.path());
        assert!(matches!(result, Err(ModelError::InvalidMagic(0xDEADBEEF))));
    }

    #[test]
    fn test_validate_gguf_unsupported_version() {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        write_test_header(&mut file, GGUF_MAGIC, 1);

        let result = validate_gguf(file.path());
        assert!(matches!(result, Err(ModelError::UnsupportedVersion(1))));
    }

    #[test]
    fn test_validate_gguf_file_too_small() {
        let mut file = tempfile::Builder::new().suffix(".gguf").tempfile().unwrap();
        file.write_all(&GGUF_MAGIC.to_le_bytes()).unwrap();
        file.flush().unwrap();

        let result = validate_gguf(file.path());
        assert!(matches!(result, Err(ModelError::FileTooSmall)));
    }
}

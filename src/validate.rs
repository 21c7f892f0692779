//! Integrity checks for staged archives.
//!
//! A file is accepted when it is non-empty, matches the expected size and
//! SHA-256 digest when the manifest supplies them, and (for archives) opens as
//! a ZIP with at least one entry whose CRC-32 verifies when read in full.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, instrument, warn};
use zip::ZipArchive;

use crate::manifest::{FileDescriptor, FileKind};

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Why a staged file was rejected.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("file not found: {path}")]
    Missing { path: PathBuf },

    #[error("file is empty")]
    Empty,

    #[error("size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("sha256 mismatch: expected {expected}, computed {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("not a readable zip archive: {0}")]
    NotAnArchive(#[source] zip::result::ZipError),

    #[error("archive has no entries")]
    NoEntries,

    #[error("corrupt entry '{entry}': {reason}")]
    CorruptEntry { entry: String, reason: String },

    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("validation task failed: {0}")]
    Task(String),
}

/// Verdict for one staged file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub file: String,
    pub is_valid: bool,
    pub reason_if_invalid: Option<String>,
}

impl ValidationResult {
    fn from_check(file: &str, check: Result<(), ValidationError>) -> Self {
        match check {
            Ok(()) => Self {
                file: file.to_string(),
                is_valid: true,
                reason_if_invalid: None,
            },
            Err(error) => Self {
                file: file.to_string(),
                is_valid: false,
                reason_if_invalid: Some(error.to_string()),
            },
        }
    }
}

/// Stateless validator; archive reads run on the blocking pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntegrityValidator;

impl IntegrityValidator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Validates the staged copy of `file`.
    #[instrument(skip(self, file), fields(file = %file.logical_name))]
    pub async fn validate(&self, file: &FileDescriptor) -> ValidationResult {
        let descriptor = file.clone();
        let check = tokio::task::spawn_blocking(move || check_file(&descriptor))
            .await
            .unwrap_or_else(|e| Err(ValidationError::Task(e.to_string())));

        let result = ValidationResult::from_check(&file.logical_name, check);
        match &result.reason_if_invalid {
            None => debug!("file is valid"),
            Some(reason) => warn!(reason = %reason, "file failed validation"),
        }
        result
    }
}

/// Runs every applicable check against the staged file.
///
/// # Errors
///
/// Returns the first failed check.
pub fn check_file(file: &FileDescriptor) -> Result<(), ValidationError> {
    let path = &file.destination_path;
    let metadata = std::fs::metadata(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            ValidationError::Missing { path: path.clone() }
        } else {
            ValidationError::Io {
                path: path.clone(),
                source,
            }
        }
    })?;

    let actual = metadata.len();
    if actual == 0 {
        return Err(ValidationError::Empty);
    }
    if let Some(expected) = file.expected_size.filter(|expected| *expected != actual) {
        return Err(ValidationError::SizeMismatch { expected, actual });
    }
    if let Some(expected) = &file.expected_sha256 {
        let actual = sha256_hex(path)?;
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(ValidationError::ChecksumMismatch {
                expected: expected.clone(),
                actual,
            });
        }
    }
    if file.expected_kind == FileKind::Archive {
        check_archive(path)?;
    }
    Ok(())
}

fn check_archive(path: &Path) -> Result<(), ValidationError> {
    let file = File::open(path).map_err(|source| ValidationError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut archive =
        ZipArchive::new(BufReader::new(file)).map_err(ValidationError::NotAnArchive)?;
    if archive.is_empty() {
        return Err(ValidationError::NoEntries);
    }

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| ValidationError::CorruptEntry {
                entry: format!("#{index}"),
                reason: e.to_string(),
            })?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        // The zip reader checks the CRC-32 once the entry is read to the end.
        io::copy(&mut entry, &mut io::sink()).map_err(|e| ValidationError::CorruptEntry {
            entry: name,
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

fn sha256_hex(path: &Path) -> Result<String, ValidationError> {
    let io_error = |source| ValidationError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(io_error)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let read = file.read(&mut buffer).map_err(io_error)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use crate::test_support::fixtures::write_zip;
    use tempfile::TempDir;

    fn descriptor(dir: &Path, name: &str) -> FileDescriptor {
        FileDescriptor::new(name, format!("http://localhost/{name}"), dir)
    }

    #[tokio::test]
    async fn test_valid_archive_passes() {
        let dir = TempDir::new().unwrap();
        let file = descriptor(dir.path(), "Cnaes.zip");
        write_zip(&file.destination_path, &[("F.K03200$Z.D50809.CNAECSV", b"\"1\";\"x\"\n")]);

        let result = IntegrityValidator::new().validate(&file).await;
        assert!(result.is_valid, "{result:?}");
        assert_eq!(result.file, "Cnaes.zip");
    }

    #[test]
    fn test_missing_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let file = descriptor(dir.path(), "Cnaes.zip");
        assert!(matches!(
            check_file(&file),
            Err(ValidationError::Missing { .. })
        ));
    }

    #[test]
    fn test_empty_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let file = descriptor(dir.path(), "Cnaes.zip");
        std::fs::write(&file.destination_path, b"").unwrap();
        assert!(matches!(check_file(&file), Err(ValidationError::Empty)));
    }

    #[test]
    fn test_truncated_archive_is_rejected() {
        let dir = TempDir::new().unwrap();
        let file = descriptor(dir.path(), "Paises.zip");
        write_zip(&file.destination_path, &[("PAISCSV", &[b'a'; 4096])]);
        let bytes = std::fs::read(&file.destination_path).unwrap();
        std::fs::write(&file.destination_path, &bytes[..bytes.len() / 2]).unwrap();

        assert!(matches!(
            check_file(&file),
            Err(ValidationError::NotAnArchive(_))
        ));
    }

    #[test]
    fn test_garbage_is_not_an_archive() {
        let dir = TempDir::new().unwrap();
        let file = descriptor(dir.path(), "Motivos.zip");
        std::fs::write(&file.destination_path, b"<html>error page</html>").unwrap();
        assert!(matches!(
            check_file(&file),
            Err(ValidationError::NotAnArchive(_))
        ));
    }

    #[test]
    fn test_empty_archive_is_rejected() {
        let dir = TempDir::new().unwrap();
        let file = descriptor(dir.path(), "Naturezas.zip");
        write_zip(&file.destination_path, &[]);
        assert!(matches!(check_file(&file), Err(ValidationError::NoEntries)));
    }

    #[test]
    fn test_expected_size_mismatch_is_rejected() {
        let dir = TempDir::new().unwrap();
        let file = descriptor(dir.path(), "Cnaes.zip").with_expected_size(1);
        write_zip(&file.destination_path, &[("CNAECSV", b"x")]);
        assert!(matches!(
            check_file(&file),
            Err(ValidationError::SizeMismatch { expected: 1, .. })
        ));
    }

    #[test]
    fn test_sha256_is_checked_when_known() {
        let dir = TempDir::new().unwrap();
        let file = descriptor(dir.path(), "data.csv");
        std::fs::write(&file.destination_path, b"abc").unwrap();

        let good = file.clone().with_expected_sha256(
            "BA7816BF8F01CFEA414140DE5DAE2223B00361A396177A9CB410FF61F20015AD",
        );
        assert!(check_file(&good).is_ok());

        let bad = file.with_expected_sha256("00");
        assert!(matches!(
            check_file(&bad),
            Err(ValidationError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_corrupted_entry_fails_crc() {
        let dir = TempDir::new().unwrap();
        let file = descriptor(dir.path(), "Simples.zip");
        // Stored (uncompressed) entry so a flipped byte reaches the CRC check
        // instead of breaking the deflate stream.
        let archive = std::fs::File::create(&file.destination_path).unwrap();
        let mut writer = zip::ZipWriter::new(archive);
        writer
            .start_file(
                "SIMPLES.CSV",
                zip::write::SimpleFileOptions::default()
                    .compression_method(zip::CompressionMethod::Stored),
            )
            .unwrap();
        std::io::Write::write_all(&mut writer, b"PAYLOAD-PAYLOAD-PAYLOAD").unwrap();
        writer.finish().unwrap();

        let mut bytes = std::fs::read(&file.destination_path).unwrap();
        let at = bytes
            .windows(7)
            .position(|w| w == b"PAYLOAD")
            .unwrap();
        bytes[at] = b'X';
        std::fs::write(&file.destination_path, &bytes).unwrap();

        let result = check_file(&file);
        assert!(
            matches!(result, Err(ValidationError::CorruptEntry { .. })),
            "{result:?}"
        );
    }
}

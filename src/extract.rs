//! Archive extraction into the working directory.
//!
//! Every file entry of a validated archive is written to
//! `working_path/<last path component>` and matched to a destination table by
//! the marker in its name. Using only the last component means an entry can
//! never be written outside the working directory.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use zip::ZipArchive;
use zip::result::ZipError;

use crate::load::classify_entry;
use crate::manifest::{FileDescriptor, FileKind};

/// `ENOSPC` on Linux and macOS.
const ENOSPC: i32 = 28;

/// Extraction errors. All are per archive except [`ExtractionError::DiskSpaceExhausted`].
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("corrupt archive {archive}: {reason}")]
    CorruptArchive { archive: String, reason: String },

    #[error("unsupported format in {archive}: {reason}")]
    UnsupportedFormat { archive: String, reason: String },

    #[error("IO error extracting {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The working directory's disk is full; remaining extractions would fail too.
    #[error("disk space exhausted while writing {path}")]
    DiskSpaceExhausted { path: PathBuf },

    #[error("extraction task failed: {0}")]
    Task(String),
}

impl ExtractionError {
    fn io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::StorageFull || source.raw_os_error() == Some(ENOSPC) {
            Self::DiskSpaceExhausted {
                path: path.to_path_buf(),
            }
        } else {
            Self::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }

    fn from_zip(archive: &str, error: ZipError) -> Self {
        match error {
            ZipError::Io(source) => Self::io(Path::new(archive), source),
            ZipError::UnsupportedArchive(reason) => Self::UnsupportedFormat {
                archive: archive.to_string(),
                reason: reason.to_string(),
            },
            other => Self::CorruptArchive {
                archive: archive.to_string(),
                reason: other.to_string(),
            },
        }
    }

    /// True when the whole extraction queue must stop.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DiskSpaceExhausted { .. })
    }
}

/// One extracted file ready to load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedEntry {
    pub source_archive: String,
    pub table_name: String,
    pub local_path: PathBuf,
}

impl ExtractedEntry {
    /// Checkpoint name of this entry's load, `table/file`.
    #[must_use]
    pub fn load_key_name(&self) -> String {
        let file = self
            .local_path
            .file_name()
            .map_or_else(|| self.local_path.display().to_string(), |n| n.to_string_lossy().into_owned());
        format!("{}/{file}", self.table_name)
    }
}

/// Result of extracting one archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionOutcome {
    pub entries: Vec<ExtractedEntry>,
    /// Entry names that matched no table; not written to disk.
    pub unmatched: Vec<String>,
}

/// Extracts archives into a working directory.
#[derive(Debug, Clone)]
pub struct Extractor {
    working_path: PathBuf,
}

impl Extractor {
    #[must_use]
    pub fn new(working_path: &Path) -> Self {
        Self {
            working_path: working_path.to_path_buf(),
        }
    }

    /// Extracts one staged archive on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractionError`] when the archive cannot be read or an
    /// entry cannot be written.
    #[instrument(skip(self, file), fields(file = %file.logical_name))]
    pub async fn extract(&self, file: &FileDescriptor) -> Result<ExtractionOutcome, ExtractionError> {
        let descriptor = file.clone();
        let working_path = self.working_path.clone();
        let outcome = tokio::task::spawn_blocking(move || extract_file(&descriptor, &working_path))
            .await
            .map_err(|e| ExtractionError::Task(e.to_string()))??;

        for name in &outcome.unmatched {
            warn!(entry = %name, "entry matches no table, skipped");
        }
        info!(entries = outcome.entries.len(), "archive extracted");
        Ok(outcome)
    }
}

/// Synchronous extraction of one staged file into `working_path`.
///
/// # Errors
///
/// See [`Extractor::extract`].
pub fn extract_file(
    file: &FileDescriptor,
    working_path: &Path,
) -> Result<ExtractionOutcome, ExtractionError> {
    std::fs::create_dir_all(working_path).map_err(|e| ExtractionError::io(working_path, e))?;

    if file.expected_kind == FileKind::Data {
        return copy_data_file(file, working_path);
    }

    let archive_name = file.logical_name.as_str();
    let handle = File::open(&file.destination_path)
        .map_err(|e| ExtractionError::io(&file.destination_path, e))?;
    let mut archive = ZipArchive::new(BufReader::new(handle))
        .map_err(|e| ExtractionError::from_zip(archive_name, e))?;

    let mut outcome = ExtractionOutcome::default();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| ExtractionError::from_zip(archive_name, e))?;
        if entry.is_dir() {
            continue;
        }

        let entry_name = entry.name().to_string();
        let Some(file_name) = last_component(&entry_name) else {
            continue;
        };
        let Some(spec) = classify_entry(file_name) else {
            outcome.unmatched.push(entry_name);
            continue;
        };

        let target = working_path.join(file_name);
        let output = File::create(&target).map_err(|e| ExtractionError::io(&target, e))?;
        let mut writer = BufWriter::new(output);
        io::copy(&mut entry, &mut writer).map_err(|e| {
            // Write failures surface as `StorageFull`; read failures are a
            // corrupt archive.
            if e.kind() == io::ErrorKind::StorageFull || e.raw_os_error() == Some(ENOSPC) {
                ExtractionError::io(&target, e)
            } else {
                ExtractionError::CorruptArchive {
                    archive: archive_name.to_string(),
                    reason: format!("{entry_name}: {e}"),
                }
            }
        })?;
        writer.flush().map_err(|e| ExtractionError::io(&target, e))?;

        debug!(entry = %entry_name, table = spec.name, "entry extracted");
        outcome.entries.push(ExtractedEntry {
            source_archive: archive_name.to_string(),
            table_name: spec.name.to_string(),
            local_path: target,
        });
    }
    Ok(outcome)
}

fn copy_data_file(
    file: &FileDescriptor,
    working_path: &Path,
) -> Result<ExtractionOutcome, ExtractionError> {
    let Some(spec) = classify_entry(&file.logical_name) else {
        return Ok(ExtractionOutcome {
            entries: Vec::new(),
            unmatched: vec![file.logical_name.clone()],
        });
    };
    let target = working_path.join(&file.logical_name);
    std::fs::copy(&file.destination_path, &target).map_err(|e| ExtractionError::io(&target, e))?;
    Ok(ExtractionOutcome {
        entries: vec![ExtractedEntry {
            source_archive: file.logical_name.clone(),
            table_name: spec.name.to_string(),
            local_path: target,
        }],
        unmatched: Vec::new(),
    })
}

fn last_component(entry_name: &str) -> Option<&str> {
    entry_name
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use crate::test_support::fixtures::write_zip;
    use tempfile::TempDir;

    fn staged(dir: &Path, name: &str, entries: &[(&str, &[u8])]) -> FileDescriptor {
        let file = FileDescriptor::new(name, format!("http://localhost/{name}"), dir);
        write_zip(&file.destination_path, entries);
        file
    }

    #[tokio::test]
    async fn test_extracts_and_classifies_entries() {
        let staging = TempDir::new().unwrap();
        let working = TempDir::new().unwrap();
        let file = staged(
            staging.path(),
            "Empresas0.zip",
            &[
                ("K3241.K03200Y0.D50809.EMPRECSV", b"\"1\";\"A\"\n"),
                ("LEIAME.txt", b"docs"),
            ],
        );

        let outcome = Extractor::new(working.path()).extract(&file).await.unwrap();

        assert_eq!(outcome.entries.len(), 1);
        let entry = &outcome.entries[0];
        assert_eq!(entry.table_name, "empresa");
        assert_eq!(entry.source_archive, "Empresas0.zip");
        assert_eq!(
            std::fs::read(&entry.local_path).unwrap(),
            b"\"1\";\"A\"\n"
        );
        assert_eq!(outcome.unmatched, ["LEIAME.txt"]);
        assert!(!working.path().join("LEIAME.txt").exists());
    }

    #[test]
    fn test_nested_paths_are_flattened_into_working_dir() {
        let staging = TempDir::new().unwrap();
        let working = TempDir::new().unwrap();
        let file = staged(
            staging.path(),
            "Paises.zip",
            &[("../../escape/F.K03200$Z.D50809.PAISCSV", b"\"105\";\"BRASIL\"\n")],
        );

        let outcome = extract_file(&file, working.path()).unwrap();

        assert_eq!(
            outcome.entries[0].local_path,
            working.path().join("F.K03200$Z.D50809.PAISCSV")
        );
        assert!(outcome.entries[0].local_path.exists());
    }

    #[test]
    fn test_corrupt_archive_is_per_file_error() {
        let staging = TempDir::new().unwrap();
        let working = TempDir::new().unwrap();
        let file = FileDescriptor::new("Cnaes.zip", "http://localhost/Cnaes.zip", staging.path());
        std::fs::write(&file.destination_path, b"not a zip").unwrap();

        let err = extract_file(&file, working.path()).unwrap_err();
        assert!(matches!(err, ExtractionError::CorruptArchive { .. }), "{err:?}");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_disk_full_is_fatal() {
        let err = ExtractionError::io(
            Path::new("/work/x"),
            io::Error::from(io::ErrorKind::StorageFull),
        );
        assert!(err.is_fatal());
        let err = ExtractionError::io(Path::new("/work/x"), io::Error::from_raw_os_error(28));
        assert!(matches!(err, ExtractionError::DiskSpaceExhausted { .. }));
    }

    #[test]
    fn test_entry_round_trips_through_json() {
        let entry = ExtractedEntry {
            source_archive: "Socios0.zip".into(),
            table_name: "socios".into(),
            local_path: PathBuf::from("/work/K3241.K03200Y0.D50809.SOCIOCSV"),
        };
        let json = serde_json::to_string(&[entry.clone()]).unwrap();
        let back: Vec<ExtractedEntry> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, [entry.clone()]);
        assert_eq!(entry.load_key_name(), "socios/K3241.K03200Y0.D50809.SOCIOCSV");
    }
}

//! End-of-run summary and process exit mapping.

use std::fmt;
use std::time::Duration;

use crate::download::DownloadReport;
use crate::load::{TableLoadReport, TableLoadState};
use crate::manifest::{FileDescriptor, FileStatus};

/// A file dropped from later stages, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub logical_name: String,
    pub reason: String,
}

impl FileFailure {
    #[must_use]
    pub fn new(logical_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            logical_name: logical_name.into(),
            reason: reason.into(),
        }
    }
}

/// How the binary should exit after a run that did not fail fatally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Everything in the manifest is loaded.
    Success,
    /// Some files were excluded or failed, or a table is partially loaded.
    Partial,
    /// A table load failed.
    Failure,
}

impl ProcessExit {
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::Partial => 2,
        }
    }
}

/// Aggregated typed results of every stage of one run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub period: String,
    /// Archives listed by the manifest.
    pub manifest_files: usize,
    pub downloads: DownloadReport,
    /// Files accepted by the integrity validator (this run or earlier).
    pub validated: Vec<String>,
    /// Files that failed validation twice.
    pub excluded: Vec<FileFailure>,
    pub extraction_failures: Vec<FileFailure>,
    /// Archives whose every extracted entry is loaded.
    pub loaded_files: Vec<String>,
    pub tables: Vec<TableLoadReport>,
    /// Manifest files with the furthest status each reached.
    pub files: Vec<FileDescriptor>,
    pub interrupted: bool,
    pub duration: Duration,
}

impl RunSummary {
    #[must_use]
    pub fn new(period: impl Into<String>) -> Self {
        Self {
            period: period.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn rows_inserted(&self) -> u64 {
        self.tables.iter().map(|t| t.rows_inserted).sum()
    }

    #[must_use]
    pub fn malformed_records(&self) -> u64 {
        self.tables.iter().map(|t| t.malformed_records).sum()
    }

    #[must_use]
    pub fn file_status(&self, logical_name: &str) -> Option<FileStatus> {
        self.files
            .iter()
            .find(|f| f.logical_name == logical_name)
            .map(|f| f.status)
    }

    #[must_use]
    pub fn table(&self, name: &str) -> Option<&TableLoadReport> {
        self.tables.iter().find(|t| t.table == name)
    }

    /// Tables left `in_progress`.
    #[must_use]
    pub fn partial_tables(&self) -> Vec<&'static str> {
        self.tables
            .iter()
            .filter(|t| t.state == TableLoadState::Partial)
            .map(|t| t.table)
            .collect()
    }

    #[must_use]
    pub fn failed_tables(&self) -> Vec<&'static str> {
        self.tables
            .iter()
            .filter(|t| matches!(t.state, TableLoadState::Failed { .. }))
            .map(|t| t.table)
            .collect()
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.interrupted
            && self.downloads.failed() == 0
            && self.downloads.interrupted() == 0
            && self.excluded.is_empty()
            && self.extraction_failures.is_empty()
            && self.tables.iter().all(|t| {
                matches!(
                    t.state,
                    TableLoadState::Loaded | TableLoadState::AlreadyLoaded
                )
            })
    }

    #[must_use]
    pub fn exit(&self) -> ProcessExit {
        if !self.failed_tables().is_empty() {
            ProcessExit::Failure
        } else if self.is_complete() {
            ProcessExit::Success
        } else {
            ProcessExit::Partial
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Period {}: {} archives in manifest", self.period, self.manifest_files)?;
        writeln!(
            f,
            "  downloads: {} downloaded, {} skipped, {} failed, {} not started, {} retries",
            self.downloads.downloaded(),
            self.downloads.skipped(),
            self.downloads.failed(),
            self.downloads.interrupted(),
            self.downloads.retried
        )?;
        for failed in self.downloads.failures() {
            writeln!(f, "    failed: {} ({})", failed.logical_name, failed.error)?;
        }
        writeln!(
            f,
            "  files: {} validated, {} loaded, {} excluded",
            self.validated.len(),
            self.loaded_files.len(),
            self.excluded.len()
        )?;
        for excluded in &self.excluded {
            writeln!(f, "    excluded: {} ({})", excluded.logical_name, excluded.reason)?;
        }
        for failure in &self.extraction_failures {
            writeln!(
                f,
                "    extraction failed: {} ({})",
                failure.logical_name, failure.reason
            )?;
        }
        if !self.files.is_empty() {
            let counts: Vec<String> = FileStatus::ALL
                .iter()
                .filter_map(|status| {
                    let n = self.files.iter().filter(|f| f.status == *status).count();
                    (n > 0).then(|| format!("{n} {}", status.as_str()))
                })
                .collect();
            writeln!(f, "  file status: {}", counts.join(", "))?;
        }

        if !self.tables.is_empty() {
            writeln!(f, "  tables:")?;
        }
        for table in &self.tables {
            write!(
                f,
                "    {:<16} {:<15} files={} rows={} malformed={} indexed={} {:.1}s",
                table.table,
                table.state.as_str(),
                table.files_loaded + table.files_skipped,
                table.rows_inserted,
                table.malformed_records,
                if table.indexed { "yes" } else { "no" },
                table.duration.as_secs_f64()
            )?;
            if let TableLoadState::Failed { reason } = &table.state {
                write!(f, " ({reason})")?;
            }
            writeln!(f)?;
        }

        if self.interrupted {
            writeln!(f, "  run interrupted; re-run to resume")?;
        }
        write!(
            f,
            "  total: {} rows, {} malformed records skipped, {:.1}s",
            self.rows_inserted(),
            self.malformed_records(),
            self.duration.as_secs_f64()
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::download::{DownloadOutcome, FileDownload};

    fn table(name: &'static str, state: TableLoadState, rows: u64) -> TableLoadReport {
        TableLoadReport {
            table: name,
            state,
            files_loaded: 1,
            files_skipped: 0,
            rows_inserted: rows,
            malformed_records: 0,
            indexed: false,
            reset: true,
            duration: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_complete_run_exits_successfully() {
        let mut summary = RunSummary::new("2025-08");
        summary.tables.push(table("pais", TableLoadState::Loaded, 3));
        summary.tables.push(table("cnae", TableLoadState::AlreadyLoaded, 0));

        assert!(summary.is_complete());
        assert_eq!(summary.exit(), ProcessExit::Success);
        assert_eq!(summary.rows_inserted(), 3);
    }

    #[test]
    fn test_excluded_file_makes_run_partial() {
        let mut summary = RunSummary::new("2025-08");
        summary.excluded.push(FileFailure::new("Simples.zip", "archive has no entries"));
        summary.tables.push(table("pais", TableLoadState::Loaded, 3));

        assert_eq!(summary.exit(), ProcessExit::Partial);
        assert_eq!(summary.exit().code(), 2);
        let text = summary.to_string();
        assert!(text.contains("excluded: Simples.zip (archive has no entries)"), "{text}");
    }

    #[test]
    fn test_failed_download_is_listed() {
        let mut summary = RunSummary::new("2025-08");
        summary.downloads.files.push(FileDownload {
            logical_name: "Empresas0.zip".into(),
            outcome: DownloadOutcome::Failed {
                error: "HTTP 404".into(),
                attempts: 1,
            },
        });

        assert_eq!(summary.exit(), ProcessExit::Partial);
        assert!(summary.to_string().contains("failed: Empresas0.zip (HTTP 404)"));
    }

    #[test]
    fn test_interrupted_downloads_are_counted() {
        let mut summary = RunSummary::new("2025-08");
        for name in ["Socios0.zip", "Socios1.zip"] {
            summary.downloads.files.push(FileDownload {
                logical_name: name.into(),
                outcome: DownloadOutcome::Interrupted,
            });
        }
        summary.interrupted = true;

        let text = summary.to_string();
        assert!(text.contains("0 failed, 2 not started"), "{text}");
        assert!(text.contains("run interrupted"), "{text}");
        assert_eq!(summary.exit(), ProcessExit::Partial);
    }

    #[test]
    fn test_file_statuses_are_counted() {
        let mut summary = RunSummary::new("2025-08");
        let staging = std::path::Path::new("/staging");
        let mut paises = FileDescriptor::new("Paises.zip", "http://x/Paises.zip", staging);
        paises.status = FileStatus::Loaded;
        let mut cnaes = FileDescriptor::new("Cnaes.zip", "http://x/Cnaes.zip", staging);
        cnaes.status = FileStatus::Excluded;
        summary.files = vec![paises, cnaes];

        assert_eq!(summary.file_status("Cnaes.zip"), Some(FileStatus::Excluded));
        assert_eq!(summary.file_status("Motivos.zip"), None);
        assert!(summary.to_string().contains("file status: 1 loaded, 1 excluded"));
    }

    #[test]
    fn test_failed_table_is_failure() {
        let mut summary = RunSummary::new("2025-08");
        summary.tables.push(table(
            "empresa",
            TableLoadState::Failed {
                reason: "disk I/O error".into(),
            },
            10,
        ));
        summary.tables.push(table("socios", TableLoadState::Partial, 1));

        assert_eq!(summary.exit(), ProcessExit::Failure);
        assert_eq!(summary.failed_tables(), ["empresa"]);
        assert_eq!(summary.partial_tables(), ["socios"]);
        assert!(summary.to_string().contains("(disk I/O error)"));
    }
}

//! Resolved, immutable pipeline configuration.
//!
//! The binary assembles a [`PipelineConfig`] from CLI flags, environment and
//! `.env`; every component receives it (or the values it needs) at
//! construction and never consults ambient state.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Receita Federal open data root. The period index lives at `{root}/{YYYY-MM}/`.
pub const DEFAULT_BASE_URL: &str =
    "https://arquivos.receitafederal.gov.br/dados/cnpj/dados_abertos_cnpj";

/// Recommended number of concurrent downloads.
pub const DEFAULT_DOWNLOAD_WORKERS: usize = 5;

/// Upper bound of concurrent downloads; the publisher throttles beyond this.
pub const MAX_DOWNLOAD_WORKERS: usize = 10;

/// Per-attempt download timeout (30 minutes; establishment archives exceed 1 GB).
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 1800;

/// TCP connect timeout for every request.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Fraction of failed downloads above which the run is aborted.
pub const DEFAULT_FAILURE_THRESHOLD: f64 = 0.5;

/// Rows per bulk insert batch.
pub const DEFAULT_BATCH_MAX_ROWS: usize = 4096;

/// Approximate decoded bytes per bulk insert batch.
pub const DEFAULT_BATCH_MAX_BYTES: usize = 16 * 1024 * 1024;

const MIN_BATCH_MAX_BYTES: usize = 1024;
const MAX_TIMEOUT_SECS: u64 = 86_400;
const MAX_RETRY_ATTEMPTS: u32 = 20;

/// Configuration errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    /// The period string or components are invalid.
    #[error("invalid period '{value}': expected YYYY-MM with year 2000..=2100 and month 1..=12")]
    InvalidPeriod {
        /// Rejected input.
        value: String,
    },

    /// A numeric option is outside its accepted range.
    #[error("invalid value for `{field}`: {value}. Expected range: {expected}")]
    OutOfRange {
        /// Option name.
        field: &'static str,
        /// Rejected value, formatted.
        value: String,
        /// Human-readable accepted range.
        expected: &'static str,
    },

    /// A required path option is empty.
    #[error("`{field}` must not be empty")]
    EmptyPath {
        /// Option name.
        field: &'static str,
    },
}

/// One published data release, identified by year and month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Period {
    year: u16,
    month: u8,
}

impl Period {
    /// Creates a period after range-checking both components.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPeriod`] when the year is outside
    /// 2000..=2100 or the month outside 1..=12.
    pub fn new(year: u16, month: u8) -> Result<Self, ConfigError> {
        if !(2000..=2100).contains(&year) || !(1..=12).contains(&month) {
            return Err(ConfigError::InvalidPeriod {
                value: format!("{year:04}-{month:02}"),
            });
        }
        Ok(Self { year, month })
    }

    #[must_use]
    pub fn year(&self) -> u16 {
        self.year
    }

    #[must_use]
    pub fn month(&self) -> u8 {
        self.month
    }

    /// Key used in URLs and checkpoint rows, `YYYY-MM`.
    #[must_use]
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidPeriod {
            value: s.to_string(),
        };
        let (year, month) = s.trim().split_once('-').ok_or_else(invalid)?;
        let year = year.parse::<u16>().map_err(|_| invalid())?;
        let month = month.parse::<u8>().map_err(|_| invalid())?;
        Self::new(year, month).map_err(|_| invalid())
    }
}

/// Fully resolved settings for one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Release to process.
    pub period: Period,
    /// Root URL of the published releases.
    pub base_url: String,
    /// Concurrent download workers (1..=10).
    pub download_workers: usize,
    /// Bound on a single download attempt.
    pub download_timeout: Duration,
    /// Bound on establishing a connection.
    pub connect_timeout: Duration,
    /// Total attempts per file, including the first.
    pub max_retry_attempts: u32,
    /// Failed/total download ratio that aborts the run (0..=1).
    pub failure_threshold_fraction: f64,
    /// Directory for raw downloaded archives.
    pub staging_path: PathBuf,
    /// Directory for extracted, not-yet-loaded files.
    pub working_path: PathBuf,
    /// SQLite file receiving the destination tables.
    pub database_path: PathBuf,
    /// SQLite file holding checkpoints.
    pub checkpoint_path: PathBuf,
    /// Maximum rows per bulk insert.
    pub batch_max_rows: usize,
    /// Maximum approximate decoded bytes per bulk insert.
    pub batch_max_bytes: usize,
}

impl PipelineConfig {
    /// Creates a configuration with defaults for everything but the period and
    /// the two working directories.
    ///
    /// The database and checkpoint files default to `cnpj.db` and
    /// `checkpoints.db` inside the staging directory.
    #[must_use]
    pub fn new(period: Period, staging_path: &Path, working_path: &Path) -> Self {
        Self {
            period,
            base_url: DEFAULT_BASE_URL.to_string(),
            download_workers: DEFAULT_DOWNLOAD_WORKERS,
            download_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            max_retry_attempts: crate::download::DEFAULT_MAX_RETRIES,
            failure_threshold_fraction: DEFAULT_FAILURE_THRESHOLD,
            staging_path: staging_path.to_path_buf(),
            working_path: working_path.to_path_buf(),
            database_path: staging_path.join("cnpj.db"),
            checkpoint_path: staging_path.join("checkpoints.db"),
            batch_max_rows: DEFAULT_BATCH_MAX_ROWS,
            batch_max_bytes: DEFAULT_BATCH_MAX_BYTES,
        }
    }

    /// Validates option ranges.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_DOWNLOAD_WORKERS).contains(&self.download_workers) {
            return Err(ConfigError::OutOfRange {
                field: "download_workers",
                value: self.download_workers.to_string(),
                expected: "1..=10",
            });
        }
        validate_timeout("download_timeout_seconds", self.download_timeout)?;
        validate_timeout("connect_timeout_seconds", self.connect_timeout)?;
        if !(1..=MAX_RETRY_ATTEMPTS).contains(&self.max_retry_attempts) {
            return Err(ConfigError::OutOfRange {
                field: "max_retry_attempts",
                value: self.max_retry_attempts.to_string(),
                expected: "1..=20",
            });
        }
        if !(0.0..=1.0).contains(&self.failure_threshold_fraction) {
            return Err(ConfigError::OutOfRange {
                field: "failure_threshold_fraction",
                value: self.failure_threshold_fraction.to_string(),
                expected: "0.0..=1.0",
            });
        }
        if self.batch_max_rows == 0 {
            return Err(ConfigError::OutOfRange {
                field: "batch_max_rows",
                value: "0".to_string(),
                expected: ">= 1",
            });
        }
        if self.batch_max_bytes < MIN_BATCH_MAX_BYTES {
            return Err(ConfigError::OutOfRange {
                field: "batch_max_bytes",
                value: self.batch_max_bytes.to_string(),
                expected: ">= 1024",
            });
        }
        for (field, path) in [
            ("staging_path", &self.staging_path),
            ("working_path", &self.working_path),
            ("database_path", &self.database_path),
            ("checkpoint_path", &self.checkpoint_path),
        ] {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::EmptyPath { field });
            }
        }
        Ok(())
    }
}

fn validate_timeout(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    let secs = value.as_secs();
    if !(1..=MAX_TIMEOUT_SECS).contains(&secs) {
        return Err(ConfigError::OutOfRange {
            field,
            value: secs.to_string(),
            expected: "1..=86400",
        });
    }
    Ok(())
}

//! CLI argument definitions using clap derive macros.
//!
//! Every option can also come from the environment (or a `.env` file loaded
//! before parsing).

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use cnpj_etl_core::config::{
    DEFAULT_BASE_URL, DEFAULT_BATCH_MAX_BYTES, DEFAULT_BATCH_MAX_ROWS,
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_DOWNLOAD_TIMEOUT_SECS, DEFAULT_DOWNLOAD_WORKERS,
    DEFAULT_FAILURE_THRESHOLD,
};
use cnpj_etl_core::{DEFAULT_MAX_RETRIES, Period, PipelineConfig, Stage};

const DEFAULT_STAGING_PATH: &str = "data/staging";
const DEFAULT_WORKING_PATH: &str = "data/extracted";

/// Download, validate, extract and load the Receita Federal CNPJ release.
#[derive(Parser, Debug)]
#[command(name = "cnpj-etl")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Read environment variables from this file instead of `./.env`
    #[arg(long, value_name = "PATH", global = true)]
    pub env_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run (or resume) the pipeline for a period
    Run(RunArgs),
    /// Show checkpoint state for a period
    Status(StatusArgs),
    /// Clear checkpoints for a period so its work is redone
    Reset(ResetArgs),
}

/// Period and storage locations shared by every subcommand.
#[derive(clap::Args, Debug)]
pub struct Location {
    /// Release period, YYYY-MM
    #[arg(short, long, env = "CNPJ_PERIOD")]
    pub period: Period,

    /// Directory for downloaded archives [env: OUTPUT_FILES_PATH] [default: data/staging]
    #[arg(long, env = "CNPJ_STAGING_PATH")]
    pub staging_path: Option<PathBuf>,

    /// Directory for extracted files [env: EXTRACTED_FILES_PATH] [default: data/extracted]
    #[arg(long, env = "CNPJ_WORKING_PATH")]
    pub working_path: Option<PathBuf>,

    /// Destination SQLite database [default: <staging>/cnpj.db]
    #[arg(long, env = "CNPJ_DATABASE_PATH")]
    pub database_path: Option<PathBuf>,

    /// Checkpoint SQLite database [default: <staging>/checkpoints.db]
    #[arg(long, env = "CNPJ_CHECKPOINT_PATH")]
    pub checkpoint_path: Option<PathBuf>,
}

impl Location {
    fn staging(&self) -> PathBuf {
        path_or_alias(self.staging_path.as_ref(), "OUTPUT_FILES_PATH", DEFAULT_STAGING_PATH)
    }

    fn working(&self) -> PathBuf {
        path_or_alias(self.working_path.as_ref(), "EXTRACTED_FILES_PATH", DEFAULT_WORKING_PATH)
    }

    /// Base configuration with defaults for every tuning option.
    #[must_use]
    pub fn config(&self) -> PipelineConfig {
        let mut config = PipelineConfig::new(self.period, &self.staging(), &self.working());
        if let Some(path) = &self.database_path {
            config.database_path.clone_from(path);
        }
        if let Some(path) = &self.checkpoint_path {
            config.checkpoint_path.clone_from(path);
        }
        config
    }
}

fn path_or_alias(explicit: Option<&PathBuf>, alias: &str, default: &str) -> PathBuf {
    explicit
        .cloned()
        .or_else(|| {
            std::env::var_os(alias)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        })
        .unwrap_or_else(|| PathBuf::from(default))
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub location: Location,

    /// Base URL of the published releases
    #[arg(long, env = "CNPJ_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub base_url: String,

    /// Concurrent downloads (1-10)
    #[arg(short = 'w', long, env = "CNPJ_DOWNLOAD_WORKERS", default_value_t = DEFAULT_DOWNLOAD_WORKERS as u8, value_parser = clap::value_parser!(u8).range(1..=10))]
    pub download_workers: u8,

    /// Timeout of one download attempt in seconds
    #[arg(long, env = "CNPJ_DOWNLOAD_TIMEOUT_SECONDS", default_value_t = DEFAULT_DOWNLOAD_TIMEOUT_SECS, value_parser = clap::value_parser!(u64).range(1..=86_400))]
    pub download_timeout_seconds: u64,

    /// Connect timeout of HTTP requests in seconds
    #[arg(long, env = "CNPJ_CONNECT_TIMEOUT_SECONDS", default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS, value_parser = clap::value_parser!(u64).range(1..=86_400))]
    pub connect_timeout_seconds: u64,

    /// Total attempts per file for transient failures (1-20)
    #[arg(short = 'r', long, env = "CNPJ_MAX_RETRY_ATTEMPTS", default_value_t = DEFAULT_MAX_RETRIES, value_parser = clap::value_parser!(u32).range(1..=20))]
    pub max_retry_attempts: u32,

    /// Abort before loading when more than this fraction of downloads fail
    #[arg(long, env = "CNPJ_FAILURE_THRESHOLD", default_value_t = DEFAULT_FAILURE_THRESHOLD)]
    pub failure_threshold: f64,

    /// Maximum rows per insert batch
    #[arg(long, env = "CNPJ_BATCH_MAX_ROWS", default_value_t = DEFAULT_BATCH_MAX_ROWS)]
    pub batch_max_rows: usize,

    /// Maximum approximate bytes per insert batch
    #[arg(long, env = "CNPJ_BATCH_MAX_BYTES", default_value_t = DEFAULT_BATCH_MAX_BYTES)]
    pub batch_max_bytes: usize,
}

impl RunArgs {
    /// Resolved pipeline configuration. Ranges are checked by
    /// [`PipelineConfig::validate`] when the run starts.
    #[must_use]
    pub fn config(&self) -> PipelineConfig {
        let mut config = self.location.config();
        config.base_url.clone_from(&self.base_url);
        config.download_workers = usize::from(self.download_workers);
        config.download_timeout = Duration::from_secs(self.download_timeout_seconds);
        config.connect_timeout = Duration::from_secs(self.connect_timeout_seconds);
        config.max_retry_attempts = self.max_retry_attempts;
        config.failure_threshold_fraction = self.failure_threshold;
        config.batch_max_rows = self.batch_max_rows;
        config.batch_max_bytes = self.batch_max_bytes;
        config
    }
}

#[derive(clap::Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub location: Location,

    /// Only show this stage (download, validate, extract, load_entry, load)
    #[arg(long)]
    pub stage: Option<Stage>,
}

#[derive(clap::Args, Debug)]
pub struct ResetArgs {
    #[command(flatten)]
    pub location: Location,

    /// Only clear this stage (download, validate, extract, load_entry, load)
    #[arg(long)]
    pub stage: Option<Stage>,
}

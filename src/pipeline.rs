//! Run orchestration: manifest → download → validate → extract → load.
//!
//! Every stage transition goes through the [`CheckpointStore`], which is the
//! only state a later run relies on. A file enters a stage only once its
//! previous stage is `done`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::checkpoint::{CheckpointError, CheckpointKey, CheckpointStatus, CheckpointStore, Stage};
use crate::config::{ConfigError, PipelineConfig};
use crate::db::{Database, DbError};
use crate::download::{
    Clock, DownloadManager, DownloadOutcome, EngineError, FailedDownload, HttpClient,
    RetryPolicy, check_failure_threshold,
};
use crate::events::{EventOutcome, EventSink, PipelineEvent, TracingSink};
use crate::extract::{ExtractedEntry, ExtractionError, Extractor};
use crate::load::{
    LoadError, LoadStage, SqliteStorage, Storage, TABLES, TableLoadReport, TableLoadState,
};
use crate::manifest::{FileDescriptor, FileStatus, ManifestError, ManifestResolver};
use crate::summary::{FileFailure, RunSummary};
use crate::validate::IntegrityValidator;

/// Errors that stop a run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Download stage failure, including `TooManyDownloadFailures`.
    #[error(transparent)]
    Download(#[from] EngineError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Database(#[from] DbError),

    /// Disk full while extracting; the remaining queue was abandoned.
    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    /// Load state could not be inspected before extraction.
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("cannot create directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    fn directory(path: &Path, source: std::io::Error) -> Self {
        Self::Directory {
            path: path.to_path_buf(),
            source,
        }
    }

    /// True for the download failure threshold error.
    #[must_use]
    pub fn is_too_many_download_failures(&self) -> bool {
        matches!(
            self,
            Self::Download(EngineError::TooManyDownloadFailures { .. })
        )
    }

    /// Files behind a [`EngineError::TooManyDownloadFailures`]; empty for
    /// every other error.
    #[must_use]
    pub fn failed_downloads(&self) -> &[FailedDownload] {
        match self {
            Self::Download(EngineError::TooManyDownloadFailures { failed, .. }) => failed,
            _ => &[],
        }
    }
}

/// One configured pipeline run.
#[derive(Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    client: HttpClient,
    store: CheckpointStore,
    storage: Arc<dyn Storage>,
    sink: Arc<dyn EventSink>,
    policy: Option<RetryPolicy>,
    clock: Option<Arc<dyn Clock>>,
    interrupt: Arc<AtomicBool>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("period", &self.config.period)
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    #[must_use]
    pub fn new(config: PipelineConfig, store: CheckpointStore, storage: Arc<dyn Storage>) -> Self {
        let client = HttpClient::new(config.connect_timeout);
        Self {
            config,
            client,
            store,
            storage,
            sink: Arc::new(TracingSink),
            policy: None,
            clock: None,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Opens the checkpoint and destination databases named by the config.
    /// When both paths are the same file, one pool is shared.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Database`] if a database cannot be opened.
    pub async fn open(config: PipelineConfig) -> Result<Self, PipelineError> {
        let checkpoints = Database::new(&config.checkpoint_path).await?;
        let destination = if config.database_path == config.checkpoint_path {
            checkpoints.clone()
        } else {
            Database::new(&config.database_path).await?
        };
        let store = CheckpointStore::new(checkpoints);
        Ok(Self::new(config, store, Arc::new(SqliteStorage::new(destination))))
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn with_interrupt_flag(mut self, interrupt: Arc<AtomicBool>) -> Self {
        self.interrupt = interrupt;
        self
    }

    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.store
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    fn key(&self, stage: Stage, name: &str) -> CheckpointKey {
        CheckpointKey::new(self.config.period.key(), stage, name)
    }

    fn emit(&self, stage: Stage, name: &str, outcome: EventOutcome, detail: Option<String>) {
        let event = PipelineEvent::new(stage, name, outcome);
        self.sink.emit(match detail {
            Some(detail) => event.with_detail(detail),
            None => event,
        });
    }

    fn download_manager(&self) -> DownloadManager {
        let mut manager = DownloadManager::new(&self.config, self.client.clone(), self.store.clone())
            .with_event_sink(Arc::clone(&self.sink))
            .with_interrupt_flag(Arc::clone(&self.interrupt));
        if let Some(policy) = &self.policy {
            manager = manager.with_retry_policy(policy.clone());
        }
        if let Some(clock) = &self.clock {
            manager = manager.with_clock(Arc::clone(clock));
        }
        manager
    }

    /// Runs every stage for the configured period.
    ///
    /// Per-file failures are collected into the returned [`RunSummary`].
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] for run-level failures: invalid config, an
    /// unavailable manifest, too many failed downloads (nothing is loaded),
    /// a full disk during extraction, or checkpoint store failures.
    #[instrument(skip(self), fields(period = %self.config.period))]
    pub async fn run(&self) -> Result<RunSummary, PipelineError> {
        let started = Instant::now();
        self.config.validate()?;
        for dir in [&self.config.staging_path, &self.config.working_path] {
            std::fs::create_dir_all(dir).map_err(|e| PipelineError::directory(dir, e))?;
        }

        let mut summary = RunSummary::new(self.config.period.key());

        let resolver = ManifestResolver::new(
            self.client.clone(),
            self.config.base_url.clone(),
            &self.config.staging_path,
        );
        let mut files = resolver.resolve(self.config.period).await?;
        summary.manifest_files = files.len();

        let manager = self.download_manager();
        let downloads = manager.run(&files).await?;
        check_failure_threshold(&downloads, self.config.failure_threshold_fraction)?;

        let available: Vec<&FileDescriptor> = files
            .iter()
            .filter(|f| {
                downloads
                    .outcome(&f.logical_name)
                    .is_some_and(DownloadOutcome::is_available)
            })
            .collect();
        summary.downloads = downloads;

        let validated = self
            .validate_stage(&manager, &available, &mut summary)
            .await?;
        let extracted = self.extract_stage(&validated, &mut summary).await?;
        self.load_stage(&files, &extracted, &mut summary).await?;

        settle_file_statuses(&mut files, &summary, &extracted);
        summary.files = files;
        summary.interrupted = self.interrupted();
        summary.duration = started.elapsed();
        info!(
            rows = summary.rows_inserted(),
            excluded = summary.excluded.len(),
            elapsed_ms = summary.duration.as_millis(),
            "run finished"
        );
        Ok(summary)
    }

    /// Validates downloaded files; a failing file gets one re-download.
    async fn validate_stage<'a>(
        &self,
        manager: &DownloadManager,
        files: &[&'a FileDescriptor],
        summary: &mut RunSummary,
    ) -> Result<Vec<&'a FileDescriptor>, PipelineError> {
        let validator = IntegrityValidator::new();
        let mut accepted = Vec::with_capacity(files.len());

        for &file in files {
            if self.interrupted() {
                break;
            }
            let key = self.key(Stage::Validate, &file.logical_name);
            if self.store.is_done(&key).await? {
                self.emit(Stage::Validate, &file.logical_name, EventOutcome::Skipped, None);
                summary.validated.push(file.logical_name.clone());
                accepted.push(file);
                continue;
            }

            self.store.mark_in_progress(&key).await?;
            let mut result = validator.validate(file).await;
            if !result.is_valid {
                let reason = result.reason_if_invalid.clone().unwrap_or_default();
                self.reject_download(file, &reason).await?;
                self.emit(
                    Stage::Validate,
                    &file.logical_name,
                    EventOutcome::Retrying,
                    Some(reason),
                );

                let outcome = manager.download_one(file.clone()).await;
                if outcome == DownloadOutcome::Interrupted {
                    info!(file = %file.logical_name, "interrupted before the re-download");
                    break;
                }
                result = if outcome.is_available() {
                    validator.validate(file).await
                } else {
                    let reason = match outcome {
                        DownloadOutcome::Failed { error, .. } => error,
                        other => format!("re-download did not complete: {other:?}"),
                    };
                    crate::validate::ValidationResult {
                        file: file.logical_name.clone(),
                        is_valid: false,
                        reason_if_invalid: Some(reason),
                    }
                };
            }

            if result.is_valid {
                self.store.mark_done(&key, None).await?;
                self.emit(Stage::Validate, &file.logical_name, EventOutcome::Succeeded, None);
                summary.validated.push(file.logical_name.clone());
                accepted.push(file);
            } else {
                let reason = result.reason_if_invalid.unwrap_or_default();
                self.reject_download(file, &reason).await?;
                self.store.mark_failed(&key, &reason).await?;
                warn!(file = %file.logical_name, reason = %reason, "file excluded");
                self.emit(
                    Stage::Validate,
                    &file.logical_name,
                    EventOutcome::Excluded,
                    Some(reason.clone()),
                );
                summary
                    .excluded
                    .push(FileFailure::new(&file.logical_name, reason));
            }
        }
        Ok(accepted)
    }

    /// Deletes a staged file and demotes its download so it is fetched again.
    async fn reject_download(&self, file: &FileDescriptor, reason: &str) -> Result<(), PipelineError> {
        remove_if_exists(&file.destination_path);
        remove_if_exists(&crate::download::partial_path(&file.destination_path));
        self.store
            .reset(
                &self.key(Stage::Download, &file.logical_name),
                CheckpointStatus::Failed,
                Some(reason),
            )
            .await?;
        Ok(())
    }

    /// Extracts validated archives. Returns the entries of every archive whose
    /// extract checkpoint is `done`, by archive name.
    async fn extract_stage(
        &self,
        files: &[&FileDescriptor],
        summary: &mut RunSummary,
    ) -> Result<BTreeMap<String, Vec<ExtractedEntry>>, PipelineError> {
        let extractor = Extractor::new(&self.config.working_path);
        let loader = self.load_stage_runner();
        let mut extracted = BTreeMap::new();

        for &file in files {
            if self.interrupted() {
                break;
            }
            let key = self.key(Stage::Extract, &file.logical_name);

            let previous = self.store.get(&key).await?;
            if let Some(record) = previous.filter(|r| r.status == CheckpointStatus::Done) {
                let entries = parse_entries(&key, record.detail.as_deref())?;
                if self.entries_still_usable(&loader, &entries).await? {
                    self.emit(Stage::Extract, &file.logical_name, EventOutcome::Skipped, None);
                    extracted.insert(file.logical_name.clone(), entries);
                    continue;
                }
                if !file.destination_path.exists() {
                    let reason = "extracted files and staged archive are missing".to_string();
                    self.store
                        .reset(&key, CheckpointStatus::Failed, Some(&reason))
                        .await?;
                    self.reject_download(file, &reason).await?;
                    self.store
                        .reset(
                            &self.key(Stage::Validate, &file.logical_name),
                            CheckpointStatus::Pending,
                            None,
                        )
                        .await?;
                    self.emit(
                        Stage::Extract,
                        &file.logical_name,
                        EventOutcome::Failed,
                        Some(reason.clone()),
                    );
                    summary
                        .extraction_failures
                        .push(FileFailure::new(&file.logical_name, reason));
                    continue;
                }
                info!(file = %file.logical_name, "extracted files missing, extracting again");
                self.store
                    .reset(&key, CheckpointStatus::InProgress, None)
                    .await?;
            }

            self.store.mark_in_progress(&key).await?;
            match extractor.extract(file).await {
                Ok(outcome) => {
                    let detail = serde_json::to_string(&outcome.entries).map_err(|e| {
                        CheckpointError::InvalidDetail {
                            key: key.to_string(),
                            message: e.to_string(),
                        }
                    })?;
                    self.store.mark_done(&key, Some(&detail)).await?;
                    self.emit(
                        Stage::Extract,
                        &file.logical_name,
                        EventOutcome::Succeeded,
                        Some(format!("{} entries", outcome.entries.len())),
                    );
                    extracted.insert(file.logical_name.clone(), outcome.entries);
                }
                Err(error) => {
                    self.store.mark_failed(&key, &error.to_string()).await?;
                    self.emit(
                        Stage::Extract,
                        &file.logical_name,
                        EventOutcome::Failed,
                        Some(error.to_string()),
                    );
                    if error.is_fatal() {
                        return Err(error.into());
                    }
                    summary
                        .extraction_failures
                        .push(FileFailure::new(&file.logical_name, error.to_string()));
                }
            }
        }
        Ok(extracted)
    }

    /// An archive must be extracted again when one of its entries is
    /// missing from the working directory and still needs loading. Every
    /// entry of a table about to be recreated needs loading, `done` or not.
    async fn entries_still_usable(
        &self,
        loader: &LoadStage,
        entries: &[ExtractedEntry],
    ) -> Result<bool, PipelineError> {
        for entry in entries {
            if entry.local_path.exists() {
                continue;
            }
            let Some(spec) = crate::load::table_spec(&entry.table_name) else {
                continue;
            };
            if loader.is_table_done(spec).await? {
                continue;
            }
            if !loader.needs_reset(spec).await? && loader.is_entry_done(entry).await? {
                continue;
            }
            return Ok(false);
        }
        Ok(true)
    }

    fn load_stage_runner(&self) -> LoadStage {
        LoadStage::new(&self.config, Arc::clone(&self.storage), self.store.clone())
            .with_event_sink(Arc::clone(&self.sink))
            .with_interrupt_flag(Arc::clone(&self.interrupt))
    }

    /// Loads tables in their fixed order. A failed table does not stop the
    /// others.
    async fn load_stage(
        &self,
        files: &[FileDescriptor],
        extracted: &BTreeMap<String, Vec<ExtractedEntry>>,
        summary: &mut RunSummary,
    ) -> Result<(), PipelineError> {
        let loader = self.load_stage_runner();

        for spec in &TABLES {
            if self.interrupted() {
                break;
            }
            let group_files: Vec<&FileDescriptor> =
                files.iter().filter(|f| f.dataset == spec.group).collect();
            let entries: Vec<ExtractedEntry> = extracted
                .values()
                .flatten()
                .filter(|e| e.table_name == spec.name)
                .cloned()
                .collect();
            let input_complete = group_files
                .iter()
                .all(|f| extracted.contains_key(&f.logical_name));

            if entries.is_empty() {
                if group_files.is_empty() {
                    continue;
                }
                let state = if loader.is_table_done(spec).await? {
                    TableLoadState::AlreadyLoaded
                } else {
                    TableLoadState::Partial
                };
                let mut report = TableLoadReport::new(spec.name);
                report.state = state;
                summary.tables.push(report);
                continue;
            }

            match loader.load_table(spec, &entries, input_complete).await {
                Ok(report) => summary.tables.push(report),
                Err(error) => {
                    warn!(table = spec.name, error = %error, "table load failed");
                    let mut report = TableLoadReport::new(spec.name);
                    report.state = TableLoadState::Failed {
                        reason: error.to_string(),
                    };
                    summary.tables.push(report);
                }
            }
        }

        summary.loaded_files = self.loaded_archives(&loader, extracted).await?;
        Ok(())
    }

    async fn loaded_archives(
        &self,
        loader: &LoadStage,
        extracted: &BTreeMap<String, Vec<ExtractedEntry>>,
    ) -> Result<Vec<String>, PipelineError> {
        let mut loaded = Vec::new();
        for (archive, entries) in extracted {
            if entries.is_empty() {
                continue;
            }
            let mut all_done = true;
            for entry in entries {
                if !loader.is_entry_done(entry).await? {
                    all_done = false;
                    break;
                }
            }
            if all_done {
                loaded.push(archive.clone());
            }
        }
        Ok(loaded)
    }
}

/// Folds each stage's result into the descriptors' status. Later stages
/// win, so a file ends with the furthest status it reached.
fn settle_file_statuses(
    files: &mut [FileDescriptor],
    summary: &RunSummary,
    extracted: &BTreeMap<String, Vec<ExtractedEntry>>,
) {
    let named = |list: &[FileFailure], name: &str| list.iter().any(|f| f.logical_name == name);
    for file in files {
        let name = file.logical_name.as_str();
        file.status = if summary.loaded_files.iter().any(|n| n == name) {
            FileStatus::Loaded
        } else if named(&summary.excluded, name) {
            FileStatus::Excluded
        } else if named(&summary.extraction_failures, name) {
            FileStatus::Failed
        } else if extracted.contains_key(name) {
            FileStatus::Extracted
        } else if summary.validated.iter().any(|n| n == name) {
            FileStatus::Validated
        } else {
            summary
                .downloads
                .outcome(name)
                .map_or(FileStatus::Pending, DownloadOutcome::file_status)
        };
    }
}

fn parse_entries(
    key: &CheckpointKey,
    detail: Option<&str>,
) -> Result<Vec<ExtractedEntry>, CheckpointError> {
    serde_json::from_str(detail.unwrap_or("[]")).map_err(|e| CheckpointError::InvalidDetail {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn remove_if_exists(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "could not remove file"),
    }
}

//! Concurrent download of a period's archives with retry and resume.
//!
//! The [`DownloadManager`] fetches every [`FileDescriptor`] into the staging
//! directory, at most `download_workers` at a time. Each file runs in its own
//! Tokio task behind a semaphore permit; failures stay inside their task and
//! end up in the [`DownloadReport`].
//!
//! # Retry Behavior
//!
//! - Every attempt is bounded by the per-attempt timeout; a timeout is transient
//! - Transient errors (timeouts, resets, 5xx, 408, size mismatch) are retried
//!   with exponential backoff; 429 waits at least the `Retry-After` delay
//! - Permanent errors (other 4xx, local IO) fail immediately
//! - A partial file left by a failed attempt is resumed by the next one
//!
//! # Cancellation
//!
//! Setting the interrupt flag stops new downloads from starting and stops
//! retries. Attempts already running finish. Interrupted files keep their
//! `in_progress` checkpoint and resume on the next run.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use super::clock::{Clock, TokioClock};
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_error, retry_after_delay};
use super::client::TransferProgress;
use super::{DownloadError, HttpClient, partial_path};
use crate::checkpoint::{CheckpointError, CheckpointKey, CheckpointStore, Stage};
use crate::config::PipelineConfig;
use crate::events::{EventOutcome, EventSink, PipelineEvent, TracingSink};
use crate::manifest::{FileDescriptor, FileStatus};

/// Error type for download stage operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The share of failed downloads exceeded the configured threshold.
    #[error(
        "too many download failures: {} of {total} failed (threshold {threshold:.2}): {}",
        .failed.len(),
        join_names(.failed)
    )]
    TooManyDownloadFailures {
        /// Every failed file with its last error.
        failed: Vec<FailedDownload>,
        /// Downloads attempted or skipped.
        total: usize,
        /// Configured fraction.
        threshold: f64,
    },

    /// Checkpoint read or write failed.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Semaphore was closed unexpectedly.
    #[error("semaphore closed unexpectedly")]
    SemaphoreClosed,
}

/// A file whose download failed, with its last error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedDownload {
    pub logical_name: String,
    pub error: String,
}

fn join_names(failed: &[FailedDownload]) -> String {
    failed
        .iter()
        .map(|f| f.logical_name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Fails when the report's share of failed files is strictly greater than
/// `threshold`.
///
/// # Errors
///
/// Returns [`EngineError::TooManyDownloadFailures`] past the threshold.
#[allow(clippy::cast_precision_loss)]
pub fn check_failure_threshold(report: &DownloadReport, threshold: f64) -> Result<(), EngineError> {
    let total = report.total();
    if total == 0 {
        return Ok(());
    }
    let fraction = report.failed() as f64 / total as f64;
    if fraction > threshold {
        return Err(EngineError::TooManyDownloadFailures {
            failed: report.failures(),
            total,
            threshold,
        });
    }
    Ok(())
}

/// Mutable state of one file while the manager works on it. Consumed into
/// a [`DownloadOutcome`] when the file reaches a terminal state.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub descriptor: FileDescriptor,
    /// Retries performed so far (attempts minus one).
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub bytes_downloaded: u64,
    pub partial_path: PathBuf,
}

impl DownloadTask {
    #[must_use]
    pub fn new(descriptor: FileDescriptor) -> Self {
        let partial_path = partial_path(&descriptor.destination_path);
        Self {
            descriptor,
            retry_count: 0,
            last_error: None,
            bytes_downloaded: 0,
            partial_path,
        }
    }

    /// Attempts made so far, the current one included.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.retry_count + 1
    }

    fn downloaded(self, resumed: bool) -> DownloadOutcome {
        DownloadOutcome::Downloaded {
            bytes: self.bytes_downloaded,
            resumed,
            attempts: self.attempts(),
        }
    }

    fn failed(self) -> DownloadOutcome {
        DownloadOutcome::Failed {
            attempts: self.attempts(),
            error: self.last_error.unwrap_or_default(),
        }
    }

    /// True when a partial file from an earlier attempt is on disk.
    fn has_partial(&self) -> bool {
        self.partial_path.exists()
    }
}

/// Terminal outcome of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Transferred in this run.
    Downloaded {
        bytes: u64,
        resumed: bool,
        attempts: u32,
    },
    /// Checkpoint already `done`; no network call was made.
    AlreadyDone,
    /// Local file matched the remote Content-Length; nothing transferred.
    UpToDate { bytes: u64 },
    /// Retries exhausted or permanent failure.
    Failed { error: String, attempts: u32 },
    /// Not started, or stopped between attempts, because of the interrupt flag.
    Interrupted,
}

impl DownloadOutcome {
    /// Status the file's descriptor takes after this outcome.
    #[must_use]
    pub fn file_status(&self) -> FileStatus {
        match self {
            Self::Downloaded { .. } | Self::AlreadyDone | Self::UpToDate { .. } => {
                FileStatus::Downloaded
            }
            Self::Failed { .. } => FileStatus::Failed,
            Self::Interrupted => FileStatus::Pending,
        }
    }

    /// True for outcomes that leave a usable file in staging.
    #[must_use]
    pub fn is_available(&self) -> bool {
        matches!(
            self,
            Self::Downloaded { .. } | Self::AlreadyDone | Self::UpToDate { .. }
        )
    }
}

/// Outcome of one file, by logical name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDownload {
    pub logical_name: String,
    pub outcome: DownloadOutcome,
}

/// Per-file outcomes of one download stage run, in manifest order.
#[derive(Debug, Clone, Default)]
pub struct DownloadReport {
    pub files: Vec<FileDownload>,
    /// Retry attempts made across all files.
    pub retried: usize,
}

impl DownloadReport {
    #[must_use]
    pub fn total(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn downloaded(&self) -> usize {
        self.count(|o| matches!(o, DownloadOutcome::Downloaded { .. }))
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(|o| {
            matches!(
                o,
                DownloadOutcome::AlreadyDone | DownloadOutcome::UpToDate { .. }
            )
        })
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, DownloadOutcome::Failed { .. }))
    }

    #[must_use]
    pub fn interrupted(&self) -> usize {
        self.count(|o| matches!(o, DownloadOutcome::Interrupted))
    }

    /// Failed files with their errors, in report order.
    #[must_use]
    pub fn failures(&self) -> Vec<FailedDownload> {
        self.files
            .iter()
            .filter_map(|f| match &f.outcome {
                DownloadOutcome::Failed { error, .. } => Some(FailedDownload {
                    logical_name: f.logical_name.clone(),
                    error: error.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    /// Outcome for a logical name.
    #[must_use]
    pub fn outcome(&self, logical_name: &str) -> Option<&DownloadOutcome> {
        self.files
            .iter()
            .find(|f| f.logical_name == logical_name)
            .map(|f| &f.outcome)
    }

    fn count(&self, predicate: impl Fn(&DownloadOutcome) -> bool) -> usize {
        self.files.iter().filter(|f| predicate(&f.outcome)).count()
    }
}

/// Concurrent downloader for a period's archives.
#[derive(Clone)]
pub struct DownloadManager {
    client: HttpClient,
    store: CheckpointStore,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    period: String,
    workers: usize,
    attempt_timeout: Duration,
    interrupt: Arc<AtomicBool>,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("period", &self.period)
            .field("workers", &self.workers)
            .field("attempt_timeout", &self.attempt_timeout)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl DownloadManager {
    /// Creates a manager from the run configuration. Retry policy, clock,
    /// event sink and interrupt flag take defaults and can be replaced.
    #[must_use]
    pub fn new(config: &PipelineConfig, client: HttpClient, store: CheckpointStore) -> Self {
        Self {
            client,
            store,
            policy: RetryPolicy::with_max_attempts(config.max_retry_attempts),
            clock: Arc::new(TokioClock),
            sink: Arc::new(TracingSink),
            period: config.period.key(),
            workers: config.download_workers.max(1),
            attempt_timeout: config.download_timeout,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
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

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Downloads every descriptor, `workers` at a time.
    ///
    /// Individual failures do not make this method fail; they are recorded in
    /// the checkpoint store and in the returned report.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::SemaphoreClosed`] if the semaphore is closed.
    #[instrument(skip(self, files), fields(period = %self.period, files = files.len()))]
    pub async fn run(&self, files: &[FileDescriptor]) -> Result<DownloadReport, EngineError> {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let retried = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::with_capacity(files.len());
        let mut not_started = Vec::new();

        info!(workers = self.workers, "starting downloads");

        for file in files {
            if self.interrupted() {
                not_started.push(file.logical_name.clone());
                continue;
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| EngineError::SemaphoreClosed)?;

            let manager = self.clone();
            let file = file.clone();
            let retried = Arc::clone(&retried);
            let name = file.logical_name.clone();

            handles.push((
                name,
                tokio::spawn(async move {
                    let _permit = permit;
                    manager.download_with_stats(file, &retried).await
                }),
            ));
        }

        let mut report = DownloadReport::default();
        for (logical_name, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(file = %logical_name, error = %e, "download task panicked");
                    DownloadOutcome::Failed {
                        error: format!("download task panicked: {e}"),
                        attempts: 0,
                    }
                }
            };
            report.files.push(FileDownload {
                logical_name,
                outcome,
            });
        }
        for logical_name in not_started {
            report.files.push(FileDownload {
                logical_name,
                outcome: DownloadOutcome::Interrupted,
            });
        }
        report.retried = retried.load(Ordering::SeqCst);

        info!(
            downloaded = report.downloaded(),
            skipped = report.skipped(),
            failed = report.failed(),
            interrupted = report.interrupted(),
            retried = report.retried,
            "downloads complete"
        );
        Ok(report)
    }

    /// Downloads one file with retries. Used for the single re-download of an
    /// archive that failed validation.
    pub async fn download_one(&self, file: FileDescriptor) -> DownloadOutcome {
        let retried = AtomicUsize::new(0);
        self.download_with_stats(file, &retried).await
    }

    async fn download_with_stats(
        &self,
        file: FileDescriptor,
        retried: &AtomicUsize,
    ) -> DownloadOutcome {
        let name = file.logical_name.clone();
        match self.download_file(file, retried).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(file = %name, error = %e, "checkpoint update failed during download");
                self.emit(&name, EventOutcome::Failed, Some(e.to_string()));
                DownloadOutcome::Failed {
                    error: e.to_string(),
                    attempts: 0,
                }
            }
        }
    }

    #[instrument(skip(self, file, retried), fields(file = %file.logical_name))]
    async fn download_file(
        &self,
        file: FileDescriptor,
        retried: &AtomicUsize,
    ) -> Result<DownloadOutcome, CheckpointError> {
        let key = CheckpointKey::new(&self.period, Stage::Download, &file.logical_name);

        if self.store.is_done(&key).await? {
            debug!("already downloaded");
            self.emit(&file.logical_name, EventOutcome::Skipped, None);
            return Ok(DownloadOutcome::AlreadyDone);
        }
        if self.interrupted() {
            return Ok(DownloadOutcome::Interrupted);
        }

        self.store.mark_in_progress(&key).await?;
        self.emit(&file.logical_name, EventOutcome::Started, None);

        if tokio::fs::try_exists(&file.destination_path)
            .await
            .unwrap_or(false)
        {
            match self
                .client
                .is_up_to_date(&file.remote_url, &file.destination_path)
                .await
            {
                Ok(true) => {
                    let bytes = tokio::fs::metadata(&file.destination_path)
                        .await
                        .map(|m| m.len())
                        .unwrap_or(0);
                    self.store
                        .mark_done(&key, Some(&format!("up to date ({bytes} bytes)")))
                        .await?;
                    self.emit(
                        &file.logical_name,
                        EventOutcome::Skipped,
                        Some("local file matches remote size".to_string()),
                    );
                    return Ok(DownloadOutcome::UpToDate { bytes });
                }
                Ok(false) => debug!("local file differs from remote, downloading"),
                Err(e) => debug!(error = %e, "up-to-date probe failed, downloading"),
            }
        }

        let mut task = DownloadTask::new(file);
        loop {
            debug!(attempt = task.attempts(), resuming = task.has_partial(), "attempting download");

            let name = task.descriptor.logical_name.clone();
            let on_progress = |progress: TransferProgress| {
                self.emit(
                    &name,
                    EventOutcome::Progress,
                    Some(format!(
                        "{}% ({} of {} bytes)",
                        progress.percent, progress.bytes, progress.total
                    )),
                );
            };
            let result = tokio::time::timeout(
                self.attempt_timeout,
                self.client.download_with_progress(
                    &task.descriptor.remote_url,
                    &task.descriptor.destination_path,
                    &on_progress,
                ),
            )
            .await
            .unwrap_or_else(|_| Err(DownloadError::timeout(&task.descriptor.remote_url)));

            let error = match result {
                Ok(transfer) => {
                    task.bytes_downloaded = transfer.bytes;
                    let detail = format!("{} bytes", transfer.bytes);
                    self.store.mark_done(&key, Some(&detail)).await?;
                    self.emit(&name, EventOutcome::Succeeded, Some(detail));
                    return Ok(task.downloaded(transfer.resumed));
                }
                Err(error) => error,
            };

            let failure_type = classify_error(&error);
            let decision = self.policy.should_retry(failure_type, task.attempts());
            task.last_error = Some(error.to_string());

            match decision {
                RetryDecision::Retry { delay, attempt: next } if !self.interrupted() => {
                    let delay = if failure_type == FailureType::RateLimited {
                        retry_after_delay(&error).map_or(delay, |server| server.max(delay))
                    } else {
                        delay
                    };
                    task.retry_count += 1;
                    retried.fetch_add(1, Ordering::SeqCst);
                    info!(
                        attempt = next,
                        max_attempts = self.policy.max_attempts(),
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "retrying download"
                    );
                    self.emit(&name, EventOutcome::Retrying, Some(error.to_string()));
                    self.clock.sleep(delay).await;
                }
                RetryDecision::Retry { .. } => {
                    info!(error = %error, "interrupted, leaving download in progress");
                    return Ok(DownloadOutcome::Interrupted);
                }
                RetryDecision::DoNotRetry { reason } => {
                    let message = format!("{error} ({reason})");
                    warn!(attempts = task.attempts(), error = %message, "download failed");
                    self.store.mark_failed(&key, &message).await?;
                    self.emit(&name, EventOutcome::Failed, Some(message.clone()));
                    task.last_error = Some(message);
                    return Ok(task.failed());
                }
            }
        }
    }

    fn emit(&self, file: &str, outcome: EventOutcome, detail: Option<String>) {
        let event = PipelineEvent::new(Stage::Download, file, outcome);
        self.sink.emit(match detail {
            Some(detail) => event.with_detail(detail),
            None => event,
        });
    }
}

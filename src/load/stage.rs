//! Transform/load of extracted files into destination tables.
//!
//! Tables are loaded one at a time. For each entry the file is streamed on
//! the blocking pool (csv reader, Latin-1 decode, typed conversion) and
//! batches are handed over a bounded channel to the async inserter, so at
//! most two batches are held in memory per table.
//!
//! Checkpoints make the load resumable:
//! - `load_entry` (`table/file`) is `done` once all of a file's rows are in
//! - `load` (`table`) is `done` once every archive of the table's group was
//!   loaded and the index exists
//!
//! A table seen for the first time is recreated empty. If a resumed table has
//! an entry left `in_progress` or `failed`, its rows may be half written, so
//! the table is recreated and every entry reloaded.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use super::batch::RowBatch;
use super::decode::convert_record;
use super::storage::{Storage, StorageError};
use super::table::TableSpec;
use crate::checkpoint::{
    CheckpointError, CheckpointKey, CheckpointRecord, CheckpointStatus, CheckpointStore, Stage,
};
use crate::config::PipelineConfig;
use crate::events::{EventOutcome, EventSink, PipelineEvent, ProgressMarks, TracingSink};
use crate::extract::ExtractedEntry;

/// Batches buffered between the reader thread and the inserter.
const CHANNEL_DEPTH: usize = 2;

/// A full batch and the reader's byte offset in the file after it.
type ReadBatch = (RowBatch, u64);

/// Load errors. Each is fatal for the table being loaded.
#[derive(Debug, Error)]
pub enum LoadError {
    /// The destination rejected a batch.
    #[error("load failed for table {table} at {file} record {record}: {source}")]
    LoadFailed {
        table: &'static str,
        file: PathBuf,
        /// First record (1-based) of the rejected batch.
        record: u64,
        #[source]
        source: StorageError,
    },

    /// The extracted file could not be read.
    #[error("failed to read {file}: {source}")]
    Read {
        file: PathBuf,
        #[source]
        source: csv::Error,
    },

    /// Table reset, index creation or row count failed.
    #[error("storage error on table {table}: {source}")]
    Storage {
        table: &'static str,
        #[source]
        source: StorageError,
    },

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("load task failed: {0}")]
    Task(String),
}

/// Final state of one table after a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableLoadState {
    /// All rows loaded and indexed in this run.
    Loaded,
    /// Already `done` in an earlier run.
    AlreadyLoaded,
    /// Some archives of the group were unavailable or the run was interrupted.
    Partial,
    /// Loading stopped on an error.
    Failed { reason: String },
}

impl TableLoadState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loaded => "loaded",
            Self::AlreadyLoaded => "already loaded",
            Self::Partial => "partial",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Statistics of one table load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLoadReport {
    pub table: &'static str,
    pub state: TableLoadState,
    /// Entries loaded in this run.
    pub files_loaded: usize,
    /// Entries already `done` from an earlier run.
    pub files_skipped: usize,
    pub rows_inserted: u64,
    pub malformed_records: u64,
    pub indexed: bool,
    /// Whether the table was recreated in this run.
    pub reset: bool,
    pub duration: Duration,
}

impl TableLoadReport {
    /// An empty report in the `Partial` state.
    #[must_use]
    pub fn new(table: &'static str) -> Self {
        Self {
            table,
            state: TableLoadState::Partial,
            files_loaded: 0,
            files_skipped: 0,
            rows_inserted: 0,
            malformed_records: 0,
            indexed: false,
            reset: false,
            duration: Duration::ZERO,
        }
    }
}

/// Counts for one streamed file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileLoadStats {
    pub records: u64,
    pub rows_inserted: u64,
    pub malformed: u64,
}

/// Loads extracted entries into [`Storage`].
#[derive(Clone)]
pub struct LoadStage {
    storage: Arc<dyn Storage>,
    store: CheckpointStore,
    sink: Arc<dyn EventSink>,
    period: String,
    batch_max_rows: usize,
    batch_max_bytes: usize,
    interrupt: Arc<AtomicBool>,
}

impl std::fmt::Debug for LoadStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadStage")
            .field("period", &self.period)
            .field("batch_max_rows", &self.batch_max_rows)
            .field("batch_max_bytes", &self.batch_max_bytes)
            .finish_non_exhaustive()
    }
}

impl LoadStage {
    #[must_use]
    pub fn new(config: &PipelineConfig, storage: Arc<dyn Storage>, store: CheckpointStore) -> Self {
        Self {
            storage,
            store,
            sink: Arc::new(TracingSink),
            period: config.period.key(),
            batch_max_rows: config.batch_max_rows,
            batch_max_bytes: config.batch_max_bytes,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
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

    fn table_key(&self, spec: &TableSpec) -> CheckpointKey {
        CheckpointKey::new(&self.period, Stage::Load, spec.name)
    }

    fn entry_key(&self, entry: &ExtractedEntry) -> CheckpointKey {
        CheckpointKey::new(&self.period, Stage::LoadEntry, entry.load_key_name())
    }

    /// True when the table's load checkpoint is `done`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if the read fails.
    pub async fn is_table_done(&self, spec: &TableSpec) -> Result<bool, CheckpointError> {
        self.store.is_done(&self.table_key(spec)).await
    }

    /// True when this entry's rows are already in the table.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if the read fails.
    pub async fn is_entry_done(&self, entry: &ExtractedEntry) -> Result<bool, CheckpointError> {
        self.store.is_done(&self.entry_key(entry)).await
    }

    /// Loads `entries` (all belonging to `spec`) in order.
    ///
    /// `input_complete` states that every archive of the table's group is
    /// among the entries' sources; only then can the table be marked `done`.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] when a batch is rejected, a file cannot be read,
    /// or storage/checkpoint operations fail. The table stays `in_progress`.
    #[instrument(skip(self, spec, entries), fields(table = spec.name, entries = entries.len()))]
    pub async fn load_table(
        &self,
        spec: &'static TableSpec,
        entries: &[ExtractedEntry],
        input_complete: bool,
    ) -> Result<TableLoadReport, LoadError> {
        let started = Instant::now();
        let mut report = TableLoadReport::new(spec.name);
        let table_key = self.table_key(spec);

        if self.store.is_done(&table_key).await? {
            debug!("table already loaded");
            self.emit(spec.name, EventOutcome::Skipped, None);
            report.state = TableLoadState::AlreadyLoaded;
            return Ok(report);
        }

        if self.needs_reset(spec).await? {
            warn!(table = spec.name, "recreating table, every entry is loaded again");
            self.reset_table(spec).await?;
            report.reset = true;
        }
        self.store.mark_in_progress(&table_key).await?;
        self.emit(spec.name, EventOutcome::Started, None);

        let mut interrupted = false;
        for entry in entries {
            if self.interrupt.load(Ordering::SeqCst) {
                info!("interrupted, leaving table partially loaded");
                interrupted = true;
                break;
            }

            let entry_key = self.entry_key(entry);
            if self.store.is_done(&entry_key).await? {
                report.files_skipped += 1;
                continue;
            }

            self.store.mark_in_progress(&entry_key).await?;
            match self.load_entry(spec, entry).await {
                Ok(stats) => {
                    let detail = format!(
                        "rows={} malformed={}",
                        stats.rows_inserted, stats.malformed
                    );
                    self.store.mark_done(&entry_key, Some(&detail)).await?;
                    self.emit(&entry.load_key_name(), EventOutcome::Succeeded, Some(detail));
                    report.files_loaded += 1;
                    report.rows_inserted += stats.rows_inserted;
                    report.malformed_records += stats.malformed;
                }
                Err(error) => {
                    self.store
                        .mark_failed(&entry_key, &error.to_string())
                        .await?;
                    self.emit(
                        &entry.load_key_name(),
                        EventOutcome::Failed,
                        Some(error.to_string()),
                    );
                    return Err(error);
                }
            }
        }

        if let Some(column) = spec.index_column {
            self.storage
                .create_index(spec.name, column)
                .await
                .map_err(|source| LoadError::Storage {
                    table: spec.name,
                    source,
                })?;
            report.indexed = true;
        }

        if input_complete && !interrupted {
            self.store.mark_done(&table_key, None).await?;
            report.state = TableLoadState::Loaded;
            self.emit(spec.name, EventOutcome::Succeeded, None);
        } else {
            report.state = TableLoadState::Partial;
            self.emit(
                spec.name,
                EventOutcome::Failed,
                Some("table partially loaded".to_string()),
            );
        }

        report.duration = started.elapsed();
        info!(
            rows = report.rows_inserted,
            malformed = report.malformed_records,
            files = report.files_loaded,
            state = report.state.as_str(),
            elapsed_ms = report.duration.as_millis(),
            "table load finished"
        );
        Ok(report)
    }

    /// True when [`LoadStage::load_table`] will recreate the table: on first
    /// start, when its destination table is missing, or when an entry was
    /// left half loaded. Every entry of such a table is loaded again.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError`] if the checkpoint or storage query fails.
    pub async fn needs_reset(&self, spec: &TableSpec) -> Result<bool, LoadError> {
        let status = self.store.status(&self.table_key(spec)).await?;
        if status == CheckpointStatus::Pending {
            return Ok(true);
        }
        let exists = self
            .storage
            .table_exists(spec.name)
            .await
            .map_err(|source| LoadError::Storage {
                table: spec.name,
                source,
            })?;
        if !exists {
            return Ok(true);
        }
        Ok(self
            .table_entries(spec)
            .await?
            .iter()
            .any(|record| {
                matches!(
                    record.status,
                    CheckpointStatus::InProgress | CheckpointStatus::Failed
                )
            }))
    }

    async fn table_entries(
        &self,
        spec: &TableSpec,
    ) -> Result<Vec<CheckpointRecord>, LoadError> {
        let prefix = format!("{}/", spec.name);
        Ok(self
            .store
            .list(&self.period, Some(Stage::LoadEntry))
            .await?
            .into_iter()
            .filter(|record| record.key.logical_name.starts_with(&prefix))
            .collect())
    }

    async fn reset_table(&self, spec: &TableSpec) -> Result<(), LoadError> {
        self.storage
            .reset_table(spec)
            .await
            .map_err(|source| LoadError::Storage {
                table: spec.name,
                source,
            })?;
        for record in self.table_entries(spec).await? {
            self.store
                .reset(&record.key, CheckpointStatus::Pending, None)
                .await?;
        }
        info!(table = spec.name, "destination table recreated");
        Ok(())
    }

    /// Streams one file into the table.
    #[instrument(skip(self, spec, entry), fields(file = %entry.local_path.display()))]
    async fn load_entry(
        &self,
        spec: &'static TableSpec,
        entry: &ExtractedEntry,
    ) -> Result<FileLoadStats, LoadError> {
        let (sender, mut receiver) = mpsc::channel::<ReadBatch>(CHANNEL_DEPTH);
        let path = entry.local_path.clone();
        let file_size = tokio::fs::metadata(&path).await.ok().map(|m| m.len());
        let mut marks = ProgressMarks::new(file_size);
        let name = entry.load_key_name();
        let (max_rows, max_bytes) = (self.batch_max_rows, self.batch_max_bytes);
        let reader =
            tokio::task::spawn_blocking(move || read_batches(&path, spec, max_rows, max_bytes, &sender));

        let mut rows_inserted = 0u64;
        while let Some((batch, position)) = receiver.recv().await {
            match self.storage.bulk_insert(&batch).await {
                Ok(inserted) => {
                    rows_inserted += inserted;
                    if let Some(percent) = marks.as_mut().and_then(|m| m.advance(position)) {
                        self.emit(
                            &name,
                            EventOutcome::Progress,
                            Some(format!("{percent}% ({rows_inserted} rows)")),
                        );
                    }
                }
                Err(source) => {
                    // Dropping the receiver stops the reader at its next send.
                    drop(receiver);
                    let _ = reader.await;
                    return Err(LoadError::LoadFailed {
                        table: spec.name,
                        file: entry.local_path.clone(),
                        record: batch.first_record,
                        source,
                    });
                }
            }
        }

        let stats = reader
            .await
            .map_err(|e| LoadError::Task(e.to_string()))??;
        if stats.malformed > 0 {
            warn!(
                malformed = stats.malformed,
                records = stats.records,
                "skipped malformed records"
            );
        }
        Ok(FileLoadStats {
            rows_inserted,
            ..stats
        })
    }

    fn emit(&self, name: &str, outcome: EventOutcome, detail: Option<String>) {
        let event = PipelineEvent::new(Stage::Load, name, outcome);
        self.sink.emit(match detail {
            Some(detail) => event.with_detail(detail),
            None => event,
        });
    }
}

/// Reads `path` as `;`-delimited, header-less records and sends full
/// batches. Returns record and malformed counts; `rows_inserted` is left 0.
fn read_batches(
    path: &Path,
    spec: &'static TableSpec,
    max_rows: usize,
    max_bytes: usize,
    sender: &mpsc::Sender<ReadBatch>,
) -> Result<FileLoadStats, LoadError> {
    let read_error = |source| LoadError::Read {
        file: path.to_path_buf(),
        source,
    };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .quote(b'"')
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(read_error)?;

    let mut stats = FileLoadStats::default();
    let mut batch = RowBatch::new(spec, max_rows, max_bytes);
    let mut record = csv::ByteRecord::new();

    loop {
        match reader.read_byte_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {}
            Err(error) if error.is_io_error() => return Err(read_error(error)),
            Err(error) => {
                stats.records += 1;
                stats.malformed += 1;
                debug!(record = stats.records, error = %error, "unparseable record skipped");
                continue;
            }
        }
        stats.records += 1;

        match convert_record(&record, spec) {
            Ok(row) => batch.push(row, stats.records),
            Err(reason) => {
                stats.malformed += 1;
                debug!(record = stats.records, reason = %reason, "malformed record skipped");
                continue;
            }
        }

        if batch.is_full()
            && sender
                .blocking_send((batch.take(), reader.position().byte()))
                .is_err()
        {
            return Ok(stats);
        }
    }

    if !batch.is_empty() {
        let _ = sender.blocking_send((batch.take(), reader.position().byte()));
    }
    Ok(stats)
}

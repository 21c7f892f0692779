//! CNPJ ETL Core Library
//!
//! Acquires the Receita Federal "Dados Abertos CNPJ" release for one period
//! and bulk-loads it into a relational store, resumably.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`manifest`] - Period index scraping into file descriptors
//! - [`download`] - Concurrent HTTP downloads with resume, timeout and retry
//! - [`validate`] - Size, checksum and ZIP/CRC integrity checks
//! - [`extract`] - Archive extraction and table classification
//! - [`load`] - Decoding, batching and the [`load::Storage`] seam
//! - [`checkpoint`] - Durable per-file, per-stage progress
//! - [`pipeline`] - Run orchestration across all stages
//! - [`db`] - Database connection and schema management

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod checkpoint;
pub mod config;
pub mod db;
pub mod download;
pub mod events;
pub mod extract;
pub mod load;
pub mod manifest;
pub mod pipeline;
pub mod summary;
pub mod validate;

#[cfg(test)]
pub mod test_support;

// Re-export commonly used types
pub use checkpoint::{CheckpointKey, CheckpointStatus, CheckpointStore, Stage};
pub use config::{Period, PipelineConfig};
pub use db::Database;
pub use download::{
    DEFAULT_MAX_RETRIES, DownloadManager, DownloadReport, EngineError, HttpClient, RetryPolicy,
};
pub use events::{EventSink, MemorySink, PipelineEvent, TracingSink};
pub use load::{SqliteStorage, Storage};
pub use pipeline::{Pipeline, PipelineError};
pub use summary::{ProcessExit, RunSummary};

//! Download stage: HTTP transfers with resume, timeouts and retry.
//!
//! # Features
//!
//! - Streaming downloads (memory-efficient for archives above 1 GB)
//! - `.part` files renamed on success, resumed with `Range` requests
//! - Per-attempt timeout, exponential backoff with optional jitter
//! - Bounded concurrency through [`DownloadManager`]
//!
//! # Example
//!
//! ```no_run
//! use cnpj_etl_core::download::HttpClient;
//! use std::path::Path;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = HttpClient::new(Duration::from_secs(30));
//! let result = client
//!     .download_to("https://example.com/Cnaes.zip", Path::new("./staging/Cnaes.zip"))
//!     .await?;
//! println!("Downloaded {} bytes", result.bytes);
//! # Ok(())
//! # }
//! ```

mod client;
mod clock;
mod error;
mod manager;
mod retry;

pub use client::{HttpClient, RemoteInfo, TransferProgress, TransferResult, partial_path};
pub use clock::{Clock, FakeClock, TokioClock};
pub use error::DownloadError;
pub use manager::{
    DownloadManager, DownloadOutcome, DownloadReport, DownloadTask, EngineError, FailedDownload,
    FileDownload,
    check_failure_threshold,
};
pub use retry::{
    DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error,
    parse_retry_after, retry_after_delay,
};

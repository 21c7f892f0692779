//! HTTP client wrapper for streaming archives to disk.
//!
//! Transfers always write to `<destination>.part` and rename on success, so a
//! file at the destination path is complete. A leftover partial file is
//! resumed with a `Range` request when the server advertises
//! `Accept-Ranges: bytes`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE, RETRY_AFTER};
use reqwest::{Client, Method, StatusCode};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::error::DownloadError;
use crate::events::ProgressMarks;

/// Bound on index and HEAD requests. Archive bodies are bounded by the
/// caller's per-attempt timeout instead.
const METADATA_TIMEOUT: Duration = Duration::from_secs(60);

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// HTTP client for downloading files with streaming support.
///
/// Create once and reuse; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

/// What a HEAD probe learned about a remote file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteInfo {
    /// Announced size in bytes.
    pub content_length: Option<u64>,
    /// Whether `Range` requests are honored.
    pub accepts_ranges: bool,
}

/// Bytes on disk at one 10% step of a transfer with a known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes: u64,
    pub total: u64,
    pub percent: u8,
}

/// Result of one successful transfer.
#[derive(Debug, Clone)]
pub struct TransferResult {
    /// Final path (the destination, after rename).
    pub path: PathBuf,
    /// Size of the file on disk.
    pub bytes: u64,
    /// Announced total size, when known.
    pub content_length: Option<u64>,
    /// Whether bytes were appended to an existing partial file.
    pub resumed: bool,
    /// Whether a partial file was found and a resume probe made.
    pub resume_attempted: bool,
}

impl HttpClient {
    /// Creates a client with the given connect timeout.
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|error| {
                warn!(error = %error, "falling back to default HTTP client configuration");
                Client::new()
            });
        Self { client }
    }

    /// Fetches a text document (the period index page).
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] on network failure, timeout or non-success
    /// status.
    #[instrument(skip(self))]
    pub async fn get_text(&self, url: &str) -> Result<String, DownloadError> {
        let response = self
            .send_request(Method::GET, url, None, Some(METADATA_TIMEOUT))
            .await?;
        response.text().await.map_err(|e| {
            if e.is_timeout() {
                DownloadError::timeout(url)
            } else {
                DownloadError::network(url, e)
            }
        })
    }

    /// Issues a HEAD request and reports size and range support.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] when the request fails.
    #[instrument(skip(self))]
    pub async fn probe(&self, url: &str) -> Result<RemoteInfo, DownloadError> {
        let response = self
            .send_request(Method::HEAD, url, None, Some(METADATA_TIMEOUT))
            .await?;
        // HEAD has no body, so `content_length()` would report zero.
        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let accepts_ranges = response
            .headers()
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));
        Ok(RemoteInfo {
            content_length,
            accepts_ranges,
        })
    }

    /// True when `destination` exists, is non-empty and its size equals the
    /// remote Content-Length.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] when the HEAD request fails.
    pub async fn is_up_to_date(&self, url: &str, destination: &Path) -> Result<bool, DownloadError> {
        let local = match tokio::fs::metadata(destination).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => meta.len(),
            _ => return Ok(false),
        };
        let remote = self.probe(url).await?;
        Ok(remote.content_length == Some(local))
    }

    /// Downloads `url` to `destination`, resuming a leftover partial file when
    /// possible.
    ///
    /// On a network error mid-stream the partial file is kept so the next
    /// attempt can resume. On a size mismatch it is removed.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] for network, HTTP, IO and size failures.
    pub async fn download_to(
        &self,
        url: &str,
        destination: &Path,
    ) -> Result<TransferResult, DownloadError> {
        self.download_with_progress(url, destination, &|_| {}).await
    }

    /// Same as [`HttpClient::download_to`], calling `on_progress` at every
    /// 10% of the announced size. Nothing is reported when the server sends
    /// no length.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError`] for network, HTTP, IO and size failures.
    #[instrument(skip(self, destination, on_progress), fields(dest = %destination.display()))]
    pub async fn download_with_progress(
        &self,
        url: &str,
        destination: &Path,
        on_progress: &(dyn Fn(TransferProgress) + Sync),
    ) -> Result<TransferResult, DownloadError> {
        Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;

        let part_path = partial_path(destination);
        let existing_bytes = tokio::fs::metadata(&part_path)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);

        let mut remote = RemoteInfo::default();
        let resume_attempted = existing_bytes > 0;
        if resume_attempted {
            match self.probe(url).await {
                Ok(info) => remote = info,
                Err(error) => debug!(error = %error, "resume probe failed, restarting transfer"),
            }
            if remote.accepts_ranges && remote.content_length == Some(existing_bytes) {
                debug!(bytes = existing_bytes, "partial file already complete");
                finalize(&part_path, destination).await?;
                return Ok(TransferResult {
                    path: destination.to_path_buf(),
                    bytes: existing_bytes,
                    content_length: remote.content_length,
                    resumed: true,
                    resume_attempted,
                });
            }
        }

        let use_resume = remote.accepts_ranges && existing_bytes > 0;
        let range_value = use_resume.then(|| format!("bytes={existing_bytes}-"));

        let response = self
            .send_request(Method::GET, url, range_value.as_deref(), None)
            .await?;
        let resumed = use_resume && response.status() == StatusCode::PARTIAL_CONTENT;
        if use_resume && !resumed {
            debug!(status = %response.status(), "server ignored range request, restarting");
        }

        let mut file = if resumed {
            tokio::fs::OpenOptions::new()
                .append(true)
                .open(&part_path)
                .await
                .map_err(|e| DownloadError::io(part_path.clone(), e))?
        } else {
            File::create(&part_path)
                .await
                .map_err(|e| DownloadError::io(part_path.clone(), e))?
        };

        let offset = if resumed { existing_bytes } else { 0 };
        let content_length = derive_total_content_length(&response, offset);

        let progress = Progress {
            offset,
            marks: ProgressMarks::new(content_length),
            on_progress,
        };
        let bytes_written = stream_to_file(&mut file, response, url, &part_path, progress).await?;
        let final_size = offset.saturating_add(bytes_written);

        if let Some(expected) = content_length.filter(|expected| *expected != final_size) {
            debug!(path = %part_path.display(), "removing partial file after size mismatch");
            let _ = tokio::fs::remove_file(&part_path).await;
            return Err(DownloadError::integrity(part_path, expected, final_size));
        }

        finalize(&part_path, destination).await?;

        info!(bytes = final_size, resumed, "download complete");

        Ok(TransferResult {
            path: destination.to_path_buf(),
            bytes: final_size,
            content_length,
            resumed,
            resume_attempted,
        })
    }

    async fn send_request(
        &self,
        method: Method,
        url: &str,
        range_header: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<reqwest::Response, DownloadError> {
        let mut request = self.client.request(method, url);
        if let Some(range) = range_header {
            request = request.header(RANGE, range);
        }
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DownloadError::timeout(url)
            } else if e.is_builder() {
                DownloadError::invalid_url(url)
            } else {
                DownloadError::network(url, e)
            }
        })?;

        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(std::string::ToString::to_string);
            return Err(DownloadError::http_status_with_retry_after(
                url,
                response.status().as_u16(),
                retry_after,
            ));
        }

        Ok(response)
    }
}

/// Path of the in-flight file for `destination`: the same name plus `.part`.
#[must_use]
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.file_name().map_or_else(
        || std::ffi::OsString::from("download"),
        std::ffi::OsStr::to_os_string,
    );
    name.push(".part");
    destination.with_file_name(name)
}

async fn finalize(part_path: &Path, destination: &Path) -> Result<(), DownloadError> {
    tokio::fs::rename(part_path, destination)
        .await
        .map_err(|e| DownloadError::io(destination.to_path_buf(), e))
}

/// Progress reporting state of one transfer.
struct Progress<'a> {
    /// Bytes already on disk before this response.
    offset: u64,
    marks: Option<ProgressMarks>,
    on_progress: &'a (dyn Fn(TransferProgress) + Sync),
}

impl Progress<'_> {
    fn advance(&mut self, written: u64) {
        let Some(marks) = self.marks.as_mut() else {
            return;
        };
        let bytes = self.offset.saturating_add(written);
        if let Some(percent) = marks.advance(bytes) {
            (self.on_progress)(TransferProgress {
                bytes,
                total: marks.total(),
                percent,
            });
        }
    }
}

/// Streams the response body to file, returning bytes written.
async fn stream_to_file(
    file: &mut File,
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
    mut progress: Progress<'_>,
) -> Result<u64, DownloadError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = match chunk_result {
            Ok(chunk) => chunk,
            Err(e) => {
                // Keep what arrived so the next attempt can resume from it.
                let _ = writer.flush().await;
                return Err(if e.is_timeout() {
                    DownloadError::timeout(url)
                } else {
                    DownloadError::network(url, e)
                });
            }
        };

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| DownloadError::io(file_path.to_path_buf(), e))?;

        bytes_written += chunk.len() as u64;
        progress.advance(bytes_written);
    }

    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(file_path.to_path_buf(), e))?;

    Ok(bytes_written)
}

fn derive_total_content_length(response: &reqwest::Response, existing_bytes: u64) -> Option<u64> {
    let current = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if response.status() == StatusCode::PARTIAL_CONTENT {
        current.map(|remaining| existing_bytes.saturating_add(remaining))
    } else {
        current
    }
}

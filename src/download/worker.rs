//! Download worker - streams a response body to disk with throttled progress

use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::config::DOWNLOAD_BUFFER_SIZE;
use crate::error::DownloadError;
use crate::progress::{ProgressSink, ProgressThrottle};

/// A fully written download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct StreamingDownloader {
    client: Client,
    buffer_size: usize,
}

impl StreamingDownloader {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            buffer_size: DOWNLOAD_BUFFER_SIZE,
        }
    }

    /// Download `url` into `destination`.
    ///
    /// `expected_size` comes from the file descriptor; when it is 0 the response's
    /// Content-Length is used for progress, and when that is missing too the
    /// events carry no total. On any failure after the file was created the
    /// partial file is removed before the error is returned.
    ///
    /// `max_bytes` caps the body; a response that goes past it fails with
    /// [`DownloadError::LimitExceeded`].
    pub async fn download(
        &self,
        url: &str,
        destination: &Path,
        expected_size: u64,
        max_bytes: Option<u64>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<DownloadedFile, DownloadError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!("download_status: {} status={}", url, status);
            return Err(DownloadError::Status(status.as_u16()));
        }
        if let (Some(limit), Some(length)) = (max_bytes, response.content_length()) {
            if length > limit {
                warn!("download_over_limit: {} length={} limit={}", url, length, limit);
                return Err(DownloadError::LimitExceeded {
                    limit,
                    received: length,
                });
            }
        }

        let total_bytes = if expected_size > 0 {
            expected_size
        } else {
            response.content_length().unwrap_or(0)
        };

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(destination).await?;

        match self
            .write_body(response, file, total_bytes, max_bytes, sink.as_ref())
            .await
        {
            Ok(bytes) => {
                info!(
                    "download_done: {} bytes={} path={}",
                    url,
                    bytes,
                    destination.display()
                );
                Ok(DownloadedFile {
                    path: destination.to_path_buf(),
                    bytes,
                })
            }
            Err(e) => {
                warn!("download_failed: {} error={}", url, e);
                if let Err(remove_err) = tokio::fs::remove_file(destination).await {
                    debug!(
                        "download_cleanup: {} error={}",
                        destination.display(),
                        remove_err
                    );
                }
                Err(e)
            }
        }
    }

    async fn write_body(
        &self,
        response: reqwest::Response,
        mut file: File,
        total_bytes: u64,
        max_bytes: Option<u64>,
        sink: &dyn ProgressSink,
    ) -> Result<u64, DownloadError> {
        let mut throttle = ProgressThrottle::download(total_bytes);
        let mut stream = response.bytes_stream();
        let mut write_buffer = Vec::with_capacity(self.buffer_size);
        let mut downloaded: u64 = 0;

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result?;
            write_buffer.extend_from_slice(&chunk);
            downloaded += chunk.len() as u64;
            if let Some(limit) = max_bytes.filter(|limit| downloaded > *limit) {
                return Err(DownloadError::LimitExceeded {
                    limit,
                    received: downloaded,
                });
            }

            if write_buffer.len() >= self.buffer_size {
                file.write_all(&write_buffer).await?;
                write_buffer.clear();
            }

            if let Some(event) = throttle.observe(downloaded) {
                debug!(
                    "download_progress: {}/{} rate={:.0}",
                    event.bytes_done, event.bytes_total, event.rate
                );
                sink.report(event);
            }
        }

        if !write_buffer.is_empty() {
            file.write_all(&write_buffer).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        sink.report(throttle.finish(downloaded));
        Ok(downloaded)
    }
}

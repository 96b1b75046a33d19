//! Remote file probe - resolves a URL to a name and size without downloading it

use log::{debug, info};
use reqwest::header::{HeaderMap, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode, Url};
use serde::Serialize;
use std::time::Duration;

use crate::config::PROBE_TIMEOUT;
use crate::error::ProbeError;

/// Name used when neither the headers nor the URL carry one
pub const FALLBACK_FILE_NAME: &str = "downloaded_file";

/// What the probe learned about a remote file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDescriptor {
    pub name: String,
    /// Size in bytes, 0 when the server does not say
    pub size: u64,
}

impl FileDescriptor {
    pub fn size_known(&self) -> bool {
        self.size > 0
    }
}

/// Parse user input as an absolute http(s) URL with a host
pub fn parse_source_url(text: &str) -> Option<Url> {
    let url = Url::parse(text.trim()).ok()?;
    let supported = matches!(url.scheme(), "http" | "https");
    if supported && url.host_str().is_some_and(|h| !h.is_empty()) {
        Some(url)
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct RemoteFileProbe {
    client: Client,
    timeout: Duration,
}

impl RemoteFileProbe {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolve `url` to a [`FileDescriptor`].
    ///
    /// Sends a HEAD request; when it yields no size, asks for the first two
    /// bytes and reads the total from `Content-Range`. Servers without range
    /// support produce size 0 rather than an error. No retries.
    pub async fn probe(&self, url: &str) -> Result<FileDescriptor, ProbeError> {
        let parsed = parse_source_url(url).ok_or_else(|| ProbeError::InvalidUrl(url.to_string()))?;

        let head = self
            .client
            .head(parsed.clone())
            .timeout(self.timeout)
            .send()
            .await?;

        let head_ok = head.status().is_success();
        let mut size = 0;
        let mut name = None;
        if head_ok {
            size = header_u64(head.headers(), CONTENT_LENGTH.as_str()).unwrap_or(0);
            name = filename_from_headers(head.headers());
        } else {
            debug!("probe_head_status: {} status={}", parsed, head.status());
        }

        if size == 0 {
            let ranged = self
                .client
                .get(parsed.clone())
                .header(RANGE, "bytes=0-1")
                .timeout(self.timeout)
                .send()
                .await?;
            let status = ranged.status();

            if status == StatusCode::PARTIAL_CONTENT {
                size = ranged
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(total_from_content_range)
                    .unwrap_or(0);
            } else if status.is_success() {
                // Range ignored; the full-body length is still the file size
                size = header_u64(ranged.headers(), CONTENT_LENGTH.as_str()).unwrap_or(0);
            } else if !head_ok {
                return Err(ProbeError::Status(status.as_u16()));
            }

            if name.is_none() {
                name = filename_from_headers(ranged.headers());
            }
            // Body is dropped unread
        }

        let name = name
            .or_else(|| filename_from_url(&parsed))
            .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string());

        info!("probe_done: {} name={} size={}", parsed, name, size);
        Ok(FileDescriptor { name, size })
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// `bytes 0-1/12345` -> 12345; `*` totals are unknown
fn total_from_content_range(value: &str) -> Option<u64> {
    let total = value.rsplit('/').next()?.trim();
    if total == "*" {
        return None;
    }
    total.parse::<u64>().ok()
}

fn filename_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(filename_from_disposition)
}

/// Extract the file name from a Content-Disposition value, preferring the
/// RFC 5987 `filename*` form
pub(crate) fn filename_from_disposition(value: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;

    for param in value.split(';').map(str::trim) {
        let Some((key, raw)) = param.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                // charset'language'percent-encoded
                let encoded = raw.trim().trim_matches('"');
                let encoded = encoded.splitn(3, '\'').nth(2).unwrap_or(encoded);
                extended = urlencoding::decode(encoded).ok().map(|s| s.into_owned());
            }
            "filename" => {
                plain = Some(raw.trim().trim_matches('"').to_string());
            }
            _ => {}
        }
    }

    extended
        .or(plain)
        .map(|name| sanitize_file_name(&name))
        .filter(|name| !name.is_empty())
}

fn filename_from_url(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let decoded = urlencoding::decode(segment)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| segment.to_string());
    let name = sanitize_file_name(&decoded);
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

/// Keep only the final path component and drop control characters
pub(crate) fn sanitize_file_name(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    match cleaned.trim() {
        "." | ".." => String::new(),
        other => other.to_string(),
    }
}

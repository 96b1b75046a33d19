//! Cloud destination: resumable upload to Google Drive, then a public link

use log::{debug, info, warn};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, LOCATION, RANGE};
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::counting_body;
use super::mime::mime_type_for;
use crate::config::CLOUD_CHUNK_SIZE;
use crate::error::UploadError;
use crate::oauth::{self, DriveCredential, OAuthError};
use crate::probe::FileDescriptor;
use crate::progress::{ProgressReporter, ProgressSink, ProgressThrottle};

pub const DRIVE_API_URL: &str = "https://www.googleapis.com/drive/v3";
pub const DRIVE_UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3";

/// Result of a cloud upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CloudReceipt {
    pub file_id: String,
    /// Anyone-with-the-link view URL
    pub link: String,
    /// Set when the access token was refreshed; the caller persists it
    #[serde(skip)]
    pub refreshed: Option<DriveCredential>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
    #[serde(rename = "webViewLink")]
    web_view_link: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DriveUploader {
    client: Client,
    api_base: String,
    upload_base: String,
    chunk_size: usize,
}

impl DriveUploader {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            api_base: DRIVE_API_URL.to_string(),
            upload_base: DRIVE_UPLOAD_URL.to_string(),
            chunk_size: CLOUD_CHUNK_SIZE,
        }
    }

    pub fn with_endpoints(mut self, api_base: &str, upload_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self.upload_base = upload_base.trim_end_matches('/').to_string();
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Upload the staged file and share it with anyone holding the link.
    ///
    /// `credential` is `None` when the user never linked an account, which is
    /// reported as [`UploadError::NotLinked`]. An expiring token is refreshed
    /// first; a refresh that cannot happen or is refused, and any 401 from
    /// Drive, become [`UploadError::ReauthorizationRequired`].
    pub async fn upload_to_cloud(
        &self,
        path: &Path,
        descriptor: &FileDescriptor,
        credential: Option<&DriveCredential>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<CloudReceipt, UploadError> {
        let credential = credential
            .filter(|c| !c.access_token.is_empty())
            .ok_or(UploadError::NotLinked)?;

        let mut refreshed = None;
        if credential.needs_refresh(chrono::Utc::now().timestamp()) {
            let fresh = oauth::refresh_credential(&self.client, credential)
                .await
                .map_err(reauthorization)?;
            info!("drive_token_refreshed");
            refreshed = Some(fresh);
        }
        let token = refreshed
            .as_ref()
            .map(|c| c.access_token.clone())
            .unwrap_or_else(|| credential.access_token.clone());

        let size = tokio::fs::metadata(path).await?.len();
        let mime = mime_type_for(&descriptor.name);
        let session = self
            .start_session(&token, &descriptor.name, mime, size)
            .await?;
        debug!("drive_session_started: {} size={}", descriptor.name, size);

        let reporter = ProgressReporter::new(ProgressThrottle::upload(size), sink);
        let file = self
            .send_chunks(&token, &session, path, size, &reporter)
            .await?;
        reporter.finish(size);

        self.share(&token, &file.id).await?;
        let link = file
            .web_view_link
            .unwrap_or_else(|| format!("https://drive.google.com/file/d/{}/view", file.id));
        info!("drive_upload_done: {} id={} bytes={}", descriptor.name, file.id, size);

        Ok(CloudReceipt {
            file_id: file.id,
            link,
            refreshed,
        })
    }

    async fn start_session(
        &self,
        token: &str,
        name: &str,
        mime: &str,
        size: u64,
    ) -> Result<String, UploadError> {
        let url = Url::parse_with_params(
            &format!("{}/files", self.upload_base),
            &[("uploadType", "resumable"), ("fields", "id,webViewLink")],
        )
        .map_err(|e| UploadError::Other(format!("invalid Drive endpoint: {}", e)))?;

        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .header("X-Upload-Content-Type", mime)
            .header("X-Upload-Content-Length", size)
            .json(&serde_json::json!({ "name": name, "mimeType": mime }))
            .send()
            .await
            .map_err(network)?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| UploadError::Other("Drive returned no upload session".into()))
    }

    async fn send_chunks(
        &self,
        token: &str,
        session: &str,
        path: &Path,
        size: u64,
        reporter: &ProgressReporter,
    ) -> Result<DriveFile, UploadError> {
        if size == 0 {
            let response = self
                .client
                .put(session)
                .bearer_auth(token)
                .header(CONTENT_RANGE, "bytes */0")
                .header(CONTENT_LENGTH, 0)
                .send()
                .await
                .map_err(network)?;
            return finished_file(response).await;
        }

        let mut file = File::open(path).await?;
        let mut offset: u64 = 0;
        loop {
            let len = std::cmp::min(self.chunk_size as u64, size - offset);
            let mut chunk = vec![0u8; len as usize];
            file.read_exact(&mut chunk).await?;
            let end = offset + len - 1;

            let response = self
                .client
                .put(session)
                .bearer_auth(token)
                .header(CONTENT_RANGE, format!("bytes {}-{}/{}", offset, end, size))
                .header(CONTENT_LENGTH, len)
                .body(counting_body(Cursor::new(chunk), reporter.clone(), offset))
                .send()
                .await
                .map_err(network)?;

            if response.status().as_u16() != 308 {
                return finished_file(response).await;
            }

            // Drive reports what it has persisted; resend from there
            let persisted = response
                .headers()
                .get(RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.rsplit('-').next())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|last| last + 1)
                .unwrap_or(0);
            if persisted <= offset || persisted > size {
                warn!(
                    "drive_chunk_stalled: offset={} persisted={} size={}",
                    offset, persisted, size
                );
                return Err(UploadError::Other(
                    "Drive upload session made no progress".into(),
                ));
            }
            if persisted != end + 1 {
                debug!("drive_chunk_partial: sent_to={} persisted={}", end + 1, persisted);
                file.seek(std::io::SeekFrom::Start(persisted)).await?;
            }
            offset = persisted;
            if offset >= size {
                return Err(UploadError::Other(
                    "Drive did not finalize the upload".into(),
                ));
            }
        }
    }

    async fn share(&self, token: &str, file_id: &str) -> Result<(), UploadError> {
        let response = self
            .client
            .post(format!("{}/files/{}/permissions", self.api_base, file_id))
            .bearer_auth(token)
            .json(&serde_json::json!({ "type": "anyone", "role": "reader" }))
            .send()
            .await
            .map_err(network)?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        Ok(())
    }
}

async fn finished_file(response: Response) -> Result<DriveFile, UploadError> {
    if !response.status().is_success() {
        return Err(status_error(response).await);
    }
    response
        .json::<DriveFile>()
        .await
        .map_err(|e| UploadError::Other(format!("unexpected Drive response: {}", e)))
}

fn network(err: reqwest::Error) -> UploadError {
    UploadError::Other(format!("Drive request failed: {}", err))
}

fn reauthorization(err: OAuthError) -> UploadError {
    warn!("drive_token_refresh_failed: {}", err);
    UploadError::ReauthorizationRequired(err.to_string())
}

async fn status_error(response: Response) -> UploadError {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED => UploadError::ReauthorizationRequired(text),
        StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN | StatusCode::PAYLOAD_TOO_LARGE => {
            UploadError::PlatformRejected(format!("{} - {}", status, text))
        }
        _ => UploadError::Other(format!("Drive request failed: {} - {}", status, text)),
    }
}

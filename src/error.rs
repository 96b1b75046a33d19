//! Error taxonomy for the transfer pipeline

use thiserror::Error;

/// Metadata probe failures
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("probe timed out")]
    Timeout,

    #[error("probe request failed: {0}")]
    Network(#[source] reqwest::Error),

    #[error("server responded with status {0}")]
    Status(u16),
}

impl From<reqwest::Error> for ProbeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProbeError::Timeout
        } else {
            ProbeError::Network(err)
        }
    }
}

/// Streaming download failures
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("download failed with status {0}")]
    Status(u16),

    #[error("failed to write file: {0}")]
    Io(#[from] std::io::Error),

    /// The body grew past the bytes the transfer was allowed to pull
    #[error("download exceeded its {limit} byte allowance ({received} bytes received)")]
    LimitExceeded { limit: u64, received: u64 },
}

/// Destination upload failures
#[derive(Debug, Error)]
pub enum UploadError {
    /// No cloud account is linked for the user
    #[error("cloud storage account is not linked")]
    NotLinked,

    /// The stored credential can no longer be used or refreshed
    #[error("cloud storage authorization expired: {0}")]
    ReauthorizationRequired(String),

    /// The destination refused the file (size, type, ...)
    #[error("destination rejected the file: {0}")]
    PlatformRejected(String),

    #[error("upload failed: {0}")]
    Other(String),
}

impl From<std::io::Error> for UploadError {
    fn from(err: std::io::Error) -> Self {
        UploadError::Other(format!("failed to read staged file: {}", err))
    }
}

/// Aggregate error at the orchestrator boundary
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("user is not registered")]
    UnknownUser,

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error("monthly quota exceeded by {shortfall} bytes")]
    QuotaExceeded { shortfall: u64, remaining: u64 },

    #[error("destination is not available for this file")]
    DestinationUnavailable,

    #[error("transfer was cancelled")]
    Cancelled,

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("database error: {0}")]
    Store(String),
}

impl TransferError {
    pub(crate) fn store(err: impl std::fmt::Display) -> Self {
        TransferError::Store(err.to_string())
    }
}

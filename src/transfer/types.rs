//! Transfer session types and state machine

use log::info;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;

use crate::config::CHAT_FILE_LIMIT;
use crate::probe::FileDescriptor;

/// Where a transfer delivers the file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
    Chat,
    Cloud,
}

impl Destination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::Chat => "chat",
            Destination::Cloud => "cloud",
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<String> for Destination {
    fn from(s: String) -> Self {
        match s.as_str() {
            "cloud" => Destination::Cloud,
            _ => Destination::Chat,
        }
    }
}

/// Destinations offered for a file. Files at or above the chat ceiling can
/// only go to the cloud; an unknown size (0) offers both.
pub fn destinations_for(size: u64) -> Vec<Destination> {
    if size >= CHAT_FILE_LIMIT {
        vec![Destination::Cloud]
    } else {
        vec![Destination::Chat, Destination::Cloud]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    Probing,
    QuotaCheck,
    AwaitingDestinationChoice,
    Downloading,
    Uploading,
    Committing,
    Done,
    Failed(String),
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Done | TransferState::Failed(_) | TransferState::Cancelled
        )
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferState::Probing => write!(f, "probing"),
            TransferState::QuotaCheck => write!(f, "quota_check"),
            TransferState::AwaitingDestinationChoice => write!(f, "awaiting_destination"),
            TransferState::Downloading => write!(f, "downloading"),
            TransferState::Uploading => write!(f, "uploading"),
            TransferState::Committing => write!(f, "committing"),
            TransferState::Done => write!(f, "done"),
            TransferState::Failed(_) => write!(f, "failed"),
            TransferState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One user request, from probe to done. Lives only in memory.
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub id: u64,
    pub user_id: i64,
    pub source_url: String,
    pub descriptor: FileDescriptor,
    pub state: TransferState,
    pub destination: Option<Destination>,
    pub staging_path: Option<PathBuf>,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,
    pub download_started: Option<Instant>,
    pub upload_started: Option<Instant>,
}

impl TransferSession {
    pub(crate) fn new(id: u64, user_id: i64, source_url: &str) -> Self {
        Self {
            id,
            user_id,
            source_url: source_url.to_string(),
            descriptor: FileDescriptor {
                name: String::new(),
                size: 0,
            },
            state: TransferState::Probing,
            destination: None,
            staging_path: None,
            bytes_downloaded: 0,
            bytes_uploaded: 0,
            download_started: None,
            upload_started: None,
        }
    }

    /// Destinations the user may choose from
    pub fn offers(&self) -> Vec<Destination> {
        destinations_for(self.descriptor.size)
    }

    pub(crate) fn transition(&mut self, next: TransferState) {
        match &next {
            TransferState::Failed(reason) => info!(
                "transfer_state: {} {} -> failed reason={}",
                self.id, self.state, reason
            ),
            _ => info!("transfer_state: {} {} -> {}", self.id, self.state, next),
        }
        self.state = next;
    }
}

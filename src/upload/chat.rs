//! Chat-native destination: the file is sent back into the chat as a document

use futures_util::future::BoxFuture;
use log::info;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::error::UploadError;
use crate::format::format_size;
use crate::probe::FileDescriptor;
use crate::progress::{ProgressReporter, ProgressSink, ProgressThrottle};

/// Handle of the delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MessageReceipt {
    pub chat_id: i64,
    pub message_id: i64,
}

/// One document to deliver; the transport streams `path` and feeds
/// `reporter` with the bytes sent so far
pub struct DocumentUpload {
    pub chat_id: i64,
    pub path: PathBuf,
    pub file_name: String,
    pub size: u64,
    pub caption: String,
    pub reporter: ProgressReporter,
}

/// Connection to the chat platform's file API
pub trait ChatTransport: Send + Sync {
    /// Establish or verify the session
    fn connect(&self) -> BoxFuture<'_, Result<(), UploadError>>;

    fn send_document(&self, upload: DocumentUpload)
        -> BoxFuture<'_, Result<MessageReceipt, UploadError>>;
}

pub struct ChatUploader {
    transport: Arc<dyn ChatTransport>,
    connected: OnceCell<()>,
}

impl ChatUploader {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            transport,
            connected: OnceCell::new(),
        }
    }

    /// Connect on first use; concurrent callers wait for the same attempt and
    /// a failed attempt is retried by the next caller
    async fn ensure_connected(&self) -> Result<(), UploadError> {
        self.connected
            .get_or_try_init(|| async {
                self.transport.connect().await?;
                info!("chat_transport_connected");
                Ok::<(), UploadError>(())
            })
            .await?;
        Ok(())
    }

    /// Deliver the staged file at `path` to `chat_id`.
    ///
    /// The size ceiling is the caller's concern; a platform-side refusal comes
    /// back as [`UploadError::PlatformRejected`].
    pub async fn upload_to_chat(
        &self,
        path: &Path,
        descriptor: &FileDescriptor,
        chat_id: i64,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<MessageReceipt, UploadError> {
        self.ensure_connected().await?;

        let size = tokio::fs::metadata(path).await?.len();
        let reporter = ProgressReporter::new(ProgressThrottle::upload(size), sink);
        let upload = DocumentUpload {
            chat_id,
            path: path.to_path_buf(),
            file_name: descriptor.name.clone(),
            size,
            caption: format!("📁 {}\n📊 Size: {}", descriptor.name, format_size(size)),
            reporter: reporter.clone(),
        };

        let receipt = self.transport.send_document(upload).await?;
        reporter.finish(size);
        info!(
            "chat_upload_done: chat={} message={} bytes={}",
            receipt.chat_id, receipt.message_id, size
        );
        Ok(receipt)
    }
}

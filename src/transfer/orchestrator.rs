//! Transfer orchestrator - drives one session through the pipeline

use log::{info, warn};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::staging::StagedFile;
use super::types::{Destination, TransferSession, TransferState};
use crate::db::Database;
use crate::download::StreamingDownloader;
use crate::error::{DownloadError, TransferError, UploadError};
use crate::oauth::DriveCredential;
use crate::probe::RemoteFileProbe;
use crate::progress::ProgressSink;
use crate::quota::{self, QuotaDecision, QuotaGate};
use crate::upload::{ChatUploader, DriveUploader, MessageReceipt};

/// Where the file ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Delivery {
    Chat(MessageReceipt),
    Cloud { link: String },
}

/// Outcome of a completed transfer
#[derive(Debug, Clone, Serialize)]
pub struct TransferReceipt {
    pub session_id: u64,
    pub file_name: String,
    /// Bytes committed against the user's quota
    pub size: u64,
    pub destination: Destination,
    pub delivery: Delivery,
    pub download_time: Duration,
    pub upload_time: Duration,
}

pub struct TransferOrchestrator {
    db: Arc<Database>,
    quota: QuotaGate,
    probe: RemoteFileProbe,
    downloader: StreamingDownloader,
    chat: ChatUploader,
    cloud: DriveUploader,
    staging_dir: PathBuf,
    next_id: AtomicU64,
}

impl TransferOrchestrator {
    pub fn new(
        db: Arc<Database>,
        quota: QuotaGate,
        probe: RemoteFileProbe,
        downloader: StreamingDownloader,
        chat: ChatUploader,
        cloud: DriveUploader,
        staging_dir: PathBuf,
    ) -> Self {
        Self {
            db,
            quota,
            probe,
            downloader,
            chat,
            cloud,
            staging_dir,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn quota(&self) -> &QuotaGate {
        &self.quota
    }

    /// Probe `url` and check the user's quota.
    ///
    /// On success the session waits for a destination choice; on failure it
    /// has already moved to `Failed` and only the error is returned.
    pub async fn prepare(&self, user_id: i64, url: &str) -> Result<TransferSession, TransferError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut session = TransferSession::new(id, user_id, url);
        info!("transfer_start: {} user={} url={}", id, user_id, url);

        match self.probe.probe(url).await {
            Ok(descriptor) => session.descriptor = descriptor,
            Err(e) => return Err(fail(&mut session, e.into())),
        }

        session.transition(TransferState::QuotaCheck);
        if let Err(e) = self.check_quota(user_id, session.descriptor.size).await {
            return Err(fail(&mut session, e));
        }

        session.transition(TransferState::AwaitingDestinationChoice);
        Ok(session)
    }

    /// Cancel a session that is still waiting for a destination
    pub fn cancel(&self, session: &mut TransferSession) -> bool {
        if session.state != TransferState::AwaitingDestinationChoice {
            return false;
        }
        session.transition(TransferState::Cancelled);
        true
    }

    /// Download the file and deliver it to `destination`.
    ///
    /// Usage is committed only after the upload succeeded. The staging file is
    /// removed before this returns, whatever the outcome.
    pub async fn execute(
        &self,
        mut session: TransferSession,
        destination: Destination,
        chat_id: i64,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<TransferReceipt, TransferError> {
        match session.state {
            TransferState::AwaitingDestinationChoice => {}
            TransferState::Cancelled => return Err(TransferError::Cancelled),
            _ => return Err(TransferError::DestinationUnavailable),
        }

        let result = self.run(&mut session, destination, chat_id, sink).await;
        match &result {
            Ok(receipt) => {
                session.transition(TransferState::Done);
                info!(
                    "transfer_done: {} user={} bytes={} destination={}",
                    session.id, session.user_id, receipt.size, destination
                );
            }
            Err(e) => session.transition(TransferState::Failed(e.to_string())),
        }
        result
    }

    async fn run(
        &self,
        session: &mut TransferSession,
        destination: Destination,
        chat_id: i64,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<TransferReceipt, TransferError> {
        if !session.offers().contains(&destination) {
            return Err(TransferError::DestinationUnavailable);
        }
        session.destination = Some(destination);

        let user_id = session.user_id;
        let url = session.source_url.clone();
        let descriptor = session.descriptor.clone();

        // Nothing to deliver to; skip the download entirely
        let credential = match destination {
            Destination::Cloud => match self.load_credential(user_id).await? {
                Some(credential) => Some(credential),
                None => return Err(UploadError::NotLinked.into()),
            },
            Destination::Chat => None,
        };

        let reservation = self.quota.reserve(&self.db, user_id, descriptor.size).await?;
        let staged = StagedFile::create(&self.staging_dir, session.id, &descriptor.name)
            .await
            .map_err(DownloadError::from)?;
        session.staging_path = Some(staged.path().to_path_buf());

        session.transition(TransferState::Downloading);
        let started = Instant::now();
        session.download_started = Some(started);
        let cap = reservation.download_cap();
        let downloaded = self
            .downloader
            .download(&url, staged.path(), descriptor.size, cap, sink.clone())
            .await
            .map_err(|e| match e {
                // Unknown-size source outgrew the budget held for it
                DownloadError::LimitExceeded { limit, received } => {
                    warn!("transfer_over_budget: {} limit={} received={}", session.id, limit, received);
                    TransferError::QuotaExceeded {
                        shortfall: received.saturating_sub(limit),
                        remaining: limit,
                    }
                }
                other => other.into(),
            })?;
        session.bytes_downloaded = downloaded.bytes;
        let download_time = started.elapsed();

        session.transition(TransferState::Uploading);
        let started = Instant::now();
        session.upload_started = Some(started);
        let delivery = match destination {
            Destination::Chat => Delivery::Chat(
                self.chat
                    .upload_to_chat(staged.path(), &descriptor, chat_id, sink)
                    .await?,
            ),
            Destination::Cloud => {
                let receipt = self
                    .cloud
                    .upload_to_cloud(staged.path(), &descriptor, credential.as_ref(), sink)
                    .await?;
                if let Some(fresh) = &receipt.refreshed {
                    self.persist_credential(user_id, fresh).await;
                }
                Delivery::Cloud { link: receipt.link }
            }
        };
        session.bytes_uploaded = downloaded.bytes;
        let upload_time = started.elapsed();

        session.transition(TransferState::Committing);
        let committed = match cap {
            Some(cap) => downloaded.bytes.min(cap),
            None if descriptor.size > 0 => descriptor.size,
            None => downloaded.bytes,
        };
        self.quota.commit(&self.db, reservation, committed).await?;
        if let Err(e) = self
            .db
            .record_transfer(user_id, &descriptor.name, committed, destination)
            .await
        {
            warn!("transfer_history_failed: {} error={}", session.id, e);
        }
        drop(staged);

        Ok(TransferReceipt {
            session_id: session.id,
            file_name: descriptor.name,
            size: committed,
            destination,
            delivery,
            download_time,
            upload_time,
        })
    }

    async fn check_quota(&self, user_id: i64, size: u64) -> Result<(), TransferError> {
        let user = self
            .db
            .get_user(user_id)
            .await
            .map_err(TransferError::store)?
            .ok_or(TransferError::UnknownUser)?;
        let usage = self.quota.usage_of(&user);
        match quota::check(&usage, size) {
            QuotaDecision::Allow => Ok(()),
            QuotaDecision::Deny { shortfall } => Err(TransferError::QuotaExceeded {
                shortfall,
                remaining: usage.limit.remaining(usage.used).unwrap_or(u64::MAX),
            }),
        }
    }

    async fn load_credential(&self, user_id: i64) -> Result<Option<DriveCredential>, TransferError> {
        let user = self
            .db
            .get_user(user_id)
            .await
            .map_err(TransferError::store)?
            .ok_or(TransferError::UnknownUser)?;
        match user.drive_credential {
            None => Ok(None),
            Some(json) => DriveCredential::from_json(&json).map(Some).map_err(|e| {
                UploadError::ReauthorizationRequired(format!("stored credential is unreadable: {}", e))
                    .into()
            }),
        }
    }

    async fn persist_credential(&self, user_id: i64, credential: &DriveCredential) {
        let json = match credential.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("credential_serialize_failed: {} error={}", user_id, e);
                return;
            }
        };
        if let Err(e) = self.db.set_credential(user_id, Some(&json)).await {
            warn!("credential_store_failed: {} error={}", user_id, e);
        }
    }
}

fn fail(session: &mut TransferSession, err: TransferError) -> TransferError {
    session.transition(TransferState::Failed(err.to_string()));
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use crate::quota::PlanTable;
    use crate::upload::{ChatTransport, DocumentUpload};
    use futures_util::future::BoxFuture;
    use reqwest::Client;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct NeverTransport;

    impl ChatTransport for NeverTransport {
        fn connect(&self) -> BoxFuture<'_, Result<(), UploadError>> {
            Box::pin(async { Ok(()) })
        }

        fn send_document(
            &self,
            _upload: DocumentUpload,
        ) -> BoxFuture<'_, Result<MessageReceipt, UploadError>> {
            Box::pin(async { Err(UploadError::Other("not expected".into())) })
        }
    }

    async fn orchestrator(dir: &tempfile::TempDir) -> TransferOrchestrator {
        let db = Arc::new(Database::open(&dir.path().join("o.db")).await.unwrap());
        db.create_user(1, "ana", "free").await.unwrap();
        TransferOrchestrator::new(
            db,
            QuotaGate::new(PlanTable::default()),
            RemoteFileProbe::new(Client::new()),
            StreamingDownloader::new(Client::new()),
            ChatUploader::new(Arc::new(NeverTransport)),
            DriveUploader::new(Client::new()),
            dir.path().join("staging"),
        )
    }

    async fn sized_server(size: u64) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("range", "bytes=0-1"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("content-range", format!("bytes 0-1/{}", size).as_str())
                    .set_body_bytes(b"ab".to_vec()),
            )
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn cancel_only_while_awaiting_destination() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&dir).await;
        let server = sized_server(10).await;

        let mut session = orchestrator
            .prepare(1, &format!("{}/a.txt", server.uri()))
            .await
            .unwrap();
        assert_eq!(session.state, TransferState::AwaitingDestinationChoice);
        assert_eq!(session.descriptor.name, "a.txt");

        assert!(orchestrator.cancel(&mut session));
        assert_eq!(session.state, TransferState::Cancelled);
        assert!(!orchestrator.cancel(&mut session));

        let err = orchestrator
            .execute(session, Destination::Chat, 1, Arc::new(NoProgress))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
    }

    #[tokio::test]
    async fn unregistered_user_is_rejected_at_quota_check() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&dir).await;
        let server = sized_server(10).await;

        let err = orchestrator
            .prepare(99, &format!("{}/a.txt", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::UnknownUser));
    }

    #[tokio::test]
    async fn chat_is_unavailable_above_the_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&dir).await;
        orchestrator.db().set_plan(1, "unlimited").await.unwrap();
        let server = sized_server(crate::config::CHAT_FILE_LIMIT).await;

        let session = orchestrator
            .prepare(1, &format!("{}/disk.iso", server.uri()))
            .await
            .unwrap();
        assert_eq!(session.offers(), vec![Destination::Cloud]);

        let err = orchestrator
            .execute(session, Destination::Chat, 1, Arc::new(NoProgress))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::DestinationUnavailable));
        assert_eq!(
            orchestrator.db().get_user(1).await.unwrap().unwrap().monthly_used,
            0
        );
    }

    #[tokio::test]
    async fn unreadable_credential_needs_reauthorization() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&dir).await;
        orchestrator
            .db()
            .set_credential(1, Some("not json"))
            .await
            .unwrap();
        let server = sized_server(10).await;

        let session = orchestrator
            .prepare(1, &format!("{}/a.txt", server.uri()))
            .await
            .unwrap();
        let err = orchestrator
            .execute(session, Destination::Cloud, 1, Arc::new(NoProgress))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Upload(UploadError::ReauthorizationRequired(_))
        ));
    }
}

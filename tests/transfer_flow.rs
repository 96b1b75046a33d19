use futures_util::future::BoxFuture;
use reqwest::Client;
use std::path::Path;
use std::sync::{Arc, Mutex};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use linkrelay_lib::db::Database;
use linkrelay_lib::download::StreamingDownloader;
use linkrelay_lib::error::{DownloadError, TransferError, UploadError};
use linkrelay_lib::probe::RemoteFileProbe;
use linkrelay_lib::progress::NoProgress;
use linkrelay_lib::quota::{PlanLimit, PlanTable, QuotaGate};
use linkrelay_lib::transfer::{Delivery, Destination, TransferOrchestrator};
use linkrelay_lib::upload::{ChatTransport, ChatUploader, DocumentUpload, DriveUploader, MessageReceipt};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

#[derive(Default)]
struct RecordingTransport {
    documents: Mutex<Vec<(i64, String)>>,
}

impl ChatTransport for RecordingTransport {
    fn connect(&self) -> BoxFuture<'_, Result<(), UploadError>> {
        Box::pin(async { Ok(()) })
    }

    fn send_document(&self, upload: DocumentUpload) -> BoxFuture<'_, Result<MessageReceipt, UploadError>> {
        Box::pin(async move {
            upload.reporter.advance(upload.size);
            let mut documents = self.documents.lock().unwrap();
            documents.push((upload.chat_id, upload.file_name));
            Ok(MessageReceipt {
                chat_id: upload.chat_id,
                message_id: documents.len() as i64,
            })
        })
    }
}

/// Chat that refuses every document, like an oversized upload
struct RejectingTransport;

impl ChatTransport for RejectingTransport {
    fn connect(&self) -> BoxFuture<'_, Result<(), UploadError>> {
        Box::pin(async { Ok(()) })
    }

    fn send_document(&self, _upload: DocumentUpload) -> BoxFuture<'_, Result<MessageReceipt, UploadError>> {
        Box::pin(async { Err(UploadError::PlatformRejected("Request Entity Too Large".into())) })
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    staging: std::path::PathBuf,
    transport: Arc<RecordingTransport>,
    orchestrator: TransferOrchestrator,
}

async fn harness() -> Harness {
    let transport = Arc::new(RecordingTransport::default());
    harness_with(PlanTable::default(), transport.clone(), transport).await
}

async fn harness_with(
    plans: PlanTable,
    transport: Arc<RecordingTransport>,
    chat: Arc<dyn ChatTransport>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let staging = dir.path().join("downloads");
    let db = Arc::new(Database::open(&dir.path().join("relay.db")).await.unwrap());
    let orchestrator = TransferOrchestrator::new(
        db,
        QuotaGate::new(plans),
        RemoteFileProbe::new(Client::new()),
        StreamingDownloader::new(Client::new()),
        ChatUploader::new(chat),
        DriveUploader::new(Client::new()),
        staging.clone(),
    );
    Harness {
        _dir: dir,
        staging,
        transport,
        orchestrator,
    }
}

/// Source that reports `size` through a ranged request and serves `status`
/// with a short body for the actual download
async fn source(file: &str, size: u64, status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/{}", file)))
        .and(header("range", "bytes=0-1"))
        .respond_with(
            ResponseTemplate::new(206)
                .insert_header("content-range", format!("bytes 0-1/{}", size).as_str())
                .set_body_bytes(b"ab".to_vec()),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/{}", file)))
        .respond_with(ResponseTemplate::new(status).set_body_bytes(b"file-contents".to_vec()))
        .with_priority(10)
        .mount(&server)
        .await;
    server
}

/// Source that reports no size at all and serves `len` bytes
async fn unsized_source(file: &str, len: usize) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/{}", file)))
        .and(header("range", "bytes=0-1"))
        .respond_with(ResponseTemplate::new(416))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/{}", file)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; len]))
        .with_priority(10)
        .mount(&server)
        .await;
    server
}

async fn used(orchestrator: &TransferOrchestrator, user_id: i64) -> u64 {
    orchestrator
        .db()
        .get_user(user_id)
        .await
        .unwrap()
        .unwrap()
        .monthly_used
}

fn staging_is_empty(dir: &Path) -> bool {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}

#[tokio::test]
async fn chat_transfer_then_quota_denial() {
    let h = harness().await;
    h.orchestrator.db().create_user(1, "ana", "free").await.unwrap();

    let movie = source("movie.mp4", 500 * MIB, 200).await;
    let session = h
        .orchestrator
        .prepare(1, &format!("{}/movie.mp4", movie.uri()))
        .await
        .unwrap();
    assert_eq!(session.descriptor.name, "movie.mp4");
    assert_eq!(session.offers(), vec![Destination::Chat, Destination::Cloud]);

    let receipt = h
        .orchestrator
        .execute(session, Destination::Chat, 42, Arc::new(NoProgress))
        .await
        .unwrap();
    assert_eq!(receipt.size, 500 * MIB);
    assert!(matches!(receipt.delivery, Delivery::Chat(MessageReceipt { chat_id: 42, .. })));
    assert_eq!(
        h.transport.documents.lock().unwrap().as_slice(),
        &[(42, "movie.mp4".to_string())]
    );
    assert_eq!(used(&h.orchestrator, 1).await, 500 * MIB);
    assert!(staging_is_empty(&h.staging));

    let history = h.orchestrator.db().list_user_transfers(1, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].file_name, "movie.mp4");
    assert_eq!(history[0].destination, Destination::Chat);

    let big = source("big.mkv", 600 * MIB, 200).await;
    let err = h
        .orchestrator
        .prepare(1, &format!("{}/big.mkv", big.uri()))
        .await
        .unwrap_err();
    match err {
        TransferError::QuotaExceeded {
            shortfall,
            remaining,
        } => {
            assert_eq!(shortfall, 76 * MIB);
            assert_eq!(remaining, 524 * MIB);
        }
        other => panic!("expected quota denial, got {:?}", other),
    }
    assert_eq!(used(&h.orchestrator, 1).await, 500 * MIB);
    assert_eq!(h.orchestrator.db().list_user_transfers(1, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn oversized_file_is_cloud_only() {
    let h = harness().await;
    h.orchestrator.db().create_user(2, "bo", "pro").await.unwrap();
    let iso = source("disk.iso", 3 * GIB, 200).await;
    let url = format!("{}/disk.iso", iso.uri());

    let session = h.orchestrator.prepare(2, &url).await.unwrap();
    assert_eq!(session.offers(), vec![Destination::Cloud]);
    let err = h
        .orchestrator
        .execute(session, Destination::Chat, 2, Arc::new(NoProgress))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::DestinationUnavailable));

    let session = h.orchestrator.prepare(2, &url).await.unwrap();
    let err = h
        .orchestrator
        .execute(session, Destination::Cloud, 2, Arc::new(NoProgress))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Upload(UploadError::NotLinked)));

    assert_eq!(used(&h.orchestrator, 2).await, 0);
    assert!(h.transport.documents.lock().unwrap().is_empty());
    assert!(h.orchestrator.db().list_user_transfers(2, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_download_leaves_nothing_behind() {
    let h = harness().await;
    h.orchestrator.db().create_user(3, "cy", "free").await.unwrap();
    let gone = source("gone.zip", 10, 404).await;

    let session = h
        .orchestrator
        .prepare(3, &format!("{}/gone.zip", gone.uri()))
        .await
        .unwrap();
    let err = h
        .orchestrator
        .execute(session, Destination::Chat, 3, Arc::new(NoProgress))
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::Download(DownloadError::Status(404))));
    assert!(staging_is_empty(&h.staging));
    assert_eq!(used(&h.orchestrator, 3).await, 0);
    assert!(h.orchestrator.db().list_user_transfers(3, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_user_cannot_prepare() {
    let h = harness().await;
    let src = source("a.bin", 10, 200).await;
    let err = h
        .orchestrator
        .prepare(99, &format!("{}/a.bin", src.uri()))
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::UnknownUser));
}

#[tokio::test]
async fn unsized_downloads_cannot_overrun_the_plan() {
    let transport = Arc::new(RecordingTransport::default());
    let plans = PlanTable::new(vec![("tiny".to_string(), PlanLimit::Bytes(100))]);
    let h = harness_with(plans, transport.clone(), transport).await;
    h.orchestrator.db().create_user(4, "di", "tiny").await.unwrap();
    let stream = unsized_source("live.ts", 80).await;
    let url = format!("{}/live.ts", stream.uri());

    let first = h.orchestrator.prepare(4, &url).await.unwrap();
    let second = h.orchestrator.prepare(4, &url).await.unwrap();
    assert_eq!(first.descriptor.size, 0);

    let (a, b) = tokio::join!(
        h.orchestrator.execute(first, Destination::Chat, 4, Arc::new(NoProgress)),
        h.orchestrator.execute(second, Destination::Chat, 4, Arc::new(NoProgress)),
    );
    let (done, denied): (Vec<_>, Vec<_>) = [a, b].into_iter().partition(|r| r.is_ok());
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].as_ref().unwrap().size, 80);
    assert!(matches!(
        denied[0],
        Err(TransferError::QuotaExceeded { .. })
    ));

    assert_eq!(used(&h.orchestrator, 4).await, 80);
    assert_eq!(h.transport.documents.lock().unwrap().len(), 1);
    assert_eq!(h.orchestrator.db().list_user_transfers(4, 10).await.unwrap().len(), 1);
    assert!(staging_is_empty(&h.staging));
}

#[tokio::test]
async fn rejected_upload_releases_everything() {
    let h = harness_with(
        PlanTable::default(),
        Arc::new(RecordingTransport::default()),
        Arc::new(RejectingTransport),
    )
    .await;
    h.orchestrator.db().create_user(5, "ed", "free").await.unwrap();
    let big = source("huge.bin", 900 * MIB, 200).await;

    let session = h
        .orchestrator
        .prepare(5, &format!("{}/huge.bin", big.uri()))
        .await
        .unwrap();
    let err = h
        .orchestrator
        .execute(session, Destination::Chat, 5, Arc::new(NoProgress))
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::Upload(UploadError::PlatformRejected(_))));
    assert_eq!(used(&h.orchestrator, 5).await, 0);
    assert!(staging_is_empty(&h.staging));
    assert!(h.orchestrator.db().list_user_transfers(5, 10).await.unwrap().is_empty());

    // The 900 MiB hold is gone, so a full-plan reservation fits again
    let reservation = h
        .orchestrator
        .quota()
        .reserve(h.orchestrator.db(), 5, GIB)
        .await
        .unwrap();
    assert_eq!(reservation.bytes(), GIB);
}

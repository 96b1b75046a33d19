//! Chat front end: long polling, commands, and destination callbacks

mod callbacks;
mod commands;
pub mod messages;
mod progress;

use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::Config;
use crate::oauth::GoogleOAuth;
use crate::telegram::{BotApi, Update};
use crate::transfer::{TransferOrchestrator, TransferSession};

pub use commands::{parse_command, Command};
pub use progress::MessageProgress;

const POLL_TIMEOUT_SECS: u64 = 30;
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);
const ROLLOVER_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// A probed link waiting for the user to pick a destination
pub(crate) struct PendingTransfer {
    pub session: TransferSession,
    pub chat_id: i64,
    /// Message carrying the destination keyboard
    pub message_id: i64,
}

pub struct Bot {
    api: BotApi,
    orchestrator: TransferOrchestrator,
    oauth: Option<GoogleOAuth>,
    config: Config,
    pending: Mutex<HashMap<i64, PendingTransfer>>,
    awaiting_auth: Mutex<HashSet<i64>>,
}

fn relock<'a, T>(result: Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>) -> MutexGuard<'a, T> {
    result.unwrap_or_else(PoisonError::into_inner)
}

impl Bot {
    pub fn new(
        api: BotApi,
        orchestrator: TransferOrchestrator,
        oauth: Option<GoogleOAuth>,
        config: Config,
    ) -> Self {
        Self {
            api,
            orchestrator,
            oauth,
            config,
            pending: Mutex::new(HashMap::new()),
            awaiting_auth: Mutex::new(HashSet::new()),
        }
    }

    /// Poll for updates until the process exits. Each update is handled on
    /// its own task so a long transfer never blocks other users.
    pub async fn run(self: Arc<Self>) {
        self.spawn_rollover();

        // Skip whatever queued up while the bot was offline
        let mut offset = match self.api.get_updates(-1, 0).await {
            Ok(updates) => updates.last().map(|u| u.update_id + 1).unwrap_or(0),
            Err(e) => {
                warn!("updates_flush_failed: {}", e);
                0
            }
        };
        info!("bot_polling: offset={}", offset);

        loop {
            match self.api.get_updates(offset, POLL_TIMEOUT_SECS).await {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        let bot = self.clone();
                        tokio::spawn(async move { bot.handle_update(update).await });
                    }
                }
                Err(e) => {
                    warn!("poll_failed: {}", e);
                    tokio::time::sleep(POLL_RETRY_DELAY).await;
                }
            }
        }
    }

    fn spawn_rollover(self: &Arc<Self>) {
        let bot = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ROLLOVER_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                match bot.orchestrator.db().reset_stale_usage(chrono::Utc::now()).await {
                    Ok(0) => debug!("usage_rollover: nothing to reset"),
                    Ok(count) => info!("usage_rollover: reset {} users", count),
                    Err(e) => warn!("usage_rollover_failed: {}", e),
                }
            }
        });
    }

    pub async fn handle_update(self: Arc<Self>, update: Update) {
        let id = update.update_id;
        let result = if let Some(query) = update.callback_query {
            self.handle_callback(query).await
        } else if let Some(message) = update.message {
            self.handle_message(message).await
        } else {
            Ok(())
        };
        if let Err(e) = result {
            error!("update_failed: {} error={}", id, e);
        }
    }

    fn is_admin(&self, user_id: i64) -> bool {
        self.config.is_admin(user_id)
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<i64, PendingTransfer>> {
        relock(self.pending.lock())
    }

    fn awaiting_auth(&self) -> MutexGuard<'_, HashSet<i64>> {
        relock(self.awaiting_auth.lock())
    }

    /// Park a prepared session; any session it replaces is cancelled
    fn park(&self, user_id: i64, transfer: PendingTransfer) {
        if let Some(mut replaced) = self.pending().insert(user_id, transfer) {
            self.orchestrator.cancel(&mut replaced.session);
        }
    }
}

type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::db::Database;
    use crate::download::StreamingDownloader;
    use crate::error::UploadError;
    use crate::probe::RemoteFileProbe;
    use crate::quota::QuotaGate;
    use crate::upload::{ChatTransport, ChatUploader, DocumentUpload, DriveUploader, MessageReceipt};
    use futures_util::future::BoxFuture;
    use reqwest::Client;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub const ADMIN: i64 = 1000;

    pub struct EchoTransport;

    impl ChatTransport for EchoTransport {
        fn connect(&self) -> BoxFuture<'_, Result<(), UploadError>> {
            Box::pin(async { Ok(()) })
        }

        fn send_document(
            &self,
            upload: DocumentUpload,
        ) -> BoxFuture<'_, Result<MessageReceipt, UploadError>> {
            Box::pin(async move {
                upload.reporter.advance(upload.size);
                Ok(MessageReceipt {
                    chat_id: upload.chat_id,
                    message_id: 1,
                })
            })
        }
    }

    /// Bot API stub answering every call with a generic message
    pub async fn api_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bott/answerCallbackQuery"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true, "result": true})),
            )
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ok": true,
                "result": {"message_id": 55, "chat": {"id": 1}}
            })))
            .mount(&server)
            .await;
        server
    }

    pub async fn bot(dir: &tempfile::TempDir, server: &MockServer, oauth: Option<GoogleOAuth>) -> Arc<Bot> {
        let lookup = |key: &str| match key {
            "BOT_TOKEN" => Some("t".to_string()),
            "ADMIN_IDS" => Some(ADMIN.to_string()),
            _ => None,
        };
        let mut config = Config::from_lookup(lookup).unwrap();
        config.download_dir = dir.path().join("staging");

        let db = Arc::new(Database::open(&dir.path().join("bot.db")).await.unwrap());
        let orchestrator = TransferOrchestrator::new(
            db,
            QuotaGate::new(config.plans.clone()),
            RemoteFileProbe::new(Client::new()),
            StreamingDownloader::new(Client::new()),
            ChatUploader::new(Arc::new(EchoTransport)),
            DriveUploader::new(Client::new()),
            config.download_dir.clone(),
        );
        let api = BotApi::new(Client::new(), &server.uri(), &server.uri(), "t");
        Arc::new(Bot::new(api, orchestrator, oauth, config))
    }

    /// Bodies of every Bot API call made so far
    pub async fn sent_texts(server: &MockServer) -> Vec<String> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .map(|r| String::from_utf8_lossy(&r.body).into_owned())
            .collect()
    }
}

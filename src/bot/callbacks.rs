//! Inline keyboard callbacks: destination choice, cancel, login and admin menu

use log::{debug, info, warn};
use std::time::Duration;

use super::messages::{
    self, CANCELLED, CB_ADMIN_PLANS, CB_ADMIN_RESET, CB_ADMIN_RESET_CONFIRM, CB_ADMIN_STATS,
    CB_ADMIN_USERS, CB_CANCEL, CB_DEST_CHAT, CB_DEST_CLOUD, CB_LOGIN, EXPIRED, NOT_ADMIN,
};
use super::{Bot, HandlerResult, MessageProgress, PendingTransfer};
use crate::telegram::CallbackQuery;
use crate::transfer::Destination;

/// Longest wait for the last progress edit after a transfer ends
const EDITOR_DRAIN: Duration = Duration::from_secs(10);

impl Bot {
    pub(super) async fn handle_callback(&self, query: CallbackQuery) -> HandlerResult {
        if let Err(e) = self.api.answer_callback_query(&query.id, None).await {
            debug!("callback_answer_failed: {} error={}", query.id, e);
        }
        let Some(message) = query.message.as_ref() else {
            return Ok(());
        };
        let data = query.data.as_deref().unwrap_or_default();
        let user_id = query.from.id;
        let chat_id = message.chat.id;
        let message_id = message.message_id;

        match data {
            CB_CANCEL => {
                if let Some(mut pending) = self.take_pending(user_id, message_id) {
                    self.orchestrator.cancel(&mut pending.session);
                }
                self.api
                    .edit_message_text(chat_id, message_id, CANCELLED, None)
                    .await?;
                Ok(())
            }
            CB_DEST_CHAT => {
                self.start_transfer(user_id, chat_id, message_id, Destination::Chat)
                    .await
            }
            CB_DEST_CLOUD => {
                self.start_transfer(user_id, chat_id, message_id, Destination::Cloud)
                    .await
            }
            CB_LOGIN => self.send_login(user_id, chat_id).await,
            admin if admin.starts_with("admin:") => {
                if !self.is_admin(user_id) {
                    self.api
                        .edit_message_text(chat_id, message_id, NOT_ADMIN, None)
                        .await?;
                    return Ok(());
                }
                self.handle_admin(admin, chat_id, message_id).await
            }
            other => {
                debug!("callback_unknown: {} data={}", user_id, other);
                Ok(())
            }
        }
    }

    async fn handle_admin(&self, data: &str, chat_id: i64, message_id: i64) -> HandlerResult {
        let db = self.orchestrator.db();
        let (text, keyboard) = match data {
            CB_ADMIN_USERS => (messages::user_list(&db.list_users().await?), None),
            CB_ADMIN_STATS => (
                messages::statistics(&db.aggregate_statistics().await?),
                None,
            ),
            CB_ADMIN_PLANS => (messages::plan_help(&self.config.plans), None),
            CB_ADMIN_RESET => {
                let (text, keyboard) = messages::reset_confirm();
                (text.to_string(), Some(keyboard))
            }
            CB_ADMIN_RESET_CONFIRM => {
                let count = db.reset_usage(None).await?;
                info!("usage_reset: all count={}", count);
                (messages::reset_done(count), None)
            }
            _ => return Ok(()),
        };
        self.api
            .edit_message_text(chat_id, message_id, &text, keyboard.as_ref())
            .await?;
        Ok(())
    }

    /// Remove the user's pending transfer if it belongs to `message_id`
    fn take_pending(&self, user_id: i64, message_id: i64) -> Option<PendingTransfer> {
        let mut pending = self.pending();
        match pending.get(&user_id) {
            Some(entry) if entry.message_id == message_id => pending.remove(&user_id),
            _ => None,
        }
    }

    async fn start_transfer(
        &self,
        user_id: i64,
        chat_id: i64,
        message_id: i64,
        destination: Destination,
    ) -> HandlerResult {
        let Some(pending) = self.take_pending(user_id, message_id) else {
            self.api
                .edit_message_text(chat_id, message_id, EXPIRED, None)
                .await?;
            return Ok(());
        };
        let chat_id = pending.chat_id;

        self.api
            .edit_message_text(
                chat_id,
                message_id,
                &messages::transfer_starting(destination),
                None,
            )
            .await?;
        let status = self
            .api
            .send_message(chat_id, "⏳ Downloading...", None)
            .await?;

        let (sink, mut editor) =
            MessageProgress::spawn(self.api.clone(), chat_id, status.message_id, destination);
        let result = self
            .orchestrator
            .execute(pending.session, destination, chat_id, sink)
            .await;
        if tokio::time::timeout(EDITOR_DRAIN, &mut editor).await.is_err() {
            editor.abort();
        }

        let (text, keyboard) = match &result {
            Ok(receipt) => (messages::transfer_done(receipt), None),
            Err(e) => {
                warn!("transfer_failed: user={} error={}", user_id, e);
                (messages::transfer_failed(e), messages::failure_keyboard(e))
            }
        };
        self.api
            .edit_message_text(chat_id, status.message_id, &text, keyboard.as_ref())
            .await?;
        Ok(())
    }
}

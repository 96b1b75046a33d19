//! Progress sink that edits a chat message

use log::debug;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::messages;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::telegram::BotApi;
use crate::transfer::Destination;

/// Forwards events to a background editor; only the latest event is kept,
/// so a slow Bot API never stalls the transfer
pub struct MessageProgress {
    tx: watch::Sender<Option<ProgressEvent>>,
}

impl ProgressSink for MessageProgress {
    fn report(&self, event: ProgressEvent) {
        if self.tx.send(Some(event)).is_err() {
            debug!("progress_dropped: editor gone");
        }
    }
}

impl MessageProgress {
    /// Start the editor for `message_id`. It exits once every handle to the
    /// returned sink has been dropped.
    pub fn spawn(
        api: BotApi,
        chat_id: i64,
        message_id: i64,
        destination: Destination,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, mut rx) = watch::channel(None);
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let event = *rx.borrow_and_update();
                let Some(event) = event else { continue };
                let text = messages::progress(destination, &event);
                if let Err(e) = api.edit_message_text(chat_id, message_id, &text, None).await {
                    debug!("progress_edit_failed: chat={} error={}", chat_id, e);
                }
            }
        });
        (Arc::new(Self { tx }), handle)
    }
}

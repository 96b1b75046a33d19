use futures_util::future::BoxFuture;
use log::{debug, info};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use super::types::{ApiResponse, InlineKeyboardMarkup, Message, Update, User};
use crate::error::UploadError;
use crate::progress::ProgressReporter;
use crate::upload::{counting_body, ChatTransport, DocumentUpload, MessageReceipt};

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("Bot API request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Bot API error {code}: {description}")]
    Api { code: i64, description: String },

    #[error("Bot API returned no result")]
    EmptyResult,
}

impl TelegramError {
    fn describes(&self, needle: &str) -> bool {
        match self {
            TelegramError::Api { description, .. } => {
                description.to_ascii_lowercase().contains(needle)
            }
            _ => false,
        }
    }
}

impl From<TelegramError> for UploadError {
    fn from(err: TelegramError) -> Self {
        match &err {
            TelegramError::Api { code: 413, .. } => UploadError::PlatformRejected(err.to_string()),
            _ if err.describes("too big") || err.describes("too large") => {
                UploadError::PlatformRejected(err.to_string())
            }
            _ => UploadError::Other(err.to_string()),
        }
    }
}

/// Bot API endpoints for one bot token.
///
/// Documents go to `upload_base`, which may point at a self-hosted Bot API
/// server that accepts files up to the 2 GiB ceiling.
#[derive(Debug, Clone)]
pub struct BotApi {
    client: Client,
    base: String,
    upload_base: String,
}

impl BotApi {
    pub fn new(client: Client, api_url: &str, upload_api_url: &str, token: &str) -> Self {
        Self {
            client,
            base: format!("{}/bot{}", api_url.trim_end_matches('/'), token),
            upload_base: format!("{}/bot{}", upload_api_url.trim_end_matches('/'), token),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<T, TelegramError> {
        let mut request = self
            .client
            .post(format!("{}/{}", self.base, method))
            .json(&payload);
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }
        parse_response(request.send().await?).await
    }

    pub async fn get_me(&self) -> Result<User, TelegramError> {
        self.call("getMe", json!({}), None).await
    }

    /// Long-poll for updates after `offset`
    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>, TelegramError> {
        self.call(
            "getUpdates",
            json!({
                "offset": offset,
                "timeout": timeout_secs,
                "allowed_updates": ["message", "callback_query"],
            }),
            Some(Duration::from_secs(timeout_secs + 10)),
        )
        .await
    }

    pub async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        markup: Option<&InlineKeyboardMarkup>,
    ) -> Result<Message, TelegramError> {
        let mut payload = json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        if let Some(markup) = markup {
            payload["reply_markup"] = serde_json::to_value(markup).unwrap_or_default();
        }
        self.call("sendMessage", payload, None).await
    }

    /// Replace a message's text; an unchanged text is not an error
    pub async fn edit_message_text(
        &self,
        chat_id: i64,
        message_id: i64,
        text: &str,
        markup: Option<&InlineKeyboardMarkup>,
    ) -> Result<(), TelegramError> {
        let mut payload = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        if let Some(markup) = markup {
            payload["reply_markup"] = serde_json::to_value(markup).unwrap_or_default();
        }
        match self
            .call::<serde_json::Value>("editMessageText", payload, None)
            .await
        {
            Err(e) if e.describes("message is not modified") => Ok(()),
            other => other.map(|_| ()),
        }
    }

    pub async fn answer_callback_query(&self, id: &str, text: Option<&str>) -> Result<(), TelegramError> {
        let mut payload = json!({ "callback_query_id": id });
        if let Some(text) = text {
            payload["text"] = json!(text);
        }
        self.call::<bool>("answerCallbackQuery", payload, None)
            .await
            .map(|_| ())
    }

    /// Stream a file from disk as a document
    pub async fn send_document(
        &self,
        chat_id: i64,
        path: &Path,
        file_name: &str,
        size: u64,
        caption: &str,
        reporter: ProgressReporter,
    ) -> Result<Message, TelegramError> {
        let file = tokio::fs::File::open(path).await.map_err(|e| TelegramError::Api {
            code: 0,
            description: format!("cannot open {}: {}", path.display(), e),
        })?;
        let part = Part::stream_with_length(counting_body(file, reporter, 0), size)
            .file_name(file_name.to_string())
            .mime_str("application/octet-stream")?;
        let form = Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", caption.to_string())
            .part("document", part);

        debug!("send_document_start: chat={} bytes={}", chat_id, size);
        let response = self
            .client
            .post(format!("{}/sendDocument", self.upload_base))
            .multipart(form)
            .send()
            .await?;
        parse_response(response).await
    }
}

async fn parse_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, TelegramError> {
    let status = response.status();
    let text = response.text().await?;
    match serde_json::from_str::<ApiResponse<T>>(&text) {
        Ok(body) if body.ok => body.result.ok_or(TelegramError::EmptyResult),
        Ok(body) => Err(TelegramError::Api {
            code: body.error_code.unwrap_or(status.as_u16() as i64),
            description: body.description.unwrap_or_default(),
        }),
        // Proxies in front of a local Bot API server answer with HTML
        Err(_) => Err(TelegramError::Api {
            code: status.as_u16() as i64,
            description: text.chars().take(200).collect(),
        }),
    }
}

impl ChatTransport for BotApi {
    fn connect(&self) -> BoxFuture<'_, Result<(), UploadError>> {
        Box::pin(async move {
            let me = self.get_me().await?;
            info!(
                "bot_connected: id={} username={}",
                me.id,
                me.username.as_deref().unwrap_or("-")
            );
            Ok(())
        })
    }

    fn send_document(&self, upload: DocumentUpload) -> BoxFuture<'_, Result<MessageReceipt, UploadError>> {
        Box::pin(async move {
            let message = BotApi::send_document(
                self,
                upload.chat_id,
                &upload.path,
                &upload.file_name,
                upload.size,
                &upload.caption,
                upload.reporter,
            )
            .await?;
            Ok(MessageReceipt {
                chat_id: message.chat.id,
                message_id: message.message_id,
            })
        })
    }
}

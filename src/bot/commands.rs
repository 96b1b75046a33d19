//! Slash commands and free-text messages

use log::{info, warn};

use super::{messages, Bot, HandlerResult, PendingTransfer};
use crate::oauth::RedirectCode;
use crate::probe::parse_source_url;
use crate::telegram::{Message, User};

const STATUS_HISTORY: i64 = 5;
const HISTORY_LIMIT: i64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Status,
    History,
    Login,
    Logout,
    Admin,
    SetPlan(Vec<String>),
    Reset(Vec<String>),
    Unknown(String),
}

/// Parse `/name[@bot] args...`; `None` when the text is not a command
pub fn parse_command(text: &str) -> Option<Command> {
    let mut words = text.trim().split_whitespace();
    let head = words.next()?.strip_prefix('/')?;
    let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();
    let args: Vec<String> = words.map(str::to_string).collect();

    Some(match name.as_str() {
        "start" => Command::Start,
        "help" => Command::Help,
        "status" => Command::Status,
        "history" => Command::History,
        "login" => Command::Login,
        "logout" => Command::Logout,
        "admin" => Command::Admin,
        "setplan" => Command::SetPlan(args),
        "reset" => Command::Reset(args),
        _ => Command::Unknown(name),
    })
}

impl Bot {
    pub(super) async fn handle_message(&self, message: Message) -> HandlerResult {
        let (Some(user), Some(text)) = (message.from.as_ref(), message.text.as_deref()) else {
            return Ok(());
        };
        let chat_id = message.chat.id;

        match parse_command(text) {
            Some(command) => self.handle_command(command, user, chat_id).await,
            None => self.handle_text(text, user, chat_id).await,
        }
    }

    async fn reply(&self, chat_id: i64, text: &str) -> HandlerResult {
        self.api.send_message(chat_id, text, None).await?;
        Ok(())
    }

    async fn handle_command(&self, command: Command, user: &User, chat_id: i64) -> HandlerResult {
        let db = self.orchestrator.db();
        match command {
            Command::Start => {
                let name = user.display_name();
                if db.create_user(user.id, &name, &self.config.default_plan).await? {
                    info!("user_registered: {} plan={}", user.id, self.config.default_plan);
                }
                self.reply(chat_id, &messages::welcome(&name, self.is_admin(user.id)))
                    .await
            }
            Command::Help => self.reply(chat_id, messages::help()).await,
            Command::Status => {
                let Some(record) = db.get_user(user.id).await? else {
                    return self.reply(chat_id, messages::USER_NOT_FOUND).await;
                };
                let usage = self.orchestrator.quota().usage_of(&record);
                let recent = db.list_user_transfers(user.id, STATUS_HISTORY).await?;
                self.reply(chat_id, &messages::status(&record, &usage, &recent))
                    .await
            }
            Command::History => {
                let records = db.list_user_transfers(user.id, HISTORY_LIMIT).await?;
                self.reply(chat_id, &messages::history(&records)).await
            }
            Command::Login => self.send_login(user.id, chat_id).await,
            Command::Logout => {
                if db.get_user(user.id).await?.is_none() {
                    return self.reply(chat_id, messages::USER_NOT_FOUND).await;
                }
                db.set_credential(user.id, None).await?;
                self.awaiting_auth().remove(&user.id);
                info!("drive_unlinked: {}", user.id);
                self.reply(chat_id, messages::LOGGED_OUT).await
            }
            Command::Admin => {
                if !self.is_admin(user.id) {
                    return self.reply(chat_id, messages::NOT_ADMIN).await;
                }
                let (text, keyboard) = messages::admin_menu();
                self.api.send_message(chat_id, text, Some(&keyboard)).await?;
                Ok(())
            }
            Command::SetPlan(args) => {
                if !self.is_admin(user.id) {
                    return self.reply(chat_id, messages::NOT_ADMIN).await;
                }
                self.set_plan(&args, chat_id).await
            }
            Command::Reset(args) => {
                if !self.is_admin(user.id) {
                    return self.reply(chat_id, messages::NOT_ADMIN).await;
                }
                let target = match args.first() {
                    Some(raw) => match raw.parse::<i64>() {
                        Ok(id) => Some(id),
                        Err(_) => return self.reply(chat_id, "❌ Usage: /reset [user_id]").await,
                    },
                    None => None,
                };
                let count = db.reset_usage(target).await?;
                info!("usage_reset: by={} target={:?} count={}", user.id, target, count);
                self.reply(chat_id, &messages::reset_done(count)).await
            }
            Command::Unknown(_) => self.reply(chat_id, "❓ Unknown command. See /help.").await,
        }
    }

    async fn set_plan(&self, args: &[String], chat_id: i64) -> HandlerResult {
        let plans = &self.config.plans;
        let (Some(target), Some(plan)) = (
            args.first().and_then(|raw| raw.parse::<i64>().ok()),
            args.get(1),
        ) else {
            return self.reply(chat_id, &messages::plan_help(plans)).await;
        };
        if plans.limit(plan).is_none() {
            return self.reply(chat_id, &messages::plan_help(plans)).await;
        }
        if !self.orchestrator.db().set_plan(target, plan).await? {
            return self.reply(chat_id, messages::USER_NOT_FOUND).await;
        }
        info!("plan_changed: {} plan={}", target, plan);
        self.reply(chat_id, &format!("✅ User {} is now on the {} plan.", target, plan))
            .await
    }

    /// Send the consent link and remember that a redirect is expected
    pub(super) async fn send_login(&self, user_id: i64, chat_id: i64) -> HandlerResult {
        let Some(oauth) = &self.oauth else {
            return self.reply(chat_id, messages::LOGIN_UNAVAILABLE).await;
        };
        let Some(record) = self.orchestrator.db().get_user(user_id).await? else {
            return self.reply(chat_id, messages::USER_NOT_FOUND).await;
        };
        if record.drive_credential.is_some() {
            return self.reply(chat_id, messages::ALREADY_LINKED).await;
        }

        let auth_url = oauth.build_authorization_url(user_id)?;
        self.awaiting_auth().insert(user_id);
        self.api
            .send_message(
                chat_id,
                &messages::login_instructions(&self.config.redirect_uri),
                Some(&messages::login_keyboard(&auth_url)),
            )
            .await?;
        Ok(())
    }

    async fn handle_text(&self, text: &str, user: &User, chat_id: i64) -> HandlerResult {
        if let Some(redirect) = self.oauth.as_ref().and_then(|o| o.parse_redirect(text)) {
            return self.link_drive(redirect, user.id, chat_id).await;
        }
        self.offer_link(text, user.id, chat_id).await
    }

    async fn link_drive(&self, redirect: RedirectCode, user_id: i64, chat_id: i64) -> HandlerResult {
        let Some(oauth) = &self.oauth else {
            return Ok(());
        };
        let awaiting = self.awaiting_auth().contains(&user_id);
        if !awaiting {
            return self.reply(chat_id, messages::NOT_AWAITING_AUTH).await;
        }
        let state_user = redirect.state.as_deref().and_then(|s| oauth.verify_state(s));
        if state_user != Some(user_id) {
            warn!("oauth_state_mismatch: {} state_user={:?}", user_id, state_user);
            return self.reply(chat_id, messages::STATE_MISMATCH).await;
        }

        let status = self.api.send_message(chat_id, messages::LINKING, None).await?;
        let linked = match oauth.exchange_code(&redirect.code).await {
            Ok(credential) => credential.to_json().map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        let text = match linked {
            Ok(json) => {
                self.orchestrator
                    .db()
                    .set_credential(user_id, Some(&json))
                    .await?;
                self.awaiting_auth().remove(&user_id);
                info!("drive_linked: {}", user_id);
                messages::LINKED.to_string()
            }
            Err(e) => {
                warn!("drive_link_failed: {} error={}", user_id, e);
                messages::link_failed(&e)
            }
        };
        self.api
            .edit_message_text(chat_id, status.message_id, &text, None)
            .await?;
        Ok(())
    }

    /// Probe a pasted link and offer destinations for it
    async fn offer_link(&self, text: &str, user_id: i64, chat_id: i64) -> HandlerResult {
        let Some(url) = parse_source_url(text) else {
            return self.reply(chat_id, messages::INVALID_LINK).await;
        };
        if self.orchestrator.db().get_user(user_id).await?.is_none() {
            return self.reply(chat_id, messages::USER_NOT_FOUND).await;
        }

        let status = self.api.send_message(chat_id, messages::CHECKING, None).await?;
        match self.orchestrator.prepare(user_id, url.as_str()).await {
            Ok(session) => {
                let offers = session.offers();
                self.api
                    .edit_message_text(
                        chat_id,
                        status.message_id,
                        &messages::file_info(&session.descriptor, &offers),
                        Some(&messages::destination_keyboard(&offers)),
                    )
                    .await?;
                self.park(
                    user_id,
                    PendingTransfer {
                        session,
                        chat_id,
                        message_id: status.message_id,
                    },
                );
            }
            Err(e) => {
                self.api
                    .edit_message_text(chat_id, status.message_id, &messages::transfer_failed(&e), None)
                    .await?;
            }
        }
        Ok(())
    }
}

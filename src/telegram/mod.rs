//! Minimal Telegram Bot API client

mod client;
pub mod types;

pub use client::{BotApi, TelegramError};
pub use types::{CallbackQuery, Chat, InlineKeyboardButton, InlineKeyboardMarkup, Message, Update, User};

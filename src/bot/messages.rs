//! User-facing texts and keyboards

use crate::db::{Statistics, TransferRecord, UserRecord};
use crate::error::{TransferError, UploadError};
use crate::format::{format_rate, format_size};
use crate::probe::FileDescriptor;
use crate::progress::{Phase, ProgressEvent};
use crate::quota::{PlanLimit, PlanTable, Usage};
use crate::telegram::{InlineKeyboardButton, InlineKeyboardMarkup};
use crate::transfer::{Delivery, Destination, TransferReceipt};

/// Users shown in the admin list
pub const ADMIN_USER_PAGE: usize = 20;

pub const CB_CANCEL: &str = "cancel";
pub const CB_LOGIN: &str = "login";
pub const CB_DEST_CHAT: &str = "dest:chat";
pub const CB_DEST_CLOUD: &str = "dest:cloud";
pub const CB_ADMIN_USERS: &str = "admin:users";
pub const CB_ADMIN_PLANS: &str = "admin:plans";
pub const CB_ADMIN_RESET: &str = "admin:reset";
pub const CB_ADMIN_RESET_CONFIRM: &str = "admin:reset_confirm";
pub const CB_ADMIN_STATS: &str = "admin:stats";

pub const USER_NOT_FOUND: &str = "❌ User not found. Send /start first.";
pub const NOT_ADMIN: &str = "❌ You are not allowed to use this command.";
pub const INVALID_LINK: &str = "❌ Invalid link. Send a valid direct download link.";
pub const CHECKING: &str = "🔍 Checking file information...";
pub const EXPIRED: &str = "❌ File information expired. Send the link again.";
pub const CANCELLED: &str = "❌ Cancelled.";

fn destination_label(destination: Destination) -> &'static str {
    match destination {
        Destination::Chat => "Telegram",
        Destination::Cloud => "Google Drive",
    }
}

fn limit_text(limit: PlanLimit) -> String {
    match limit {
        PlanLimit::Bytes(bytes) => format_size(bytes),
        PlanLimit::Unlimited => "Unlimited".to_string(),
    }
}

pub fn welcome(name: &str, is_admin: bool) -> String {
    let mut text = format!(
        "🎉 Welcome {}!\n\n\
         This bot fetches files from direct download links and uploads them to Telegram or Google Drive.\n\n\
         📌 Commands:\n\
         /start - start the bot\n\
         /help - show help\n\
         /status - show your quota\n\
         /history - recent transfers\n\
         /login - link Google Drive\n\
         /logout - unlink Google Drive\n\n\
         📥 Just send a direct download link.\n\n\
         • Under 2 GB: Telegram or Google Drive\n\
         • 2 GB and above: Google Drive only",
        name
    );
    if is_admin {
        text.push_str("\n\n👑 You are an admin. Use /admin.");
    }
    text
}

pub fn help() -> &'static str {
    "📖 Help\n\n\
     🔹 How to use:\n\
     1. Send a direct download link\n\
     2. Check the file name and size\n\
     3. Pick where to upload it\n\n\
     🔹 File size:\n\
     • Under 2 GB: Telegram + Google Drive\n\
     • 2 GB and above: Google Drive only\n\n\
     🔹 Monthly quota:\n\
     Each plan has a monthly transfer quota. See /status.\n\n\
     🔹 Google Drive:\n\
     Link your account with /login before uploading to Drive."
}

pub fn status(user: &UserRecord, usage: &Usage, recent: &[TransferRecord]) -> String {
    let remaining = match usage.limit.remaining(usage.used) {
        Some(bytes) => format_size(bytes),
        None => "Unlimited".to_string(),
    };
    let mut text = format!(
        "📊 Your status\n\n\
         👤 User: {}\n\
         📦 Plan: {}\n\
         📈 Monthly limit: {}\n\
         📊 Used: {}\n\
         ✅ Remaining: {}\n\n\
         🔄 Resets on the 1st of every month\n\n\
         🔗 Google Drive: {}",
        user.name,
        user.plan,
        limit_text(usage.limit),
        format_size(usage.used),
        remaining,
        if user.drive_credential.is_some() {
            "✅ linked"
        } else {
            "❌ not linked"
        }
    );
    if !recent.is_empty() {
        text.push_str("\n\n🕘 Recent transfers:\n");
        text.push_str(&history_lines(recent));
    }
    text
}

pub fn history(records: &[TransferRecord]) -> String {
    if records.is_empty() {
        return "📭 No transfers yet.".to_string();
    }
    format!("🕘 Recent transfers:\n{}", history_lines(records))
}

fn history_lines(records: &[TransferRecord]) -> String {
    records
        .iter()
        .map(|r| {
            let date = chrono::DateTime::<chrono::Utc>::from_timestamp(r.created_at, 0)
                .map(|t| t.format("%Y-%m-%d").to_string())
                .unwrap_or_default();
            format!(
                "• {} ({}) → {} {}",
                r.file_name,
                format_size(r.file_size),
                destination_label(r.destination),
                date
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn file_info(descriptor: &FileDescriptor, offers: &[Destination]) -> String {
    let size = if descriptor.size_known() {
        format_size(descriptor.size)
    } else {
        "unknown".to_string()
    };
    let mut text = format!(
        "📁 File information\n\n📝 Name: {}\n📊 Size: {}\n\n📥 Choose where to upload:",
        descriptor.name, size
    );
    if !offers.contains(&Destination::Chat) {
        text.push_str("\n\n⚠️ The file is 2 GB or larger and can only be uploaded to Google Drive.");
    }
    if !descriptor.size_known() {
        text.push_str("\n\nℹ️ The server did not report a size; progress will show bytes only.");
    }
    text
}

pub fn destination_keyboard(offers: &[Destination]) -> InlineKeyboardMarkup {
    let mut buttons: Vec<InlineKeyboardButton> = offers
        .iter()
        .map(|destination| match destination {
            Destination::Chat => InlineKeyboardButton::callback("📤 Upload to Telegram", CB_DEST_CHAT),
            Destination::Cloud => {
                InlineKeyboardButton::callback("☁️ Upload to Google Drive", CB_DEST_CLOUD)
            }
        })
        .collect();
    buttons.push(InlineKeyboardButton::callback("❌ Cancel", CB_CANCEL));
    InlineKeyboardMarkup::column(buttons)
}

pub fn transfer_starting(destination: Destination) -> String {
    format!("📥 Starting upload to {}...", destination_label(destination))
}

pub fn progress(destination: Destination, event: &ProgressEvent) -> String {
    let heading = match event.phase {
        Phase::Download => "⏳ Downloading...".to_string(),
        Phase::Upload => format!("⏳ Uploading to {}...", destination_label(destination)),
    };
    let amount = if event.bytes_total > 0 {
        format!(
            "{} / {}",
            format_size(event.bytes_done),
            format_size(event.bytes_total)
        )
    } else {
        format_size(event.bytes_done)
    };
    match event.percent() {
        Some(percent) => format!(
            "{} {}%\n📊 {}\n⚡ Speed: {}",
            heading,
            percent,
            amount,
            format_rate(event.rate)
        ),
        None => format!("{}\n📊 {}\n⚡ Speed: {}", heading, amount, format_rate(event.rate)),
    }
}

fn average_rate(bytes: u64, elapsed: std::time::Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 / secs
    } else {
        0.0
    }
}

pub fn transfer_done(receipt: &TransferReceipt) -> String {
    let speeds = format!(
        "📥 Download speed: {}\n📤 Upload speed: {}",
        format_rate(average_rate(receipt.size, receipt.download_time)),
        format_rate(average_rate(receipt.size, receipt.upload_time))
    );
    match &receipt.delivery {
        Delivery::Chat(_) => format!(
            "✅ Uploaded to Telegram!\n\n📁 {} ({})\n{}",
            receipt.file_name,
            format_size(receipt.size),
            speeds
        ),
        Delivery::Cloud { link } => format!(
            "✅ Uploaded to Google Drive!\n\n📁 {} ({})\n🔗 Link: {}\n{}",
            receipt.file_name,
            format_size(receipt.size),
            link,
            speeds
        ),
    }
}

/// Message for a failed session; each failure kind gets its own guidance
pub fn transfer_failed(err: &TransferError) -> String {
    match err {
        TransferError::UnknownUser => USER_NOT_FOUND.to_string(),
        TransferError::Probe(e) => format!("❌ Could not get file information:\n{}", e),
        TransferError::QuotaExceeded {
            shortfall,
            remaining,
        } => {
            let remaining = if *remaining == u64::MAX {
                "Unlimited".to_string()
            } else {
                format_size(*remaining)
            };
            format!(
                "❌ Monthly quota exceeded!\n\n📊 Remaining: {}\n📦 Needed: {} more\n\nWait for the monthly reset or ask an admin for a larger plan.",
                remaining,
                format_size(*shortfall)
            )
        }
        TransferError::DestinationUnavailable => {
            "❌ That destination is not available for this file.".to_string()
        }
        TransferError::Cancelled => CANCELLED.to_string(),
        TransferError::Download(e) => format!("❌ Download failed:\n{}\n\nSend the link again to retry.", e),
        TransferError::Upload(UploadError::NotLinked) => {
            "❌ Google Drive is not linked.\n\nLink your account with /login first.".to_string()
        }
        TransferError::Upload(UploadError::ReauthorizationRequired(_)) => {
            "❌ Google Drive access has expired or was revoked.\n\nRun /logout, then /login again to reconnect.".to_string()
        }
        TransferError::Upload(UploadError::PlatformRejected(e)) => {
            format!("❌ The destination refused the file:\n{}", e)
        }
        TransferError::Upload(UploadError::Other(e)) => {
            format!("❌ Upload failed:\n{}\n\nSend the link again to retry.", e)
        }
        TransferError::Store(_) => "❌ Internal error. Please try again later.".to_string(),
    }
}

/// Follow-up buttons for a failure, if any
pub fn failure_keyboard(err: &TransferError) -> Option<InlineKeyboardMarkup> {
    match err {
        TransferError::Upload(UploadError::NotLinked) => Some(InlineKeyboardMarkup::column(vec![
            InlineKeyboardButton::callback("🔗 Log in", CB_LOGIN),
        ])),
        _ => None,
    }
}

pub fn login_instructions(redirect_uri: &str) -> String {
    format!(
        "☁️ To give access to Google Drive:\n\n\
         1. Press the button below\n\
         2. Choose your Google account\n\
         3. Press 'Continue' if you see an unverified app warning\n\
         4. Press 'Allow'\n\
         5. After the redirect, copy the full URL from the address bar\n\
         6. Send that URL to this bot\n\n\
         📝 It will look like:\n{}?state=...&code=...",
        redirect_uri
    )
}

pub fn login_keyboard(auth_url: &str) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::column(vec![InlineKeyboardButton::link(
        "🔗 Log in with Google",
        auth_url,
    )])
}

pub const ALREADY_LINKED: &str =
    "✅ Google Drive is already linked.\n\nUse /logout to unlink it.";
pub const LOGIN_UNAVAILABLE: &str = "❌ Google Drive login is not configured on this bot.";
pub const LINKING: &str = "🔄 Linking Google Drive...";
pub const LINKED: &str = "✅ Google Drive linked!\n\nYou can now upload files to Google Drive.";
pub const NOT_AWAITING_AUTH: &str = "❌ No login in progress.\n\nUse /login first.";
pub const STATE_MISMATCH: &str = "❌ This login link belongs to another account. Use /login again.";
pub const LOGGED_OUT: &str = "✅ Google Drive unlinked.";

pub fn link_failed(err: &dyn std::fmt::Display) -> String {
    format!(
        "❌ Could not link Google Drive:\n{}\n\nTry /login again.",
        err
    )
}

pub fn admin_menu() -> (&'static str, InlineKeyboardMarkup) {
    (
        "👑 Admin panel\n\nChoose an option:",
        InlineKeyboardMarkup::column(vec![
            InlineKeyboardButton::callback("👥 All users", CB_ADMIN_USERS),
            InlineKeyboardButton::callback("📦 Change plan", CB_ADMIN_PLANS),
            InlineKeyboardButton::callback("🔄 Reset quotas", CB_ADMIN_RESET),
            InlineKeyboardButton::callback("📊 Statistics", CB_ADMIN_STATS),
        ]),
    )
}

pub fn user_list(users: &[UserRecord]) -> String {
    if users.is_empty() {
        return "👥 No users yet.".to_string();
    }
    let mut text = String::from("👥 All users:\n\n");
    for user in users.iter().take(ADMIN_USER_PAGE) {
        text.push_str(&format!(
            "• {} (ID: {})\n  📦 {} | 📊 {}\n\n",
            user.name,
            user.user_id,
            user.plan,
            format_size(user.monthly_used)
        ));
    }
    if users.len() > ADMIN_USER_PAGE {
        text.push_str(&format!(
            "... and {} more users",
            users.len() - ADMIN_USER_PAGE
        ));
    }
    text
}

pub fn plan_help(plans: &PlanTable) -> String {
    let lines = plans
        .names()
        .map(|name| {
            let limit = plans
                .limit(name)
                .map(limit_text)
                .unwrap_or_default();
            format!("• {} - {}", name, limit)
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "📦 Change a user's plan\n\nSend:\n/setplan <user_id> <plan>\n\nAvailable plans:\n{}",
        lines
    )
}

pub fn reset_confirm() -> (&'static str, InlineKeyboardMarkup) {
    (
        "⚠️ Reset the monthly usage of every user?\n\nThis sets everyone's used quota to 0.",
        InlineKeyboardMarkup::column(vec![
            InlineKeyboardButton::callback("✅ Yes, reset everything", CB_ADMIN_RESET_CONFIRM),
            InlineKeyboardButton::callback("❌ No, cancel", CB_CANCEL),
        ]),
    )
}

pub fn reset_done(count: u64) -> String {
    format!("✅ Monthly usage reset for {} user(s).", count)
}

pub fn statistics(stats: &Statistics) -> String {
    format!(
        "📊 Statistics\n\n👥 Total users: {}\n📤 Total transfers: {}\n💾 Total data: {}",
        stats.user_count,
        stats.transfer_count,
        format_size(stats.total_bytes)
    )
}

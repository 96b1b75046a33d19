//! Bot configuration
//!
//! Loaded from environment variables (and an optional `.env` file).

use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::quota::PlanTable;

/// Largest file the chat platform accepts in a single document (2 GiB)
pub const CHAT_FILE_LIMIT: u64 = 2 * 1024 * 1024 * 1024;

/// Write buffer for downloads (8 MiB) - amortizes syscalls on fast links
pub const DOWNLOAD_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Minimum spacing between download progress events
pub const DOWNLOAD_PROGRESS_INTERVAL: Duration = Duration::from_secs(3);

/// Minimum spacing between upload progress events
pub const UPLOAD_PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

/// Upload progress is also emitted whenever this many percent have passed
pub const UPLOAD_PROGRESS_STEP: u32 = 10;

/// Timeout for the metadata probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Resumable upload chunk for the cloud destination (must be a multiple of 256 KiB)
pub const CLOUD_CHUNK_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Bot API token
    pub bot_token: String,

    /// Users allowed to run admin commands
    pub admin_ids: Vec<i64>,

    /// Bot API base URL used for polling and messages
    pub telegram_api_url: String,

    /// Bot API base URL used for document uploads (a local Bot API server lifts the size cap)
    pub telegram_upload_api_url: String,

    pub database_path: PathBuf,

    /// Staging directory for downloads
    pub download_dir: PathBuf,

    /// Google OAuth client secrets (`installed` or `web` JSON)
    pub google_client_secrets_file: PathBuf,

    pub redirect_uri: String,

    /// Key for signing the OAuth `state` parameter
    pub oauth_state_secret: String,

    /// Disable TLS certificate validation for probe and download requests
    pub accept_invalid_certs: bool,

    /// Plan assigned to newly registered users
    pub default_plan: String,

    pub plans: PlanTable,
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is fine
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bot_token = lookup("BOT_TOKEN")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("BOT_TOKEN"))?;

        let admin_ids = match lookup("ADMIN_IDS") {
            Some(raw) => parse_admin_ids(&raw)?,
            None => Vec::new(),
        };

        let telegram_api_url = lookup("TELEGRAM_API_URL")
            .unwrap_or_else(|| "https://api.telegram.org".into())
            .trim_end_matches('/')
            .to_string();
        let telegram_upload_api_url = lookup("TELEGRAM_UPLOAD_API_URL")
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or_else(|| telegram_api_url.clone());

        let accept_invalid_certs = match lookup("ACCEPT_INVALID_CERTS") {
            Some(raw) => parse_bool("ACCEPT_INVALID_CERTS", &raw)?,
            None => false,
        };

        let plans = PlanTable::default();
        let default_plan = lookup("DEFAULT_PLAN").unwrap_or_else(|| "free".into());
        if plans.limit(&default_plan).is_none() {
            return Err(ConfigError::Invalid {
                key: "DEFAULT_PLAN",
                value: default_plan,
            });
        }

        Ok(Self {
            oauth_state_secret: lookup("OAUTH_STATE_SECRET").unwrap_or_else(|| bot_token.clone()),
            bot_token,
            admin_ids,
            telegram_api_url,
            telegram_upload_api_url,
            database_path: lookup("DATABASE_PATH")
                .unwrap_or_else(|| "bot_database.db".into())
                .into(),
            download_dir: lookup("DOWNLOAD_DIR")
                .unwrap_or_else(|| "downloads".into())
                .into(),
            google_client_secrets_file: lookup("GOOGLE_CLIENT_SECRETS_FILE")
                .unwrap_or_else(|| "credentials.json".into())
                .into(),
            redirect_uri: lookup("REDIRECT_URI").unwrap_or_else(|| "http://localhost:8080/".into()),
            accept_invalid_certs,
            default_plan,
            plans,
        })
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.admin_ids.contains(&user_id)
    }
}

fn parse_admin_ids(raw: &str) -> Result<Vec<i64>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>().map_err(|_| ConfigError::Invalid {
                key: "ADMIN_IDS",
                value: s.to_string(),
            })
        })
        .collect()
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
        }),
    }
}

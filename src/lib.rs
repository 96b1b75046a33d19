pub mod bot;
pub mod config;
pub mod db;
pub mod download;
pub mod error;
pub mod format;
pub mod http;
pub mod oauth;
pub mod probe;
pub mod progress;
pub mod quota;
pub mod telegram;
pub mod transfer;
pub mod upload;

use log::{info, warn};
use std::sync::Arc;

use bot::Bot;
use config::Config;
use db::Database;
use download::StreamingDownloader;
use oauth::GoogleOAuth;
use probe::RemoteFileProbe;
use quota::QuotaGate;
use telegram::BotApi;
use transfer::{sweep_staging_dir, TransferOrchestrator};
use upload::{ChatUploader, DriveUploader};

/// Wire everything up from `config` and poll until the process is stopped
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let db = Arc::new(Database::open(&config.database_path).await?);

    // Catch up on month boundaries missed while offline
    let reset = db.reset_stale_usage(chrono::Utc::now()).await?;
    if reset > 0 {
        info!("usage_rollover: reset {} users on startup", reset);
    }

    // Leftovers from a previous run that was killed mid-transfer
    match sweep_staging_dir(&config.download_dir).await {
        Ok(0) => {}
        Ok(count) => info!("staging_swept: removed {} files", count),
        Err(e) => warn!("staging_sweep_failed: {}", e),
    }

    let api_client = http::api_client()?;
    let source_client = http::source_client(config.accept_invalid_certs)?;

    let api = BotApi::new(
        api_client.clone(),
        &config.telegram_api_url,
        &config.telegram_upload_api_url,
        &config.bot_token,
    );

    let oauth = match GoogleOAuth::from_secrets_file(
        api_client.clone(),
        &config.google_client_secrets_file,
        config.redirect_uri.clone(),
        config.oauth_state_secret.clone(),
    ) {
        Ok(oauth) => Some(oauth),
        Err(e) => {
            warn!("drive_login_disabled: {}", e);
            None
        }
    };

    let orchestrator = TransferOrchestrator::new(
        db,
        QuotaGate::new(config.plans.clone()),
        RemoteFileProbe::new(source_client.clone()),
        StreamingDownloader::new(source_client),
        ChatUploader::new(Arc::new(api.clone())),
        DriveUploader::new(api_client),
        config.download_dir.clone(),
    );

    info!(
        "bot_starting: admins={} staging={}",
        config.admin_ids.len(),
        config.download_dir.display()
    );
    Arc::new(Bot::new(api, orchestrator, oauth, config)).run().await;
    Ok(())
}

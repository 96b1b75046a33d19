use log::error;

use linkrelay_lib::config::Config;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("config_invalid: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = linkrelay_lib::run(config).await {
        error!("bot_failed: {}", e);
        std::process::exit(1);
    }
}

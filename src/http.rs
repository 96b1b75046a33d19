//! Shared HTTP client construction

use reqwest::Client;
use std::time::Duration;

/// Connect timeout for every outbound request
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle read timeout while streaming bodies
const READ_TIMEOUT: Duration = Duration::from_secs(60);

const USER_AGENT: &str = concat!("linkrelay/", env!("CARGO_PKG_VERSION"));

/// Client used for probing and downloading arbitrary user-supplied URLs.
///
/// `accept_invalid_certs` turns off certificate validation for hosts that
/// cannot present a chain the local trust store accepts.
pub fn source_client(accept_invalid_certs: bool) -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(READ_TIMEOUT)
        .pool_max_idle_per_host(10)
        .danger_accept_invalid_certs(accept_invalid_certs)
        .build()
}

/// Client for API calls (Bot API, Drive, OAuth)
pub fn api_client() -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
}

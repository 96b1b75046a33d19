//! Google OAuth broker for linking a Drive account
//!
//! The bot cannot receive the redirect itself, so the user pastes the final
//! redirect URL back into the chat. The `state` parameter carries the user id
//! plus an HMAC so a pasted URL can only link the account that requested it.

use hmac::{Hmac, Mac};
use log::{info, warn};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::Path;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Per-file access to files the app created
pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";

const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/auth";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Refresh this long before the recorded expiry
const REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("invalid client secrets: {0}")]
    Secrets(String),

    #[error("authorization state does not match")]
    InvalidState,

    #[error("credential has no refresh token")]
    MissingRefreshToken,

    #[error("token endpoint rejected the request: {0}")]
    Rejected(String),

    #[error("token request failed: {0}")]
    Network(#[from] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Deserialize)]
struct ClientSecretsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

impl ClientSecrets {
    /// Parse a downloaded client secrets JSON (`installed` or `web` app type)
    pub fn from_json(json: &str) -> Result<Self, OAuthError> {
        let file: ClientSecretsFile =
            serde_json::from_str(json).map_err(|e| OAuthError::Secrets(e.to_string()))?;
        file.installed
            .or(file.web)
            .ok_or_else(|| OAuthError::Secrets("expected an \"installed\" or \"web\" section".into()))
    }
}

/// A linked Drive account, stored as JSON on the user record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveCredential {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub token_uri: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Unix seconds; `None` when the token endpoint did not say
    #[serde(default)]
    pub expires_at: Option<i64>,
}

impl DriveCredential {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn needs_refresh(&self, now: i64) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at - REFRESH_MARGIN_SECS <= now)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// Authorization code recovered from a pasted redirect URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectCode {
    pub code: String,
    pub state: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GoogleOAuth {
    client: Client,
    secrets: ClientSecrets,
    redirect_uri: String,
    state_secret: String,
}

impl GoogleOAuth {
    pub fn new(
        client: Client,
        secrets: ClientSecrets,
        redirect_uri: impl Into<String>,
        state_secret: impl Into<String>,
    ) -> Self {
        Self {
            client,
            secrets,
            redirect_uri: redirect_uri.into(),
            state_secret: state_secret.into(),
        }
    }

    pub fn from_secrets_file(
        client: Client,
        path: &Path,
        redirect_uri: impl Into<String>,
        state_secret: impl Into<String>,
    ) -> Result<Self, OAuthError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| OAuthError::Secrets(format!("{}: {}", path.display(), e)))?;
        let secrets = ClientSecrets::from_json(&json)?;
        Ok(Self::new(client, secrets, redirect_uri, state_secret))
    }

    /// Consent URL for `user_id`, asking for offline access to files the app creates
    pub fn build_authorization_url(&self, user_id: i64) -> Result<String, OAuthError> {
        let state = self.sign_state(user_id)?;
        let url = Url::parse_with_params(
            &self.secrets.auth_uri,
            &[
                ("response_type", "code"),
                ("client_id", self.secrets.client_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("scope", DRIVE_SCOPE),
                ("access_type", "offline"),
                ("include_granted_scopes", "true"),
                ("prompt", "consent"),
                ("state", state.as_str()),
            ],
        )
        .map_err(|e| OAuthError::Secrets(format!("invalid auth_uri: {}", e)))?;
        Ok(url.into())
    }

    fn state_mac(&self) -> Result<HmacSha256, OAuthError> {
        HmacSha256::new_from_slice(self.state_secret.as_bytes())
            .map_err(|e| OAuthError::Secrets(format!("invalid state secret: {}", e)))
    }

    /// `<user_id>.<hex hmac>`
    pub fn sign_state(&self, user_id: i64) -> Result<String, OAuthError> {
        let mut mac = self.state_mac()?;
        mac.update(user_id.to_string().as_bytes());
        Ok(format!(
            "{}.{}",
            user_id,
            hex::encode(mac.finalize().into_bytes())
        ))
    }

    /// User id carried by a state value, if its signature is valid
    pub fn verify_state(&self, state: &str) -> Option<i64> {
        let (user_part, signature) = state.split_once('.')?;
        let user_id: i64 = user_part.parse().ok()?;
        let signature = hex::decode(signature).ok()?;
        let mut mac = self.state_mac().ok()?;
        mac.update(user_part.as_bytes());
        mac.verify_slice(&signature).ok()?;
        Some(user_id)
    }

    /// Recognize a redirect URL pasted back by the user: same host and port
    /// as the configured redirect URI and a `code` query parameter
    pub fn parse_redirect(&self, text: &str) -> Option<RedirectCode> {
        let expected = Url::parse(&self.redirect_uri).ok()?;
        let pasted = Url::parse(text.trim()).ok()?;
        if pasted.host_str() != expected.host_str()
            || pasted.port_or_known_default() != expected.port_or_known_default()
        {
            return None;
        }

        let mut code = None;
        let mut state = None;
        for (key, value) in pasted.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                _ => {}
            }
        }
        code.filter(|c| !c.is_empty())
            .map(|code| RedirectCode { code, state })
    }

    /// Exchange an authorization code for a credential
    pub async fn exchange_code(&self, code: &str) -> Result<DriveCredential, OAuthError> {
        let body = encode_form(&[
            ("code", code),
            ("client_id", &self.secrets.client_id),
            ("client_secret", &self.secrets.client_secret),
            ("redirect_uri", &self.redirect_uri),
            ("grant_type", "authorization_code"),
        ]);
        let token = post_token(&self.client, &self.secrets.token_uri, body).await?;
        info!("oauth_exchange: token issued refresh={}", token.refresh_token.is_some());

        let now = chrono::Utc::now().timestamp();
        Ok(DriveCredential {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            token_uri: self.secrets.token_uri.clone(),
            client_id: self.secrets.client_id.clone(),
            client_secret: self.secrets.client_secret.clone(),
            scopes: token
                .scope
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_else(|| vec![DRIVE_SCOPE.to_string()]),
            expires_at: token.expires_in.map(|secs| now + secs),
        })
    }
}

/// Trade the refresh token for a new access token
pub async fn refresh_credential(
    client: &Client,
    credential: &DriveCredential,
) -> Result<DriveCredential, OAuthError> {
    let refresh_token = credential
        .refresh_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .ok_or(OAuthError::MissingRefreshToken)?;

    let body = encode_form(&[
        ("refresh_token", refresh_token),
        ("client_id", &credential.client_id),
        ("client_secret", &credential.client_secret),
        ("grant_type", "refresh_token"),
    ]);
    let token = post_token(client, &credential.token_uri, body).await?;

    let now = chrono::Utc::now().timestamp();
    Ok(DriveCredential {
        access_token: token.access_token,
        refresh_token: token
            .refresh_token
            .or_else(|| credential.refresh_token.clone()),
        expires_at: token.expires_in.map(|secs| now + secs),
        ..credential.clone()
    })
}

async fn post_token(client: &Client, token_uri: &str, body: String) -> Result<TokenResponse, OAuthError> {
    let response = client
        .post(token_uri)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(body)
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        warn!("oauth_token_rejected: status={}", status);
        return Err(OAuthError::Rejected(format!("{} - {}", status, text)));
    }
    Ok(response.json::<TokenResponse>().await?)
}

fn encode_form(pairs: &[(&str, &str)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn secrets(token_uri: &str) -> ClientSecrets {
        ClientSecrets {
            client_id: "client-1".into(),
            client_secret: "s3cret".into(),
            auth_uri: DEFAULT_AUTH_URI.into(),
            token_uri: token_uri.into(),
        }
    }

    fn broker(token_uri: &str) -> GoogleOAuth {
        GoogleOAuth::new(
            Client::new(),
            secrets(token_uri),
            "http://localhost:8080/",
            "state-key",
        )
    }

    #[test]
    fn client_secrets_sections() {
        let installed = r#"{"installed":{"client_id":"a","client_secret":"b"}}"#;
        let parsed = ClientSecrets::from_json(installed).unwrap();
        assert_eq!(parsed.client_id, "a");
        assert_eq!(parsed.token_uri, DEFAULT_TOKEN_URI);

        let web = r#"{"web":{"client_id":"c","client_secret":"d","token_uri":"https://t/"}}"#;
        assert_eq!(ClientSecrets::from_json(web).unwrap().token_uri, "https://t/");

        assert!(matches!(
            ClientSecrets::from_json(r#"{"other":{}}"#),
            Err(OAuthError::Secrets(_))
        ));
    }

    #[test]
    fn authorization_url_carries_offline_consent_and_state() {
        let oauth = broker(DEFAULT_TOKEN_URI);
        let url = Url::parse(&oauth.build_authorization_url(42).unwrap()).unwrap();
        let params: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(params["client_id"], "client-1");
        assert_eq!(params["access_type"], "offline");
        assert_eq!(params["prompt"], "consent");
        assert_eq!(params["scope"], DRIVE_SCOPE);
        assert_eq!(params["redirect_uri"], "http://localhost:8080/");
        assert_eq!(oauth.verify_state(&params["state"]), Some(42));
    }

    #[test]
    fn state_rejects_tampering() {
        let oauth = broker(DEFAULT_TOKEN_URI);
        let state = oauth.sign_state(7).unwrap();
        let (_, sig) = state.split_once('.').unwrap();

        assert_eq!(oauth.verify_state(&state), Some(7));
        assert_eq!(oauth.verify_state(&format!("8.{}", sig)), None);
        assert_eq!(oauth.verify_state("7"), None);
        assert_eq!(oauth.verify_state("7.zz"), None);

        let other = GoogleOAuth::new(Client::new(), secrets(DEFAULT_TOKEN_URI), "http://localhost:8080/", "other-key");
        assert_eq!(other.verify_state(&state), None);
    }

    #[test]
    fn recognizes_pasted_redirects() {
        let oauth = broker(DEFAULT_TOKEN_URI);
        let parsed = oauth
            .parse_redirect("http://localhost:8080/?state=1.ab&code=4%2F0Ad&scope=x")
            .unwrap();
        assert_eq!(parsed.code, "4/0Ad");
        assert_eq!(parsed.state.as_deref(), Some("1.ab"));

        assert!(oauth.parse_redirect("http://localhost:8080/?state=1.ab").is_none());
        assert!(oauth.parse_redirect("http://localhost:9090/?code=x").is_none());
        assert!(oauth.parse_redirect("https://example.com/file.zip?code=x").is_none());
        assert!(oauth.parse_redirect("not a url").is_none());
    }

    #[test]
    fn refresh_margin() {
        let credential = DriveCredential {
            access_token: "a".into(),
            refresh_token: None,
            token_uri: DEFAULT_TOKEN_URI.into(),
            client_id: String::new(),
            client_secret: String::new(),
            scopes: vec![],
            expires_at: Some(1_000),
        };
        assert!(!credential.needs_refresh(900));
        assert!(credential.needs_refresh(940));
        assert!(!DriveCredential {
            expires_at: None,
            ..credential
        }
        .needs_refresh(i64::MAX));
    }

    #[tokio::test]
    async fn exchanges_code_for_credential() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=abc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "ya29.token",
                "expires_in": 3599,
                "refresh_token": "1//refresh",
                "scope": DRIVE_SCOPE,
                "token_type": "Bearer"
            })))
            .mount(&server)
            .await;

        let oauth = broker(&format!("{}/token", server.uri()));
        let credential = oauth.exchange_code("abc").await.unwrap();
        assert_eq!(credential.access_token, "ya29.token");
        assert_eq!(credential.refresh_token.as_deref(), Some("1//refresh"));
        assert_eq!(credential.scopes, vec![DRIVE_SCOPE.to_string()]);
        assert!(credential.expires_at.is_some());

        let json = credential.to_json().unwrap();
        assert_eq!(DriveCredential::from_json(&json).unwrap(), credential);
    }

    #[tokio::test]
    async fn refresh_requires_and_keeps_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let stale = DriveCredential {
            access_token: "old".into(),
            refresh_token: Some("keep-me".into()),
            token_uri: server.uri(),
            client_id: "client-1".into(),
            client_secret: "s3cret".into(),
            scopes: vec![DRIVE_SCOPE.into()],
            expires_at: Some(0),
        };
        let fresh = refresh_credential(&Client::new(), &stale).await.unwrap();
        assert_eq!(fresh.access_token, "fresh");
        assert_eq!(fresh.refresh_token.as_deref(), Some("keep-me"));
        assert_eq!(fresh.client_id, "client-1");

        let no_refresh = DriveCredential {
            refresh_token: None,
            ..stale
        };
        assert!(matches!(
            refresh_credential(&Client::new(), &no_refresh).await,
            Err(OAuthError::MissingRefreshToken)
        ));
    }

    #[tokio::test]
    async fn rejected_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("{\"error\":\"invalid_grant\"}"))
            .mount(&server)
            .await;

        let credential = DriveCredential {
            access_token: "old".into(),
            refresh_token: Some("revoked".into()),
            token_uri: server.uri(),
            client_id: "c".into(),
            client_secret: "s".into(),
            scopes: vec![],
            expires_at: Some(0),
        };
        match refresh_credential(&Client::new(), &credential).await {
            Err(OAuthError::Rejected(msg)) => assert!(msg.contains("invalid_grant")),
            other => panic!("expected rejection, got {:?}", other),
        }
    }
}

use crate::config::Config;
use crate::remote::DriveClient;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration, Utc};
use oauth2::basic::{BasicClient, BasicTokenResponse};
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, RedirectUrl, RefreshToken,
    Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufRead, Write};
use std::path::Path;
use tracing::{info, warn};

pub const DRIVE_FILE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";

// Tokens this close to expiry are treated as expired.
const EXPIRY_SLACK_SECS: i64 = 60;

/// Client secrets as downloaded from the Google Cloud console.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSecrets {
    pub client_id: String,
    pub client_secret: String,
    pub auth_uri: String,
    pub token_uri: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CredentialsFile {
    installed: Option<ClientSecrets>,
    web: Option<ClientSecrets>,
}

impl ClientSecrets {
    pub fn from_json(content: &str) -> Result<Self> {
        let file: CredentialsFile =
            serde_json::from_str(content).context("Failed to parse credentials file")?;
        file.installed
            .or(file.web)
            .context("Credentials file has neither an \"installed\" nor a \"web\" section")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Unable to read credentials file: {}", path.display()))?;
        Self::from_json(&content)
    }

    fn oauth_client(&self) -> Result<BasicClient> {
        let redirect = self
            .redirect_uris
            .first()
            .context("Credentials file lists no redirect_uris")?;

        Ok(BasicClient::new(
            ClientId::new(self.client_id.clone()),
            Some(ClientSecret::new(self.client_secret.clone())),
            AuthUrl::new(self.auth_uri.clone()).context("Invalid auth_uri")?,
            Some(TokenUrl::new(self.token_uri.clone()).context("Invalid token_uri")?),
        )
        .set_redirect_uri(RedirectUrl::new(redirect.clone()).context("Invalid redirect uri")?))
    }
}

/// Cached OAuth token, stored as JSON next to the binary's working directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl StoredToken {
    fn from_response(response: &BasicTokenResponse, previous_refresh: Option<String>) -> Self {
        let expiry = response
            .expires_in()
            .and_then(|d| Duration::from_std(d).ok())
            .map(|d| Utc::now() + d);

        Self {
            access_token: response.access_token().secret().clone(),
            token_type: default_token_type(),
            refresh_token: response
                .refresh_token()
                .map(|t| t.secret().clone())
                .or(previous_refresh),
            expiry,
        }
    }

    /// Tokens written by other clients use the zero time (year 1) for
    /// "never expires".
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expiry.filter(|expiry| expiry.year() > 1)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(expiry) => expiry <= now + Duration::seconds(EXPIRY_SLACK_SECS),
            None => false,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read token file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse token file: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        info!("Saving credential file to: {}", path.display());
        let content = serde_json::to_string_pretty(self)?;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options
            .open(path)
            .with_context(|| format!("Unable to cache oauth token: {}", path.display()))?;
        file.write_all(content.as_bytes())
            .with_context(|| format!("Unable to cache oauth token: {}", path.display()))?;
        Ok(())
    }
}

/// Accepts either a bare authorization code or the full redirect URL the
/// browser landed on. A pasted URL must carry the `state` we sent.
pub fn extract_auth_code(input: &str, expected_state: &str) -> Result<String> {
    let input = input.trim();
    if input.is_empty() {
        anyhow::bail!("No authorization code entered");
    }

    let url = match url::Url::parse(input) {
        Ok(url) => url,
        Err(_) => return Ok(input.to_string()),
    };

    let param = |name: &str| {
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    };
    match param("state") {
        Some(state) if state == expected_state => {}
        Some(_) => anyhow::bail!("Redirect URL state does not match the authorization request"),
        None => anyhow::bail!("Redirect URL has no state parameter"),
    }
    param("code").context("Redirect URL has no code parameter")
}

async fn token_from_web(secrets: &ClientSecrets) -> Result<StoredToken> {
    let client = secrets.oauth_client()?;
    let (auth_url, csrf) = client
        .authorize_url(CsrfToken::new_random)
        .add_scope(Scope::new(DRIVE_FILE_SCOPE.to_string()))
        .add_extra_param("access_type", "offline")
        .url();

    println!(
        "Go to the following link in your browser then type the authorization code:\n{}",
        auth_url
    );

    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Unable to read authorization code")?;
    let code =
        extract_auth_code(&line, csrf.secret()).context("Unable to read authorization code")?;

    let response = client
        .exchange_code(AuthorizationCode::new(code))
        .request_async(async_http_client)
        .await
        .context("Unable to retrieve token from web")?;

    Ok(StoredToken::from_response(&response, None))
}

async fn refresh(secrets: &ClientSecrets, token: &StoredToken) -> Result<StoredToken> {
    let refresh_token = token
        .refresh_token
        .clone()
        .context("Cached token has no refresh token")?;
    let client = secrets.oauth_client()?;

    let response = client
        .exchange_refresh_token(&RefreshToken::new(refresh_token.clone()))
        .request_async(async_http_client)
        .await
        .context("Failed to refresh oauth token")?;

    Ok(StoredToken::from_response(&response, Some(refresh_token)))
}

/// Produces an authenticated Drive client, reusing the cached token when
/// possible and falling back to interactive authorization.
pub async fn authorize(config: &Config) -> Result<DriveClient> {
    let secrets = ClientSecrets::load(&config.credentials_path)?;
    let token_path = config.token_path.as_path();

    let token = match StoredToken::load(token_path) {
        Ok(token) if !token.is_expired(Utc::now()) => token,
        Ok(token) if token.refresh_token.is_some() => {
            info!("Cached token expired, refreshing");
            let token = refresh(&secrets, &token).await?;
            token.save(token_path)?;
            token
        }
        Ok(_) => {
            warn!("Cached token expired and cannot be refreshed");
            let token = token_from_web(&secrets).await?;
            token.save(token_path)?;
            token
        }
        Err(e) => {
            info!("No usable cached token ({:#}), starting authorization", e);
            let token = token_from_web(&secrets).await?;
            token.save(token_path)?;
            token
        }
    };

    DriveClient::new(&token.access_token)
}

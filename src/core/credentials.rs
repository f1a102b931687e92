//! Drive credential lifecycle.
//!
//! A saved token is reused until it is about to expire, refreshed when it
//! has a refresh token, and otherwise replaced through an interactive
//! authorization flow. Every new token is written back to the token file.

pub mod flow;
pub mod service_account;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::AuthConfig;
use crate::error::AuthError;

pub use flow::{AuthorizationFlow, LoopbackFlow, ManualCodeFlow, select_flow};
pub use service_account::{ServiceAccountKey, ServiceAccountProvider};

/// Drive access limited to files this app creates.
pub const DRIVE_FILE_SCOPE: &str = "https://www.googleapis.com/auth/drive.file";

/// Tokens this close to expiry are treated as expired.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// A bearer token for the Drive API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_at,
        }
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn expires_within(&self, secs: i64) -> bool {
        self.expires_at - ChronoDuration::seconds(secs) <= Utc::now()
    }
}

/// Something that can hand out a currently valid Drive credential.
///
/// Implementations may block on user interaction.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_valid_credential(&self) -> Result<Credential, AuthError>;

    /// Replace a credential the API rejected before its recorded expiry.
    async fn renew_credential(&self, rejected: &Credential) -> Result<Credential, AuthError> {
        let _ = rejected;
        self.get_valid_credential().await
    }
}

#[async_trait]
impl<P: CredentialProvider + ?Sized> CredentialProvider for Box<P> {
    async fn get_valid_credential(&self) -> Result<Credential, AuthError> {
        (**self).get_valid_credential().await
    }

    async fn renew_credential(&self, rejected: &Credential) -> Result<Credential, AuthError> {
        (**self).renew_credential(rejected).await
    }
}

/// Service account when `auth.service_account_file` is set, user OAuth otherwise.
pub fn provider_from_config(config: &AuthConfig) -> Result<Box<dyn CredentialProvider>, AuthError> {
    match &config.service_account_file {
        Some(path) => {
            info!(path = %path.display(), "Using Drive service account");
            Ok(Box::new(ServiceAccountProvider::from_file(path)?))
        }
        None => Ok(Box::new(OAuthCredentialProvider::new(config))),
    }
}

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

impl TokenResponse {
    /// Convert to a credential, keeping `previous_refresh` when the endpoint
    /// did not rotate the refresh token.
    pub fn into_credential(self, previous_refresh: Option<&str>) -> Credential {
        Credential {
            access_token: self.access_token,
            refresh_token: self
                .refresh_token
                .or_else(|| previous_refresh.map(String::from)),
            expires_at: Utc::now() + ChronoDuration::seconds(self.expires_in),
        }
    }
}

/// PKCE verifier/challenge pair plus the anti-forgery state value.
#[derive(Debug, Clone)]
pub struct PkceChallenge {
    pub verifier: String,
    pub challenge: String,
    pub state: String,
}

impl PkceChallenge {
    pub fn generate() -> Self {
        let verifier = random_url_safe(64);
        let challenge = code_challenge_s256(&verifier);
        Self {
            verifier,
            challenge,
            state: random_url_safe(16),
        }
    }
}

fn random_url_safe(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(&bytes)
}

fn code_challenge_s256(verifier: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Talks to the OAuth authorization server.
pub struct OAuthClient {
    http: Client,
    client_id: String,
    client_secret: String,
    auth_base: String,
    token_url: String,
}

impl OAuthClient {
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            http: Client::new(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            auth_base: config.auth_base.clone(),
            token_url: config.token_url.clone(),
        }
    }

    /// Consent page URL. Offline access is requested so a refresh token is issued.
    pub fn authorize_url(
        &self,
        redirect_uri: &str,
        pkce: &PkceChallenge,
    ) -> Result<String, AuthError> {
        let mut url = Url::parse(&self.auth_base)?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("scope", DRIVE_FILE_SCOPE)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", &pkce.state)
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent");
        Ok(url.to_string())
    }

    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        verifier: &str,
    ) -> Result<TokenResponse, AuthError> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("code_verifier", verifier),
        ];
        self.token_request(&params).await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, AuthError> {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        self.token_request(&params).await
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenResponse, AuthError> {
        let response = self.http.post(&self.token_url).form(params).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenEndpoint { status, body });
        }

        Ok(response.json().await?)
    }
}

/// JSON file holding the last issued credential.
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Option<Credential>, AuthError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(credential) => Ok(Some(credential)),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Ignoring unreadable token file");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the credential, readable by the owner only on Unix.
    pub async fn save(&self, credential: &Credential) -> Result<(), AuthError> {
        let content = serde_json::to_vec_pretty(credential)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&self.path).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, &content).await?;
        tokio::io::AsyncWriteExt::flush(&mut file).await?;
        debug!(path = %self.path.display(), "Saved Drive token");
        Ok(())
    }
}

/// Production [`CredentialProvider`]: token file, refresh, then interactive flow.
pub struct OAuthCredentialProvider {
    oauth: OAuthClient,
    store: TokenStore,
    flow: Box<dyn AuthorizationFlow>,
}

impl OAuthCredentialProvider {
    /// Build with the flow chosen from `config.flow` and the environment.
    pub fn new(config: &AuthConfig) -> Self {
        Self::with_flow(config, select_flow(config))
    }

    pub fn with_flow(config: &AuthConfig, flow: Box<dyn AuthorizationFlow>) -> Self {
        Self {
            oauth: OAuthClient::new(config),
            store: TokenStore::new(&config.token_file),
            flow,
        }
    }

    /// Run the interactive flow regardless of any saved token.
    pub async fn authorize(&self) -> Result<Credential, AuthError> {
        info!(flow = self.flow.name(), "Starting Drive authorization");
        let token = self.flow.authorize(&self.oauth).await?;
        let credential = token.into_credential(None);
        self.store.save(&credential).await?;
        info!(expires_at = %credential.expires_at(), "Drive authorization complete");
        Ok(credential)
    }

    async fn refresh(&self, saved: &Credential) -> Option<Credential> {
        let refresh_token = saved.refresh_token()?;
        match self.oauth.refresh(refresh_token).await {
            Ok(token) => Some(token.into_credential(Some(refresh_token))),
            Err(e) => {
                warn!(error = %e, "Token refresh failed, re-authorizing");
                None
            }
        }
    }
}

#[async_trait]
impl CredentialProvider for OAuthCredentialProvider {
    async fn get_valid_credential(&self) -> Result<Credential, AuthError> {
        if let Some(saved) = self.store.load().await? {
            if !saved.expires_within(EXPIRY_MARGIN_SECS) {
                debug!("Using saved Drive token");
                return Ok(saved);
            }

            if let Some(refreshed) = self.refresh(&saved).await {
                self.store.save(&refreshed).await?;
                debug!(expires_at = %refreshed.expires_at(), "Refreshed Drive token");
                return Ok(refreshed);
            }
        }

        self.authorize().await
    }

    async fn renew_credential(&self, rejected: &Credential) -> Result<Credential, AuthError> {
        let saved = self.store.load().await?;
        if let Some(saved) = &saved {
            // Another run may already have replaced the rejected token.
            if saved != rejected && !saved.expires_within(EXPIRY_MARGIN_SECS) {
                return Ok(saved.clone());
            }
        }

        let base = saved.as_ref().unwrap_or(rejected);
        if let Some(refreshed) = self.refresh(base).await {
            self.store.save(&refreshed).await?;
            debug!(expires_at = %refreshed.expires_at(), "Renewed rejected Drive token");
            return Ok(refreshed);
        }

        self.authorize().await
    }
}

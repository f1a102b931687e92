//! Google service account credentials.
//!
//! The key file's private key signs a short-lived RS256 assertion that the
//! token endpoint trades for an access token (the JWT-bearer grant). No user
//! interaction and no refresh token are involved; a new assertion is signed
//! whenever the cached token nears expiry.

use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{Credential, CredentialProvider, DRIVE_FILE_SCOPE, EXPIRY_MARGIN_SECS, TokenResponse};
use crate::error::AuthError;

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Assertions are valid for the maximum Google accepts.
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// The fields of a downloaded service account key this crate uses.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

pub struct ServiceAccountProvider {
    http: Client,
    key: ServiceAccountKey,
    signing_key: EncodingKey,
    cached: Mutex<Option<Credential>>,
}

impl ServiceAccountProvider {
    pub fn new(key: ServiceAccountKey) -> Result<Self, AuthError> {
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())?;
        Ok(Self {
            http: Client::new(),
            key,
            signing_key,
            cached: Mutex::new(None),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self, AuthError> {
        let bytes = std::fs::read(path)?;
        let key: ServiceAccountKey = serde_json::from_slice(&bytes).map_err(|e| {
            AuthError::ServiceAccountKey(format!("{}: {}", path.display(), e))
        })?;
        Self::new(key)
    }

    pub fn client_email(&self) -> &str {
        &self.key.client_email
    }

    fn sign_assertion(&self) -> Result<String, AuthError> {
        let iat = Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            scope: DRIVE_FILE_SCOPE,
            aud: &self.key.token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = self.key.private_key_id.clone();
        Ok(encode(&header, &claims, &self.signing_key)?)
    }

    async fn fetch_token(&self) -> Result<Credential, AuthError> {
        let assertion = self.sign_assertion()?;
        let params = [("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())];

        let response = self
            .http
            .post(&self.key.token_uri)
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::TokenEndpoint { status, body });
        }

        let token: TokenResponse = response.json().await?;
        let credential = token.into_credential(None);
        info!(
            account = %self.key.client_email,
            expires_at = %credential.expires_at(),
            "Obtained service account token"
        );
        Ok(credential)
    }
}

#[async_trait]
impl CredentialProvider for ServiceAccountProvider {
    async fn get_valid_credential(&self) -> Result<Credential, AuthError> {
        let mut cached = self.cached.lock().await;
        if let Some(credential) = cached.as_ref() {
            if !credential.expires_within(EXPIRY_MARGIN_SECS) {
                debug!("Using cached service account token");
                return Ok(credential.clone());
            }
        }

        let credential = self.fetch_token().await?;
        *cached = Some(credential.clone());
        Ok(credential)
    }

    async fn renew_credential(&self, rejected: &Credential) -> Result<Credential, AuthError> {
        let mut cached = self.cached.lock().await;
        if let Some(credential) = cached.as_ref() {
            if credential != rejected && !credential.expires_within(EXPIRY_MARGIN_SECS) {
                return Ok(credential.clone());
            }
        }

        let credential = self.fetch_token().await?;
        *cached = Some(credential.clone());
        Ok(credential)
    }
}

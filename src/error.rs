//! Error types for the panel, transfer and authorization layers.

use reqwest::StatusCode;
use thiserror::Error;

/// Failures talking to the backup-hosting panel API.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("panel request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("panel returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("panel response missing '{field}': {body}")]
    MissingField { field: &'static str, body: String },

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Failures moving bytes in or out.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("transfer incomplete: expected {expected} bytes, have {actual}")]
    Incomplete { expected: u64, actual: u64 },

    #[error("gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("upload session expired or was not found")]
    SessionExpired,

    #[error("Drive rejected the access token")]
    Unauthorized,

    #[error("could not obtain a Drive credential: {0}")]
    Auth(#[from] AuthError),

    #[error("upload session response had no Location header")]
    MissingSessionUri,

    #[error("upload finished without returning a file id")]
    MissingObjectId,

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Failures obtaining a Drive credential.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("token endpoint returned {status}: {body}")]
    TokenEndpoint { status: StatusCode, body: String },

    #[error("token serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("authorization callback failed: {0}")]
    Callback(String),

    #[error("authorization state did not match")]
    StateMismatch,

    #[error("timed out waiting for authorization")]
    Timeout,

    #[error("invalid service account key: {0}")]
    ServiceAccountKey(String),

    #[error("failed to sign token assertion: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

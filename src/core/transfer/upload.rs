//! Google Drive resumable upload.
//!
//! The session is opened with the file metadata, then the content is sent in
//! fixed-size chunks with `Content-Range`. Drive answers `308 Resume
//! Incomplete` with the committed range until the last chunk, which returns
//! the created file. After a failed chunk the committed offset is queried
//! again, so a retry resends only what Drive has not stored.
//!
//! A `401` means the bearer token is no longer accepted. The token is
//! renewed through the [`CredentialProvider`] and the upload resumes from the
//! committed offset. A renewed token that is rejected again ends the upload.

use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::io::SeekFrom;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::sleep;
use tracing::{Instrument, debug, info, info_span, warn};
use url::Url;

use super::{RetryPolicy, TransferTask};
use crate::core::credentials::{Credential, CredentialProvider};
use crate::error::TransferError;
use crate::logging::LogThrottle;

/// Drive requires every chunk except the last to be a multiple of this.
pub const CHUNK_GRANULARITY: usize = 256 * 1024;

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// `308 Resume Incomplete`
const RESUME_INCOMPLETE: u16 = 308;

/// Where a session stands after a request.
enum SessionState {
    /// Drive has committed everything before this offset.
    Pending(u64),
    Complete(String),
}

#[derive(Deserialize)]
struct CreatedFile {
    id: Option<String>,
}

/// Bearer token for one upload, replaced when Drive rejects it.
struct UploadAuth<'a> {
    provider: &'a dyn CredentialProvider,
    credential: Credential,
    /// Set between a renewal and the first request Drive accepts.
    unconfirmed: bool,
}

impl<'a> UploadAuth<'a> {
    async fn acquire(provider: &'a dyn CredentialProvider) -> Result<Self, TransferError> {
        let credential = provider.get_valid_credential().await?;
        Ok(Self {
            provider,
            credential,
            unconfirmed: false,
        })
    }

    fn token(&self) -> &str {
        self.credential.access_token()
    }

    fn accepted(&mut self) {
        self.unconfirmed = false;
    }

    /// Swap the rejected token for a new one. Fails if the previous
    /// replacement was never accepted.
    async fn renew(&mut self) -> Result<(), TransferError> {
        if self.unconfirmed {
            return Err(TransferError::Unauthorized);
        }
        warn!("Drive rejected the access token, renewing");
        self.credential = self.provider.renew_credential(&self.credential).await?;
        self.unconfirmed = true;
        Ok(())
    }
}

pub struct Uploader {
    client: Client,
    policy: RetryPolicy,
    upload_base: String,
    chunk_size: usize,
}

impl Uploader {
    /// `chunk_size` is rounded down to a multiple of [`CHUNK_GRANULARITY`].
    pub fn new(
        policy: RetryPolicy,
        upload_base: &str,
        chunk_size: usize,
    ) -> Result<Self, TransferError> {
        let chunk_size = (chunk_size / CHUNK_GRANULARITY).max(1) * CHUNK_GRANULARITY;
        // No overall timeout: a large final chunk on a slow link can take minutes.
        // 308 here means Resume Incomplete, never a redirect to follow.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            policy,
            upload_base: upload_base.trim_end_matches('/').to_string(),
            chunk_size,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Upload `path` into the Drive folder `folder_id` and return the new file id.
    pub async fn upload(
        &self,
        path: &Path,
        folder_id: &str,
        mime_type: &str,
        credentials: &dyn CredentialProvider,
    ) -> Result<String, TransferError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "backup.tar.gz".to_string());

        let span = info_span!("upload", file = %name, folder_id = %folder_id);

        async {
            let start = Instant::now();
            let total = tokio::fs::metadata(path).await?.len();
            let mut auth = UploadAuth::acquire(credentials).await?;

            let session = self
                .open_session(&name, folder_id, mime_type, total, &mut auth)
                .await?;
            debug!(session = %session, "Upload session opened");

            let mut task = TransferTask::new(session.as_str(), path);
            task.total_bytes = Some(total);

            let file_id = self.send_chunks(&session, &mut task, &mut auth).await?;

            info!(
                file_id = %file_id,
                total_bytes = total,
                duration_secs = start.elapsed().as_secs(),
                "Upload complete"
            );
            Ok(file_id)
        }
        .instrument(span)
        .await
    }

    async fn open_session(
        &self,
        name: &str,
        folder_id: &str,
        mime_type: &str,
        total: u64,
        auth: &mut UploadAuth<'_>,
    ) -> Result<Url, TransferError> {
        let mut failures = 0;
        loop {
            match self
                .start_session(name, folder_id, mime_type, total, auth.token())
                .await
            {
                Ok(session) => {
                    auth.accepted();
                    return Ok(session);
                }
                Err(TransferError::Unauthorized) => auth.renew().await?,
                Err(e) => {
                    failures += 1;
                    if !self.policy.allows_retry(failures) {
                        return Err(TransferError::RetriesExhausted {
                            attempts: failures,
                            last_error: e.to_string(),
                        });
                    }
                    warn!(
                        failures,
                        retry_in_secs = self.policy.delay.as_secs(),
                        error = %e,
                        "Starting upload session failed, retrying"
                    );
                    sleep(self.policy.delay).await;
                }
            }
        }
    }

    async fn send_chunks(
        &self,
        session: &Url,
        task: &mut TransferTask,
        auth: &mut UploadAuth<'_>,
    ) -> Result<String, TransferError> {
        let total = task.total_bytes.unwrap_or(0);
        let mut file = File::open(&task.destination).await?;
        let mut throttle = LogThrottle::new(PROGRESS_LOG_INTERVAL);
        let mut failures = 0;
        let mut offset = 0;
        // After a failure or a renewal, ask Drive for the committed offset
        // before sending more.
        let mut resync = false;

        loop {
            // Once every byte is stored only the final response is missing.
            let querying = resync || (total > 0 && offset >= total);
            resync = false;

            let result = if querying {
                self.query_offset(session, total, auth.token()).await
            } else {
                self.put_chunk(session, &mut file, offset, total, auth.token())
                    .await
            };
            if result.is_ok() {
                auth.accepted();
            }

            let error = match result {
                Ok(SessionState::Complete(id)) => {
                    task.bytes_transferred = total;
                    return Ok(id);
                }
                Ok(SessionState::Pending(committed)) if querying && committed < total => {
                    debug!(committed, "Resuming from committed offset");
                    offset = committed;
                    task.resume_offset = committed;
                    continue;
                }
                Ok(SessionState::Pending(committed)) if committed > offset && committed < total => {
                    failures = 0;
                    offset = committed;
                    task.resume_offset = committed;
                    task.bytes_transferred = committed;
                    if throttle.should_log() {
                        info!(
                            bytes = committed,
                            total,
                            percentage = task.percentage(),
                            "Upload progress"
                        );
                    }
                    continue;
                }
                Ok(SessionState::Pending(committed)) => {
                    offset = committed.min(total);
                    TransferError::Incomplete {
                        expected: total,
                        actual: committed,
                    }
                }
                Err(TransferError::Unauthorized) => {
                    auth.renew().await?;
                    resync = true;
                    continue;
                }
                Err(e @ (TransferError::SessionExpired | TransferError::MissingObjectId)) => {
                    return Err(e);
                }
                Err(e) => e,
            };

            failures += 1;
            if !self.policy.allows_retry(failures) {
                return Err(TransferError::RetriesExhausted {
                    attempts: failures,
                    last_error: error.to_string(),
                });
            }
            warn!(
                offset,
                failures,
                retry_in_secs = self.policy.delay.as_secs(),
                error = %error,
                "Chunk upload failed, retrying"
            );
            sleep(self.policy.delay).await;
            resync = true;
        }
    }

    async fn start_session(
        &self,
        name: &str,
        folder_id: &str,
        mime_type: &str,
        total: u64,
        token: &str,
    ) -> Result<Url, TransferError> {
        let url = format!(
            "{}/upload/drive/v3/files?uploadType=resumable&fields=id",
            self.upload_base
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .header("X-Upload-Content-Type", mime_type)
            .header("X-Upload-Content-Length", total)
            .json(&json!({ "name": name, "parents": [folder_id] }))
            .send()
            .await?;

        let response = check_success(response).await?;
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(TransferError::MissingSessionUri)?;

        // Location may be relative to the upload endpoint.
        let base = Url::parse(&url)?;
        Ok(base.join(location)?)
    }

    async fn put_chunk(
        &self,
        session: &Url,
        file: &mut File,
        offset: u64,
        total: u64,
        token: &str,
    ) -> Result<SessionState, TransferError> {
        let request = self.client.put(session.clone()).bearer_auth(token);

        let request = if total == 0 {
            request
                .header(CONTENT_RANGE, "bytes */0")
                .header(CONTENT_LENGTH, 0)
        } else {
            let len = (total - offset).min(self.chunk_size as u64);
            let mut buf = vec![0u8; len as usize];
            file.seek(SeekFrom::Start(offset)).await?;
            file.read_exact(&mut buf).await?;

            request
                .header(
                    CONTENT_RANGE,
                    format!("bytes {}-{}/{}", offset, offset + len - 1, total),
                )
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(buf)
        };

        let response = request.send().await?;
        session_state(response).await
    }

    /// Ask Drive how much of the file it has committed.
    async fn query_offset(
        &self,
        session: &Url,
        total: u64,
        token: &str,
    ) -> Result<SessionState, TransferError> {
        let response = self
            .client
            .put(session.clone())
            .bearer_auth(token)
            .header(CONTENT_RANGE, format!("bytes */{}", total))
            .header(CONTENT_LENGTH, 0)
            .send()
            .await?;

        session_state(response).await
    }
}

async fn session_state(response: Response) -> Result<SessionState, TransferError> {
    match response.status() {
        s if s.as_u16() == RESUME_INCOMPLETE => {
            let committed = response
                .headers()
                .get(RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_committed_range)
                .unwrap_or(0);
            Ok(SessionState::Pending(committed))
        }
        StatusCode::OK | StatusCode::CREATED => {
            let created: CreatedFile = response.json().await?;
            created
                .id
                .map(SessionState::Complete)
                .ok_or(TransferError::MissingObjectId)
        }
        StatusCode::UNAUTHORIZED => Err(TransferError::Unauthorized),
        StatusCode::NOT_FOUND | StatusCode::GONE => Err(TransferError::SessionExpired),
        status => {
            let body = response.text().await.unwrap_or_default();
            Err(TransferError::Status { status, body })
        }
    }
}

/// Next offset from a `Range: bytes=0-<last>` header.
fn parse_committed_range(value: &str) -> Option<u64> {
    let last: u64 = value.strip_prefix("bytes=")?.split('-').nth(1)?.parse().ok()?;
    Some(last + 1)
}

async fn check_success(response: Response) -> Result<Response, TransferError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(TransferError::Unauthorized);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransferError::Status { status, body })
}

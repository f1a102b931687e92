use futures::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::sleep;
use tracing::{Instrument, debug, info, info_span, warn};
use url::Url;

use super::{RetryPolicy, TransferOutcome, TransferTask};
use crate::error::TransferError;
use crate::logging::LogThrottle;

/// Write buffer for the destination file
const BUFFER_SIZE: usize = 128 * 1024;

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Resumable HTTP downloader.
///
/// Each attempt continues from whatever is already on disk at the
/// destination, so a retry never re-fetches bytes it already has. A partial
/// file is left in place when the retry budget runs out.
pub struct Downloader {
    client: Client,
    policy: RetryPolicy,
}

impl Downloader {
    pub fn new(policy: RetryPolicy, timeout: Duration) -> Result<Self, TransferError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, policy })
    }

    pub async fn download(&self, url: &Url, dest: &Path) -> Result<TransferOutcome, TransferError> {
        let span = info_span!("download", destination = %dest.display());

        async {
            let start = Instant::now();
            let mut task = TransferTask::new(url.as_str(), dest);
            let mut throttle = LogThrottle::new(PROGRESS_LOG_INTERVAL);
            let mut attempts = 0;

            loop {
                attempts += 1;
                throttle.reset();

                match self.attempt(&mut task, &mut throttle).await {
                    Ok(total_bytes) => {
                        info!(
                            total_bytes,
                            bytes_transferred = task.bytes_transferred,
                            attempts,
                            duration_secs = start.elapsed().as_secs(),
                            "Download complete"
                        );
                        return Ok(TransferOutcome {
                            total_bytes,
                            bytes_transferred: task.bytes_transferred,
                            attempts,
                        });
                    }
                    Err(e) => {
                        if !self.policy.allows_retry(attempts) {
                            warn!(attempts, error = %e, "Download failed, retries exhausted");
                            return Err(TransferError::RetriesExhausted {
                                attempts,
                                last_error: e.to_string(),
                            });
                        }
                        warn!(
                            attempt = attempts,
                            retry_in_secs = self.policy.delay.as_secs(),
                            error = %e,
                            "Download attempt failed, retrying"
                        );
                        sleep(self.policy.delay).await;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// One request, resuming from the current on-disk size. Returns the
    /// final file size.
    async fn attempt(
        &self,
        task: &mut TransferTask,
        throttle: &mut LogThrottle,
    ) -> Result<u64, TransferError> {
        let offset = existing_len(&task.destination).await?;
        task.resume_offset = offset;

        let mut request = self.client.get(task.source.as_str());
        if offset > 0 {
            debug!(offset, "Resuming partial download");
            request = request.header(RANGE, format!("bytes={}-", offset));
        }

        let response = request.send().await?;
        let status = response.status();

        let (mut written, append) = match status {
            StatusCode::PARTIAL_CONTENT if offset > 0 => {
                task.total_bytes = content_range_total(&response)
                    .or_else(|| response.content_length().map(|len| offset + len));
                (offset, true)
            }
            StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
                debug!(offset, "Server reports nothing left to fetch");
                task.total_bytes = Some(offset);
                return Ok(offset);
            }
            s if s.is_success() => {
                if offset > 0 {
                    debug!("Server ignored range request, restarting from zero");
                }
                task.total_bytes = response.content_length();
                (0, false)
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                return Err(TransferError::Status { status, body });
            }
        };

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&task.destination)
            .await?;
        let mut writer = BufWriter::with_capacity(BUFFER_SIZE, file);

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    // Keep what arrived so the next attempt resumes after it.
                    writer.flush().await?;
                    return Err(e.into());
                }
            };
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
            task.bytes_transferred += chunk.len() as u64;

            if throttle.should_log() {
                info!(
                    bytes = written,
                    total = task.total_bytes,
                    percentage = task.percentage(),
                    "Download progress"
                );
            }
        }
        writer.flush().await?;

        if let Some(expected) = task.total_bytes {
            if written != expected {
                return Err(TransferError::Incomplete {
                    expected,
                    actual: written,
                });
            }
        }

        Ok(written)
    }
}

async fn existing_len(path: &Path) -> Result<u64, TransferError> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

/// Total size from `Content-Range: bytes <start>-<end>/<total>`.
fn content_range_total(response: &reqwest::Response) -> Option<u64> {
    let value = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
    parse_content_range_total(value)
}

fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

pub mod download;
pub mod upload;

use std::path::PathBuf;
use std::time::Duration;

pub use download::Downloader;
pub use upload::Uploader;

/// How often a failed transfer request is retried, and how long to wait between tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed; `None` retries forever.
    pub max_attempts: Option<u32>,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn bounded(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            delay,
        }
    }

    pub fn unbounded(delay: Duration) -> Self {
        Self {
            max_attempts: None,
            delay,
        }
    }

    /// Whether another attempt may follow `failed` consecutive failures.
    pub fn allows_retry(&self, failed: u32) -> bool {
        self.max_attempts.is_none_or(|max| failed < max)
    }
}

/// Bookkeeping for one transfer, owned by the transfer call.
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub source: String,
    pub destination: PathBuf,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    pub resume_offset: u64,
}

impl TransferTask {
    pub fn new(source: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            bytes_transferred: 0,
            total_bytes: None,
            resume_offset: 0,
        }
    }

    pub fn percentage(&self) -> Option<u8> {
        let total = self.total_bytes.filter(|t| *t > 0)?;
        Some(((self.bytes_transferred as f64 / total as f64) * 100.0).min(100.0) as u8)
    }
}

/// What a finished transfer moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Size of the completed file.
    pub total_bytes: u64,
    /// Bytes fetched by this call, excluding any pre-existing partial data.
    pub bytes_transferred: u64,
    pub attempts: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_policy_counts_total_attempts() {
        let policy = RetryPolicy::bounded(5, Duration::ZERO);
        assert!(policy.allows_retry(4));
        assert!(!policy.allows_retry(5));
    }

    #[test]
    fn unbounded_policy_always_retries() {
        let policy = RetryPolicy::unbounded(Duration::from_secs(5));
        assert!(policy.allows_retry(u32::MAX));
    }

    #[test]
    fn zero_budget_still_makes_one_attempt() {
        let policy = RetryPolicy::bounded(0, Duration::ZERO);
        assert_eq!(policy.max_attempts, Some(1));
        assert!(!policy.allows_retry(1));
    }

    #[test]
    fn task_percentage() {
        let mut task = TransferTask::new("https://example.com/a", "/tmp/a");
        assert_eq!(task.percentage(), None);
        task.total_bytes = Some(200);
        task.bytes_transferred = 50;
        assert_eq!(task.percentage(), Some(25));
    }
}

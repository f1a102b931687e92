mod discord;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::NotificationConfig;
use crate::core::models::JobId;

pub use discord::DiscordNotifier;

/// Embed colors
pub const COLOR_PROGRESS: u32 = 0xffff00;
pub const COLOR_SUCCESS: u32 = 0x00ff00;
pub const COLOR_FAILURE: u32 = 0xff0000;

/// Phase-boundary events of a backup run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupEvent {
    Started,
    Created { job_id: JobId },
    BackupFailed { reason: String },
    DownloadStarted,
    DownloadSucceeded { bytes: u64 },
    DownloadFailed { reason: String },
    UploadStarted,
    UploadSucceeded { file_id: String },
    UploadFailed { reason: String },
    /// An error that escaped its phase.
    Error { message: String },
}

impl BackupEvent {
    pub fn title(&self) -> &'static str {
        match self {
            Self::Started => "Backup Start",
            Self::Created { .. } => "Backup Created",
            Self::BackupFailed { .. } => "Backup Failed",
            Self::DownloadStarted => "Download Start",
            Self::DownloadSucceeded { .. } => "Download Successful",
            Self::DownloadFailed { .. } => "Download Failed",
            Self::UploadStarted => "Upload Start",
            Self::UploadSucceeded { .. } => "Upload Successful",
            Self::UploadFailed { .. } => "Upload Failed",
            Self::Error { .. } => "Error",
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::Started => "Starting backup process".to_string(),
            Self::Created { job_id } => format!("Backup created with UUID: {}", job_id),
            Self::BackupFailed { reason } => reason.clone(),
            Self::DownloadStarted => "Starting download process".to_string(),
            Self::DownloadSucceeded { bytes } => format!(
                "Backup file downloaded successfully ({:.1} MB).",
                *bytes as f64 / (1024.0 * 1024.0)
            ),
            Self::DownloadFailed { reason } => format!("Failed to download backup. {}", reason),
            Self::UploadStarted => "Starting upload process".to_string(),
            Self::UploadSucceeded { file_id } => format!(
                "Backup file uploaded to Google Drive successfully (file id: {}).",
                file_id
            ),
            Self::UploadFailed { reason } => format!("Failed to upload backup. {}", reason),
            Self::Error { message } => format!("An error occurred: {}", message),
        }
    }

    pub fn color(&self) -> u32 {
        match self {
            Self::Started | Self::DownloadStarted | Self::UploadStarted => COLOR_PROGRESS,
            Self::Created { .. } | Self::DownloadSucceeded { .. } | Self::UploadSucceeded { .. } => {
                COLOR_SUCCESS
            }
            Self::BackupFailed { .. }
            | Self::DownloadFailed { .. }
            | Self::UploadFailed { .. }
            | Self::Error { .. } => COLOR_FAILURE,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.color() == COLOR_FAILURE
    }
}

/// Trait for notification channel implementations (Discord, etc.)
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn notify(&self, event: &BackupEvent) -> Result<()>;
}

/// Factory function to create a channel based on config
pub fn create_channel(config: &NotificationConfig) -> Option<Arc<dyn NotificationChannel>> {
    let webhook = config.discord_webhook.as_ref()?;
    if webhook.trim().is_empty() {
        return None;
    }
    Some(Arc::new(DiscordNotifier::new(webhook.clone())))
}

/// Fire-and-forget front for an optional channel. Delivery failures are
/// logged and never reach the caller.
#[derive(Clone, Default)]
pub struct Notifier {
    channel: Option<Arc<dyn NotificationChannel>>,
}

impl Notifier {
    pub fn new(channel: Option<Arc<dyn NotificationChannel>>) -> Self {
        Self { channel }
    }

    pub fn from_config(config: &NotificationConfig) -> Self {
        Self::new(create_channel(config))
    }

    pub async fn notify(&self, event: BackupEvent) {
        let Some(channel) = &self.channel else {
            debug!(title = event.title(), "No notification channel configured");
            return;
        };

        if let Err(e) = channel.notify(&event).await {
            warn!(title = event.title(), error = %e, "Failed to send notification");
        }
    }
}

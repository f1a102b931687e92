//! Application configuration.
//!
//! Settings are layered with figment: built-in defaults, then the TOML config
//! file, then `PANEL_BACKUP_*` environment variables (nested keys split on
//! `__`, e.g. `PANEL_BACKUP_PANEL__API_KEY`), then CLI overrides.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::core::transfer::RetryPolicy;

const ENV_PREFIX: &str = "PANEL_BACKUP_";
const PLACEHOLDER_PREFIX: &str = "YOUR_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "{} not found. A template has been written; edit it and run again.",
        path.display()
    )]
    Missing { path: PathBuf },

    #[error("'{field}' is not configured. Edit the config file and run again.")]
    Placeholder { field: &'static str },

    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),

    #[error("failed to write config template: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize config template: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub verbose: bool,
    pub json_logs: bool,
    pub panel: PanelConfig,
    pub drive: DriveConfig,
    pub auth: AuthConfig,
    pub notifications: NotificationConfig,
    pub poll: PollConfig,
    pub download: DownloadConfig,
    pub upload: UploadConfig,
    pub cleanup: CleanupConfig,
    pub paths: PathsConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelConfig {
    /// Panel base URL, e.g. `https://panel.example.com`
    pub url: String,
    pub api_key: String,
    pub server_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    pub folder_id: String,
    pub upload_base: String,
    pub chunk_size_bytes: usize,
    pub mime_type: String,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            folder_id: String::new(),
            upload_base: "https://www.googleapis.com".to_string(),
            chunk_size_bytes: 8 * 1024 * 1024,
            mime_type: "application/gzip".to_string(),
        }
    }
}

/// Which interactive authorization flow to use when no usable token exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthFlowKind {
    #[default]
    Auto,
    Loopback,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_file: PathBuf,
    pub flow: AuthFlowKind,
    pub auth_base: String,
    pub token_url: String,
    pub manual_redirect_uri: String,
    /// Service account key JSON. When set, no user authorization is needed.
    pub service_account_file: Option<PathBuf>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            token_file: PathBuf::from("token.json"),
            flow: AuthFlowKind::Auto,
            auth_base: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            manual_redirect_uri: "http://localhost".to_string(),
            service_account_file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub discord_webhook: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_secs: u64,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            max_attempts: 30,
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    pub max_attempts: u32,
    pub retry_delay_secs: u64,
    pub timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay_secs: 5,
            timeout_secs: 30,
        }
    }
}

impl DownloadConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::bounded(self.max_attempts, Duration::from_secs(self.retry_delay_secs))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Unset means chunk requests are retried until they succeed.
    pub max_attempts: Option<u32>,
    pub retry_delay_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            retry_delay_secs: 5,
        }
    }
}

impl UploadConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        let delay = Duration::from_secs(self.retry_delay_secs);
        match self.max_attempts {
            Some(n) => RetryPolicy::bounded(n, delay),
            None => RetryPolicy::unbounded(delay),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Remove the downloaded archive when the run fails after downloading.
    pub purge_on_failure: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            purge_on_failure: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub scratch_dir: PathBuf,
    pub history_db: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            scratch_dir: PathBuf::from(".temp"),
            history_db: Some(PathBuf::from("backup_history.db")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub interval_minutes: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 360,
        }
    }
}

impl ScheduleConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }
}

impl AppConfig {
    /// Load the configuration from `path`, layering environment variables and
    /// the given CLI overrides on top.
    ///
    /// A missing file is replaced with an editable template and reported as
    /// [`ConfigError::Missing`].
    pub fn load<T: Serialize>(path: &Path, overrides: Option<&T>) -> Result<Self, ConfigError> {
        if !path.exists() {
            write_template(path)?;
            return Err(ConfigError::Missing {
                path: path.to_path_buf(),
            });
        }

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: AppConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Config with placeholder values for every required setting.
    pub fn template() -> Self {
        let mut config = Self::default();
        config.panel.url = "YOUR_PANEL_URL".to_string();
        config.panel.api_key = "YOUR_PANEL_API_KEY".to_string();
        config.panel.server_id = "YOUR_SERVER_ID".to_string();
        config.drive.folder_id = "YOUR_DRIVE_FOLDER_ID".to_string();
        config.auth.client_id = "YOUR_OAUTH_CLIENT_ID".to_string();
        config.auth.client_secret = "YOUR_OAUTH_CLIENT_SECRET".to_string();
        config.notifications.discord_webhook = Some("YOUR_DISCORD_WEBHOOK_URL".to_string());
        config
    }

    /// Reject required settings that are empty or still hold template placeholders.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("panel.url", &self.panel.url),
            ("panel.api_key", &self.panel.api_key),
            ("panel.server_id", &self.panel.server_id),
            ("drive.folder_id", &self.drive.folder_id),
        ];

        for (field, value) in required {
            if is_unset(value) {
                return Err(ConfigError::Placeholder { field });
            }
        }

        // A service account replaces the OAuth client.
        if self.auth.service_account_file.is_none() && is_unset(&self.auth.client_id) {
            return Err(ConfigError::Placeholder {
                field: "auth.client_id",
            });
        }

        if let Some(webhook) = &self.notifications.discord_webhook {
            if webhook.starts_with(PLACEHOLDER_PREFIX) {
                return Err(ConfigError::Placeholder {
                    field: "notifications.discord_webhook",
                });
            }
        }

        Ok(())
    }
}

fn is_unset(value: &str) -> bool {
    value.trim().is_empty() || value.starts_with(PLACEHOLDER_PREFIX)
}

fn write_template(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let content = toml::to_string_pretty(&AppConfig::template())?;
    std::fs::write(path, content)?;
    Ok(())
}

//! Client for the game panel's backup endpoints.
//!
//! Every call is a single attempt. Retrying is left to the orchestrator,
//! which only does so while polling for completion.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::config::PanelConfig;
use crate::core::models::{JobId, JobProgress};
use crate::error::RemoteError;

/// Result of asking the panel to start a backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(JobId),
    /// The panel answered without a backup id; `body` is the raw response.
    Rejected { body: String },
}

/// Operations the orchestrator needs from the backup host.
#[async_trait]
pub trait BackupHost: Send + Sync {
    async fn create_job(&self) -> Result<CreateOutcome, RemoteError>;

    /// Malformed or incomplete responses are reported as not complete.
    async fn get_status(&self, job_id: &JobId) -> Result<JobProgress, RemoteError>;

    async fn get_download_descriptor(&self, job_id: &JobId) -> Result<Url, RemoteError>;

    async fn delete_job(&self, job_id: &JobId) -> Result<(), RemoteError>;
}

/// Pterodactyl client API implementation of [`BackupHost`].
pub struct PanelClient {
    client: Client,
    backups_url: String,
    api_key: String,
}

impl PanelClient {
    pub fn new(config: &PanelConfig) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        let backups_url = format!(
            "{}/api/client/servers/{}/backups",
            config.url.trim_end_matches('/'),
            config.server_id
        );

        Ok(Self {
            client,
            backups_url,
            api_key: config.api_key.clone(),
        })
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(&self.api_key)
            .header(ACCEPT, "application/json")
    }

    fn job_url(&self, job_id: &JobId) -> String {
        format!("{}/{}", self.backups_url, job_id)
    }
}

#[async_trait]
impl BackupHost for PanelClient {
    async fn create_job(&self) -> Result<CreateOutcome, RemoteError> {
        let response = self
            .authorized(self.client.post(&self.backups_url))
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        debug!(%status, "Create backup response");

        let uuid = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| attribute(&v, "uuid").and_then(Value::as_str).map(String::from));

        Ok(match uuid {
            Some(id) => CreateOutcome::Created(JobId::new(id)),
            None => CreateOutcome::Rejected { body },
        })
    }

    async fn get_status(&self, job_id: &JobId) -> Result<JobProgress, RemoteError> {
        let response = self
            .authorized(self.client.get(self.job_url(job_id)))
            .send()
            .await?;

        let response = check_status(response).await?;
        let body = response.text().await?;

        let Ok(value) = serde_json::from_str::<Value>(&body) else {
            debug!(job_id = %job_id, "Unparseable status response, treating as incomplete");
            return Ok(JobProgress::unknown());
        };

        Ok(parse_progress(&value))
    }

    async fn get_download_descriptor(&self, job_id: &JobId) -> Result<Url, RemoteError> {
        let response = self
            .authorized(self.client.get(format!("{}/download", self.job_url(job_id))))
            .send()
            .await?;

        let response = check_status(response).await?;
        let body = response.text().await?;

        let url = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| attribute(&v, "url").and_then(Value::as_str).map(String::from))
            .ok_or(RemoteError::MissingField { field: "url", body })?;

        Ok(Url::parse(&url)?)
    }

    async fn delete_job(&self, job_id: &JobId) -> Result<(), RemoteError> {
        let response = self
            .authorized(self.client.delete(self.job_url(job_id)))
            .send()
            .await?;

        if response.status() == StatusCode::NO_CONTENT {
            return Ok(());
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Status { status, body })
    }
}

fn attribute<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    value.get("attributes")?.get(key)
}

/// Map a backup resource to progress. Completion is signalled by a non-null
/// `completed_at`; `is_successful` then tells success from failure.
fn parse_progress(value: &Value) -> JobProgress {
    let Some(attributes) = value.get("attributes") else {
        return JobProgress::unknown();
    };

    let completed = attributes.get("completed_at").filter(|v| !v.is_null());
    let completed_at = completed
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    JobProgress {
        is_complete: completed.is_some(),
        is_successful: attributes.get("is_successful").and_then(Value::as_bool),
        completed_at,
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::Status { status, body })
}

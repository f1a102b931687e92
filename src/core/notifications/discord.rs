use super::{BackupEvent, NotificationChannel};
use anyhow::{Result, bail};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use tracing::debug;

pub struct DiscordNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl DiscordNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    fn format_message(&self, event: &BackupEvent) -> serde_json::Value {
        json!({
            "embeds": [
                {
                    "title": event.title(),
                    "description": event.description(),
                    "color": event.color()
                }
            ]
        })
    }
}

#[async_trait]
impl NotificationChannel for DiscordNotifier {
    async fn notify(&self, event: &BackupEvent) -> Result<()> {
        let payload = self.format_message(event);
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?;

        // Discord acknowledges webhook posts with 204 unless `?wait=true` is set.
        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::OK => {
                debug!(title = event.title(), "Notification delivered");
                Ok(())
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                bail!("Discord webhook returned {}: {}", status, body)
            }
        }
    }
}

//! Notification sinks: where reminder dispatches go.
//!
//! The scheduler only sees the [`NotificationSink`] trait; actual email
//! transport lives behind an external webhook. Deployments without one get
//! the log sink so reminders are still observable.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::info;

use crate::traits::NotificationSink;

/// POSTs `{account, subject, body}` to a configured webhook (e.g. an email
/// relay). A non-2xx response counts as a failed send.
pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn send(&self, account: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(&json!({
                "account": account,
                "subject": subject,
                "body": body,
            }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("Notification webhook returned {}", status);
        }
        info!(account = %account, subject = %subject, "Notification delivered");
        Ok(())
    }
}

/// Emits the notification as a tracing event and always succeeds.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn send(&self, account: &str, subject: &str, body: &str) -> anyhow::Result<()> {
        info!(account = %account, subject = %subject, body = %body, "Reminder (log sink)");
        Ok(())
    }
}

//! Generic JSON webhook channel.
//!
//! Posts the event's tagged JSON form to `NOTIFY_WEBHOOK_URL`.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::rejection;
use crate::error::ChannelError;
use crate::events::NotifyEvent;
use crate::NotifyChannel;

/// Environment variable for the generic webhook URL.
const ENV_NOTIFY_WEBHOOK_URL: &str = "NOTIFY_WEBHOOK_URL";

/// Upper bound on one delivery, so a hung receiver cannot pin a task.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

/// Generic webhook notification channel.
pub struct WebhookChannel {
    url: Option<String>,
    client: reqwest::Client,
}

impl WebhookChannel {
    /// Create a new webhook channel from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let url = std::env::var(ENV_NOTIFY_WEBHOOK_URL)
            .ok()
            .filter(|v| !v.trim().is_empty());

        if url.is_some() {
            debug!("Webhook notifications enabled");
        } else {
            debug!("Webhook notifications disabled (NOTIFY_WEBHOOK_URL not set)");
        }

        Self {
            url,
            client: http_client(DEFAULT_TIMEOUT),
        }
    }

    /// Create a webhook channel posting to a specific URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_timeout(url, DEFAULT_TIMEOUT)
    }

    /// Create a webhook channel whose deliveries give up after `timeout`.
    #[must_use]
    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: Some(url.into()),
            client: http_client(timeout),
        }
    }
}

#[async_trait]
impl NotifyChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn enabled(&self) -> bool {
        self.url.is_some()
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        let url = self
            .url
            .as_ref()
            .ok_or_else(|| ChannelError::NotConfigured(ENV_NOTIFY_WEBHOOK_URL.to_string()))?;

        let body = serde_json::to_vec(event)?;

        debug!(channel = "webhook", policy = event.policy_id(), "Sending notification");

        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(rejection("webhook", response).await)
        }
    }
}

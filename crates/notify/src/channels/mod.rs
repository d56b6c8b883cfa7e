//! Notification channel implementations.

pub mod webhook;

use async_trait::async_trait;

use crate::error::ChannelError;
use crate::events::NotifyEvent;

/// Trait for notification channels.
#[async_trait]
pub trait NotifyChannel: Send + Sync {
    /// Get the name of this channel.
    fn name(&self) -> &'static str;

    /// Check if this channel is enabled/configured.
    fn enabled(&self) -> bool;

    /// Send a notification event to this channel.
    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError>;
}

/// Map a non-success HTTP response onto a channel error.
pub(crate) async fn rejection(channel: &'static str, response: reqwest::Response) -> ChannelError {
    let status = response.status();

    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        return ChannelError::RateLimited { retry_after_secs };
    }

    let body = response.text().await.unwrap_or_default();
    tracing::warn!(channel, status = %status, body = %body, "Webhook request failed");

    ChannelError::Rejected {
        status: status.as_u16(),
        body,
    }
}

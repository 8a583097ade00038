//! Outbound chat relay
//!
//! Guild text messages from humans are forwarded as JSON to a configured
//! webhook. Pure forwarding: nothing comes back into the session.

use parley_core::{ParleyError, Result};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Attachment metadata
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RelayAttachment {
    /// CDN url
    pub url: String,
    /// Proxied url
    #[serde(rename = "proxyURL")]
    pub proxy_url: String,
    /// Size in bytes
    pub size: u64,
    /// MIME type, when Discord knows it
    pub content_type: Option<String>,
}

/// Message author
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RelayAuthor {
    /// User id
    pub id: String,
    /// Bot account
    pub bot: bool,
    /// Unique username
    pub username: String,
    /// Display name
    pub global_name: Option<String>,
    /// Legacy discriminator
    pub discriminator: Option<String>,
}

/// Where a message was posted
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RelayPlace {
    /// Channel or guild id
    pub id: String,
    /// Name, when cached
    pub name: Option<String>,
}

/// Body POSTed to the webhook
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RelayPayload {
    /// Message text; `null` when empty
    pub content: Option<String>,
    /// Attachments
    pub attachments: Vec<RelayAttachment>,
    /// Author
    pub author: RelayAuthor,
    /// Channel
    pub channel: RelayPlace,
    /// Guild
    pub guild: RelayPlace,
    /// RFC 3339 creation time
    pub timestamp: String,
}

/// Forwards chat messages to an HTTP endpoint
#[derive(Clone)]
pub struct WebhookRelay {
    url: String,
    client: reqwest::Client,
}

impl WebhookRelay {
    /// Relay to `url`
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            url: url.into(),
            client,
        }
    }

    /// POST `payload` to the webhook
    pub async fn relay(&self, payload: &RelayPayload) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| ParleyError::other(format!("Webhook request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = %status, "Webhook rejected relayed message");
            return Err(ParleyError::other(format!(
                "Webhook returned {}",
                status.as_u16()
            )));
        }
        debug!(channel_id = %payload.channel.id, "Relayed message to webhook");
        Ok(())
    }
}

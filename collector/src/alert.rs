//! Deduplicated operator alerts
//!
//! Every message is delivered at most once per process, to every configured
//! channel. Delivery failures are logged and counted, never returned to the
//! caller: alerting must not be able to fail a run.

use crate::config::AlertConfig;
use crate::error::AlertError;
use crate::metrics;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const SLACK_API_URL: &str = "https://slack.com/api/chat.postMessage";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Alert severity, rendered as a Slack emoji marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Error,
    Info,
    Success,
    Warning,
}

impl Severity {
    pub fn marker(&self) -> &'static str {
        match self {
            Severity::Error => ":x:",
            Severity::Info => ":information_source:",
            Severity::Success => ":white_check_mark:",
            Severity::Warning => ":warning:",
        }
    }
}

/// Somewhere an alert can be delivered
#[async_trait]
pub trait AlertChannel: Send + Sync {
    /// Channel name for logging and metrics
    fn name(&self) -> &'static str;

    /// Deliver one fully formatted message
    async fn deliver(&self, text: &str) -> Result<(), AlertError>;
}

fn http_client() -> Result<Client, AlertError> {
    Client::builder()
        .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
        .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
        .build()
        .map_err(|e| AlertError::Delivery(format!("failed to build HTTP client: {e}")))
}

/// Slack Web API `chat.postMessage`
pub struct SlackChatChannel {
    client: Client,
    url: String,
    token: String,
    channel: String,
}

#[derive(Deserialize)]
struct SlackResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

impl SlackChatChannel {
    pub fn new(token: impl Into<String>, channel: impl Into<String>) -> Result<Self, AlertError> {
        Ok(Self {
            client: http_client()?,
            url: SLACK_API_URL.to_string(),
            token: token.into(),
            channel: channel.into(),
        })
    }

    /// Point at a different API endpoint
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

#[async_trait]
impl AlertChannel for SlackChatChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn deliver(&self, text: &str) -> Result<(), AlertError> {
        let form = [
            ("channel", self.channel.as_str()),
            ("type", "mrkdwn"),
            ("text", text),
        ];
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .form(&form)
            .send()
            .await
            .map_err(|e| AlertError::Delivery(format!("slack unreachable: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AlertError::Rejected(format!("slack returned {status}")));
        }
        let body: SlackResponse = response
            .json()
            .await
            .map_err(|e| AlertError::Delivery(format!("unreadable slack response: {e}")))?;
        if body.ok {
            Ok(())
        } else {
            Err(AlertError::Rejected(
                body.error.unwrap_or_else(|| "ok: false".to_string()),
            ))
        }
    }
}

/// Incoming webhook payload
#[derive(Serialize)]
struct WebhookPayload<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

/// Slack-compatible incoming webhook
pub struct WebhookChannel {
    client: Client,
    url: String,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>) -> Result<Self, AlertError> {
        Ok(Self {
            client: http_client()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, text: &str) -> Result<(), AlertError> {
        let payload = WebhookPayload {
            kind: "mrkdwn",
            text,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AlertError::Delivery(format!("webhook unreachable: {e}")))?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(AlertError::Rejected(format!("webhook returned {status}: {body}")))
        }
    }
}

/// Process-wide deduplicating alert fan-out
pub struct Alerter {
    tenancy: String,
    sent: Mutex<HashSet<String>>,
    channels: Vec<Arc<dyn AlertChannel>>,
}

impl Alerter {
    /// Alerter with no channels; messages are only logged
    pub fn new(tenancy: impl Into<String>) -> Self {
        Self {
            tenancy: tenancy.into(),
            sent: Mutex::new(HashSet::new()),
            channels: Vec::new(),
        }
    }

    pub fn with_channel(mut self, channel: Arc<dyn AlertChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    /// Build channels from configuration
    ///
    /// A channel whose HTTP client cannot be built is skipped with an error
    /// log rather than failing startup.
    pub fn from_config(tenancy: impl Into<String>, config: &AlertConfig) -> Self {
        let mut alerter = Self::new(tenancy);

        if let (Some(token), Some(channel)) = (&config.slack_token, &config.slack_channel) {
            match SlackChatChannel::new(token.clone(), channel.clone()) {
                Ok(slack) => alerter = alerter.with_channel(Arc::new(slack)),
                Err(e) => error!(error = %e, "slack alert channel disabled"),
            }
        }
        if let Some(url) = &config.slack_webhook {
            match WebhookChannel::new(url.clone()) {
                Ok(webhook) => alerter = alerter.with_channel(Arc::new(webhook)),
                Err(e) => error!(error = %e, "webhook alert channel disabled"),
            }
        }

        info!(channels = alerter.channels.len(), "alerting configured");
        alerter
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Whether `message` was already sent this run
    pub fn was_sent(&self, message: &str) -> bool {
        self.sent.lock().contains(message)
    }

    /// Send `message` once; returns the number of channels that accepted it
    ///
    /// Repeats of a raw message are dropped, whatever their severity.
    pub async fn send(&self, message: &str, severity: Severity) -> usize {
        if !self.sent.lock().insert(message.to_string()) {
            debug!(message, "duplicate alert suppressed");
            return 0;
        }

        let text = format!("{} - {} - {}", severity.marker(), self.tenancy, message);
        match severity {
            Severity::Error => error!(alert = %text, "alert"),
            Severity::Warning => warn!(alert = %text, "alert"),
            Severity::Info | Severity::Success => info!(alert = %text, "alert"),
        }

        let mut delivered = 0;
        for channel in &self.channels {
            match channel.deliver(&text).await {
                Ok(()) => {
                    delivered += 1;
                    metrics::try_record_alert(channel.name(), true);
                }
                Err(e) => {
                    metrics::try_record_alert(channel.name(), false);
                    error!(channel = channel.name(), error = %e, "alert delivery failed");
                }
            }
        }
        delivered
    }
}

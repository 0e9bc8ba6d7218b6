//! Block alerts (Gotify, webhook).

use anyhow::{Context, Result};
use async_trait::async_trait;
use ipnet::IpNet;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::AlertsConfig;
use crate::dnsbl::DnsblResult;
use crate::validation::format_interval;

/// Timeout for alert HTTP requests (30s for slow networks)
const TIMEOUT_SECS: u64 = 30;

/// Everything an operator needs to judge a block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub target: IpNet,
    pub classification: String,
    pub reason: String,
    pub count: u64,
    #[serde(serialize_with = "serialize_interval")]
    pub window: Duration,
    /// `None` is permanent
    #[serde(serialize_with = "serialize_block_duration")]
    pub duration: Option<Duration>,
    pub escalated: bool,
    pub samples: Vec<String>,
    pub dnsbl: Option<DnsblResult>,
}

fn serialize_interval<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_interval(*d))
}

fn serialize_block_duration<S: serde::Serializer>(
    d: &Option<Duration>,
    s: S,
) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => s.serialize_str(&format_interval(*d)),
        None => s.serialize_str("permanent"),
    }
}

impl Summary {
    pub fn title(&self) -> String {
        if self.escalated {
            format!("Permanently blocked {}", self.target)
        } else {
            format!("Blocked {}", self.target)
        }
    }

    pub fn body(&self) -> String {
        let mut body = format!(
            "Address: {}\n\
             Classification: {}\n\
             Reason: {}\n\
             Failures: {} within {}\n\
             Duration: {}\n",
            self.target,
            self.classification,
            self.reason,
            self.count,
            format_interval(self.window),
            self.duration
                .map(format_interval)
                .unwrap_or_else(|| "permanent".to_string()),
        );
        if self.escalated {
            body.push_str("Escalated to a permanent block after repeated offences\n");
        }
        if let Some(dnsbl) = &self.dnsbl {
            body.push_str(&format!("DNSBL: {}\n", dnsbl.describe()));
        }
        if !self.samples.is_empty() {
            body.push_str("\nRecent log lines:\n");
            for line in &self.samples {
                body.push_str("  ");
                body.push_str(line);
                body.push('\n');
            }
        }
        body
    }

    fn gotify_priority(&self) -> u8 {
        if self.escalated {
            8
        } else {
            5
        }
    }
}

/// Delivers block notifications. Failures are reported, never fatal.
#[async_trait]
pub trait AlertDispatcher: Send + Sync {
    async fn notify(&self, summary: &Summary) -> Result<()>;
}

/// Dispatcher used when no destination is enabled.
#[derive(Debug, Default, Clone)]
pub struct NullDispatcher;

#[async_trait]
impl AlertDispatcher for NullDispatcher {
    async fn notify(&self, _summary: &Summary) -> Result<()> {
        Ok(())
    }
}

/// Alert manager
pub struct AlertManager {
    config: AlertsConfig,
    client: Client,
}

impl AlertManager {
    /// Create a new alert manager
    pub fn new(config: AlertsConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client for alerts")?;

        Ok(Self { config, client })
    }

    /// Send alert via Gotify
    async fn send_gotify(&self, summary: &Summary) -> Result<()> {
        let url = format!("{}/message", self.config.gotify.url.trim_end_matches('/'));

        #[derive(Serialize)]
        struct GotifyMessage<'a> {
            title: &'a str,
            message: &'a str,
            priority: u8,
        }

        let title = summary.title();
        let message = summary.body();
        let payload = GotifyMessage {
            title: &title,
            message: &message,
            priority: summary.gotify_priority(),
        };

        // Get token from env var or config (SecureString is zeroed on drop)
        let token = self.config.gotify.get_token();

        let response = self
            .client
            .post(&url)
            .header("X-Gotify-Key", token.as_str())
            .json(&payload)
            .send()
            .await
            .context("Failed to send Gotify alert")?;

        if !response.status().is_success() {
            // Don't log response body as it may contain sensitive info
            anyhow::bail!("Gotify returned {}", response.status());
        }

        debug!("Gotify alert sent successfully");
        Ok(())
    }

    /// Send alert via webhook
    async fn send_webhook(&self, summary: &Summary) -> Result<()> {
        #[derive(Serialize)]
        struct WebhookPayload<'a> {
            event: &'a str,
            title: String,
            timestamp: String,
            source: &'a str,
            #[serde(flatten)]
            summary: &'a Summary,
        }

        let payload = WebhookPayload {
            event: "block",
            title: summary.title(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            source: "blockwarden",
            summary,
        };

        let mut request = self.client.post(&self.config.webhook.url).json(&payload);

        // Custom headers are validated during config deserialization
        for (key, value) in &self.config.webhook.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.send().await.context("Failed to send webhook")?;

        if !response.status().is_success() {
            anyhow::bail!("Webhook returned {}", response.status());
        }

        debug!("Webhook alert sent successfully");
        Ok(())
    }
}

#[async_trait]
impl AlertDispatcher for AlertManager {
    /// Send to every enabled destination concurrently.
    async fn notify(&self, summary: &Summary) -> Result<()> {
        let gotify = async {
            if self.config.gotify.enabled {
                Some(self.send_gotify(summary).await)
            } else {
                None
            }
        };
        let webhook = async {
            if self.config.webhook.enabled {
                Some(self.send_webhook(summary).await)
            } else {
                None
            }
        };
        let (gotify, webhook) = futures::future::join(gotify, webhook).await;

        let mut failed = Vec::new();
        for (name, result) in [("Gotify", gotify), ("Webhook", webhook)] {
            if let Some(Err(e)) = result {
                warn!("{} alert failed: {:#}", name, e);
                failed.push(name);
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("Alert delivery failed for {}", failed.join(", "))
        }
    }
}

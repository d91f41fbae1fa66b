// ABOUTME: HTTP webhook sink for alert transitions
// ABOUTME: Posts each event as JSON and treats non-success status codes as delivery failures

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::models::AlertEvent;
use super::sink::AlertSink;

pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    async fn emit(&self, event: &AlertEvent) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(event)
            .send()
            .await
            .with_context(|| {
                format!(
                    "Failed to deliver alert for {} to webhook {}",
                    event.node, self.url
                )
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "Webhook rejected alert for {} with status {}: {}",
                event.node,
                status,
                body
            );
        }

        Ok(())
    }
}

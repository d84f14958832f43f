// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Outbound notification sinks for status summaries and alerts.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tracing::{error, info};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Destination for operator-facing summaries and alerts.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, subject: &str, body: &str);
}

/// Sink that writes every notification to the process log.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn notify(&self, subject: &str, body: &str) {
        info!("{subject}\n{body}");
    }
}

/// Sink that POSTs notifications as JSON to a configured webhook.
///
/// Delivery is best effort: a failed POST is logged and dropped, it never
/// blocks or fails the reporting loop that produced it.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()?;
        Ok(WebhookSink {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn notify(&self, subject: &str, body: &str) {
        let payload = json!({ "subject": subject, "body": body });
        match self.client.post(&self.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                error!(
                    "Webhook sink returned status {} for '{subject}'",
                    response.status()
                );
            }
            Err(e) => {
                error!("Failed to deliver '{subject}' to webhook sink: {e}");
            }
        }
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Thin HTTP clients for the remote source's collaborators: the object store
//! holding uploaded bundles and the message queue announcing them.

use bytes::Bytes;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{context}: unexpected status {status}")]
    Status {
        context: String,
        status: reqwest::StatusCode,
    },
}

fn build_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().timeout(CLIENT_TIMEOUT).build()
}

/// GET/PUT access to `{base}/{bucket}/{key}`.
#[derive(Clone)]
pub struct ObjectStoreClient {
    client: reqwest::Client,
    base_url: String,
}

impl ObjectStoreClient {
    pub fn new(base_url: &str) -> Result<Self, StoreError> {
        Ok(ObjectStoreClient {
            client: build_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, StoreError> {
        let url = format!("{}/{bucket}/{key}", self.base_url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(StoreError::Status {
                context: format!("GET {bucket}/{key}"),
                status: response.status(),
            });
        }
        let body = response.bytes().await?;
        debug!("Fetched {} bytes from {bucket}/{key}", body.len());
        Ok(body)
    }

    pub async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<(), StoreError> {
        let url = format!("{}/{bucket}/{key}", self.base_url);
        let response = self.client.put(&url).body(body).send().await?;
        if !response.status().is_success() {
            return Err(StoreError::Status {
                context: format!("PUT {bucket}/{key}"),
                status: response.status(),
            });
        }
        Ok(())
    }
}

/// One message announcing an uploaded object, `body` = `"<bucket>,<key>"`.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueMessage {
    pub receipt: String,
    pub body: String,
}

/// Receive/delete access to the announcement queue.
#[derive(Clone)]
pub struct MessageQueueClient {
    client: reqwest::Client,
    base_url: String,
}

impl MessageQueueClient {
    pub fn new(base_url: &str) -> Result<Self, StoreError> {
        Ok(MessageQueueClient {
            client: build_client()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Fetches up to `max` pending messages. Messages stay visible until
    /// deleted, so a crash mid-batch leads to redelivery, not loss.
    pub async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>, StoreError> {
        let url = format!("{}/messages?max={max}", self.base_url);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(StoreError::Status {
                context: "receive messages".to_string(),
                status: response.status(),
            });
        }
        Ok(response.json().await?)
    }

    pub async fn delete(&self, receipt: &str) -> Result<(), StoreError> {
        let url = format!("{}/messages/{receipt}", self.base_url);
        let response = self.client.delete(&url).send().await?;
        if !response.status().is_success() {
            return Err(StoreError::Status {
                context: format!("delete message {receipt}"),
                status: response.status(),
            });
        }
        Ok(())
    }
}

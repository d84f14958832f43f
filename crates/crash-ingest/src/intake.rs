// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client for the external crash-report intake service.
//!
//! One report becomes one structured descriptor POSTed to the intake
//! endpoint. The service answers with a positive record id on acceptance; a
//! timeout, transport error or non-positive id triggers a bounded number of
//! retries after a fixed delay before the caller preserves the payload on
//! disk instead of losing it.

use crate::context::{CrashContext, CrashKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Upload form of a [`CrashContext`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashDescriptor {
    pub report_id: String,
    pub engine_version: String,
    pub platform: String,
    pub platform_variant: String,
    pub build_config: String,
    pub branch_name: String,
    pub changelist: String,
    pub kind: CrashKind,
    pub error_message: String,
    pub call_stack: Vec<String>,
    pub source_context: Vec<String>,
    pub command_line: String,
    pub user_name: String,
    pub machine_id: String,
    pub allow_contact: bool,
    pub crash_time: DateTime<Utc>,
    pub processor_failed_message: Option<String>,
    /// Set when the call stack is shorter than the configured minimum depth;
    /// the browsing side treats these as probable noise.
    pub likely_invalid: bool,
}

impl CrashDescriptor {
    pub fn from_context(context: &CrashContext, min_callstack_depth: usize) -> Self {
        let likely_invalid = context.call_stack.len() < min_callstack_depth;
        CrashDescriptor {
            report_id: context.report_id.clone(),
            engine_version: context.engine_version.clone(),
            platform: context.platform.clone(),
            platform_variant: context.platform_variant.clone(),
            build_config: context.build_config.clone(),
            branch_name: context.branch_name.clone(),
            changelist: context.changelist.clone(),
            kind: context.kind,
            error_message: context.error_message.clone(),
            call_stack: context.call_stack.clone(),
            source_context: context.source_context.clone(),
            command_line: context.command_line.clone(),
            user_name: context.user_name.clone(),
            machine_id: context.machine_id.clone(),
            allow_contact: context.allow_contact,
            crash_time: context.crash_time,
            processor_failed_message: context.processor_failed_message.clone(),
            likely_invalid,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct IntakeResponse {
    pub id: i64,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("intake request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("intake rejected report (id {id}): {message}")]
    Rejected { id: i64, message: String },
}

pub struct IntakeClient {
    client: reqwest::Client,
    url: String,
    retries: u32,
    retry_delay: Duration,
}

impl IntakeClient {
    pub fn new(
        url: &str,
        timeout: Duration,
        retries: u32,
        retry_delay: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(IntakeClient {
            client,
            url: url.to_string(),
            retries,
            retry_delay,
        })
    }

    /// Uploads one descriptor. Makes `retries + 1` attempts in total with a
    /// fixed delay in between; a non-positive id counts as a failed attempt
    /// exactly like a timeout or transport error.
    pub async fn add_report(&self, descriptor: &CrashDescriptor) -> Result<i64, IntakeError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_send(descriptor).await {
                Ok(id) => {
                    debug!(
                        "Report {} accepted as record {id} (attempt {attempt})",
                        descriptor.report_id
                    );
                    return Ok(id);
                }
                Err(e) => {
                    warn!(
                        "Upload attempt {attempt} for {} failed: {e}",
                        descriptor.report_id
                    );
                    if attempt > self.retries {
                        return Err(e);
                    }
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    async fn try_send(&self, descriptor: &CrashDescriptor) -> Result<i64, IntakeError> {
        let response = self
            .client
            .post(&self.url)
            .json(descriptor)
            .send()
            .await?
            .error_for_status()?;

        let result: IntakeResponse = response.json().await?;
        if result.id > 0 {
            Ok(result.id)
        } else {
            Err(IntakeError::Rejected {
                id: result.id,
                message: result.error.unwrap_or_else(|| "no record id".to_string()),
            })
        }
    }
}

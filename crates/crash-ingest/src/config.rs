// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_WORKER_COUNT: usize = 8;
const DEFAULT_ADD_REPORT_SLOTS: usize = 4;
const DEFAULT_SYMBOL_SLOTS: usize = 2;
const DEFAULT_MAX_QUEUE_SIZE: usize = 64;
const DEFAULT_MIN_QUEUE_SIZE: usize = 16;
const DEFAULT_RETENTION_DAYS: u64 = 14;
const DEFAULT_INTAKE_TIMEOUT_SECS: u64 = 30;
const DEFAULT_INTAKE_RETRIES: u32 = 1;
const DEFAULT_INTAKE_RETRY_DELAY_SECS: u64 = 5;
const DEFAULT_FAILURE_ALERT_THRESHOLD: u32 = 10;
const DEFAULT_SYMBOL_TIMEOUT_SECS: u64 = 600;
const DEFAULT_MIN_CALLSTACK_DEPTH: usize = 3;
const DEFAULT_STATUS_INTERVAL_MINS: u64 = 10;
const DEFAULT_DISK_ALERT_GB: u64 = 50;

#[derive(Debug)]
pub struct Config {
    /// Landing zone scanned by the local-only source. `None` disables it.
    pub landing_zone: Option<PathBuf>,
    /// Landing zone the remote-fed source unpacks bundles into and then
    /// scans. `None` disables the remote source.
    pub remote_landing_zone: Option<PathBuf>,
    pub invalid_reports_dir: PathBuf,
    pub index_path: PathBuf,
    pub intake_url: String,
    pub object_store_url: Option<String>,
    pub queue_url: Option<String>,
    /// Local archive destination for processed artifacts; independently
    /// toggleable from the object-store archive.
    pub archive_dir: Option<PathBuf>,
    /// Object-store bucket receiving processed artifacts.
    pub archive_bucket: Option<String>,
    pub worker_count: usize,
    pub add_report_slots: usize,
    pub symbol_slots: usize,
    pub max_queue_size: usize,
    pub min_queue_size: usize,
    pub retention: Duration,
    pub retention_days: u64,
    pub intake_timeout: Duration,
    pub intake_retries: u32,
    pub intake_retry_delay: Duration,
    pub failure_alert_threshold: u32,
    /// Path to the external symbolication tool; absent disables
    /// symbolication entirely.
    pub symbol_tool: Option<PathBuf>,
    pub symbol_timeout: Duration,
    pub symbol_cache: Option<PathBuf>,
    pub min_callstack_depth: usize,
    pub alert_webhook_url: Option<String>,
    pub status_interval: Duration,
    pub perf_interval: Option<Duration>,
    pub disk_alert_bytes: u64,
    pub log_dir: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Config, anyhow::Error> {
        let intake_url = env::var("CC_INTAKE_URL")
            .map_err(|_| anyhow::anyhow!("CC_INTAKE_URL environment variable is not set"))?;

        let landing_zone = env::var("CC_LANDING_ZONE").ok().map(PathBuf::from);
        let remote_landing_zone = env::var("CC_REMOTE_LANDING_ZONE").ok().map(PathBuf::from);
        if landing_zone.is_none() && remote_landing_zone.is_none() {
            return Err(anyhow::anyhow!(
                "no report source configured: set CC_LANDING_ZONE and/or CC_REMOTE_LANDING_ZONE"
            ));
        }

        let object_store_url = env::var("CC_OBJECT_STORE_URL").ok();
        let queue_url = env::var("CC_QUEUE_URL").ok();
        if remote_landing_zone.is_some() && (object_store_url.is_none() || queue_url.is_none()) {
            return Err(anyhow::anyhow!(
                "remote source requires CC_OBJECT_STORE_URL and CC_QUEUE_URL"
            ));
        }

        let invalid_reports_dir = env::var("CC_INVALID_REPORTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let base = landing_zone
                    .as_deref()
                    .or(remote_landing_zone.as_deref())
                    .map(|p| p.parent().unwrap_or(p).to_path_buf())
                    .unwrap_or_else(|| PathBuf::from("."));
                base.join("invalid")
            });

        let max_queue_size = env_parse("CC_MAX_QUEUE_SIZE", DEFAULT_MAX_QUEUE_SIZE);
        let min_queue_size =
            env_parse("CC_MIN_QUEUE_SIZE", DEFAULT_MIN_QUEUE_SIZE).min(max_queue_size);
        let retention_days = env_parse("CC_RETENTION_DAYS", DEFAULT_RETENTION_DAYS);
        let perf_interval_mins: u64 = env_parse("CC_PERF_INTERVAL_MINS", 0);

        Ok(Config {
            landing_zone,
            remote_landing_zone,
            invalid_reports_dir,
            index_path: env::var("CC_INDEX_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("reports.index")),
            intake_url,
            object_store_url,
            queue_url,
            archive_dir: env::var("CC_ARCHIVE_DIR").ok().map(PathBuf::from),
            archive_bucket: env::var("CC_ARCHIVE_BUCKET").ok(),
            worker_count: env_parse("CC_WORKER_COUNT", DEFAULT_WORKER_COUNT).max(1),
            add_report_slots: env_parse("CC_ADD_REPORT_SLOTS", DEFAULT_ADD_REPORT_SLOTS).max(1),
            symbol_slots: env_parse("CC_SYMBOL_SLOTS", DEFAULT_SYMBOL_SLOTS).max(1),
            max_queue_size,
            min_queue_size,
            retention: Duration::from_secs(retention_days * 24 * 60 * 60),
            retention_days,
            intake_timeout: Duration::from_secs(env_parse(
                "CC_INTAKE_TIMEOUT_SECS",
                DEFAULT_INTAKE_TIMEOUT_SECS,
            )),
            intake_retries: env_parse("CC_INTAKE_RETRIES", DEFAULT_INTAKE_RETRIES),
            intake_retry_delay: Duration::from_secs(env_parse(
                "CC_INTAKE_RETRY_DELAY_SECS",
                DEFAULT_INTAKE_RETRY_DELAY_SECS,
            )),
            failure_alert_threshold: env_parse(
                "CC_FAILURE_ALERT_THRESHOLD",
                DEFAULT_FAILURE_ALERT_THRESHOLD,
            ),
            symbol_tool: env::var("CC_SYMBOL_TOOL").ok().map(PathBuf::from),
            symbol_timeout: Duration::from_secs(env_parse(
                "CC_SYMBOL_TIMEOUT_SECS",
                DEFAULT_SYMBOL_TIMEOUT_SECS,
            )),
            symbol_cache: env::var("CC_SYMBOL_CACHE").ok().map(PathBuf::from),
            min_callstack_depth: env_parse("CC_MIN_CALLSTACK_DEPTH", DEFAULT_MIN_CALLSTACK_DEPTH),
            alert_webhook_url: env::var("CC_ALERT_WEBHOOK_URL").ok(),
            status_interval: Duration::from_secs(
                env_parse("CC_STATUS_INTERVAL_MINS", DEFAULT_STATUS_INTERVAL_MINS).max(1) * 60,
            ),
            perf_interval: (perf_interval_mins > 0)
                .then(|| Duration::from_secs(perf_interval_mins * 60)),
            disk_alert_bytes: env_parse("CC_DISK_ALERT_GB", DEFAULT_DISK_ALERT_GB)
                * 1024
                * 1024
                * 1024,
            log_dir: env::var("CC_LOG_DIR").ok().map(PathBuf::from),
        })
    }
}

fn env_parse<T: FromStr + Copy>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|raw| raw.parse::<T>().ok())
        .unwrap_or(default)
}

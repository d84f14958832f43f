// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crash_ingest::{
    config::Config,
    dedup::DedupIndex,
    intake::IntakeClient,
    processor::{ProcessorPool, ProcessorSettings},
    queue::{LandingZoneQueue, QueueSettings, ReportQueue},
    remote::RemoteQueue,
    store::{MessageQueueClient, ObjectStoreClient},
    symbolicator::{Symbolicator, SymbolicatorSettings},
    watcher::Watcher,
};
use crash_telemetry::{
    alerts::DEFAULT_MIN_REPEAT, Alerter, CounterRegistry, LogSink, NotificationSink,
    ReporterSettings, StatusReporter, WebhookSink,
};

const REPORTER_WARMUP: Duration = Duration::from_secs(60);

#[tokio::main]
pub async fn main() {
    let log_level = env::var("CC_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("hyper=off,reqwest=off,rustls=off,{log_level}");

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("Error loading crash-courier configuration: {e}");
            return;
        }
    };

    // Keep the appender guard alive for the lifetime of the process.
    let _log_guard = match init_logging(&config, &env_filter) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error configuring logging: {e}");
            return;
        }
    };

    info!("Starting crash-courier");

    let telemetry = Arc::new(CounterRegistry::new());
    let sink: Arc<dyn NotificationSink> = match &config.alert_webhook_url {
        Some(url) => match WebhookSink::new(url) {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                error!("Invalid alert webhook, falling back to log sink: {e}");
                Arc::new(LogSink)
            }
        },
        None => Arc::new(LogSink),
    };
    let alerter = Arc::new(Alerter::new(Arc::clone(&sink), DEFAULT_MIN_REPEAT));

    let dedup = Arc::new(DedupIndex::new(
        config.index_path.clone(),
        config.retention_days,
    ));

    let queue_settings = QueueSettings {
        max_memory_queue_size: config.max_queue_size,
        min_desired_memory_queue_size: config.min_queue_size,
        retention: config.retention,
    };

    // Priority order: the remote-fed source drains first, the local drop
    // directory second.
    let mut candidates: Vec<Arc<dyn ReportQueue>> = Vec::new();
    if let Some(zone) = &config.remote_landing_zone {
        match build_remote_queue(&config, zone, &queue_settings, &dedup, &telemetry) {
            Ok(queue) => candidates.push(queue),
            Err(e) => {
                error!("Error creating remote source, it will be disabled: {e}");
            }
        }
    }
    if let Some(zone) = &config.landing_zone {
        candidates.push(Arc::new(LandingZoneQueue::new(
            "landing",
            zone,
            queue_settings.clone(),
            Arc::clone(&dedup),
            Arc::clone(&telemetry),
        )));
    }

    let watcher = Arc::new(Watcher::new(candidates, &dedup, Arc::clone(&telemetry)));
    let queues = watcher.queues();
    if queues.is_empty() {
        error!("No reachable report source, shutting down");
        return;
    }

    let symbolicator = config.symbol_tool.clone().map(|tool_path| {
        Arc::new(Symbolicator::new(
            SymbolicatorSettings {
                tool_path,
                timeout: config.symbol_timeout,
                slots: config.symbol_slots,
                symbol_cache: config.symbol_cache.clone(),
            },
            Arc::clone(&telemetry),
        ))
    });
    if symbolicator.is_none() {
        info!("CC_SYMBOL_TOOL not set, symbolication disabled");
    }

    let intake = match IntakeClient::new(
        &config.intake_url,
        config.intake_timeout,
        config.intake_retries,
        config.intake_retry_delay,
    ) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Error creating intake client: {e}");
            return;
        }
    };

    let archive_store = match (&config.archive_bucket, &config.object_store_url) {
        (Some(_), Some(url)) => match ObjectStoreClient::new(url) {
            Ok(client) => Some(client),
            Err(e) => {
                error!("Error creating archive store client, remote archival disabled: {e}");
                None
            }
        },
        (Some(_), None) => {
            error!("CC_ARCHIVE_BUCKET set without CC_OBJECT_STORE_URL, remote archival disabled");
            None
        }
        _ => None,
    };

    let pool = Arc::new(ProcessorPool::new(
        queues.clone(),
        ProcessorSettings {
            worker_count: config.worker_count,
            add_report_slots: config.add_report_slots,
            min_callstack_depth: config.min_callstack_depth,
            failure_alert_threshold: config.failure_alert_threshold,
            invalid_reports_dir: config.invalid_reports_dir.clone(),
            archive_dir: config.archive_dir.clone(),
            archive_bucket: config.archive_bucket.clone(),
        },
        symbolicator,
        intake,
        archive_store,
        Arc::clone(&telemetry),
        Arc::clone(&alerter),
    ));

    let reporter = Arc::new(StatusReporter::new(
        Arc::clone(&telemetry),
        sink,
        Arc::clone(&alerter),
        ReporterSettings {
            status_interval: config.status_interval,
            warmup: REPORTER_WARMUP,
            perf_interval: config.perf_interval,
            disk_check_path: queues.first().map(|q| q.landing_zone().to_path_buf()),
            disk_alert_bytes: config.disk_alert_bytes,
        },
    ));

    let cancel = CancellationToken::new();

    let watcher_handle = {
        let watcher = Arc::clone(&watcher);
        let token = cancel.clone();
        tokio::spawn(async move { watcher.run(token).await })
    };
    let pool_handles = Arc::clone(&pool).start(&cancel);
    let reporter_handles = reporter.spawn_all(&cancel);

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Failed to listen for shutdown signal: {e}"),
    }
    cancel.cancel();

    // Workers finish their current report, then the in-flight upload/archive
    // tasks drain, then the queues hand their buffered keys back to the
    // index before it persists. Nothing in flight is silently dropped.
    if let Err(e) = watcher_handle.await {
        error!("Watcher task failed: {e}");
    }
    for handle in pool_handles {
        if let Err(e) = handle.await {
            error!("Worker task failed: {e}");
        }
    }
    pool.drain().await;

    for queue in &queues {
        queue.shutdown().await;
    }
    dedup.persist();

    for handle in reporter_handles {
        if let Err(e) = handle.await {
            error!("Reporter task failed: {e}");
        }
    }

    info!("crash-courier stopped");
}

fn build_remote_queue(
    config: &Config,
    zone: &std::path::Path,
    queue_settings: &QueueSettings,
    dedup: &Arc<DedupIndex>,
    telemetry: &Arc<CounterRegistry>,
) -> Result<Arc<dyn ReportQueue>, anyhow::Error> {
    let store_url = config
        .object_store_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("missing CC_OBJECT_STORE_URL"))?;
    let queue_url = config
        .queue_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("missing CC_QUEUE_URL"))?;

    Ok(Arc::new(RemoteQueue::new(
        "receiver",
        zone,
        queue_settings.clone(),
        Arc::clone(dedup),
        Arc::clone(telemetry),
        ObjectStoreClient::new(store_url)?,
        MessageQueueClient::new(queue_url)?,
    )))
}

/// Sets up the tracing subscriber: stdout by default, a daily-rolled file
/// under `CC_LOG_DIR` when configured.
fn init_logging(
    config: &Config,
    env_filter: &str,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>, anyhow::Error> {
    let filter = EnvFilter::try_new(env_filter)
        .map_err(|e| anyhow::anyhow!("could not parse log level in configuration: {e}"))?;

    match &config.log_dir {
        Some(log_dir) => {
            let appender = tracing_appender::rolling::daily(log_dir, "crash-courier.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let subscriber = tracing_subscriber::fmt::Subscriber::builder()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .with_level(true)
                .with_target(true)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| anyhow::anyhow!("setting default subscriber failed: {e}"))?;
            Ok(Some(guard))
        }
        None => {
            let subscriber = tracing_subscriber::fmt::Subscriber::builder()
                .with_env_filter(filter)
                .with_level(true)
                .with_target(true)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| anyhow::anyhow!("setting default subscriber failed: {e}"))?;
            Ok(None)
        }
    }
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic status loops.
//!
//! Each loop is an independent task: a counter summary every few minutes, an
//! optional performance summary, and a daily disk-space check. Loops sleep
//! through a warm-up delay before their first report, diff the registry
//! against their own previous snapshot, and observe cancellation between
//! iterations so an in-flight report always runs to completion on shutdown.

use crate::alerts::Alerter;
use crate::counters::{CounterRegistry, Delta, Snapshot};
use crate::disk;
use crate::sink::NotificationSink;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const DISK_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DISK_ALERT_KEY: &str = "disk-space";

#[derive(Debug, Clone)]
pub struct ReporterSettings {
    /// Period of the counter summary loop.
    pub status_interval: Duration,
    /// Delay before any loop emits its first report.
    pub warmup: Duration,
    /// Period of the performance summary loop; `None` disables it.
    pub perf_interval: Option<Duration>,
    /// Directory whose filesystem the daily disk check probes; `None`
    /// disables the check.
    pub disk_check_path: Option<PathBuf>,
    /// Free-space floor below which the disk alert fires.
    pub disk_alert_bytes: u64,
}

impl Default for ReporterSettings {
    fn default() -> Self {
        ReporterSettings {
            status_interval: Duration::from_secs(10 * 60),
            warmup: Duration::from_secs(60),
            perf_interval: None,
            disk_check_path: None,
            disk_alert_bytes: 50 * 1024 * 1024 * 1024,
        }
    }
}

pub struct StatusReporter {
    registry: Arc<CounterRegistry>,
    sink: Arc<dyn NotificationSink>,
    alerter: Arc<Alerter>,
    settings: ReporterSettings,
}

impl StatusReporter {
    pub fn new(
        registry: Arc<CounterRegistry>,
        sink: Arc<dyn NotificationSink>,
        alerter: Arc<Alerter>,
        settings: ReporterSettings,
    ) -> Self {
        StatusReporter {
            registry,
            sink,
            alerter,
            settings,
        }
    }

    /// Spawns every configured loop. Each returned handle completes once its
    /// loop has observed cancellation and finished its current iteration.
    pub fn spawn_all(self: Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let reporter = Arc::clone(&self);
        let token = cancel.clone();
        let period = self.settings.status_interval;
        handles.push(tokio::spawn(async move {
            reporter
                .run_summary_loop("Crash pipeline status", period, token, |delta| {
                    format_counter_summary(delta, period)
                })
                .await;
        }));

        if let Some(period) = self.settings.perf_interval {
            let reporter = Arc::clone(&self);
            let token = cancel.clone();
            handles.push(tokio::spawn(async move {
                reporter
                    .run_summary_loop("Crash pipeline performance", period, token, |delta| {
                        format_perf_summary(delta, period)
                    })
                    .await;
            }));
        }

        if self.settings.disk_check_path.is_some() {
            let reporter = Arc::clone(&self);
            let token = cancel.clone();
            handles.push(tokio::spawn(async move {
                reporter.run_disk_loop(token).await;
            }));
        }

        handles
    }

    async fn run_summary_loop<F>(
        &self,
        subject: &str,
        period: Duration,
        cancel: CancellationToken,
        format: F,
    ) where
        F: Fn(&Delta) -> Option<String>,
    {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.warmup) => {}
            _ = cancel.cancelled() => return,
        }

        let mut previous = self.registry.snapshot();
        let mut ticker = interval(period);
        ticker.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => {
                    debug!("{subject} loop stopping");
                    return;
                }
            }

            let current = self.registry.snapshot();
            let delta = current.delta_since(&previous);
            previous = current;

            match format(&delta) {
                Some(body) => self.sink.notify(subject, &body).await,
                None => debug!("{subject}: nothing to report this period"),
            }
        }
    }

    async fn run_disk_loop(&self, cancel: CancellationToken) {
        let Some(path) = self.settings.disk_check_path.clone() else {
            return;
        };

        tokio::select! {
            _ = tokio::time::sleep(self.settings.warmup) => {}
            _ = cancel.cancelled() => return,
        }

        let mut ticker = interval(DISK_CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => return,
            }

            match disk::free_space_bytes(&path) {
                Some(free) if free < self.settings.disk_alert_bytes => {
                    self.alerter
                        .raise(
                            DISK_ALERT_KEY,
                            &format!(
                                "Free space on {} is down to {:.1} GiB",
                                path.display(),
                                free as f64 / (1024.0 * 1024.0 * 1024.0)
                            ),
                        )
                        .await;
                }
                Some(free) => {
                    info!(
                        "Disk check: {:.1} GiB free on {}",
                        free as f64 / (1024.0 * 1024.0 * 1024.0),
                        path.display()
                    );
                }
                None => {
                    info!("Disk check: probe unsupported for {}", path.display());
                }
            }
        }
    }

    /// Used by tests and the shutdown path to snapshot outside a loop.
    pub fn snapshot(&self) -> Snapshot {
        self.registry.snapshot()
    }
}

fn format_counter_summary(delta: &Delta, period: Duration) -> Option<String> {
    if delta.is_quiet() && delta.gauges.is_empty() {
        return None;
    }

    let mut lines = vec![format!("Last {} minutes:", period.as_secs() / 60)];

    let mut counters: Vec<_> = delta.counters.iter().filter(|(_, v)| **v > 0).collect();
    counters.sort_by(|a, b| a.0.cmp(b.0));
    for (name, value) in counters {
        lines.push(format!("  {name}: {value}"));
    }

    let mut gauges: Vec<_> = delta.gauges.iter().collect();
    gauges.sort_by(|a, b| a.0.cmp(b.0));
    for (name, value) in gauges {
        lines.push(format!("  {name}: {value}"));
    }

    Some(lines.join("\n"))
}

fn format_perf_summary(delta: &Delta, period: Duration) -> Option<String> {
    let mut timers: Vec<_> = delta.timers.iter().filter(|(_, t)| t.samples > 0).collect();
    if timers.is_empty() {
        return None;
    }
    timers.sort_by(|a, b| a.0.cmp(b.0));

    let mut lines = vec![format!("Timings over the last {} minutes:", period.as_secs() / 60)];
    for (name, totals) in timers {
        let mean_ms = totals.mean().map(|d| d.as_millis()).unwrap_or(0);
        lines.push(format!(
            "  {name}: {} calls, mean {mean_ms} ms",
            totals.samples
        ));
    }
    Some(lines.join("\n"))
}

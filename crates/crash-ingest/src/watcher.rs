// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Coordinator that owns the report queues and polls them on a fixed
//! cadence. Queue order encodes priority: workers always serve earlier
//! queues first.

use crate::dedup::DedupIndex;
use crate::queue::ReportQueue;
use crash_telemetry::CounterRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(30);

pub struct Watcher {
    queues: Vec<Arc<dyn ReportQueue>>,
    telemetry: Arc<CounterRegistry>,
}

impl Watcher {
    /// Keeps the sources whose landing zones are reachable and loads the
    /// dedup index before the first pass. A missing landing zone disables
    /// that source; it never fails startup.
    pub fn new(
        candidates: Vec<Arc<dyn ReportQueue>>,
        dedup: &DedupIndex,
        telemetry: Arc<CounterRegistry>,
    ) -> Self {
        let mut queues = Vec::new();
        for queue in candidates {
            if queue.landing_zone().is_dir() {
                info!(
                    "Source '{}' watching {}",
                    queue.name(),
                    queue.landing_zone().display()
                );
                queues.push(queue);
            } else {
                warn!(
                    "Source '{}' skipped: landing zone {} is not reachable",
                    queue.name(),
                    queue.landing_zone().display()
                );
            }
        }

        dedup.load();

        Watcher { queues, telemetry }
    }

    /// Active queues in priority order. Shared with the processor pool.
    pub fn queues(&self) -> Vec<Arc<dyn ReportQueue>> {
        self.queues.clone()
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!("Watcher started with {} source(s)", self.queues.len());
        loop {
            for queue in &self.queues {
                let depth = queue.check_for_new_reports().await;
                debug!("Queue '{}' outstanding: {depth}", queue.name());
                self.telemetry
                    .set_gauge(&format!("queue.depth.{}", queue.name()), depth as i64);
            }

            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = cancel.cancelled() => {
                    info!("Watcher stopping");
                    return;
                }
            }
        }
    }
}

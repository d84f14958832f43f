// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-source report queues.
//!
//! Each source owns a bounded in-memory FIFO fed from a landing-zone
//! directory. Discovery applies a low/high watermark pair: a pass is skipped
//! entirely while the FIFO sits at or above the low watermark, and admission
//! stops for the pass once the FIFO reaches its hard cap, which smooths
//! bursty discovery without starving the workers.

use crate::context::CrashContext;
use crate::dedup::DedupIndex;
use async_trait::async_trait;
use crash_telemetry::CounterRegistry;
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

pub const COUNTER_DISCOVERED: &str = "queue.reports_discovered";
pub const COUNTER_DUPLICATES: &str = "queue.duplicates_discarded";
pub const COUNTER_CONTEXT_ERRORS: &str = "queue.context_errors";
pub const COUNTER_PURGED: &str = "queue.landing_zone_purged";
pub const COUNTER_RETURNED: &str = "queue.returned_on_shutdown";

/// A prioritized source of crash reports.
#[async_trait]
pub trait ReportQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Root directory this source discovers reports in.
    fn landing_zone(&self) -> &Path;

    /// Pulls newly landed reports into the in-memory FIFO, bounded by the
    /// watermarks. Returns the total outstanding count: in-memory plus
    /// known-on-disk.
    async fn check_for_new_reports(&self) -> usize;

    /// Hands out the oldest buffered report, if any.
    async fn try_dequeue(&self) -> Option<CrashContext>;

    /// Deletes landing-zone sub-directories older than the retention window.
    async fn clean_landing_zone(&self);

    /// Returns still-buffered entries' keys to the dedup index so they are
    /// retried on the next startup.
    async fn shutdown(&self);
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Hard cap on the in-memory FIFO.
    pub max_memory_queue_size: usize,
    /// Discovery is skipped while the FIFO holds at least this many.
    pub min_desired_memory_queue_size: usize,
    /// Landing-zone sub-directories older than this are purged.
    pub retention: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        QueueSettings {
            max_memory_queue_size: 64,
            min_desired_memory_queue_size: 16,
            retention: Duration::from_secs(14 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    fifo: VecDeque<CrashContext>,
    /// Directory names already handled (admitted, discarded or failed), so a
    /// later pass only reads genuinely new arrivals.
    seen: HashSet<String>,
}

/// Local-only source reading a single landing-zone directory.
pub struct LandingZoneQueue {
    name: String,
    landing_zone: PathBuf,
    settings: QueueSettings,
    dedup: Arc<DedupIndex>,
    telemetry: Arc<CounterRegistry>,
    state: Mutex<QueueState>,
}

#[allow(clippy::expect_used)]
impl LandingZoneQueue {
    pub fn new(
        name: &str,
        landing_zone: impl Into<PathBuf>,
        settings: QueueSettings,
        dedup: Arc<DedupIndex>,
        telemetry: Arc<CounterRegistry>,
    ) -> Self {
        LandingZoneQueue {
            name: name.to_string(),
            landing_zone: landing_zone.into(),
            settings,
            dedup,
            telemetry,
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn memory_len(&self) -> usize {
        self.state.lock().expect("lock poisoned").fifo.len()
    }

    /// True while discovery is allowed to pull more work into memory.
    pub fn has_headroom(&self) -> bool {
        self.memory_len() < self.settings.min_desired_memory_queue_size
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    fn discover_pass(&self) -> usize {
        let mut state = self.state.lock().expect("lock poisoned");
        if state.fifo.len() >= self.settings.min_desired_memory_queue_size {
            return state.fifo.len();
        }

        let mut candidates = match list_subdirs_oldest_first(&self.landing_zone) {
            Ok(dirs) => dirs,
            Err(e) => {
                error!(
                    "Failed to list landing zone {}: {e}",
                    self.landing_zone.display()
                );
                return state.fifo.len();
            }
        };
        candidates.retain(|(_, name, _)| !state.seen.contains(name));

        let mut remaining = 0usize;
        for (_, dir_name, path) in candidates {
            if state.fifo.len() >= self.settings.max_memory_queue_size {
                // Left on disk for the next poll.
                remaining += 1;
                continue;
            }

            let context = match CrashContext::discover(&path) {
                Ok(context) => context,
                Err(e) => {
                    warn!("Rejecting unreadable report {}: {e}", path.display());
                    self.telemetry.incr(COUNTER_CONTEXT_ERRORS);
                    state.seen.insert(dir_name);
                    continue;
                }
            };

            if !self.dedup.try_add(&context.report_id) {
                // Another source won the race; this copy is surplus.
                debug!("Discarding duplicate report {}", context.report_id);
                self.telemetry.incr(COUNTER_DUPLICATES);
                if let Err(e) = fs::remove_dir_all(&path) {
                    warn!("Failed to delete duplicate {}: {e}", path.display());
                }
                state.seen.insert(dir_name);
                continue;
            }

            self.telemetry.incr(COUNTER_DISCOVERED);
            state.seen.insert(dir_name);
            state.fifo.push_back(context);
        }

        state.fifo.len() + remaining
    }
}

#[async_trait]
#[allow(clippy::expect_used)]
impl ReportQueue for LandingZoneQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn landing_zone(&self) -> &Path {
        &self.landing_zone
    }

    async fn check_for_new_reports(&self) -> usize {
        self.discover_pass()
    }

    async fn try_dequeue(&self) -> Option<CrashContext> {
        self.state.lock().expect("lock poisoned").fifo.pop_front()
    }

    async fn clean_landing_zone(&self) {
        let cutoff = SystemTime::now() - self.settings.retention;
        let dirs = match list_subdirs_oldest_first(&self.landing_zone) {
            Ok(dirs) => dirs,
            Err(e) => {
                error!(
                    "Failed to list landing zone {} for cleanup: {e}",
                    self.landing_zone.display()
                );
                return;
            }
        };

        let mut purged = 0u64;
        for (timestamp, _, path) in dirs {
            if timestamp >= cutoff {
                break; // sorted oldest first
            }
            match fs::remove_dir_all(&path) {
                Ok(()) => purged += 1,
                Err(e) => warn!("Failed to purge {}: {e}", path.display()),
            }
        }
        if purged > 0 {
            info!("Purged {purged} expired directories from {}", self.name);
            self.telemetry.add(COUNTER_PURGED, purged);
        }

        // Drop tombstones for directories that no longer exist.
        let mut state = self.state.lock().expect("lock poisoned");
        let zone = self.landing_zone.clone();
        state.seen.retain(|name| zone.join(name).exists());
    }

    async fn shutdown(&self) {
        let mut state = self.state.lock().expect("lock poisoned");
        let mut returned = 0u64;
        while let Some(context) = state.fifo.pop_front() {
            self.dedup.remove(&context.report_id);
            returned += 1;
        }
        if returned > 0 {
            info!(
                "Queue {} returned {returned} buffered reports for retry after restart",
                self.name
            );
            self.telemetry.add(COUNTER_RETURNED, returned);
        }
    }
}

/// Lists report sub-directories sorted by creation time ascending, name as
/// tie-break so ordering is stable within one timestamp granule.
fn list_subdirs_oldest_first(
    root: &Path,
) -> std::io::Result<Vec<(SystemTime, String, PathBuf)>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let metadata = entry.metadata()?;
        let timestamp = metadata
            .created()
            .or_else(|_| metadata.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let name = entry.file_name().to_string_lossy().into_owned();
        dirs.push((timestamp, name, path));
    }
    dirs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    Ok(dirs)
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded worker pool driving symbolication, upload and archival.
//!
//! N long-lived workers pull from the shared queues in strict priority
//! order: after every processed report the scan restarts from the
//! highest-priority queue, so a lower-priority source is never served while
//! a higher one has work. Upload and archival of a finished report runs in a
//! small fixed pool of "add report" tasks so a slow intake call cannot stall
//! extraction work; a worker blocks only when every slot is busy.

use crate::context::{CrashContext, DIAGNOSTICS_FILE};
use crate::intake::{CrashDescriptor, IntakeClient};
use crate::queue::ReportQueue;
use crate::store::ObjectStoreClient;
use crate::symbolicator::Symbolicator;
use crash_telemetry::{Alerter, CounterRegistry};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const COUNTER_PROCESSED: &str = "reports.processed";
pub const COUNTER_UPLOAD_FAILED: &str = "reports.upload_failed";
pub const COUNTER_ARCHIVED: &str = "reports.archived";
pub const COUNTER_ARCHIVE_FAILED: &str = "reports.archive_failed";
pub const COUNTER_RELOCATED: &str = "reports.invalid_relocated";
pub const COUNTER_LIKELY_INVALID: &str = "reports.likely_invalid";
pub const COUNTER_DELETE_FAILED: &str = "reports.delete_failed";
pub const TIMER_UPLOAD: &str = "upload.duration";

pub const UPLOAD_FAILURE_ALERT_KEY: &str = "upload-failures";
/// Name of the preserved payload written beside a report whose upload failed.
pub const FAILED_PAYLOAD_FILE: &str = "upload-failed.json";

const IDLE_SLEEP: Duration = Duration::from_secs(1);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);
const DELETE_ATTEMPTS: u32 = 3;
const DELETE_RETRY_SLEEP: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub worker_count: usize,
    pub add_report_slots: usize,
    pub min_callstack_depth: usize,
    /// Consecutive upload failures, across the whole pool, before the
    /// operator alert fires.
    pub failure_alert_threshold: u32,
    pub invalid_reports_dir: PathBuf,
    /// Local archive destination; `None` disables local archival.
    pub archive_dir: Option<PathBuf>,
    /// Object-store archive bucket; `None` disables remote archival.
    pub archive_bucket: Option<String>,
}

/// Raw files recognized inside a report directory, by extension.
#[derive(Debug, Default, Clone)]
pub struct ReportArtifacts {
    pub minidump: Option<PathBuf>,
    pub log: Option<PathBuf>,
    pub diagnostics: Option<PathBuf>,
    pub video: Option<PathBuf>,
}

impl ReportArtifacts {
    fn archivable(&self) -> impl Iterator<Item = &PathBuf> {
        [
            self.log.as_ref(),
            self.diagnostics.as_ref(),
            self.minidump.as_ref(),
            self.video.as_ref(),
        ]
        .into_iter()
        .flatten()
    }
}

pub struct ProcessorPool {
    queues: Vec<Arc<dyn ReportQueue>>,
    settings: ProcessorSettings,
    symbolicator: Option<Arc<Symbolicator>>,
    intake: Arc<IntakeClient>,
    archive_store: Option<ObjectStoreClient>,
    telemetry: Arc<CounterRegistry>,
    alerter: Arc<Alerter>,
    add_report_slots: Arc<Semaphore>,
    consecutive_failures: AtomicU32,
}

impl ProcessorPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queues: Vec<Arc<dyn ReportQueue>>,
        settings: ProcessorSettings,
        symbolicator: Option<Arc<Symbolicator>>,
        intake: Arc<IntakeClient>,
        archive_store: Option<ObjectStoreClient>,
        telemetry: Arc<CounterRegistry>,
        alerter: Arc<Alerter>,
    ) -> Self {
        let add_report_slots = Arc::new(Semaphore::new(settings.add_report_slots.max(1)));
        ProcessorPool {
            queues,
            settings,
            symbolicator,
            intake,
            archive_store,
            telemetry,
            alerter,
            add_report_slots,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Spawns the N workers plus the dedicated maintenance task. Handles
    /// complete once cancellation is observed and the current report (if
    /// any) has been handed to an add-report slot.
    pub fn start(self: Arc<Self>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for worker_id in 0..self.settings.worker_count {
            let pool = Arc::clone(&self);
            let token = cancel.clone();
            handles.push(tokio::spawn(async move {
                pool.worker_loop(worker_id, token).await;
            }));
        }

        let token = cancel.clone();
        handles.push(tokio::spawn(async move {
            self.maintenance_loop(token).await;
        }));

        handles
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, cancel: CancellationToken) {
        debug!("Worker {worker_id} started");
        while !cancel.is_cancelled() {
            match self.next_report().await {
                Some(context) => {
                    // Finish this report before looking at cancellation again.
                    Arc::clone(&self).process_report(context).await;
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(IDLE_SLEEP) => {}
                        _ = cancel.cancelled() => break,
                    }
                }
            }
        }
        debug!("Worker {worker_id} stopping");
    }

    /// Waits until every in-flight add-report task has finished. Called
    /// after the workers have been joined on shutdown.
    pub async fn drain(&self) {
        let slots = self.settings.add_report_slots.max(1) as u32;
        match self.add_report_slots.acquire_many(slots).await {
            Ok(_permits) => {}
            Err(_) => debug!("Add-report slot pool already closed"),
        }
    }

    /// First report from the highest-priority non-empty queue.
    pub async fn next_report(&self) -> Option<CrashContext> {
        for queue in &self.queues {
            if let Some(context) = queue.try_dequeue().await {
                return Some(context);
            }
        }
        None
    }

    /// Processes one dequeued report end to end: diagnostics extraction,
    /// optional symbolication, sidecar persist, then upload + archival in an
    /// add-report slot.
    pub async fn process_report(self: Arc<Self>, mut context: CrashContext) {
        info!("Processing report {}", context.report_id);
        let mut artifacts = scan_artifacts(&context.report_dir);

        if let Some(diagnostics) = &artifacts.diagnostics {
            apply_diagnostics_file(&mut context, diagnostics);
        } else if let (Some(dump), Some(symbolicator)) =
            (artifacts.minidump.clone(), self.symbolicator.as_ref())
        {
            if !context.has_processed_data() {
                let produced = symbolicator.run(&dump, &mut context).await;
                // The tool writes its diagnostics next to the dump.
                let diagnostics_path = context.report_dir.join(DIAGNOSTICS_FILE);
                if produced && diagnostics_path.is_file() {
                    apply_diagnostics_file(&mut context, &diagnostics_path);
                    artifacts.diagnostics = Some(diagnostics_path);
                }
            }
        }

        if let Err(e) = context.save() {
            warn!("Failed to persist context for {}: {e}", context.report_id);
        }

        // Blocks while every add-report slot is busy.
        let permit = match Arc::clone(&self.add_report_slots).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return, // pool closed
        };
        let pool = Arc::clone(&self);
        tokio::spawn(async move {
            pool.upload_and_archive(context, artifacts).await;
            drop(permit);
        });
    }

    async fn upload_and_archive(&self, context: CrashContext, artifacts: ReportArtifacts) {
        let descriptor =
            CrashDescriptor::from_context(&context, self.settings.min_callstack_depth);
        if descriptor.likely_invalid {
            debug!(
                "Report {} has a suspiciously short call stack ({} frames)",
                context.report_id,
                context.call_stack.len()
            );
            self.telemetry.incr(COUNTER_LIKELY_INVALID);
        }

        let started = Instant::now();
        let outcome = self.intake.add_report(&descriptor).await;
        self.telemetry.record_timing(TIMER_UPLOAD, started.elapsed());

        match outcome {
            Ok(record_id) => {
                self.consecutive_failures.store(0, Ordering::SeqCst);
                self.telemetry.incr(COUNTER_PROCESSED);
                match self.archive_artifacts(record_id, &artifacts).await {
                    Ok(()) => {
                        self.telemetry.incr(COUNTER_ARCHIVED);
                        self.remove_report_dir(&context.report_dir).await;
                    }
                    Err(e) => {
                        // The record is uploaded; keep the raw files for a
                        // manual retry instead of discarding them.
                        error!("Archival of {} failed: {e}", context.report_id);
                        self.telemetry.incr(COUNTER_ARCHIVE_FAILED);
                        self.relocate_to_invalid(&context).await;
                    }
                }
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                error!(
                    "Upload of {} failed ({failures} consecutive): {e}",
                    context.report_id
                );
                self.telemetry.incr(COUNTER_UPLOAD_FAILED);

                if failures >= self.settings.failure_alert_threshold {
                    self.alerter
                        .raise(
                            UPLOAD_FAILURE_ALERT_KEY,
                            &format!(
                                "{failures} consecutive report uploads have failed; latest: {e}"
                            ),
                        )
                        .await;
                }

                self.preserve_failed_payload(&context, &descriptor);
                self.relocate_to_invalid(&context).await;
            }
        }
    }

    /// Copies recognized artifacts into the per-record destinations. Both
    /// destinations are optional and independent.
    async fn archive_artifacts(
        &self,
        record_id: i64,
        artifacts: &ReportArtifacts,
    ) -> Result<(), io::Error> {
        if let (Some(store), Some(bucket)) = (&self.archive_store, &self.settings.archive_bucket) {
            for path in artifacts.archivable() {
                let name = file_name_of(path);
                let data = fs::read(path)?;
                store
                    .put(bucket, &format!("{record_id}/{name}"), data)
                    .await
                    .map_err(|e| io::Error::other(e.to_string()))?;
            }
        }

        if let Some(archive_dir) = &self.settings.archive_dir {
            let target = archive_dir.join(record_id.to_string());
            fs::create_dir_all(&target)?;
            for path in artifacts.archivable() {
                fs::copy(path, target.join(file_name_of(path)))?;
            }
        }

        Ok(())
    }

    /// Writes the descriptor that could not be uploaded next to the report's
    /// raw files, so the relocated directory carries everything needed for a
    /// manual replay.
    fn preserve_failed_payload(&self, context: &CrashContext, descriptor: &CrashDescriptor) {
        let path = context.report_dir.join(FAILED_PAYLOAD_FILE);
        match serde_json::to_vec_pretty(descriptor) {
            Ok(payload) => {
                if let Err(e) = fs::write(&path, payload) {
                    error!("Failed to preserve payload at {}: {e}", path.display());
                }
            }
            Err(e) => error!("Failed to serialize payload for {}: {e}", context.report_id),
        }
    }

    /// Moves the whole report directory into the invalid-reports area for
    /// manual inspection, optionally mirroring the raw files to the archive
    /// bucket first.
    async fn relocate_to_invalid(&self, context: &CrashContext) {
        if let (Some(store), Some(bucket)) = (&self.archive_store, &self.settings.archive_bucket) {
            for path in scan_artifacts(&context.report_dir).archivable() {
                if let Ok(data) = fs::read(path) {
                    let key = format!("invalid/{}/{}", context.report_id, file_name_of(path));
                    if let Err(e) = store.put(bucket, &key, data).await {
                        warn!("Failed to mirror {} for inspection: {e}", path.display());
                    }
                }
            }
        }

        let invalid_root = &self.settings.invalid_reports_dir;
        if let Err(e) = fs::create_dir_all(invalid_root) {
            error!(
                "Cannot create invalid-reports area {}: {e}",
                invalid_root.display()
            );
            return;
        }

        let target = unique_target(invalid_root, &context.report_id);
        match move_dir(&context.report_dir, &target) {
            Ok(()) => {
                info!(
                    "Report {} relocated to {}",
                    context.report_id,
                    target.display()
                );
                self.telemetry.incr(COUNTER_RELOCATED);
            }
            Err(e) => error!(
                "Failed to relocate {} to {}: {e}",
                context.report_dir.display(),
                target.display()
            ),
        }
    }

    /// Deletes a finished report directory. Networked storage intermittently
    /// holds locks without surfacing an error, so the removal is verified
    /// and retried a few times.
    async fn remove_report_dir(&self, dir: &Path) {
        for attempt in 1..=DELETE_ATTEMPTS {
            match fs::remove_dir_all(dir) {
                Ok(()) if !dir.exists() => return,
                Ok(()) => warn!(
                    "{} still present after delete (attempt {attempt})",
                    dir.display()
                ),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return,
                Err(e) => warn!("Failed to delete {} (attempt {attempt}): {e}", dir.display()),
            }
            tokio::time::sleep(DELETE_RETRY_SLEEP).await;
        }
        error!("Giving up deleting {}", dir.display());
        self.telemetry.incr(COUNTER_DELETE_FAILED);
    }

    /// Low-frequency background duties, owned by the pool rather than
    /// elected among the workers: purge expired landing-zone directories.
    async fn maintenance_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => return,
            }
            debug!("Running landing-zone maintenance");
            for queue in &self.queues {
                queue.clean_landing_zone().await;
            }
        }
    }
}

/// Recognizes raw report files by extension, case-insensitively. The
/// diagnostics text has a fixed well-known name rather than an extension.
pub fn scan_artifacts(dir: &Path) -> ReportArtifacts {
    let mut artifacts = ReportArtifacts::default();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Cannot scan report directory {}: {e}", dir.display());
            return artifacts;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.eq_ignore_ascii_case(DIAGNOSTICS_FILE) {
            artifacts.diagnostics = Some(path);
            continue;
        }
        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "dmp" | "mdmp" => artifacts.minidump = Some(path),
            "log" => artifacts.log = Some(path),
            "avi" | "mp4" => artifacts.video = Some(path),
            _ => {}
        }
    }
    artifacts
}

fn apply_diagnostics_file(context: &mut CrashContext, path: &Path) {
    match fs::read_to_string(path) {
        Ok(text) => context.apply_diagnostics(&text),
        Err(e) => warn!("Cannot read diagnostics {}: {e}", path.display()),
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn unique_target(root: &Path, base: &str) -> PathBuf {
    let candidate = root.join(base);
    if !candidate.exists() {
        return candidate;
    }
    for n in 1..=999u32 {
        let candidate = root.join(format!("{base}_DUPE{n:03}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    root.join(format!("{base}_DUPE999"))
}

/// Renames when possible, falling back to copy-and-delete for cross-device
/// moves.
fn move_dir(source: &Path, target: &Path) -> io::Result<()> {
    match fs::rename(source, target) {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_dir_recursive(source, target)?;
            fs::remove_dir_all(source)
        }
    }
}

fn copy_dir_recursive(source: &Path, target: &Path) -> io::Result<()> {
    fs::create_dir_all(target)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let from = entry.path();
        let to = target.join(entry.file_name());
        if from.is_dir() {
            copy_dir_recursive(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable index of report keys already admitted for processing.
//!
//! Multiple uncoordinated sources race to admit the same report; this index
//! is the single arbiter. Once a key is present it is never re-admitted,
//! even if the report is rediscovered in a landing zone. The file survives a
//! crash mid-write because the previous generation is renamed to `.backup`
//! before the rewrite lands.

use chrono::{NaiveDate, Utc};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, NaiveDate>,
    /// UTC day of the most recent admission; a new day triggers a persist so
    /// steady state does not rewrite the file on every admission.
    last_admission_day: Option<NaiveDate>,
}

/// Key/first-seen-date store shared by every queue through one mutex.
#[derive(Debug)]
pub struct DedupIndex {
    path: PathBuf,
    retention_days: u64,
    inner: Mutex<Inner>,
}

#[allow(clippy::expect_used)]
impl DedupIndex {
    pub fn new(path: impl Into<PathBuf>, retention_days: u64) -> Self {
        DedupIndex {
            path: path.into(),
            retention_days,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Loads entries from the primary file, falling back to `.backup`, and
    /// creates an empty file when neither exists. Returns the entry count.
    pub fn load(&self) -> usize {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.entries.clear();

        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => Some(raw),
            Err(_) => match fs::read_to_string(backup_sibling(&self.path)) {
                Ok(raw) => {
                    warn!(
                        "Dedup index {} missing, recovered from backup",
                        self.path.display()
                    );
                    Some(raw)
                }
                Err(_) => None,
            },
        };

        match raw {
            Some(raw) => {
                for line in raw.lines() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match parse_line(line) {
                        Some((key, date)) => {
                            inner.entries.insert(key, date);
                        }
                        None => warn!("Skipping unparseable dedup index line: {line}"),
                    }
                }
            }
            None => {
                info!(
                    "No dedup index at {}, starting empty",
                    self.path.display()
                );
                if let Err(e) = fs::write(&self.path, "") {
                    error!("Failed to create empty dedup index: {e}");
                }
            }
        }

        info!(
            "Dedup index loaded: {} entries from {}",
            inner.entries.len(),
            self.path.display()
        );
        inner.entries.len()
    }

    /// Admits `key` if it has never been seen. Returns false when the key is
    /// already present; the caller must discard its copy of the report.
    pub fn try_add(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.entries.contains_key(key) {
            return false;
        }
        let today = Utc::now().date_naive();
        inner.entries.insert(key.to_string(), today);

        // First admission of a new calendar day flushes to disk.
        if inner.last_admission_day != Some(today) {
            inner.last_admission_day = Some(today);
            if let Err(e) = persist_locked(&mut inner, &self.path, self.retention_days) {
                error!("Failed to persist dedup index: {e}");
            }
        }
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        let inner = self.inner.lock().expect("lock poisoned");
        inner.entries.contains_key(key)
    }

    /// Removes `key`, allowing it to be re-admitted. Used on shutdown to
    /// return still-queued reports for retry after restart.
    pub fn remove(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("lock poisoned");
        inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes all non-expired entries to disk. Entries older than the
    /// retention window are dropped here rather than on every admission.
    pub fn persist(&self) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if let Err(e) = persist_locked(&mut inner, &self.path, self.retention_days) {
            error!("Failed to persist dedup index: {e}");
        }
    }
}

fn persist_locked(inner: &mut Inner, path: &Path, retention_days: u64) -> io::Result<()> {
    let cutoff = Utc::now().date_naive() - chrono::Duration::days(retention_days as i64);
    let before = inner.entries.len();
    inner.entries.retain(|_, date| *date >= cutoff);
    let expired = before - inner.entries.len();
    if expired > 0 {
        debug!("Dedup index dropped {expired} expired entries");
    }

    let mut lines: Vec<String> = inner
        .entries
        .iter()
        .map(|(key, date)| format!("\"{key}\",{}", date.format(DATE_FORMAT)))
        .collect();
    lines.sort();
    let mut contents = lines.join("\n");
    if !contents.is_empty() {
        contents.push('\n');
    }

    let temp = temp_sibling(path);
    fs::write(&temp, contents)?;
    if path.exists() {
        fs::rename(path, backup_sibling(path))?;
    }
    fs::rename(&temp, path)?;
    debug!(
        "Dedup index persisted: {} entries to {}",
        inner.entries.len(),
        path.display()
    );
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut os = path.to_path_buf().into_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

fn backup_sibling(path: &Path) -> PathBuf {
    let mut os = path.to_path_buf().into_os_string();
    os.push(".backup");
    PathBuf::from(os)
}

fn parse_line(line: &str) -> Option<(String, NaiveDate)> {
    let (quoted_key, date_part) = line.rsplit_once(',')?;
    let key = quoted_key
        .strip_prefix('"')
        .and_then(|k| k.strip_suffix('"'))?;
    if key.is_empty() {
        return None;
    }
    let date = NaiveDate::parse_from_str(date_part.trim(), DATE_FORMAT).ok()?;
    Some((key.to_string(), date))
}

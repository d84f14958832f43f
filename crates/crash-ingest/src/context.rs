// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The normalized, mutable record describing one crash report.
//!
//! A [`CrashContext`] is created when a landing-zone directory is discovered,
//! either from its sidecar descriptor or synthesized from legacy per-platform
//! metadata, and is persisted back to the sidecar after every mutation so an
//! interrupted process resumes without losing extracted data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Extension of the sidecar descriptor file inside each report directory.
pub const SIDECAR_EXTENSION: &str = "crashctx";
/// Well-known name of the diagnostics text produced by clients and by the
/// symbolication tool.
pub const DIAGNOSTICS_FILE: &str = "Diagnostics.txt";
/// Legacy per-platform metadata file, `Key=Value` per line.
pub const LEGACY_METADATA_FILE: &str = "Report.wer";

const ERROR_PREFIX: &str = "Error:";
const CALLSTACK_HEADER: &str = "Callstack:";
const SOURCE_CONTEXT_HEADER: &str = "SourceContext:";

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("no sidecar descriptor in {0}")]
    NoSidecar(PathBuf),
    #[error("descriptor parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Classification reported by the crashing client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CrashKind {
    Crash,
    Assert,
    Ensure,
    #[default]
    Unknown,
}

impl CrashKind {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "crash" => CrashKind::Crash,
            "assert" => CrashKind::Assert,
            "ensure" => CrashKind::Ensure,
            _ => CrashKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrashContext {
    /// Directory holding the report's raw files. Derived from where the
    /// report was discovered, never persisted.
    #[serde(skip)]
    pub report_dir: PathBuf,
    /// Landing-zone folder name; the dedup key.
    pub report_id: String,
    pub engine_version: String,
    pub platform: String,
    pub platform_variant: String,
    pub build_config: String,
    pub command_line: String,
    pub user_name: String,
    pub machine_id: String,
    pub branch_name: String,
    pub changelist: String,
    pub call_stack: Vec<String>,
    pub source_context: Vec<String>,
    pub error_message: String,
    pub kind: CrashKind,
    /// Diagnostic note recorded when an earlier stage could not fully
    /// process the report.
    pub processor_failed_message: Option<String>,
    pub allow_contact: bool,
    pub crash_time: DateTime<Utc>,
}

impl CrashContext {
    /// True once either a call stack or an error message has been extracted.
    pub fn has_processed_data(&self) -> bool {
        !self.call_stack.is_empty() || !self.error_message.is_empty()
    }

    pub fn sidecar_path(&self) -> PathBuf {
        self.report_dir
            .join(format!("{}.{SIDECAR_EXTENSION}", self.report_id))
    }

    /// Loads the context from the sidecar descriptor inside `dir`.
    pub fn load(dir: &Path) -> Result<CrashContext, ContextError> {
        let sidecar = find_sidecar(dir).ok_or_else(|| ContextError::NoSidecar(dir.to_path_buf()))?;
        let raw = fs::read_to_string(&sidecar)?;
        let mut context: CrashContext = serde_json::from_str(&raw)?;
        context.report_dir = dir.to_path_buf();
        if context.report_id.is_empty() {
            context.report_id = dir_name(dir);
        }
        Ok(context)
    }

    /// Rewrites the sidecar descriptor. Called after every mutation so a
    /// restart resumes from the latest extracted state.
    pub fn save(&self) -> Result<(), ContextError> {
        let serialized = serde_json::to_string_pretty(self)?;
        fs::write(self.sidecar_path(), serialized)?;
        Ok(())
    }

    /// Discovers the context for a landing-zone directory: sidecar first,
    /// legacy metadata synthesis otherwise.
    pub fn discover(dir: &Path) -> Result<CrashContext, ContextError> {
        match CrashContext::load(dir) {
            Ok(context) => Ok(context),
            Err(ContextError::NoSidecar(_)) => CrashContext::from_legacy_metadata(dir),
            Err(e) => Err(e),
        }
    }

    /// Synthesizes a context from legacy per-platform metadata.
    ///
    /// Missing branch, changelist, or diagnostics mean the reporting client
    /// skipped vital data; each case is recorded so later stages flag the
    /// report instead of treating it as complete.
    pub fn from_legacy_metadata(dir: &Path) -> Result<CrashContext, ContextError> {
        let mut context = CrashContext {
            report_dir: dir.to_path_buf(),
            report_id: dir_name(dir),
            crash_time: Utc::now(),
            ..CrashContext::default()
        };

        let metadata_path = dir.join(LEGACY_METADATA_FILE);
        if metadata_path.is_file() {
            let raw = fs::read_to_string(&metadata_path)?;
            for line in raw.lines() {
                let Some((key, value)) = line.split_once('=') else {
                    continue;
                };
                let value = value.trim().to_string();
                match key.trim() {
                    "EngineVersion" => context.engine_version = value,
                    "Platform" => context.platform = value,
                    "PlatformVariant" => context.platform_variant = value,
                    "BuildConfiguration" => context.build_config = value,
                    "CommandLine" => context.command_line = value,
                    "UserName" => context.user_name = value,
                    "MachineId" => context.machine_id = value,
                    "BranchName" => context.branch_name = value,
                    "ChangeList" => context.changelist = value,
                    "CrashType" => context.kind = CrashKind::parse(&value),
                    "AllowContact" => context.allow_contact = value.eq_ignore_ascii_case("true"),
                    _ => {}
                }
            }
        } else {
            debug!("No legacy metadata in {}", dir.display());
        }

        let diagnostics_path = dir.join(DIAGNOSTICS_FILE);
        if diagnostics_path.is_file() {
            if let Ok(text) = fs::read_to_string(&diagnostics_path) {
                context.apply_diagnostics(&text);
            }
        }

        let mut warnings = Vec::new();
        if context.branch_name.is_empty() {
            warnings.push("no branch name reported by client");
        }
        if context.changelist.is_empty() {
            warnings.push("no changelist reported by client");
        }
        if !diagnostics_path.is_file() && !context.has_processed_data() {
            warnings.push("neither diagnostics nor callstack/error present");
        }
        if !warnings.is_empty() {
            warn!(
                "Synthesized incomplete context for {}: {}",
                context.report_id,
                warnings.join("; ")
            );
            context.processor_failed_message = Some(warnings.join("; "));
        }

        Ok(context)
    }

    /// Parses a diagnostics text blob into error message, call stack and
    /// source context, replacing whatever the context held before.
    pub fn apply_diagnostics(&mut self, text: &str) {
        let mut error_message = String::new();
        let mut call_stack = Vec::new();
        let mut source_context = Vec::new();

        enum Section {
            None,
            Callstack,
            Source,
        }
        let mut section = Section::None;

        for line in text.lines() {
            let trimmed = line.trim_end();
            if let Some(rest) = trimmed.strip_prefix(ERROR_PREFIX) {
                error_message = rest.trim().to_string();
                section = Section::None;
            } else if trimmed == CALLSTACK_HEADER {
                section = Section::Callstack;
            } else if trimmed == SOURCE_CONTEXT_HEADER {
                section = Section::Source;
            } else if trimmed.is_empty() {
                section = Section::None;
            } else {
                match section {
                    Section::Callstack => call_stack.push(trimmed.trim_start().to_string()),
                    Section::Source => source_context.push(trimmed.to_string()),
                    Section::None => {}
                }
            }
        }

        if !error_message.is_empty() {
            self.error_message = error_message;
        }
        if !call_stack.is_empty() {
            self.call_stack = call_stack;
        }
        if !source_context.is_empty() {
            self.source_context = source_context;
        }
    }
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn find_sidecar(dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(SIDECAR_EXTENSION))
        {
            return Some(path);
        }
    }
    None
}

// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded-concurrency gate around the external symbolication tool.
//!
//! The tool is memory-hungry, so a fixed pool of slots caps how many
//! invocations run at once regardless of worker-pool size; callers block on
//! a free slot. Hang-detection reports short-circuit the tool entirely: the
//! dump of a stalled process symbolicates to nothing useful, so a placeholder
//! call stack is synthesized instead.

use crate::context::CrashContext;
use crash_telemetry::CounterRegistry;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

pub const TIMER_SYMBOLICATION: &str = "symbolication.duration";
pub const COUNTER_SUCCEEDED: &str = "symbolication.succeeded";
pub const COUNTER_FAILED: &str = "symbolication.failed";
pub const COUNTER_TIMED_OUT: &str = "symbolication.timed_out";
pub const COUNTER_HANG_FAST_PATH: &str = "symbolication.hang_fast_path";

/// Command-line switch the client adds when the watchdog, not the crashing
/// code, produced the report.
const HANG_DETECTION_SWITCH: &str = "-hangdetection";

#[derive(Debug, Clone)]
pub struct SymbolicatorSettings {
    pub tool_path: PathBuf,
    pub timeout: Duration,
    pub slots: usize,
    pub symbol_cache: Option<PathBuf>,
}

pub struct Symbolicator {
    settings: SymbolicatorSettings,
    slots: Arc<Semaphore>,
    telemetry: Arc<CounterRegistry>,
}

impl Symbolicator {
    pub fn new(settings: SymbolicatorSettings, telemetry: Arc<CounterRegistry>) -> Self {
        let slots = Arc::new(Semaphore::new(settings.slots.max(1)));
        Symbolicator {
            settings,
            slots,
            telemetry,
        }
    }

    /// Symbolicates `dump_path` into `context`. Blocks on a free slot, runs
    /// the tool under a hard timeout, and reports success only on a clean
    /// exit within that timeout. The produced diagnostics file is read back
    /// by the caller.
    pub async fn run(&self, dump_path: &Path, context: &mut CrashContext) -> bool {
        if is_hang_report(context) {
            synthesize_hang_stack(context);
            self.telemetry.incr(COUNTER_HANG_FAST_PATH);
            return true;
        }

        let permit = match self.slots.acquire().await {
            Ok(permit) => permit,
            Err(_) => return false, // pool closed during shutdown
        };

        let started = Instant::now();
        let succeeded = self.invoke_tool(dump_path, context).await;
        self.telemetry
            .record_timing(TIMER_SYMBOLICATION, started.elapsed());
        drop(permit);

        if succeeded {
            self.telemetry.incr(COUNTER_SUCCEEDED);
        } else {
            self.telemetry.incr(COUNTER_FAILED);
        }
        succeeded
    }

    async fn invoke_tool(&self, dump_path: &Path, context: &CrashContext) -> bool {
        let mut command = self.build_command(dump_path, context);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(
                    "Failed to launch {} for {}: {e}",
                    self.settings.tool_path.display(),
                    context.report_id
                );
                return false;
            }
        };

        match tokio::time::timeout(self.settings.timeout, child.wait()).await {
            Ok(Ok(status)) if status.success() => {
                debug!("Symbolicated {}", context.report_id);
                true
            }
            Ok(Ok(status)) => {
                warn!(
                    "Symbolication of {} exited with {status}",
                    context.report_id
                );
                false
            }
            Ok(Err(e)) => {
                error!("Symbolication of {} failed: {e}", context.report_id);
                false
            }
            Err(_) => {
                warn!(
                    "Symbolication of {} exceeded {:?}, killing tool",
                    context.report_id, self.settings.timeout
                );
                self.telemetry.incr(COUNTER_TIMED_OUT);
                if let Err(e) = child.kill().await {
                    error!("Failed to kill symbolication tool: {e}");
                }
                false
            }
        }
    }

    fn build_command(&self, dump_path: &Path, context: &CrashContext) -> Command {
        let mut command = Command::new(&self.settings.tool_path);
        command
            .arg(dump_path)
            .arg("--engine-version")
            .arg(&context.engine_version)
            .arg("--platform")
            .arg(&context.platform)
            .arg("--build-id")
            .arg(format!("{}@{}", context.branch_name, context.changelist))
            .kill_on_drop(true);
        if let Some(cache) = &self.settings.symbol_cache {
            command.arg("--symbol-cache").arg(cache);
        }
        command
    }
}

fn is_hang_report(context: &CrashContext) -> bool {
    context
        .command_line
        .to_ascii_lowercase()
        .contains(HANG_DETECTION_SWITCH)
}

fn synthesize_hang_stack(context: &mut CrashContext) {
    context.call_stack = vec![
        "Hang detected: call stack not recoverable from watchdog report".to_string(),
    ];
    if context.error_message.is_empty() {
        context.error_message =
            "Application stalled and was terminated by the hang watchdog".to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use tokio::task::JoinSet;

    #[cfg(unix)]
    fn write_stub_tool(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-symbolicator.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn context_for(dump_dir: &Path) -> CrashContext {
        CrashContext {
            report_dir: dump_dir.to_path_buf(),
            report_id: "CR-SYM-0001".to_string(),
            engine_version: "5.3.0".to_string(),
            platform: "Linux".to_string(),
            branch_name: "main".to_string(),
            changelist: "100".to_string(),
            ..CrashContext::default()
        }
    }

    #[tokio::test]
    async fn hang_report_short_circuits_without_tool() {
        let tmp = TempDir::new().unwrap();
        let telemetry = Arc::new(CounterRegistry::new());
        let symbolicator = Symbolicator::new(
            SymbolicatorSettings {
                tool_path: PathBuf::from("/definitely/not/a/tool"),
                timeout: Duration::from_secs(1),
                slots: 1,
                symbol_cache: None,
            },
            telemetry.clone(),
        );

        let mut context = context_for(tmp.path());
        context.command_line = "-game -HangDetection".to_string();

        assert!(symbolicator.run(&tmp.path().join("a.dmp"), &mut context).await);
        assert!(context.call_stack[0].contains("Hang detected"));
        assert!(!context.error_message.is_empty());
        assert_eq!(telemetry.counter(COUNTER_HANG_FAST_PATH), 1);
    }

    #[tokio::test]
    async fn missing_tool_reports_failure() {
        let tmp = TempDir::new().unwrap();
        let telemetry = Arc::new(CounterRegistry::new());
        let symbolicator = Symbolicator::new(
            SymbolicatorSettings {
                tool_path: PathBuf::from("/definitely/not/a/tool"),
                timeout: Duration::from_secs(1),
                slots: 1,
                symbol_cache: None,
            },
            telemetry.clone(),
        );

        let mut context = context_for(tmp.path());
        assert!(!symbolicator.run(&tmp.path().join("a.dmp"), &mut context).await);
        assert_eq!(telemetry.counter(COUNTER_FAILED), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn clean_exit_within_timeout_is_success() {
        let tmp = TempDir::new().unwrap();
        let tool = write_stub_tool(tmp.path(), "exit 0");
        let telemetry = Arc::new(CounterRegistry::new());
        let symbolicator = Symbolicator::new(
            SymbolicatorSettings {
                tool_path: tool,
                timeout: Duration::from_secs(5),
                slots: 1,
                symbol_cache: None,
            },
            telemetry.clone(),
        );

        let mut context = context_for(tmp.path());
        assert!(symbolicator.run(&tmp.path().join("a.dmp"), &mut context).await);
        assert_eq!(telemetry.counter(COUNTER_SUCCEEDED), 1);
        assert_eq!(
            telemetry.snapshot().timers[TIMER_SYMBOLICATION].samples,
            1
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn overrunning_tool_is_killed_and_failed() {
        let tmp = TempDir::new().unwrap();
        let tool = write_stub_tool(tmp.path(), "sleep 30");
        let telemetry = Arc::new(CounterRegistry::new());
        let symbolicator = Symbolicator::new(
            SymbolicatorSettings {
                tool_path: tool,
                timeout: Duration::from_millis(200),
                slots: 1,
                symbol_cache: None,
            },
            telemetry.clone(),
        );

        let mut context = context_for(tmp.path());
        assert!(!symbolicator.run(&tmp.path().join("a.dmp"), &mut context).await);
        assert_eq!(telemetry.counter(COUNTER_TIMED_OUT), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn concurrency_never_exceeds_slot_count() {
        let tmp = TempDir::new().unwrap();
        // Each stub invocation marks itself with a pid file, counts its live
        // peers, and flags an overflow if it ever sees more than the slot
        // count running at once.
        let running = tmp.path().join("running");
        fs::create_dir(&running).unwrap();
        let overflow = tmp.path().join("overflow");
        let tool = write_stub_tool(
            tmp.path(),
            &format!(
                "touch {running}/$$\n\
                 count=$(ls {running} | wc -l)\n\
                 if [ \"$count\" -gt 2 ]; then touch {overflow}; fi\n\
                 sleep 0.2\n\
                 rm -f {running}/$$\n\
                 exit 0",
                running = running.display(),
                overflow = overflow.display()
            ),
        );

        let telemetry = Arc::new(CounterRegistry::new());
        let symbolicator = Arc::new(Symbolicator::new(
            SymbolicatorSettings {
                tool_path: tool,
                timeout: Duration::from_secs(10),
                slots: 2,
                symbol_cache: None,
            },
            telemetry.clone(),
        ));

        let mut tasks = JoinSet::new();
        for i in 0..6 {
            let symbolicator = symbolicator.clone();
            let dump = tmp.path().join(format!("{i}.dmp"));
            let dir = tmp.path().to_path_buf();
            tasks.spawn(async move {
                let mut context = context_for(&dir);
                symbolicator.run(&dump, &mut context).await
            });
        }
        while let Some(result) = tasks.join_next().await {
            assert!(result.unwrap());
        }

        assert!(!overflow.exists(), "more than 2 invocations ran at once");
        assert_eq!(telemetry.counter(COUNTER_SUCCEEDED), 6);
    }
}

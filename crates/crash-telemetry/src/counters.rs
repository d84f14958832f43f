// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide named counters, mean timers and gauges.
//!
//! Every pipeline component increments counters through a shared
//! [`CounterRegistry`]. Reporting loops never reset shared state; each loop
//! takes a [`Snapshot`] and computes a [`Delta`] against the snapshot it took
//! on its own previous iteration, so loops with different periods do not
//! interfere with each other's readings.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Accumulated samples for one mean timer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerTotals {
    pub samples: u64,
    pub total: Duration,
}

impl TimerTotals {
    pub fn mean(&self) -> Option<Duration> {
        if self.samples == 0 {
            return None;
        }
        Some(self.total / u32::try_from(self.samples).unwrap_or(u32::MAX))
    }
}

#[derive(Debug, Default)]
struct Registry {
    counters: HashMap<String, u64>,
    timers: HashMap<String, TimerTotals>,
    gauges: HashMap<String, i64>,
}

/// Shared registry of monotonic counters, mean timers and gauges.
///
/// A single mutex guards all three maps; increments are cheap and no lock is
/// held across an await point anywhere in the pipeline.
#[derive(Debug, Default)]
pub struct CounterRegistry {
    inner: Mutex<Registry>,
}

#[allow(clippy::expect_used)]
impl CounterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &str) {
        self.add(name, 1);
    }

    pub fn add(&self, name: &str, amount: u64) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        *inner.counters.entry(name.to_string()).or_insert(0) += amount;
    }

    pub fn record_timing(&self, name: &str, elapsed: Duration) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let totals = inner.timers.entry(name.to_string()).or_default();
        totals.samples += 1;
        totals.total += elapsed;
    }

    pub fn set_gauge(&self, name: &str, value: i64) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.gauges.insert(name.to_string(), value);
    }

    pub fn counter(&self, name: &str) -> u64 {
        let inner = self.inner.lock().expect("lock poisoned");
        inner.counters.get(name).copied().unwrap_or(0)
    }

    /// Copies the current totals. Reporting loops diff two snapshots rather
    /// than resetting shared state.
    pub fn snapshot(&self) -> Snapshot {
        let inner = self.inner.lock().expect("lock poisoned");
        Snapshot {
            counters: inner.counters.clone(),
            timers: inner.timers.clone(),
            gauges: inner.gauges.clone(),
        }
    }
}

/// Point-in-time copy of every counter, timer and gauge.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub counters: HashMap<String, u64>,
    pub timers: HashMap<String, TimerTotals>,
    pub gauges: HashMap<String, i64>,
}

impl Snapshot {
    /// Computes the change since `previous`. Counters and timer totals are
    /// monotonic, so a plain saturating subtraction is enough; gauges carry
    /// their current value.
    pub fn delta_since(&self, previous: &Snapshot) -> Delta {
        let mut counters = HashMap::new();
        for (name, value) in &self.counters {
            let before = previous.counters.get(name).copied().unwrap_or(0);
            counters.insert(name.clone(), value.saturating_sub(before));
        }

        let mut timers = HashMap::new();
        for (name, totals) in &self.timers {
            let before = previous.timers.get(name).copied().unwrap_or_default();
            timers.insert(
                name.clone(),
                TimerTotals {
                    samples: totals.samples.saturating_sub(before.samples),
                    total: totals.total.saturating_sub(before.total),
                },
            );
        }

        Delta {
            counters,
            timers,
            gauges: self.gauges.clone(),
        }
    }
}

/// Per-period change between two snapshots.
#[derive(Debug, Clone, Default)]
pub struct Delta {
    pub counters: HashMap<String, u64>,
    pub timers: HashMap<String, TimerTotals>,
    pub gauges: HashMap<String, i64>,
}

impl Delta {
    pub fn is_quiet(&self) -> bool {
        self.counters.values().all(|v| *v == 0) && self.timers.values().all(|t| t.samples == 0)
    }
}

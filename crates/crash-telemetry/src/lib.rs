// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Operator-facing telemetry for the crash pipeline: process-wide counters and
//! timers, independent periodic status loops, and rate-limited threshold
//! alerts delivered through pluggable notification sinks.

pub mod alerts;
pub mod counters;
pub mod disk;
pub mod reporter;
pub mod sink;

pub use alerts::Alerter;
pub use counters::{CounterRegistry, Delta, Snapshot};
pub use reporter::{ReporterSettings, StatusReporter};
pub use sink::{LogSink, NotificationSink, WebhookSink};

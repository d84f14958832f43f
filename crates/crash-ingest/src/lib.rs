// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ingestion and processing pipeline for crash reports.
//!
//! Reports arrive from several uncoordinated producers: dropped directly
//! into a landing-zone directory, or published as compressed bundles through
//! a message queue + object store. The pipeline deduplicates them, extracts
//! and symbolicates diagnostics, uploads a normalized descriptor to the
//! intake service and archives raw artifacts, with at-most-once processing
//! guaranteed by a durable dedup index.

pub mod bundle;
pub mod config;
pub mod context;
pub mod dedup;
pub mod intake;
pub mod processor;
pub mod queue;
pub mod remote;
pub mod store;
pub mod symbolicator;
pub mod watcher;

pub use config::Config;
pub use context::{CrashContext, CrashKind};
pub use dedup::DedupIndex;
pub use queue::{LandingZoneQueue, QueueSettings, ReportQueue};

// SPDX-License-Identifier: MIT OR Apache-2.0
//! ocmem-telemetry
//!
//! The abstract `log`/`status`/`notify` surface the core uses to talk to
//! whatever agent host is embedding it, plus structured metrics collection
//! for the ingestor's periodic heartbeats.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Log severity passed to [`HostClient::log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Diagnostic detail, shown only under `verbose` or `CLAUDE_MEM_DEBUG`.
    Debug,
    /// Routine progress information.
    Info,
    /// Recoverable but noteworthy condition.
    Warn,
    /// A failure the user should know about.
    Error,
}

/// Notification severity passed to [`HostClient::notify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyKind {
    /// Informational toast.
    Info,
    /// Something went wrong.
    Error,
}

/// Output verbosity. Default is `Normal`; `Quiet` suppresses info/warn and
/// only shows errors; `Verbose` (or `CLAUDE_MEM_DEBUG=true`) enables debug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Errors only.
    Quiet,
    /// Info, warn, and error.
    #[default]
    Normal,
    /// Everything, including debug.
    Verbose,
}

impl Verbosity {
    /// Whether a message at `level` should surface given this verbosity.
    #[must_use]
    pub fn allows(self, level: LogLevel) -> bool {
        match (self, level) {
            (Self::Quiet, LogLevel::Error) => true,
            (Self::Quiet, _) => false,
            (Self::Normal, LogLevel::Debug) => false,
            (Self::Normal, _) => true,
            (Self::Verbose, _) => true,
        }
    }
}

/// Abstract surface for reporting status to whatever embeds oc-memory.
///
/// Implementors typically forward to `tracing` and/or a host-specific UI
/// channel; [`TracingHostClient`] is the default implementation used when no
/// host provides its own.
pub trait HostClient: Send + Sync {
    /// Emit a structured log line with arbitrary metadata.
    fn log(&self, level: LogLevel, message: &str, meta: &BTreeMap<String, serde_json::Value>);

    /// Report a transient status update (e.g. "ingesting 12 observations").
    fn status(&self, message: &str);

    /// Surface a user-facing notification.
    fn notify(&self, message: &str, kind: NotifyKind);
}

/// [`HostClient`] implementation that forwards everything to `tracing`,
/// gated by a [`Verbosity`] level.
#[derive(Debug, Clone)]
pub struct TracingHostClient {
    verbosity: Verbosity,
}

impl TracingHostClient {
    /// Build a client at the given verbosity.
    #[must_use]
    pub fn new(verbosity: Verbosity) -> Self {
        Self { verbosity }
    }
}

impl HostClient for TracingHostClient {
    fn log(&self, level: LogLevel, message: &str, meta: &BTreeMap<String, serde_json::Value>) {
        if !self.verbosity.allows(level) {
            return;
        }
        match level {
            LogLevel::Debug => debug!(meta = ?meta, "{message}"),
            LogLevel::Info => info!(meta = ?meta, "{message}"),
            LogLevel::Warn => warn!(meta = ?meta, "{message}"),
            LogLevel::Error => error!(meta = ?meta, "{message}"),
        }
    }

    fn status(&self, message: &str) {
        if self.verbosity.allows(LogLevel::Info) {
            info!(status = message, "status");
        }
    }

    fn notify(&self, message: &str, kind: NotifyKind) {
        match kind {
            NotifyKind::Info => info!(notify = message, "notify"),
            NotifyKind::Error => error!(notify = message, "notify"),
        }
    }
}

/// Metrics captured for a single ingestor tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IngestTickMetrics {
    /// Outbox files scanned this tick.
    pub files_processed: u64,
    /// Rows successfully promoted into a project store.
    pub rows_ingested: u64,
    /// Lines that failed to parse as JSON.
    pub malformed_lines: u64,
    /// Wall-clock duration of the tick in milliseconds.
    pub duration_ms: u64,
}

/// Aggregated statistics across multiple ingestor ticks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsSummary {
    /// Number of ticks recorded.
    pub count: usize,
    /// Mean tick duration in milliseconds.
    pub mean_duration_ms: f64,
    /// 99th-percentile tick duration in milliseconds.
    pub p99_duration_ms: f64,
    /// Total rows ingested across all ticks.
    pub total_rows_ingested: u64,
    /// Total malformed lines across all ticks.
    pub total_malformed_lines: u64,
}

impl Default for MetricsSummary {
    fn default() -> Self {
        Self {
            count: 0,
            mean_duration_ms: 0.0,
            p99_duration_ms: 0.0,
            total_rows_ingested: 0,
            total_malformed_lines: 0,
        }
    }
}

/// Compute a percentile value from a **sorted** slice.
fn percentile(sorted: &[u64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0] as f64;
    }
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] as f64 * (1.0 - frac) + sorted[upper] as f64 * frac
}

/// Thread-safe collector for ingestor tick metrics.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    inner: Arc<Mutex<Vec<IngestTickMetrics>>>,
}

impl MetricsCollector {
    /// Create a new, empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Record a completed tick's metrics.
    pub fn record(&self, metrics: IngestTickMetrics) {
        let mut data = self.inner.lock().expect("metrics lock poisoned");
        data.push(metrics);
    }

    /// Number of ticks recorded so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("metrics lock poisoned").len()
    }

    /// Whether the collector has no recorded ticks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compute an aggregated summary of all recorded ticks.
    #[must_use]
    pub fn summary(&self) -> MetricsSummary {
        let data = self.inner.lock().expect("metrics lock poisoned");
        if data.is_empty() {
            return MetricsSummary::default();
        }
        let count = data.len();
        let mut durations: Vec<u64> = data.iter().map(|r| r.duration_ms).collect();
        durations.sort_unstable();
        let mean_duration_ms = durations.iter().sum::<u64>() as f64 / count as f64;
        MetricsSummary {
            count,
            mean_duration_ms,
            p99_duration_ms: percentile(&durations, 99.0),
            total_rows_ingested: data.iter().map(|r| r.rows_ingested).sum(),
            total_malformed_lines: data.iter().map(|r| r.malformed_lines).sum(),
        }
    }
}

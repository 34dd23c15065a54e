// SPDX-License-Identifier: MIT OR Apache-2.0
//! Structured telemetry for the settlement substrate.
//!
//! Tracing is initialized once at binary startup; the metrics collector is a
//! thread-safe aggregate of append and delivery counters with deterministic
//! `BTreeMap` output.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

/// Initialize tracing from `RUST_LOG`, falling back to `level`.
///
/// Safe to call once per process; later calls are ignored.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// One append observation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppendSample {
    /// Stream the append targeted.
    pub stream_id: String,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Whether the append was accepted.
    pub ok: bool,
    /// Whether it failed on an optimistic-concurrency conflict.
    pub conflict: bool,
}

/// Aggregated counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSummary {
    /// Appends observed.
    pub appends: u64,
    /// Appends rejected on conflict.
    pub append_conflicts: u64,
    /// Mean append duration in milliseconds.
    pub mean_append_ms: f64,
    /// 99th-percentile append duration in milliseconds.
    pub p99_append_ms: f64,
    /// Deliveries acknowledged as delivered.
    pub deliveries_ok: u64,
    /// Deliveries that scheduled a retry.
    pub delivery_retries: u64,
    /// Entries dead-lettered.
    pub dlq_entries: u64,
    /// Per-stream append counts (deterministic ordering).
    pub appends_by_stream: BTreeMap<String, u64>,
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

#[derive(Debug, Default)]
struct Counters {
    appends: Vec<AppendSample>,
    deliveries_ok: u64,
    delivery_retries: u64,
    dlq_entries: u64,
}

/// Thread-safe collector for substrate metrics.
///
/// Clone freely; clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector {
    inner: Arc<Mutex<Counters>>,
}

impl MetricsCollector {
    /// Create an empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one append observation.
    pub fn record_append(&self, sample: AppendSample) {
        self.inner
            .lock()
            .expect("metrics mutex poisoned")
            .appends
            .push(sample);
    }

    /// Record one delivery resolution.
    pub fn record_delivery(&self, delivered: usize, retried: usize, dead_lettered: usize) {
        let mut inner = self.inner.lock().expect("metrics mutex poisoned");
        inner.deliveries_ok += delivered as u64;
        inner.delivery_retries += retried as u64;
        inner.dlq_entries += dead_lettered as u64;
    }

    /// Aggregate everything recorded so far.
    #[must_use]
    pub fn summary(&self) -> MetricsSummary {
        let inner = self.inner.lock().expect("metrics mutex poisoned");
        let mut durations: Vec<u64> = inner.appends.iter().map(|s| s.duration_ms).collect();
        durations.sort_unstable();
        let mean = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<u64>() as f64 / durations.len() as f64
        };
        let mut by_stream = BTreeMap::new();
        for sample in &inner.appends {
            *by_stream.entry(sample.stream_id.clone()).or_insert(0u64) += 1;
        }
        MetricsSummary {
            appends: inner.appends.len() as u64,
            append_conflicts: inner.appends.iter().filter(|s| s.conflict).count() as u64,
            mean_append_ms: mean,
            p99_append_ms: percentile(&durations, 99.0),
            deliveries_ok: inner.deliveries_ok,
            delivery_retries: inner.delivery_retries,
            dlq_entries: inner.dlq_entries,
            appends_by_stream: by_stream,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(stream: &str, ms: u64, conflict: bool) -> AppendSample {
        AppendSample {
            stream_id: stream.to_string(),
            duration_ms: ms,
            ok: !conflict,
            conflict,
        }
    }

    #[test]
    fn empty_summary_is_zeroed() {
        let summary = MetricsCollector::new().summary();
        assert_eq!(summary.appends, 0);
        assert_eq!(summary.p99_append_ms, 0.0);
        assert!(summary.appends_by_stream.is_empty());
    }

    #[test]
    fn counters_aggregate() {
        let collector = MetricsCollector::new();
        collector.record_append(sample("s1", 10, false));
        collector.record_append(sample("s1", 20, true));
        collector.record_append(sample("s2", 30, false));
        collector.record_delivery(2, 1, 1);

        let summary = collector.summary();
        assert_eq!(summary.appends, 3);
        assert_eq!(summary.append_conflicts, 1);
        assert_eq!(summary.mean_append_ms, 20.0);
        assert_eq!(summary.appends_by_stream["s1"], 2);
        assert_eq!(summary.deliveries_ok, 2);
        assert_eq!(summary.delivery_retries, 1);
        assert_eq!(summary.dlq_entries, 1);
    }

    #[test]
    fn clones_share_storage() {
        let a = MetricsCollector::new();
        let b = a.clone();
        b.record_append(sample("s1", 5, false));
        assert_eq!(a.summary().appends, 1);
    }

    #[test]
    fn percentile_interpolates() {
        assert_eq!(percentile(&[10], 99.0), 10.0);
        assert_eq!(percentile(&[0, 100], 50.0), 50.0);
        assert!(percentile(&[1, 2, 3, 4, 100], 99.0) > 90.0);
    }
}

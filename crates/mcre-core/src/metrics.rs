//! Run metrics.
//!
//! - **Counters**: runs, failed runs, participants processed/failed, entries created/clamped
//! - **Histograms**: run and per-participant latency
//! - **Gauges**: runs currently executing
//!
//! # Usage
//!
//! ```rust,ignore
//! use mcre_core::metrics::RunMetrics;
//!
//! let metrics = RunMetrics::new();
//! metrics.record_run(&run);
//! println!("{}", metrics.render_prometheus());
//! ```

use crate::orchestrator::report::{CommissionRun, RunStatus};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Instant;

// =============================================================================
// Metric Types
// =============================================================================

/// A simple counter that can only increase.
#[derive(Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge that can go up or down.
#[derive(Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A histogram for tracking distributions.
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    bucket_bounds: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Buckets in milliseconds, sized for whole runs.
    pub fn new_run_latency() -> Self {
        Self::new(vec![
            10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0, 15000.0, 60000.0, 300000.0,
        ])
    }

    /// Buckets in milliseconds, sized for one participant's evaluation.
    pub fn new_participant_latency() -> Self {
        Self::new(vec![0.1, 0.5, 1.0, 5.0, 10.0, 50.0, 100.0])
    }

    pub fn new(bucket_bounds: Vec<f64>) -> Self {
        let buckets = (0..=bucket_bounds.len())
            .map(|_| AtomicU64::new(0))
            .collect();

        Self {
            buckets,
            bucket_bounds,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .bucket_bounds
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(self.bucket_bounds.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        self.sum
            .fetch_add((value * 1000.0) as u64, Ordering::Relaxed); // Store as micros
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get_sum(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn get_mean(&self) -> f64 {
        let count = self.get_count();
        if count == 0 {
            0.0
        } else {
            self.get_sum() / count as f64
        }
    }

    /// Cumulative `(upper_bound, count)` pairs; the last bound is `+Inf`.
    fn cumulative(&self) -> Vec<(String, u64)> {
        let mut total = 0;
        let mut out = Vec::with_capacity(self.buckets.len());
        for (i, bucket) in self.buckets.iter().enumerate() {
            total += bucket.load(Ordering::Relaxed);
            let le = self
                .bucket_bounds
                .get(i)
                .map(|b| b.to_string())
                .unwrap_or_else(|| "+Inf".to_string());
            out.push((le, total));
        }
        out
    }
}

// =============================================================================
// Run Metrics Collection
// =============================================================================

/// Metrics shared by every run of one orchestrator.
pub struct RunMetrics {
    pub runs_total: Counter,
    pub runs_failed: Counter,
    pub runs_with_errors: Counter,
    pub runs_aborted: Counter,
    pub idempotency_conflicts: Counter,

    pub participants_processed: Counter,
    pub participant_failures: Counter,
    pub entries_created: Counter,
    pub entries_clamped: Counter,
    pub rank_changes: Counter,

    pub active_runs: Gauge,

    pub run_latency: Histogram,
    pub participant_latency: Histogram,

    // Entries created per commission type.
    entries_by_type: RwLock<BTreeMap<String, u64>>,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self {
            runs_total: Counter::new(),
            runs_failed: Counter::new(),
            runs_with_errors: Counter::new(),
            runs_aborted: Counter::new(),
            idempotency_conflicts: Counter::new(),

            participants_processed: Counter::new(),
            participant_failures: Counter::new(),
            entries_created: Counter::new(),
            entries_clamped: Counter::new(),
            rank_changes: Counter::new(),

            active_runs: Gauge::new(),

            run_latency: Histogram::new_run_latency(),
            participant_latency: Histogram::new_participant_latency(),

            entries_by_type: RwLock::new(BTreeMap::new()),
        }
    }

    /// Fold a finished run into the counters.
    pub fn record_run(&self, run: &CommissionRun) {
        self.runs_total.inc();
        match run.status {
            RunStatus::Failed => self.runs_failed.inc(),
            RunStatus::CompletedWithErrors => self.runs_with_errors.inc(),
            RunStatus::Completed => {}
        }
        if run.aborted.is_some() {
            self.runs_aborted.inc();
        }
        self.participants_processed
            .inc_by(run.participants_processed as u64);
        self.participant_failures.inc_by(run.errors.len() as u64);
        self.entries_created.inc_by(run.entries_created as u64);
        self.entries_clamped.inc_by(run.entries_clamped as u64);
        self.rank_changes.inc_by(run.rank_changes.len() as u64);

        let latency = (run.finished_at - run.started_at)
            .to_std()
            .map(|d| d.as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        self.run_latency.observe(latency);
    }

    pub fn record_entries(&self, kind: &str, n: u64) {
        if let Ok(mut map) = self.entries_by_type.write() {
            *map.entry(kind.to_string()).or_insert(0) += n;
        }
    }

    pub fn get_entries(&self, kind: &str) -> u64 {
        if let Ok(map) = self.entries_by_type.read() {
            map.get(kind).copied().unwrap_or(0)
        } else {
            0
        }
    }

    /// Export metrics as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        let by_type = self
            .entries_by_type
            .read()
            .map(|m| m.clone())
            .unwrap_or_default();
        serde_json::json!({
            "counters": {
                "runs_total": self.runs_total.get(),
                "runs_failed": self.runs_failed.get(),
                "runs_with_errors": self.runs_with_errors.get(),
                "runs_aborted": self.runs_aborted.get(),
                "idempotency_conflicts": self.idempotency_conflicts.get(),
                "participants_processed": self.participants_processed.get(),
                "participant_failures": self.participant_failures.get(),
                "entries_created": self.entries_created.get(),
                "entries_clamped": self.entries_clamped.get(),
                "rank_changes": self.rank_changes.get(),
            },
            "gauges": {
                "active_runs": self.active_runs.get(),
            },
            "entries_by_type": by_type,
            "latencies_ms": {
                "run_mean": self.run_latency.get_mean(),
                "participant_mean": self.participant_latency.get_mean(),
            },
        })
    }

    /// Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        let counters = [
            ("mcre_runs_total", &self.runs_total),
            ("mcre_runs_failed_total", &self.runs_failed),
            ("mcre_runs_with_errors_total", &self.runs_with_errors),
            ("mcre_runs_aborted_total", &self.runs_aborted),
            ("mcre_idempotency_conflicts_total", &self.idempotency_conflicts),
            ("mcre_participants_processed_total", &self.participants_processed),
            ("mcre_participant_failures_total", &self.participant_failures),
            ("mcre_entries_created_total", &self.entries_created),
            ("mcre_entries_clamped_total", &self.entries_clamped),
            ("mcre_rank_changes_total", &self.rank_changes),
        ];
        for (name, counter) in counters {
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {}", counter.get());
        }

        let _ = writeln!(out, "# TYPE mcre_active_runs gauge");
        let _ = writeln!(out, "mcre_active_runs {}", self.active_runs.get());

        if let Ok(map) = self.entries_by_type.read() {
            let _ = writeln!(out, "# TYPE mcre_entries_by_type_total counter");
            for (kind, n) in map.iter() {
                let _ = writeln!(out, "mcre_entries_by_type_total{{kind=\"{kind}\"}} {n}");
            }
        }

        for (name, hist) in [
            ("mcre_run_latency_ms", &self.run_latency),
            ("mcre_participant_latency_ms", &self.participant_latency),
        ] {
            let _ = writeln!(out, "# TYPE {name} histogram");
            for (le, count) in hist.cumulative() {
                let _ = writeln!(out, "{name}_bucket{{le=\"{le}\"}} {count}");
            }
            let _ = writeln!(out, "{name}_sum {}", hist.get_sum());
            let _ = writeln!(out, "{name}_count {}", hist.get_count());
        }
        out
    }
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Stage Timer
// =============================================================================

/// Observes elapsed milliseconds into a histogram when dropped.
pub struct StageTimer<'a> {
    histogram: &'a Histogram,
    start: Instant,
}

impl<'a> StageTimer<'a> {
    pub fn start(histogram: &'a Histogram) -> Self {
        Self {
            histogram,
            start: Instant::now(),
        }
    }
}

impl<'a> Drop for StageTimer<'a> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        self.histogram.observe(elapsed.as_secs_f64() * 1000.0);
    }
}

// =============================================================================
// Tests
// =============================================================================

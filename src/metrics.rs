//! Capture-engine measurements.
//!
//! Each [`Metric`] keeps its most recent observations in a bounded window.
//! Timings are in microseconds; window sizes in seconds of audio; fill is the
//! delivered / requested ratio of a finalized recording (1.0 = complete).

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Copying a session window out of the ring.
    RingReadUs,
    /// Whole finalize path: ring copy, artifact assembly, persist.
    FinalizeUs,
    PersistUs,
    /// Time a knock spent in the dispatcher queue.
    KnockQueueWaitUs,
    /// Seconds of audio handed to the sink per recording.
    WindowSecs,
    WindowFill,
}

impl Metric {
    pub fn name(self) -> &'static str {
        match self {
            Metric::RingReadUs => "ring_read_us",
            Metric::FinalizeUs => "finalize_us",
            Metric::PersistUs => "persist_us",
            Metric::KnockQueueWaitUs => "knock_queue_wait_us",
            Metric::WindowSecs => "window_secs",
            Metric::WindowFill => "window_fill",
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSummary {
    pub p50: f64,
    pub p95: f64,
    pub min: f64,
    pub max: f64,
    pub count: usize,
}

pub struct MetricsRegistry {
    windows: Mutex<HashMap<Metric, VecDeque<f64>>>,
    keep: usize,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::with_window(1024)
    }

    /// Keep at most `keep` observations per metric.
    pub fn with_window(keep: usize) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            keep: keep.max(1),
        }
    }

    pub fn record(&self, metric: Metric, value: f64) {
        let mut windows = self.windows.lock();
        let window = windows.entry(metric).or_default();
        if window.len() == self.keep {
            window.pop_front();
        }
        window.push_back(value);
        tracing::trace!(%metric, value, "metric_recorded");
    }

    /// Run `f`, recording its wall time under `metric`.
    pub fn time<T>(&self, metric: Metric, f: impl FnOnce() -> T) -> T {
        let started = Instant::now();
        let out = f();
        self.record(metric, started.elapsed().as_secs_f64() * 1e6);
        out
    }

    /// Record how much of a requested recording made it out of the ring.
    pub fn record_window(&self, delivered_secs: f64, requested_secs: f64) {
        self.record(Metric::WindowSecs, delivered_secs);
        let fill = if requested_secs > 0.0 {
            (delivered_secs / requested_secs).min(1.0)
        } else {
            1.0
        };
        self.record(Metric::WindowFill, fill);
    }

    pub fn get(&self, metric: Metric) -> Option<MetricSummary> {
        self.windows.lock().get(&metric).and_then(summarize)
    }

    pub fn summary(&self) -> Vec<(Metric, MetricSummary)> {
        let windows = self.windows.lock();
        let mut out: Vec<_> = windows
            .iter()
            .filter_map(|(&m, w)| summarize(w).map(|s| (m, s)))
            .collect();
        out.sort_by_key(|(m, _)| m.name());
        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Nearest-rank percentiles over one window.
fn summarize(window: &VecDeque<f64>) -> Option<MetricSummary> {
    if window.is_empty() {
        return None;
    }
    let mut sorted: Vec<f64> = window.iter().copied().collect();
    sorted.sort_by(f64::total_cmp);
    let rank = |p: f64| {
        let idx = (p * sorted.len() as f64).ceil() as usize;
        sorted[idx.clamp(1, sorted.len()) - 1]
    };
    Some(MetricSummary {
        p50: rank(0.50),
        p95: rank(0.95),
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        count: sorted.len(),
    })
}

//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! Monotonic counters and histograms are exported to Prometheus as-is;
//! `report()` additionally swaps the periodic counters used by the log summary.
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only and must not be used for coordination.

use crate::domain::error::{DispatchError, DISPATCH_ERROR_KINDS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Exponential bucket boundaries (milliseconds)
/// Buckets: ≤25, ≤50, ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, >12800
const BUCKET_BOUNDS: [u64; 10] = [25, 50, 100, 200, 400, 800, 1600, 3200, 6400, 12800];
const NUM_BUCKETS: usize = 11;
const NUM_ERROR_KINDS: usize = DISPATCH_ERROR_KINDS.len();

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].swap(0, Ordering::Relaxed))
}

/// Load all bucket values without resetting
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].load(Ordering::Relaxed))
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Last bucket uses 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [25, 50, 100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Cumulative latency histogram
struct Histogram {
    buckets: [AtomicU64; NUM_BUCKETS],
    sum_ms: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self { buckets: std::array::from_fn(|_| AtomicU64::new(0)), sum_ms: AtomicU64::new(0) }
    }

    #[inline]
    fn record(&self, latency_ms: u64) {
        self.buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: load_buckets(&self.buckets),
            sum_ms: self.sum_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HistogramSnapshot {
    pub buckets: [u64; NUM_BUCKETS],
    pub sum_ms: u64,
}

impl HistogramSnapshot {
    pub fn count(&self) -> u64 {
        self.buckets.iter().sum()
    }
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
pub struct Metrics {
    dispatches_total: AtomicU64,
    dispatches_succeeded: AtomicU64,
    dispatch_failures: [AtomicU64; NUM_ERROR_KINDS],
    dispatch_latency: Histogram,
    geocode_requests: AtomicU64,
    geocode_failures: AtomicU64,
    geocode_admission_timeouts: AtomicU64,
    geocode_latency: Histogram,
    route_requests: AtomicU64,
    route_failures: AtomicU64,
    route_latency: Histogram,
    reservations_won: AtomicU64,
    reservations_conflicted: AtomicU64,
    reservations_released: AtomicU64,
    compensations: AtomicU64,
    /// Dispatches since last report (reset on report)
    dispatches_since_report: AtomicU64,
    /// Dispatch latency buckets since last report (reset on report)
    period_dispatch_buckets: [AtomicU64; NUM_BUCKETS],
    /// Max dispatch latency since last report (reset on report)
    period_dispatch_max_ms: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            dispatches_total: AtomicU64::new(0),
            dispatches_succeeded: AtomicU64::new(0),
            dispatch_failures: std::array::from_fn(|_| AtomicU64::new(0)),
            dispatch_latency: Histogram::new(),
            geocode_requests: AtomicU64::new(0),
            geocode_failures: AtomicU64::new(0),
            geocode_admission_timeouts: AtomicU64::new(0),
            geocode_latency: Histogram::new(),
            route_requests: AtomicU64::new(0),
            route_failures: AtomicU64::new(0),
            route_latency: Histogram::new(),
            reservations_won: AtomicU64::new(0),
            reservations_conflicted: AtomicU64::new(0),
            reservations_released: AtomicU64::new(0),
            compensations: AtomicU64::new(0),
            dispatches_since_report: AtomicU64::new(0),
            period_dispatch_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            period_dispatch_max_ms: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record the end of a dispatch, successful or not
    #[inline]
    pub fn record_dispatch(&self, latency_ms: u64, outcome: Result<(), &DispatchError>) {
        self.dispatches_total.fetch_add(1, Ordering::Relaxed);
        self.dispatches_since_report.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Ok(()) => {
                self.dispatches_succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.dispatch_failures[e.kind_index()].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.dispatch_latency.record(latency_ms);
        self.period_dispatch_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.period_dispatch_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_geocode(&self, latency_ms: u64, success: bool) {
        self.geocode_requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.geocode_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.geocode_latency.record(latency_ms);
    }

    #[inline]
    pub fn record_geocode_admission_timeout(&self) {
        self.geocode_admission_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_route(&self, latency_ms: u64, success: bool) {
        self.route_requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.route_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.route_latency.record(latency_ms);
    }

    #[inline]
    pub fn record_reservation(&self, won: bool) {
        if won {
            self.reservations_won.fetch_add(1, Ordering::Relaxed);
        } else {
            self.reservations_conflicted.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_release(&self) {
        self.reservations_released.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_compensation(&self) {
        self.compensations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dispatches_total(&self) -> u64 {
        self.dispatches_total.load(Ordering::Relaxed)
    }

    pub fn reservations_won(&self) -> u64 {
        self.reservations_won.load(Ordering::Relaxed)
    }

    pub fn reservations_released(&self) -> u64 {
        self.reservations_released.load(Ordering::Relaxed)
    }

    pub fn compensations(&self) -> u64 {
        self.compensations.load(Ordering::Relaxed)
    }

    /// Monotonic view for exporters; resets nothing
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            dispatches_total: self.dispatches_total.load(Ordering::Relaxed),
            dispatches_succeeded: self.dispatches_succeeded.load(Ordering::Relaxed),
            dispatch_failures: std::array::from_fn(|i| {
                self.dispatch_failures[i].load(Ordering::Relaxed)
            }),
            dispatch_latency: self.dispatch_latency.snapshot(),
            geocode_requests: self.geocode_requests.load(Ordering::Relaxed),
            geocode_failures: self.geocode_failures.load(Ordering::Relaxed),
            geocode_admission_timeouts: self.geocode_admission_timeouts.load(Ordering::Relaxed),
            geocode_latency: self.geocode_latency.snapshot(),
            route_requests: self.route_requests.load(Ordering::Relaxed),
            route_failures: self.route_failures.load(Ordering::Relaxed),
            route_latency: self.route_latency.snapshot(),
            reservations_won: self.reservations_won.load(Ordering::Relaxed),
            reservations_conflicted: self.reservations_conflicted.load(Ordering::Relaxed),
            reservations_released: self.reservations_released.load(Ordering::Relaxed),
            compensations: self.compensations.load(Ordering::Relaxed),
        }
    }

    /// Generate a periodic report.
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        let period_count = self.dispatches_since_report.swap(0, Ordering::Relaxed);
        let period_buckets = swap_buckets(&self.period_dispatch_buckets);
        let period_max_ms = self.period_dispatch_max_ms.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let dispatches_per_min = if elapsed.as_secs_f64() > 0.0 {
            period_count as f64 * 60.0 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            totals: self.snapshot(),
            period_dispatches: period_count,
            dispatches_per_min,
            dispatch_p50_ms: percentile_from_buckets(&period_buckets, 0.50),
            dispatch_p95_ms: percentile_from_buckets(&period_buckets, 0.95),
            dispatch_p99_ms: percentile_from_buckets(&period_buckets, 0.99),
            dispatch_max_ms: period_max_ms,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub dispatches_total: u64,
    pub dispatches_succeeded: u64,
    /// Failures indexed like `DISPATCH_ERROR_KINDS`
    pub dispatch_failures: [u64; NUM_ERROR_KINDS],
    pub dispatch_latency: HistogramSnapshot,
    pub geocode_requests: u64,
    pub geocode_failures: u64,
    pub geocode_admission_timeouts: u64,
    pub geocode_latency: HistogramSnapshot,
    pub route_requests: u64,
    pub route_failures: u64,
    pub route_latency: HistogramSnapshot,
    pub reservations_won: u64,
    pub reservations_conflicted: u64,
    pub reservations_released: u64,
    pub compensations: u64,
}

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub totals: MetricsSnapshot,
    /// Dispatches finished since the previous report
    pub period_dispatches: u64,
    pub dispatches_per_min: f64,
    pub dispatch_p50_ms: u64,
    pub dispatch_p95_ms: u64,
    pub dispatch_p99_ms: u64,
    pub dispatch_max_ms: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        let failed: u64 = self.totals.dispatch_failures.iter().sum();
        info!(
            dispatches_total = %self.totals.dispatches_total,
            dispatches_ok = %self.totals.dispatches_succeeded,
            dispatches_failed = %failed,
            period_dispatches = %self.period_dispatches,
            dispatches_per_min = format!("{:.1}", self.dispatches_per_min),
            p50_ms = %self.dispatch_p50_ms,
            p95_ms = %self.dispatch_p95_ms,
            p99_ms = %self.dispatch_p99_ms,
            max_ms = %self.dispatch_max_ms,
            geocode_failures = %self.totals.geocode_failures,
            route_failures = %self.totals.route_failures,
            reservations_conflicted = %self.totals.reservations_conflicted,
            compensations = %self.totals.compensations,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.dispatches_total(), 0);
        assert_eq!(metrics.snapshot().route_requests, 0);
    }

    #[test]
    fn test_record_dispatch_outcomes() {
        let metrics = Metrics::new();
        metrics.record_dispatch(120, Ok(()));
        metrics.record_dispatch(30, Err(&DispatchError::NoStockAvailable));
        metrics.record_dispatch(
            40,
            Err(&DispatchError::NoTechnicianAvailable { needed: 2, found: 0 }),
        );

        let snap = metrics.snapshot();
        assert_eq!(snap.dispatches_total, 3);
        assert_eq!(snap.dispatches_succeeded, 1);
        assert_eq!(snap.dispatch_failures[DispatchError::NoStockAvailable.kind_index()], 1);
        assert_eq!(snap.dispatch_failures.iter().sum::<u64>(), 2);
        assert_eq!(snap.dispatch_latency.count(), 3);
        assert_eq!(snap.dispatch_latency.sum_ms, 190);
    }

    #[test]
    fn test_report_resets_period_only() {
        let metrics = Metrics::new();
        metrics.record_dispatch(500, Ok(()));
        metrics.record_dispatch(700, Ok(()));

        let first = metrics.report();
        assert_eq!(first.period_dispatches, 2);
        assert_eq!(first.dispatch_max_ms, 700);
        assert_eq!(first.dispatch_p99_ms, 800);

        let second = metrics.report();
        assert_eq!(second.period_dispatches, 0);
        assert_eq!(second.dispatch_max_ms, 0);
        assert_eq!(second.dispatch_p50_ms, 0);
        // Totals survive the report
        assert_eq!(second.totals.dispatches_total, 2);
        assert_eq!(second.totals.dispatch_latency.count(), 2);
    }

    #[test]
    fn test_reservation_counters() {
        let metrics = Metrics::new();
        metrics.record_reservation(true);
        metrics.record_reservation(false);
        metrics.record_reservation(false);
        metrics.record_release();
        metrics.record_compensation();

        let snap = metrics.snapshot();
        assert_eq!(snap.reservations_won, 1);
        assert_eq!(snap.reservations_conflicted, 2);
        assert_eq!(snap.reservations_released, 1);
        assert_eq!(snap.compensations, 1);
    }

    #[test]
    fn test_concurrent_updates() {
        let metrics = Arc::new(Metrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        m.record_route(i % 300, i % 10 != 0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let snap = metrics.snapshot();
        assert_eq!(snap.route_requests, 8000);
        assert_eq!(snap.route_failures, 800);
        assert_eq!(snap.route_latency.count(), 8000);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(25), 0);
        assert_eq!(bucket_index(26), 1);
        assert_eq!(bucket_index(12800), 9);
        assert_eq!(bucket_index(12801), 10);
    }

    #[test]
    fn test_percentile_computation() {
        let metrics = Metrics::new();
        for _ in 0..100 {
            metrics.record_dispatch(150, Ok(()));
        }
        let summary = metrics.report();
        assert_eq!(summary.dispatch_p50_ms, 200);
        assert_eq!(summary.dispatch_p95_ms, 200);
        assert_eq!(summary.dispatch_p99_ms, 200);
    }
}

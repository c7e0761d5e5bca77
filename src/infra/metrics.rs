//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations so the poll loop never blocks on a
//! mutex. Reporting is the only operation that resets anything (via atomic
//! swap of the periodic counters).
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only; do NOT use them for coordination or logic decisions.

use crate::domain::types::{Decision, SensorId};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
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
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
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

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

fn load_per_sensor(counters: &[AtomicU64; 2]) -> [u64; 2] {
    [counters[0].load(Ordering::Relaxed), counters[1].load(Ordering::Relaxed)]
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Total poll ticks (monotonic)
    ticks_total: AtomicU64,
    /// Ticks since last report (reset on report)
    ticks_since_report: AtomicU64,
    /// Sum of tick latencies in microseconds (reset on report)
    tick_latency_sum_us: AtomicU64,
    /// Max tick latency in microseconds (reset on report)
    tick_latency_max_us: AtomicU64,
    /// Tick latency histogram buckets (reset on report)
    tick_latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Failed reads per sensor, timeouts excluded (monotonic)
    read_errors: [AtomicU64; 2],
    /// Timed-out reads per sensor (monotonic)
    read_timeouts: [AtomicU64; 2],
    /// Lone Sets discarded by the single-sensor timeout (monotonic)
    false_triggers: [AtomicU64; 2],
    enters_total: AtomicU64,
    exits_total: AtomicU64,
    dwell_notices_total: AtomicU64,
    /// Store calls that failed (monotonic)
    store_failures_total: AtomicU64,
    /// Decisions waiting for the store (gauge)
    pending_updates: AtomicU64,
    /// Pending decisions discarded on queue overflow (monotonic)
    dropped_updates_total: AtomicU64,
    /// Exits applied to an empty room (monotonic)
    underflow_clamped_total: AtomicU64,
    snapshots_written_total: AtomicU64,
    snapshots_failed_total: AtomicU64,
    /// Last count returned by the store (gauge)
    occupancy: AtomicI64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            ticks_total: AtomicU64::new(0),
            ticks_since_report: AtomicU64::new(0),
            tick_latency_sum_us: AtomicU64::new(0),
            tick_latency_max_us: AtomicU64::new(0),
            tick_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            read_errors: std::array::from_fn(|_| AtomicU64::new(0)),
            read_timeouts: std::array::from_fn(|_| AtomicU64::new(0)),
            false_triggers: std::array::from_fn(|_| AtomicU64::new(0)),
            enters_total: AtomicU64::new(0),
            exits_total: AtomicU64::new(0),
            dwell_notices_total: AtomicU64::new(0),
            store_failures_total: AtomicU64::new(0),
            pending_updates: AtomicU64::new(0),
            dropped_updates_total: AtomicU64::new(0),
            underflow_clamped_total: AtomicU64::new(0),
            snapshots_written_total: AtomicU64::new(0),
            snapshots_failed_total: AtomicU64::new(0),
            occupancy: AtomicI64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record one completed poll tick (lock-free)
    #[inline]
    pub fn record_tick(&self, latency_us: u64) {
        self.ticks_total.fetch_add(1, Ordering::Relaxed);
        self.ticks_since_report.fetch_add(1, Ordering::Relaxed);
        self.tick_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);

        let bucket = bucket_index(latency_us);
        self.tick_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);

        update_atomic_max(&self.tick_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_read_error(&self, sensor: SensorId) {
        self.read_errors[sensor.index()].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_read_timeout(&self, sensor: SensorId) {
        self.read_timeouts[sensor.index()].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_false_trigger(&self, sensor: SensorId) {
        self.false_triggers[sensor.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a resolved crossing
    #[inline]
    pub fn record_decision(&self, decision: Decision) {
        match decision {
            Decision::Enter => self.enters_total.fetch_add(1, Ordering::Relaxed),
            Decision::Exit => self.exits_total.fetch_add(1, Ordering::Relaxed),
        };
    }

    #[inline]
    pub fn record_dwell_notice(&self) {
        self.dwell_notices_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_store_failure(&self) {
        self.store_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Set current pending update depth (called by poll loop)
    #[inline]
    pub fn set_pending_updates(&self, depth: u64) {
        self.pending_updates.store(depth, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dropped_update(&self) {
        self.dropped_updates_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_underflow_clamped(&self) {
        self.underflow_clamped_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_snapshot_written(&self) {
        self.snapshots_written_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_snapshot_failed(&self) {
        self.snapshots_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_occupancy(&self, count: i64) {
        self.occupancy.store(count, Ordering::Relaxed);
    }

    /// Get total ticks
    #[inline]
    pub fn ticks_total(&self) -> u64 {
        self.ticks_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn occupancy(&self) -> i64 {
        self.occupancy.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn store_failures_total(&self) -> u64 {
        self.store_failures_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn underflow_clamped_total(&self) -> u64 {
        self.underflow_clamped_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn snapshots_written_total(&self) -> u64 {
        self.snapshots_written_total.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        // Swap periodic counters to zero and get their values
        let ticks_count = self.ticks_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.tick_latency_sum_us.swap(0, Ordering::Relaxed);
        let max_latency = self.tick_latency_max_us.swap(0, Ordering::Relaxed);
        let tick_lat_buckets = swap_buckets(&self.tick_latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let ticks_per_sec = if elapsed.as_secs_f64() > 0.0 {
            ticks_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg_latency = if ticks_count > 0 { latency_sum / ticks_count } else { 0 };

        MetricsSummary {
            ticks_total: self.ticks_total.load(Ordering::Relaxed),
            ticks_per_sec,
            tick_lat_buckets,
            tick_lat_avg_us: avg_latency,
            tick_lat_max_us: max_latency,
            tick_lat_p50_us: percentile_from_buckets(&tick_lat_buckets, 0.50),
            tick_lat_p99_us: percentile_from_buckets(&tick_lat_buckets, 0.99),
            read_errors: load_per_sensor(&self.read_errors),
            read_timeouts: load_per_sensor(&self.read_timeouts),
            false_triggers: load_per_sensor(&self.false_triggers),
            enters_total: self.enters_total.load(Ordering::Relaxed),
            exits_total: self.exits_total.load(Ordering::Relaxed),
            dwell_notices_total: self.dwell_notices_total.load(Ordering::Relaxed),
            store_failures_total: self.store_failures_total.load(Ordering::Relaxed),
            pending_updates: self.pending_updates.load(Ordering::Relaxed),
            dropped_updates_total: self.dropped_updates_total.load(Ordering::Relaxed),
            underflow_clamped_total: self.underflow_clamped_total.load(Ordering::Relaxed),
            snapshots_written_total: self.snapshots_written_total.load(Ordering::Relaxed),
            snapshots_failed_total: self.snapshots_failed_total.load(Ordering::Relaxed),
            occupancy: self.occupancy.load(Ordering::Relaxed),
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

#[derive(Debug)]
pub struct MetricsSummary {
    pub ticks_total: u64,
    pub ticks_per_sec: f64,
    /// Poll tick latency histogram buckets
    /// Bounds: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200 µs
    pub tick_lat_buckets: [u64; NUM_BUCKETS],
    pub tick_lat_avg_us: u64,
    pub tick_lat_max_us: u64,
    pub tick_lat_p50_us: u64,
    pub tick_lat_p99_us: u64,
    /// Indexed by `SensorId::index()`
    pub read_errors: [u64; 2],
    pub read_timeouts: [u64; 2],
    pub false_triggers: [u64; 2],
    pub enters_total: u64,
    pub exits_total: u64,
    pub dwell_notices_total: u64,
    pub store_failures_total: u64,
    pub pending_updates: u64,
    pub dropped_updates_total: u64,
    pub underflow_clamped_total: u64,
    pub snapshots_written_total: u64,
    pub snapshots_failed_total: u64,
    pub occupancy: i64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            ticks_total = %self.ticks_total,
            ticks_per_sec = format!("{:.1}", self.ticks_per_sec),
            tick_avg_us = %self.tick_lat_avg_us,
            tick_max_us = %self.tick_lat_max_us,
            tick_p99_us = %self.tick_lat_p99_us,
            occupancy = %self.occupancy,
            enters = %self.enters_total,
            exits = %self.exits_total,
            dwell_notices = %self.dwell_notices_total,
            read_errors = ?self.read_errors,
            read_timeouts = ?self.read_timeouts,
            pending_updates = %self.pending_updates,
            store_failures = %self.store_failures_total,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.ticks_total(), 0);
        assert_eq!(metrics.occupancy(), 0);
    }

    #[test]
    fn test_record_tick() {
        let metrics = Metrics::new();

        metrics.record_tick(100);
        assert_eq!(metrics.ticks_total(), 1);
        assert_eq!(metrics.tick_latency_sum_us.load(Ordering::Relaxed), 100);

        metrics.record_tick(200);
        assert_eq!(metrics.ticks_total(), 2);
        assert_eq!(metrics.tick_latency_sum_us.load(Ordering::Relaxed), 300);
    }

    #[test]
    fn test_report() {
        let metrics = Metrics::new();

        metrics.record_tick(100);
        metrics.record_tick(200);
        metrics.record_tick(300);
        metrics.record_decision(Decision::Enter);
        metrics.record_decision(Decision::Enter);
        metrics.record_decision(Decision::Exit);
        metrics.record_read_timeout(SensorId::Inside);
        metrics.set_occupancy(1);

        let summary = metrics.report();

        assert_eq!(summary.ticks_total, 3);
        assert_eq!(summary.tick_lat_avg_us, 200); // (100+200+300)/3
        assert_eq!(summary.tick_lat_max_us, 300);
        assert_eq!(summary.enters_total, 2);
        assert_eq!(summary.exits_total, 1);
        assert_eq!(summary.read_timeouts, [0, 1]);
        assert_eq!(summary.occupancy, 1);

        // Periodic counters should be reset, monotonic ones kept
        assert_eq!(metrics.ticks_since_report.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.tick_latency_sum_us.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.tick_latency_max_us.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.report().enters_total, 2);
    }

    #[test]
    fn test_report_empty() {
        let metrics = Metrics::new();
        let summary = metrics.report();

        assert_eq!(summary.ticks_total, 0);
        assert_eq!(summary.tick_lat_avg_us, 0);
        assert_eq!(summary.tick_lat_p99_us, 0);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    m.record_tick(i as u64);
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.ticks_total(), 10_000);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(100), 0);
        assert_eq!(bucket_index(101), 1);
        assert_eq!(bucket_index(51200), 9);
        assert_eq!(bucket_index(51201), 10); // overflow
    }

    #[test]
    fn test_percentile_computation() {
        let metrics = Metrics::new();

        // 100 ticks, all at 150µs (bucket 1, ≤200)
        for _ in 0..100 {
            metrics.record_tick(150);
        }

        let summary = metrics.report();
        assert_eq!(summary.tick_lat_p50_us, 200);
        assert_eq!(summary.tick_lat_p99_us, 200);
    }
}

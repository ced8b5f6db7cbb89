//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! Counters are monotonic; poll latency statistics are reset on each report.
//!
//! All atomics use Relaxed ordering; they are statistics only and must not
//! drive cooldown or auth decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Poll latency bucket boundaries (milliseconds)
/// Buckets: ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, ≤5120, >5120
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = [10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5120];
pub const METRICS_NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    METRICS_BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
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
fn swap_buckets(buckets: &[AtomicU64; METRICS_NUM_BUCKETS]) -> [u64; METRICS_NUM_BUCKETS] {
    let mut result = [0u64; METRICS_NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

pub struct Metrics {
    /// Completed poll cycles (snapshot fetched and diffed)
    polls_total: AtomicU64,
    /// Poll cycles skipped because the snapshot could not be fetched
    poll_failures_total: AtomicU64,
    /// Failed re-authentication attempts
    auth_failures_total: AtomicU64,
    /// Successful re-authentications
    auth_successes_total: AtomicU64,
    /// Cycles skipped because re-authentication backoff was in effect
    auth_backoff_skips_total: AtomicU64,
    connects_total: AtomicU64,
    disconnects_total: AtomicU64,
    roams_total: AtomicU64,
    gate_triggers_total: AtomicU64,
    gate_skips_total: AtomicU64,
    gate_errors_total: AtomicU64,
    /// Event log writes that failed (best-effort)
    log_write_failures_total: AtomicU64,
    /// Poll latency histogram (reset on report)
    poll_latency_buckets: [AtomicU64; METRICS_NUM_BUCKETS],
    poll_latency_sum_ms: AtomicU64,
    poll_latency_max_ms: AtomicU64,
    polls_since_report: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            polls_total: AtomicU64::new(0),
            poll_failures_total: AtomicU64::new(0),
            auth_failures_total: AtomicU64::new(0),
            auth_successes_total: AtomicU64::new(0),
            auth_backoff_skips_total: AtomicU64::new(0),
            connects_total: AtomicU64::new(0),
            disconnects_total: AtomicU64::new(0),
            roams_total: AtomicU64::new(0),
            gate_triggers_total: AtomicU64::new(0),
            gate_skips_total: AtomicU64::new(0),
            gate_errors_total: AtomicU64::new(0),
            log_write_failures_total: AtomicU64::new(0),
            poll_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            poll_latency_sum_ms: AtomicU64::new(0),
            poll_latency_max_ms: AtomicU64::new(0),
            polls_since_report: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record a completed poll cycle with its latency
    #[inline]
    pub fn record_poll(&self, latency_ms: u64) {
        self.polls_total.fetch_add(1, Ordering::Relaxed);
        self.polls_since_report.fetch_add(1, Ordering::Relaxed);
        self.poll_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.poll_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.poll_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_poll_failure(&self) {
        self.poll_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_auth_failure(&self) {
        self.auth_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_auth_success(&self) {
        self.auth_successes_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_auth_backoff_skip(&self) {
        self.auth_backoff_skips_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_connect(&self) {
        self.connects_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_disconnect(&self) {
        self.disconnects_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_roam(&self) {
        self.roams_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_gate_trigger(&self) {
        self.gate_triggers_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_gate_skip(&self) {
        self.gate_skips_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_gate_error(&self) {
        self.gate_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_log_write_failure(&self) {
        self.log_write_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn polls_total(&self) -> u64 {
        self.polls_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn gate_triggers_total(&self) -> u64 {
        self.gate_triggers_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn gate_skips_total(&self) -> u64 {
        self.gate_skips_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn gate_errors_total(&self) -> u64 {
        self.gate_errors_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn auth_failures_total(&self) -> u64 {
        self.auth_failures_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn log_write_failures_total(&self) -> u64 {
        self.log_write_failures_total.load(Ordering::Relaxed)
    }

    /// Read counters and swap per-report statistics
    pub fn report(&self, tracked_devices: usize, connected_devices: usize) -> MetricsSummary {
        let mut last_report = self.last_report_time.lock();
        let elapsed_secs = last_report.elapsed().as_secs_f64();
        *last_report = Instant::now();
        drop(last_report);

        let polls_since = self.polls_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.poll_latency_sum_ms.swap(0, Ordering::Relaxed);
        let latency_max = self.poll_latency_max_ms.swap(0, Ordering::Relaxed);
        let buckets = swap_buckets(&self.poll_latency_buckets);

        MetricsSummary {
            polls_total: self.polls_total.load(Ordering::Relaxed),
            polls_per_sec: if elapsed_secs > 0.0 { polls_since as f64 / elapsed_secs } else { 0.0 },
            poll_failures_total: self.poll_failures_total.load(Ordering::Relaxed),
            auth_failures_total: self.auth_failures_total.load(Ordering::Relaxed),
            auth_successes_total: self.auth_successes_total.load(Ordering::Relaxed),
            auth_backoff_skips_total: self.auth_backoff_skips_total.load(Ordering::Relaxed),
            connects_total: self.connects_total.load(Ordering::Relaxed),
            disconnects_total: self.disconnects_total.load(Ordering::Relaxed),
            roams_total: self.roams_total.load(Ordering::Relaxed),
            gate_triggers_total: self.gate_triggers_total.load(Ordering::Relaxed),
            gate_skips_total: self.gate_skips_total.load(Ordering::Relaxed),
            gate_errors_total: self.gate_errors_total.load(Ordering::Relaxed),
            log_write_failures_total: self.log_write_failures_total.load(Ordering::Relaxed),
            poll_lat_buckets: buckets,
            poll_lat_avg_ms: if polls_since > 0 { latency_sum / polls_since } else { 0 },
            poll_lat_max_ms: latency_max,
            tracked_devices,
            connected_devices,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub polls_total: u64,
    pub polls_per_sec: f64,
    pub poll_failures_total: u64,
    pub auth_failures_total: u64,
    pub auth_successes_total: u64,
    pub auth_backoff_skips_total: u64,
    pub connects_total: u64,
    pub disconnects_total: u64,
    pub roams_total: u64,
    pub gate_triggers_total: u64,
    pub gate_skips_total: u64,
    pub gate_errors_total: u64,
    pub log_write_failures_total: u64,
    /// Poll latency histogram since last report
    pub poll_lat_buckets: [u64; METRICS_NUM_BUCKETS],
    pub poll_lat_avg_ms: u64,
    pub poll_lat_max_ms: u64,
    pub tracked_devices: usize,
    pub connected_devices: usize,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            polls_total = %self.polls_total,
            polls_per_sec = format!("{:.2}", self.polls_per_sec),
            poll_failures = %self.poll_failures_total,
            auth_failures = %self.auth_failures_total,
            avg_poll_ms = %self.poll_lat_avg_ms,
            max_poll_ms = %self.poll_lat_max_ms,
            tracked_devices = %self.tracked_devices,
            connected_devices = %self.connected_devices,
            gate_triggers = %self.gate_triggers_total,
            gate_skips = %self.gate_skips_total,
            gate_errors = %self.gate_errors_total,
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
        assert_eq!(metrics.polls_total(), 0);
        assert_eq!(metrics.gate_triggers_total(), 0);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(10), 0);
        assert_eq!(bucket_index(11), 1);
        assert_eq!(bucket_index(5120), 9);
        assert_eq!(bucket_index(10_000), 10);
    }

    #[test]
    fn test_report() {
        let metrics = Metrics::new();

        metrics.record_poll(10);
        metrics.record_poll(20);
        metrics.record_poll(30);
        metrics.record_gate_trigger();
        metrics.record_gate_skip();
        metrics.record_auth_failure();

        let summary = metrics.report(4, 1);

        assert_eq!(summary.polls_total, 3);
        assert_eq!(summary.poll_lat_avg_ms, 20);
        assert_eq!(summary.poll_lat_max_ms, 30);
        assert_eq!(summary.gate_triggers_total, 1);
        assert_eq!(summary.gate_skips_total, 1);
        assert_eq!(summary.auth_failures_total, 1);
        assert_eq!(summary.tracked_devices, 4);
        assert_eq!(summary.connected_devices, 1);
        assert_eq!(summary.poll_lat_buckets.iter().sum::<u64>(), 3);
    }

    #[test]
    fn test_report_resets_latency_but_not_counters() {
        let metrics = Metrics::new();
        metrics.record_poll(50);
        let _ = metrics.report(0, 0);

        let summary = metrics.report(0, 0);
        assert_eq!(summary.polls_total, 1);
        assert_eq!(summary.poll_lat_avg_ms, 0);
        assert_eq!(summary.poll_lat_max_ms, 0);
        assert_eq!(summary.poll_lat_buckets.iter().sum::<u64>(), 0);
    }
}

//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! Counters are monotonic; `snapshot()` reads them without resetting so
//! Prometheus scrapes and the periodic log line never steal from each other.
//!
//! NOTE: All atomics use Relaxed ordering intentionally: these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions
//! (the circuit breaker keeps its own state under a mutex).

use crate::domain::types::FallbackReason;
use crate::error::DeliveryError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

const NUM_BUCKETS: usize = 11;

/// Valuation compute latency bounds (microseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const COMPUTE_BOUNDS_US: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const COMPUTE_UPPER_US: [u64; NUM_BUCKETS] =
    [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200, 102400];

/// Delivery latency bounds (milliseconds), including backoff sleeps
/// Buckets: ≤5, ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, ≤2500, ≤5000, >5000
const DELIVERY_BOUNDS_MS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];
const DELIVERY_UPPER_MS: [u64; NUM_BUCKETS] =
    [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10000];

/// Attempt-count slots: 0, 1, 2, 3, 4, 5+
pub const ATTEMPT_SLOTS: usize = 6;

const NUM_REASONS: usize = FallbackReason::ALL.len();

/// Breaker state values for Prometheus gauge
pub const BREAKER_STATE_CLOSED: u64 = 0;
pub const BREAKER_STATE_OPEN: u64 = 1;
pub const BREAKER_STATE_HALF_OPEN: u64 = 2;

#[inline]
fn bucket_index(bounds: &[u64; 10], value: u64) -> usize {
    bounds.partition_point(|&bound| bound < value)
}

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

#[inline]
fn load_all<const N: usize>(counters: &[AtomicU64; N]) -> [u64; N] {
    std::array::from_fn(|i| counters[i].load(Ordering::Relaxed))
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(
    buckets: &[u64; NUM_BUCKETS],
    upper_bounds: &[u64; NUM_BUCKETS],
    percentile: f64,
) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total as f64 * percentile).ceil() as u64).max(1);
    let mut cumulative = 0u64;
    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return upper_bounds[i];
        }
    }
    upper_bounds[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector shared by the valuation path and the delivery client
pub struct Metrics {
    valuations_total: AtomicU64,
    valuations_insufficient: AtomicU64,
    validation_rejected: AtomicU64,
    reasons: [AtomicU64; NUM_REASONS],
    compute_buckets: [AtomicU64; NUM_BUCKETS],
    compute_sum_us: AtomicU64,
    compute_max_us: AtomicU64,

    delivery_requests: AtomicU64,
    delivery_success: AtomicU64,
    delivery_client_errors: AtomicU64,
    delivery_server_errors: AtomicU64,
    delivery_network_errors: AtomicU64,
    delivery_circuit_open: AtomicU64,
    /// Calls dropped by the caller before reaching an outcome
    delivery_cancelled: AtomicU64,
    delivery_other_errors: AtomicU64,
    /// Total network attempts across all calls
    delivery_attempts_total: AtomicU64,
    /// Calls by attempt count (0, 1, 2, 3, 4, 5+)
    attempts_dist: [AtomicU64; ATTEMPT_SLOTS],
    /// Successful delivery latency histogram (ms)
    delivery_buckets: [AtomicU64; NUM_BUCKETS],
    delivery_sum_ms: AtomicU64,
    delivery_max_ms: AtomicU64,
    breaker_state: AtomicU64,
    breaker_trips: AtomicU64,

    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            valuations_total: AtomicU64::new(0),
            valuations_insufficient: AtomicU64::new(0),
            validation_rejected: AtomicU64::new(0),
            reasons: std::array::from_fn(|_| AtomicU64::new(0)),
            compute_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            compute_sum_us: AtomicU64::new(0),
            compute_max_us: AtomicU64::new(0),
            delivery_requests: AtomicU64::new(0),
            delivery_success: AtomicU64::new(0),
            delivery_client_errors: AtomicU64::new(0),
            delivery_server_errors: AtomicU64::new(0),
            delivery_network_errors: AtomicU64::new(0),
            delivery_circuit_open: AtomicU64::new(0),
            delivery_cancelled: AtomicU64::new(0),
            delivery_other_errors: AtomicU64::new(0),
            delivery_attempts_total: AtomicU64::new(0),
            attempts_dist: std::array::from_fn(|_| AtomicU64::new(0)),
            delivery_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            delivery_sum_ms: AtomicU64::new(0),
            delivery_max_ms: AtomicU64::new(0),
            breaker_state: AtomicU64::new(BREAKER_STATE_CLOSED),
            breaker_trips: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// Record a finished valuation (lock-free)
    #[inline]
    pub fn record_valuation(&self, valued: bool, reasons: &[FallbackReason], latency_us: u64) {
        self.valuations_total.fetch_add(1, Ordering::Relaxed);
        if !valued {
            self.valuations_insufficient.fetch_add(1, Ordering::Relaxed);
        }
        for reason in reasons {
            self.reasons[reason.index()].fetch_add(1, Ordering::Relaxed);
        }

        let bucket = bucket_index(&COMPUTE_BOUNDS_US, latency_us);
        self.compute_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.compute_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        update_atomic_max(&self.compute_max_us, latency_us);
    }

    #[inline]
    pub fn record_validation_rejected(&self) {
        self.validation_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a delivery call as soon as it starts, so calls the caller
    /// abandons still show up in `delivery_requests`
    #[inline]
    pub fn record_delivery_started(&self) {
        self.delivery_requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn record_attempts(&self, attempts: u32) {
        self.delivery_attempts_total.fetch_add(attempts as u64, Ordering::Relaxed);
        let slot = (attempts as usize).min(ATTEMPT_SLOTS - 1);
        self.attempts_dist[slot].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a delivered event (lock-free)
    #[inline]
    pub fn record_delivery_success(&self, attempts: u32, latency_ms: u64) {
        self.record_attempts(attempts);
        self.delivery_success.fetch_add(1, Ordering::Relaxed);

        let bucket = bucket_index(&DELIVERY_BOUNDS_MS, latency_ms);
        self.delivery_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.delivery_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        update_atomic_max(&self.delivery_max_ms, latency_ms);
    }

    /// Record a terminal delivery failure (lock-free)
    #[inline]
    pub fn record_delivery_failure(&self, err: &DeliveryError) {
        self.record_attempts(err.attempts());
        let counter = match err {
            DeliveryError::Client { .. } => &self.delivery_client_errors,
            DeliveryError::Server { .. } => &self.delivery_server_errors,
            DeliveryError::Network { .. } => &self.delivery_network_errors,
            DeliveryError::CircuitOpen => &self.delivery_circuit_open,
            DeliveryError::Encode(_) => &self.delivery_other_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a call whose future was dropped mid-flight (lock-free)
    #[inline]
    pub fn record_delivery_cancelled(&self, attempts: u32) {
        self.record_attempts(attempts);
        self.delivery_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Set breaker state gauge (0=closed, 1=open, 2=half_open)
    #[inline]
    pub fn set_breaker_state(&self, state: u64) {
        self.breaker_state.store(state, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_breaker_trip(&self) {
        self.breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn breaker_state(&self) -> u64 {
        self.breaker_state.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn delivery_requests(&self) -> u64 {
        self.delivery_requests.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn delivery_successes(&self) -> u64 {
        self.delivery_success.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn valuations_total(&self) -> u64 {
        self.valuations_total.load(Ordering::Relaxed)
    }

    /// Read every counter without resetting
    pub fn snapshot(&self) -> MetricsSummary {
        let valuations_total = self.valuations_total.load(Ordering::Relaxed);
        let compute_buckets = load_all(&self.compute_buckets);
        let compute_sum = self.compute_sum_us.load(Ordering::Relaxed);
        let compute_count: u64 = compute_buckets.iter().sum();

        let delivery_requests = self.delivery_requests.load(Ordering::Relaxed);
        let delivery_success = self.delivery_success.load(Ordering::Relaxed);
        let delivery_buckets = load_all(&self.delivery_buckets);
        let delivery_sum = self.delivery_sum_ms.load(Ordering::Relaxed);

        let success_ratio = if delivery_requests > 0 {
            delivery_success as f64 / delivery_requests as f64
        } else {
            1.0
        };

        // Throughput since start; readers share no window state
        let elapsed = self.started_at.elapsed().as_secs_f64();
        let valuations_per_sec = if elapsed > 0.0 { valuations_total as f64 / elapsed } else { 0.0 };

        MetricsSummary {
            valuations_total,
            valuations_per_sec,
            valuations_insufficient: self.valuations_insufficient.load(Ordering::Relaxed),
            validation_rejected: self.validation_rejected.load(Ordering::Relaxed),
            reasons: load_all(&self.reasons),
            compute_buckets,
            compute_avg_us: if compute_count > 0 { compute_sum / compute_count } else { 0 },
            compute_max_us: self.compute_max_us.load(Ordering::Relaxed),
            compute_p50_us: percentile_from_buckets(&compute_buckets, &COMPUTE_UPPER_US, 0.50),
            compute_p95_us: percentile_from_buckets(&compute_buckets, &COMPUTE_UPPER_US, 0.95),
            delivery_requests,
            delivery_success,
            delivery_success_ratio: success_ratio,
            delivery_client_errors: self.delivery_client_errors.load(Ordering::Relaxed),
            delivery_server_errors: self.delivery_server_errors.load(Ordering::Relaxed),
            delivery_network_errors: self.delivery_network_errors.load(Ordering::Relaxed),
            delivery_circuit_open: self.delivery_circuit_open.load(Ordering::Relaxed),
            delivery_cancelled: self.delivery_cancelled.load(Ordering::Relaxed),
            delivery_other_errors: self.delivery_other_errors.load(Ordering::Relaxed),
            delivery_attempts_total: self.delivery_attempts_total.load(Ordering::Relaxed),
            attempts_dist: load_all(&self.attempts_dist),
            delivery_buckets,
            delivery_avg_ms: if delivery_success > 0 { delivery_sum / delivery_success } else { 0 },
            delivery_max_ms: self.delivery_max_ms.load(Ordering::Relaxed),
            delivery_p50_ms: percentile_from_buckets(&delivery_buckets, &DELIVERY_UPPER_MS, 0.50),
            delivery_p95_ms: percentile_from_buckets(&delivery_buckets, &DELIVERY_UPPER_MS, 0.95),
            breaker_state: self.breaker_state.load(Ordering::Relaxed),
            breaker_trips: self.breaker_trips.load(Ordering::Relaxed),
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
pub const METRICS_COMPUTE_BOUNDS_US: [u64; 10] = COMPUTE_BOUNDS_US;
pub const METRICS_DELIVERY_BOUNDS_MS: [u64; 10] = DELIVERY_BOUNDS_MS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub valuations_total: u64,
    pub valuations_per_sec: f64,
    pub valuations_insufficient: u64,
    pub validation_rejected: u64,
    /// Count per reason, indexed like `FallbackReason::ALL`
    pub reasons: [u64; NUM_REASONS],
    pub compute_buckets: [u64; NUM_BUCKETS],
    pub compute_avg_us: u64,
    pub compute_max_us: u64,
    pub compute_p50_us: u64,
    pub compute_p95_us: u64,
    pub delivery_requests: u64,
    pub delivery_success: u64,
    pub delivery_success_ratio: f64,
    pub delivery_client_errors: u64,
    pub delivery_server_errors: u64,
    pub delivery_network_errors: u64,
    pub delivery_circuit_open: u64,
    pub delivery_cancelled: u64,
    pub delivery_other_errors: u64,
    pub delivery_attempts_total: u64,
    /// Calls by attempt count (0, 1, 2, 3, 4, 5+)
    pub attempts_dist: [u64; ATTEMPT_SLOTS],
    /// Successful delivery latency histogram (ms)
    /// Bounds: ≤5, ≤10, ≤25, ≤50, ≤100, ≤250, ≤500, ≤1000, ≤2500, ≤5000, >5000
    pub delivery_buckets: [u64; NUM_BUCKETS],
    pub delivery_avg_ms: u64,
    pub delivery_max_ms: u64,
    pub delivery_p50_ms: u64,
    pub delivery_p95_ms: u64,
    /// 0=closed, 1=open, 2=half_open
    pub breaker_state: u64,
    pub breaker_trips: u64,
}

impl MetricsSummary {
    pub fn breaker_state_str(&self) -> &'static str {
        match self.breaker_state {
            BREAKER_STATE_OPEN => "open",
            BREAKER_STATE_HALF_OPEN => "half_open",
            _ => "closed",
        }
    }

    pub fn log(&self) {
        info!(
            valuations_total = %self.valuations_total,
            valuations_per_sec = format!("{:.1}", self.valuations_per_sec),
            insufficient = %self.valuations_insufficient,
            rejected = %self.validation_rejected,
            compute_p95_us = %self.compute_p95_us,
            delivery_requests = %self.delivery_requests,
            delivery_success_ratio = format!("{:.3}", self.delivery_success_ratio),
            delivery_p50_ms = %self.delivery_p50_ms,
            delivery_p95_ms = %self.delivery_p95_ms,
            circuit_open = %self.delivery_circuit_open,
            cancelled = %self.delivery_cancelled,
            breaker = self.breaker_state_str(),
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
        assert_eq!(metrics.valuations_total(), 0);
        assert_eq!(metrics.delivery_requests(), 0);
        assert_eq!(metrics.breaker_state(), BREAKER_STATE_CLOSED);
    }

    #[test]
    fn test_record_valuation_counts_reasons() {
        let metrics = Metrics::new();
        metrics.record_valuation(true, &[FallbackReason::LowSample], 150);
        metrics.record_valuation(
            false,
            &[FallbackReason::LowSample, FallbackReason::InsufficientComparables],
            300,
        );

        let summary = metrics.snapshot();
        assert_eq!(summary.valuations_total, 2);
        assert_eq!(summary.valuations_insufficient, 1);
        assert_eq!(summary.reasons[FallbackReason::LowSample.index()], 2);
        assert_eq!(summary.reasons[FallbackReason::InsufficientComparables.index()], 1);
        assert_eq!(summary.compute_avg_us, 225);
        assert_eq!(summary.compute_max_us, 300);
    }

    #[test]
    fn test_delivery_outcomes() {
        let metrics = Metrics::new();
        for _ in 0..4 {
            metrics.record_delivery_started();
        }
        metrics.record_delivery_success(1, 12);
        metrics.record_delivery_success(4, 700);
        metrics.record_delivery_failure(&DeliveryError::CircuitOpen);
        metrics.record_delivery_failure(&DeliveryError::Client {
            status: 400,
            attempts: 1,
            body: String::new(),
        });

        let summary = metrics.snapshot();
        assert_eq!(summary.delivery_requests, 4);
        assert_eq!(summary.delivery_success, 2);
        assert_eq!(summary.delivery_circuit_open, 1);
        assert_eq!(summary.delivery_client_errors, 1);
        assert_eq!(summary.attempts_dist, [1, 2, 0, 0, 1, 0]);
        assert_eq!(summary.delivery_attempts_total, 6);
        assert!((summary.delivery_success_ratio - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_cancelled_call_is_counted() {
        let metrics = Metrics::new();
        metrics.record_delivery_started();
        metrics.record_delivery_cancelled(2);

        let summary = metrics.snapshot();
        assert_eq!(summary.delivery_requests, 1);
        assert_eq!(summary.delivery_cancelled, 1);
        assert_eq!(summary.delivery_attempts_total, 2);
        assert_eq!(summary.attempts_dist[2], 1);
        assert_eq!(summary.delivery_success_ratio, 0.0);
    }

    #[test]
    fn test_throughput_survives_repeated_snapshots() {
        let metrics = Metrics::new();
        for _ in 0..10 {
            metrics.record_valuation(true, &[], 50);
        }
        std::thread::sleep(std::time::Duration::from_millis(5));
        let first = metrics.snapshot();
        let second = metrics.snapshot();
        assert!(first.valuations_per_sec > 0.0);
        assert!(second.valuations_per_sec > 0.0);
        assert!(second.valuations_per_sec <= first.valuations_per_sec);
    }

    #[test]
    fn test_snapshot_does_not_reset() {
        let metrics = Metrics::new();
        metrics.record_delivery_success(1, 40);
        let first = metrics.snapshot();
        let second = metrics.snapshot();
        assert_eq!(first.delivery_buckets, second.delivery_buckets);
        assert_eq!(second.delivery_success, 1);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(&DELIVERY_BOUNDS_MS, 0), 0);
        assert_eq!(bucket_index(&DELIVERY_BOUNDS_MS, 5), 0);
        assert_eq!(bucket_index(&DELIVERY_BOUNDS_MS, 6), 1);
        assert_eq!(bucket_index(&DELIVERY_BOUNDS_MS, 5000), 9);
        assert_eq!(bucket_index(&DELIVERY_BOUNDS_MS, 5001), 10);
        assert_eq!(bucket_index(&COMPUTE_BOUNDS_US, 51201), 10);
    }

    #[test]
    fn test_percentiles_from_buckets() {
        let metrics = Metrics::new();
        for _ in 0..95 {
            metrics.record_delivery_success(1, 20);
        }
        for _ in 0..5 {
            metrics.record_delivery_success(2, 900);
        }
        let summary = metrics.snapshot();
        assert_eq!(summary.delivery_p50_ms, 25);
        assert_eq!(summary.delivery_p95_ms, 25);

        metrics.record_delivery_success(2, 900);
        let summary = metrics.snapshot();
        assert_eq!(summary.delivery_p95_ms, 1000);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];
        for _ in 0..8 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    m.record_valuation(true, &[], i as u64);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(metrics.valuations_total(), 8_000);
    }
}

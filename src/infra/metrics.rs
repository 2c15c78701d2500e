//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap). Scrapers read the
//! cumulative view through `snapshot()`, which never resets anything.
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use crate::domain::errors::{CameraError, ResolutionError};
use crate::domain::ticket::ResolutionStep;
use crate::domain::types::CheckInOutcome;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Exponential bucket boundaries for resolution latency (milliseconds)
/// Buckets: ≤100, ≤200, ≤400, ≤800, ≤1600, ≤3200, ≤6400, ≤12800, ≤25600, ≤51200, >51200
const BUCKET_BOUNDS: [u64; 10] = [100, 200, 400, 800, 1600, 3200, 6400, 12800, 25600, 51200];
const NUM_BUCKETS: usize = 11;

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
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

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

/// Session state values for the Prometheus gauge
pub const SESSION_STATE_IDLE: u64 = 0;
pub const SESSION_STATE_INITIALIZING: u64 = 1;
pub const SESSION_STATE_SCANNING: u64 = 2;
pub const SESSION_STATE_RESOLVING: u64 = 3;
pub const SESSION_STATE_DECIDED: u64 = 4;
pub const SESSION_STATE_CLOSED: u64 = 5;

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Decodes delivered by the capture device (monotonic)
    decodes_total: AtomicU64,
    /// Decodes suppressed by the debouncer (monotonic)
    decodes_debounced: AtomicU64,
    /// Decodes dropped because the decoded-code buffer was full (monotonic)
    decodes_dropped: AtomicU64,
    /// Resolution runs started (monotonic)
    resolutions_total: AtomicU64,
    /// Resolution runs completed since last report (reset on report)
    resolutions_since_report: AtomicU64,
    /// Successful responses per pipeline step, indexed by `ResolutionStep::index`
    step_success: [AtomicU64; 3],
    /// Failed responses per pipeline step
    step_failure: [AtomicU64; 3],
    checkins_created: AtomicU64,
    checkins_already: AtomicU64,
    errors_not_found: AtomicU64,
    errors_backend: AtomicU64,
    errors_timeout: AtomicU64,
    errors_not_admissible: AtomicU64,
    /// Camera errors surfaced to the operator (monotonic)
    camera_errors: AtomicU64,
    /// Successful camera opens (monotonic)
    camera_opens: AtomicU64,
    /// Sum of resolution latencies in milliseconds (reset on report)
    latency_sum_ms: AtomicU64,
    /// Max resolution latency in milliseconds (reset on report)
    latency_max_ms: AtomicU64,
    /// Resolution latency histogram buckets (reset on report)
    latency_buckets: [AtomicU64; NUM_BUCKETS],
    /// Cumulative latency histogram, sum and max (monotonic)
    latency_total_buckets: [AtomicU64; NUM_BUCKETS],
    latency_total_sum_ms: AtomicU64,
    latency_total_max_ms: AtomicU64,
    /// Current session state (see SESSION_STATE_* constants)
    session_state: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            decodes_total: AtomicU64::new(0),
            decodes_debounced: AtomicU64::new(0),
            decodes_dropped: AtomicU64::new(0),
            resolutions_total: AtomicU64::new(0),
            resolutions_since_report: AtomicU64::new(0),
            step_success: std::array::from_fn(|_| AtomicU64::new(0)),
            step_failure: std::array::from_fn(|_| AtomicU64::new(0)),
            checkins_created: AtomicU64::new(0),
            checkins_already: AtomicU64::new(0),
            errors_not_found: AtomicU64::new(0),
            errors_backend: AtomicU64::new(0),
            errors_timeout: AtomicU64::new(0),
            errors_not_admissible: AtomicU64::new(0),
            camera_errors: AtomicU64::new(0),
            camera_opens: AtomicU64::new(0),
            latency_sum_ms: AtomicU64::new(0),
            latency_max_ms: AtomicU64::new(0),
            latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            latency_total_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            latency_total_sum_ms: AtomicU64::new(0),
            latency_total_max_ms: AtomicU64::new(0),
            session_state: AtomicU64::new(SESSION_STATE_IDLE),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_decode(&self) {
        self.decodes_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_decode_debounced(&self) {
        self.decodes_debounced.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a decode dropped due to channel full (lock-free)
    #[inline]
    pub fn record_decode_dropped(&self) {
        self.decodes_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_resolution_started(&self) {
        self.resolutions_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the response of a single pipeline step
    #[inline]
    pub fn record_step(&self, step: ResolutionStep, ok: bool) {
        let counters = if ok { &self.step_success } else { &self.step_failure };
        counters[step.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed resolution with its end-to-end latency (lock-free)
    #[inline]
    pub fn record_resolution(&self, result: Result<CheckInOutcome, &ResolutionError>, latency_ms: u64) {
        self.resolutions_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        let bucket = bucket_index(latency_ms);
        self.latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.latency_max_ms, latency_ms);
        self.latency_total_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.latency_total_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        update_atomic_max(&self.latency_total_max_ms, latency_ms);

        let counter = match result {
            Ok(CheckInOutcome::Created) => &self.checkins_created,
            Ok(CheckInOutcome::AlreadyCheckedIn) => &self.checkins_already,
            Err(ResolutionError::NotFound) => &self.errors_not_found,
            Err(ResolutionError::BackendUnavailable(_)) => &self.errors_backend,
            Err(ResolutionError::Timeout) => &self.errors_timeout,
            Err(ResolutionError::NotAdmissible(_)) => &self.errors_not_admissible,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_camera_open(&self) {
        self.camera_opens.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_camera_error(&self, _error: CameraError) {
        self.camera_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Set session state (see SESSION_STATE_* constants)
    #[inline]
    pub fn set_session_state(&self, state: u64) {
        self.session_state.store(state, Ordering::Relaxed);
    }

    #[inline]
    pub fn session_state(&self) -> u64 {
        self.session_state.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn decodes_total(&self) -> u64 {
        self.decodes_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn decodes_debounced(&self) -> u64 {
        self.decodes_debounced.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn decodes_dropped(&self) -> u64 {
        self.decodes_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn resolutions_total(&self) -> u64 {
        self.resolutions_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn checkins_created(&self) -> u64 {
        self.checkins_created.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn checkins_already(&self) -> u64 {
        self.checkins_already.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn camera_errors(&self) -> u64 {
        self.camera_errors.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn step_success(&self, step: ResolutionStep) -> u64 {
        self.step_success[step.index()].load(Ordering::Relaxed)
    }

    #[inline]
    pub fn step_failure(&self, step: ResolutionStep) -> u64 {
        self.step_failure[step.index()].load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self) -> MetricsSummary {
        // Swap periodic counters to zero and get their values
        let resolutions = self.resolutions_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.latency_sum_ms.swap(0, Ordering::Relaxed);
        let max_latency = self.latency_max_ms.swap(0, Ordering::Relaxed);
        let lat_buckets = swap_buckets(&self.latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let resolutions_per_min = if elapsed.as_secs_f64() > 0.0 {
            resolutions as f64 * 60.0 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        self.summary(resolutions, latency_sum, max_latency, lat_buckets, resolutions_per_min)
    }

    /// Cumulative summary since start; resets nothing, so any number of
    /// readers can call it
    pub fn snapshot(&self) -> MetricsSummary {
        let lat_buckets = load_buckets(&self.latency_total_buckets);
        let resolutions = lat_buckets.iter().sum();
        self.summary(
            resolutions,
            self.latency_total_sum_ms.load(Ordering::Relaxed),
            self.latency_total_max_ms.load(Ordering::Relaxed),
            lat_buckets,
            0.0,
        )
    }

    fn summary(
        &self,
        resolutions: u64,
        latency_sum: u64,
        max_latency: u64,
        lat_buckets: [u64; NUM_BUCKETS],
        resolutions_per_min: f64,
    ) -> MetricsSummary {
        let avg_latency = if resolutions > 0 { latency_sum / resolutions } else { 0 };

        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);

        MetricsSummary {
            decodes_total: load(&self.decodes_total),
            decodes_debounced: load(&self.decodes_debounced),
            decodes_dropped: load(&self.decodes_dropped),
            resolutions_total: load(&self.resolutions_total),
            resolutions_per_min,
            step_success: std::array::from_fn(|i| load(&self.step_success[i])),
            step_failure: std::array::from_fn(|i| load(&self.step_failure[i])),
            checkins_created: load(&self.checkins_created),
            checkins_already: load(&self.checkins_already),
            errors_not_found: load(&self.errors_not_found),
            errors_backend: load(&self.errors_backend),
            errors_timeout: load(&self.errors_timeout),
            errors_not_admissible: load(&self.errors_not_admissible),
            camera_errors: load(&self.camera_errors),
            camera_opens: load(&self.camera_opens),
            avg_latency_ms: avg_latency,
            latency_sum_ms: latency_sum,
            max_latency_ms: max_latency,
            lat_buckets,
            lat_p50_ms: percentile_from_buckets(&lat_buckets, 0.50),
            lat_p95_ms: percentile_from_buckets(&lat_buckets, 0.95),
            lat_p99_ms: percentile_from_buckets(&lat_buckets, 0.99),
            session_state: load(&self.session_state),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for the Prometheus endpoint)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub decodes_total: u64,
    pub decodes_debounced: u64,
    pub decodes_dropped: u64,
    pub resolutions_total: u64,
    pub resolutions_per_min: f64,
    /// Indexed by `ResolutionStep::index`
    pub step_success: [u64; 3],
    pub step_failure: [u64; 3],
    pub checkins_created: u64,
    pub checkins_already: u64,
    pub errors_not_found: u64,
    pub errors_backend: u64,
    pub errors_timeout: u64,
    pub errors_not_admissible: u64,
    pub camera_errors: u64,
    pub camera_opens: u64,
    pub avg_latency_ms: u64,
    pub latency_sum_ms: u64,
    pub max_latency_ms: u64,
    /// Resolution latency histogram buckets (ms), over the summary's window
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_ms: u64,
    pub lat_p95_ms: u64,
    pub lat_p99_ms: u64,
    pub session_state: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            decodes = %self.decodes_total,
            debounced = %self.decodes_debounced,
            dropped = %self.decodes_dropped,
            resolutions = %self.resolutions_total,
            per_min = format!("{:.1}", self.resolutions_per_min),
            created = %self.checkins_created,
            already = %self.checkins_already,
            not_found = %self.errors_not_found,
            backend_errors = %self.errors_backend,
            timeouts = %self.errors_timeout,
            camera_errors = %self.camera_errors,
            avg_ms = %self.avg_latency_ms,
            p99_ms = %self.lat_p99_ms,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::TicketStatus;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.decodes_total(), 0);
        assert_eq!(metrics.session_state(), SESSION_STATE_IDLE);
    }

    #[test]
    fn test_record_outcomes() {
        let metrics = Metrics::new();

        metrics.record_resolution(Ok(CheckInOutcome::Created), 120);
        metrics.record_resolution(Ok(CheckInOutcome::AlreadyCheckedIn), 80);
        metrics.record_resolution(Err(&ResolutionError::NotFound), 300);
        metrics.record_resolution(Err(&ResolutionError::NotAdmissible(TicketStatus::Pending)), 10);

        let summary = metrics.report();
        assert_eq!(summary.checkins_created, 1);
        assert_eq!(summary.checkins_already, 1);
        assert_eq!(summary.errors_not_found, 1);
        assert_eq!(summary.errors_not_admissible, 1);
        assert_eq!(summary.avg_latency_ms, 127); // (120+80+300+10)/4
        assert_eq!(summary.max_latency_ms, 300);
    }

    #[test]
    fn test_report_resets_periodic_counters() {
        let metrics = Metrics::new();
        metrics.record_decode();
        metrics.record_resolution(Ok(CheckInOutcome::Created), 100);

        let _ = metrics.report();
        assert_eq!(metrics.resolutions_since_report.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.latency_sum_ms.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.latency_max_ms.load(Ordering::Relaxed), 0);

        // Monotonic counters survive
        let summary = metrics.report();
        assert_eq!(summary.decodes_total, 1);
        assert_eq!(summary.checkins_created, 1);
    }

    #[test]
    fn test_snapshot_keeps_cumulative_latency() {
        let metrics = Metrics::new();
        metrics.record_resolution(Ok(CheckInOutcome::Created), 150);
        metrics.record_resolution(Ok(CheckInOutcome::Created), 450);

        let first = metrics.snapshot();
        let second = metrics.snapshot();
        assert_eq!(first.lat_buckets, second.lat_buckets);
        assert_eq!(second.lat_buckets.iter().sum::<u64>(), 2);
        assert_eq!(second.latency_sum_ms, 600);
        assert_eq!(second.max_latency_ms, 450);

        // Snapshots leave the periodic window to the reporter
        let report = metrics.report();
        assert_eq!(report.lat_buckets.iter().sum::<u64>(), 2);
        assert_eq!(report.avg_latency_ms, 300);

        // and the reporter's reset leaves the cumulative view alone
        assert_eq!(metrics.snapshot().lat_buckets.iter().sum::<u64>(), 2);
        assert_eq!(metrics.report().lat_buckets.iter().sum::<u64>(), 0);
    }

    #[test]
    fn test_step_counters() {
        let metrics = Metrics::new();
        metrics.record_step(ResolutionStep::Atomic, false);
        metrics.record_step(ResolutionStep::Joined, true);
        metrics.record_step(ResolutionStep::Joined, true);

        assert_eq!(metrics.step_failure(ResolutionStep::Atomic), 1);
        assert_eq!(metrics.step_success(ResolutionStep::Joined), 2);
        assert_eq!(metrics.step_success(ResolutionStep::Direct), 0);
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
                for _ in 0..1000 {
                    m.record_decode();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.decodes_total(), 10_000);
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
        for _ in 0..100 {
            metrics.record_resolution(Ok(CheckInOutcome::Created), 150);
        }

        let summary = metrics.report();
        assert_eq!(summary.lat_p50_ms, 200);
        assert_eq!(summary.lat_p99_ms, 200);
    }
}

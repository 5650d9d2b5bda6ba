use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sliding window of durations with percentile queries
#[derive(Debug, Clone)]
pub struct PercentileTracker {
    samples: Arc<Mutex<VecDeque<Duration>>>,
    window_size: usize,
}

impl PercentileTracker {
    pub fn new(window_size: usize) -> Self {
        Self {
            samples: Arc::new(Mutex::new(VecDeque::with_capacity(window_size))),
            window_size,
        }
    }

    pub fn record(&self, sample: Duration) {
        let mut samples = self.samples.lock();
        if samples.len() >= self.window_size {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Percentile `p` (0.0-1.0) of the window, in milliseconds
    pub fn percentile_ms(&self, p: f64) -> f64 {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return 0.0;
        }

        let mut sorted: Vec<_> = samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = ((sorted.len() as f64 * p).ceil() as usize)
            .saturating_sub(1)
            .min(sorted.len() - 1);
        sorted[idx].as_secs_f64() * 1000.0
    }

    pub fn count(&self) -> usize {
        self.samples.lock().len()
    }
}

/// Counters for one agent loop.
///
/// `wait` samples are the time an operation spent inside a blocking
/// put/get, i.e. how much backpressure the loop saw.
#[derive(Debug, Clone)]
pub struct LoopMetrics {
    completed: Arc<AtomicU64>,
    faults: Arc<AtomicU64>,
    invalid_items: Arc<AtomicU64>,
    wait: PercentileTracker,
    start_time: Instant,
}

impl LoopMetrics {
    pub fn new() -> Self {
        Self {
            completed: Arc::new(AtomicU64::new(0)),
            faults: Arc::new(AtomicU64::new(0)),
            invalid_items: Arc::new(AtomicU64::new(0)),
            wait: PercentileTracker::new(1000),
            start_time: Instant::now(),
        }
    }

    pub fn record_completed(&self, waited: Duration) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.wait.record(waited);
    }

    pub fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_invalid_item(&self) {
        self.invalid_items.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn total_faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    pub fn total_invalid_items(&self) -> u64 {
        self.invalid_items.load(Ordering::Relaxed)
    }

    /// Completed operations per second since the loop started
    pub fn throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.total_completed() as f64 / elapsed
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            completed: self.total_completed(),
            faults: self.total_faults(),
            invalid_items: self.total_invalid_items(),
            throughput: self.throughput(),
            wait_p50_ms: self.wait.percentile_ms(0.50),
            wait_p95_ms: self.wait.percentile_ms(0.95),
            wait_p99_ms: self.wait.percentile_ms(0.99),
            elapsed: self.start_time.elapsed(),
        }
    }
}

impl Default for LoopMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of a loop's metrics
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub completed: u64,
    pub faults: u64,
    pub invalid_items: u64,
    pub throughput: f64,
    pub wait_p50_ms: f64,
    pub wait_p95_ms: f64,
    pub wait_p99_ms: f64,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    pub fn format(&self) -> String {
        format!(
            "Completed: {}, Faults: {}, Invalid: {}, Throughput: {:.2} op/s, \
             Wait P50: {:.1}ms, P95: {:.1}ms, P99: {:.1}ms, Elapsed: {:.2}s",
            self.completed,
            self.faults,
            self.invalid_items,
            self.throughput,
            self.wait_p50_ms,
            self.wait_p95_ms,
            self.wait_p99_ms,
            self.elapsed.as_secs_f64()
        )
    }
}

//! C1: a bounded window of recent execution outcomes, used by the AIMD
//! controller and the composite rate limiter's adaptive loop to decide
//! whether to grow or shrink a limit.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A single completed call.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionSample {
    pub recorded_at: Instant,
    pub latency: Duration,
    pub is_error: bool,
}

/// A point-in-time read of the window, cheap to compute and cheap to clone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub sample_count: usize,
    pub average_latency: Duration,
    pub error_rate: f64,
}

impl MetricsSnapshot {
    pub const EMPTY: MetricsSnapshot = MetricsSnapshot {
        sample_count: 0,
        average_latency: Duration::ZERO,
        error_rate: 0.0,
    };
}

/// A fixed-capacity FIFO of the most recent samples, guarded by a single
/// mutex. Writers are never more than one sample behind a snapshot reader.
pub struct MetricsWindow {
    capacity: usize,
    samples: Mutex<VecDeque<ExecutionSample>>,
}

impl MetricsWindow {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "metrics window capacity must be > 0");
        Self {
            capacity,
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn record(&self, latency: Duration, is_error: bool) {
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(ExecutionSample {
            recorded_at: Instant::now(),
            latency,
            is_error,
        });
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return MetricsSnapshot::EMPTY;
        }
        let sample_count = samples.len();
        let total_latency: Duration = samples.iter().map(|s| s.latency).sum();
        let errors = samples.iter().filter(|s| s.is_error).count();
        MetricsSnapshot {
            sample_count,
            average_latency: total_latency / sample_count as u32,
            error_rate: errors as f64 / sample_count as f64,
        }
    }

    /// Weighted exponential moving average of success (not error) rate.
    ///
    /// The most-recent 25% of the window carries 60% of the weight and the
    /// most-recent 50% carries 40%; the oldest half of that 50% is ignored.
    /// An empty window is neutral: neither a signal to grow nor to shrink.
    pub fn weighted_ema(&self) -> f64 {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return 0.5;
        }

        let len = samples.len();
        // `samples` is oldest-first; the most recent sample is at the back.
        let recent_quarter_start = len - (len / 4).max(1).min(len);
        let recent_half_start = len - (len / 2).max(1).min(len);

        let success_rate_over = |start: usize| -> f64 {
            let slice: Vec<&ExecutionSample> = samples.iter().skip(start).collect();
            if slice.is_empty() {
                return 0.5;
            }
            let successes = slice.iter().filter(|s| !s.is_error).count();
            successes as f64 / slice.len() as f64
        };

        let recent_quarter = success_rate_over(recent_quarter_start);
        let recent_half = success_rate_over(recent_half_start);

        0.6 * recent_quarter + 0.4 * recent_half
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

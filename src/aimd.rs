//! C3: the AIMD feedback controller that periodically retunes a bulkhead's
//! parallelism limit from the samples recorded in its [`MetricsWindow`].

use crate::config::AimdOptions;
use crate::metrics_window::MetricsWindow;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

/// An accepted limit change, published to every subscribed listener.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adjustment {
    pub new_limit: u32,
    pub average_latency: Duration,
    pub error_rate: f64,
    pub sample_count: usize,
}

const ADJUSTMENT_CHANNEL_CAPACITY: usize = 64;

/// Periodically reads a [`MetricsWindow`] and publishes a new parallelism
/// limit following the additive-increase/multiplicative-decrease law.
///
/// The controller does not own a timer by default: call [`AimdController::tick`]
/// directly for deterministic tests, or [`AimdController::spawn`] to run it on
/// `adjustment_interval` inside the Tokio runtime.
pub struct AimdController {
    options: AimdOptions,
    metrics: Arc<MetricsWindow>,
    current_limit: AtomicU32,
    last_adjustment_at: Mutex<Option<Instant>>,
    events: broadcast::Sender<Adjustment>,
    stopped: AtomicBool,
}

impl AimdController {
    pub fn new(initial_limit: u32, options: AimdOptions, metrics: Arc<MetricsWindow>) -> Self {
        let (events, _) = broadcast::channel(ADJUSTMENT_CHANNEL_CAPACITY);
        Self {
            options,
            metrics,
            current_limit: AtomicU32::new(initial_limit),
            last_adjustment_at: Mutex::new(None),
            events,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn current_limit(&self) -> u32 {
        self.current_limit.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Adjustment> {
        self.events.subscribe()
    }

    pub fn metrics_snapshot(&self) -> crate::metrics_window::MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Records an execution outcome, unless the controller has been stopped.
    pub fn record(&self, latency: Duration, is_error: bool) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        self.metrics.record(latency, is_error);
    }

    /// Runs one adjustment cycle. Returns `Some(Adjustment)` if the limit
    /// changed, `None` otherwise (including when stopped or under-sampled).
    #[instrument(skip(self), fields(current_limit = self.current_limit()))]
    pub fn tick(&self) -> Option<Adjustment> {
        if self.stopped.load(Ordering::Acquire) {
            return None;
        }

        let snapshot = self.metrics.snapshot();
        if snapshot.sample_count < self.options.min_samples {
            debug!(
                sample_count = snapshot.sample_count,
                min_samples = self.options.min_samples,
                "too few samples, skipping adjustment"
            );
            return None;
        }

        let should_decrease = snapshot.average_latency > self.options.latency_threshold()
            || snapshot.error_rate > self.options.error_rate_threshold;

        let current = self.current_limit();
        let candidate = if should_decrease {
            ((current as f64 * self.options.multiplicative_decrease).ceil() as u32).max(1)
        } else {
            current.saturating_add(self.options.additive_increase)
        };
        let clamped = candidate.clamp(self.options.min, self.options.max);

        if clamped == current {
            return None;
        }

        self.current_limit.store(clamped, Ordering::Release);
        *self.last_adjustment_at.lock() = Some(Instant::now());

        let adjustment = Adjustment {
            new_limit: clamped,
            average_latency: snapshot.average_latency,
            error_rate: snapshot.error_rate,
            sample_count: snapshot.sample_count,
        };
        debug!(?adjustment, "publishing parallelism adjustment");
        // A send error just means there are no subscribers right now; the
        // limit has already been published via the atomic above.
        let _ = self.events.send(adjustment);
        Some(adjustment)
    }

    pub fn last_adjustment_at(&self) -> Option<Instant> {
        *self.last_adjustment_at.lock()
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    /// Spawns the periodic timer loop onto the current Tokio runtime. A
    /// panic inside a single tick is caught and logged; the timer keeps
    /// running. Dropping the returned handle stops the timer.
    pub fn spawn(self: Arc<Self>) -> AimdTimerHandle {
        let interval = self.options.adjustment_interval();
        let controller = Arc::clone(&self);
        let join_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if controller.stopped.load(Ordering::Acquire) {
                    break;
                }
                let controller = Arc::clone(&controller);
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| controller.tick()));
                if let Err(panic) = outcome {
                    error!(?panic, "aimd controller tick panicked, continuing");
                }
            }
        });
        AimdTimerHandle {
            controller: self,
            join_handle,
        }
    }
}

/// Owns the spawned timer task; dropping it stops further adjustments and
/// aborts the background loop.
pub struct AimdTimerHandle {
    controller: Arc<AimdController>,
    join_handle: JoinHandle<()>,
}

impl Drop for AimdTimerHandle {
    fn drop(&mut self) {
        self.controller.stop();
        self.join_handle.abort();
        warn!("aimd controller timer stopped");
    }
}

//! C5: a composite adaptive rate limiter pairing a token bucket (burst
//! smoothing) with a segmented sliding window (aggregate rate), with
//! paired acquire/rollback semantics and a self-tuning adaptive loop.

use crate::config::{
    CompositeRateLimiterOptions, SlidingWindowOptions, TokenBucketOptions,
};
use crate::error::{PolicyError, PolicyResult, RejectionKind};
use crate::metrics_window::MetricsWindow;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::debug;

const MIN_DATA_POINTS_FOR_UPDATE: u64 = 10;
const REBUILD_THRESHOLD_FRACTION: f64 = 0.10;

/// A successful or failed acquisition from the token-bucket stage.
///
/// Normal disposal does *not* refund the consumed tokens — matching a
/// standard token bucket, where spent tokens return only via periodic
/// replenishment. [`TokenBucketLease::rollback`] is the one exception,
/// used to unwind a speculative acquisition that a later paired stage
/// rejected.
pub struct TokenBucketLease {
    acquired: bool,
    tokens: u32,
    metadata: HashMap<String, String>,
    bucket: Option<Arc<TokenBucketLimiterInner>>,
    disposed: bool,
}

impl TokenBucketLease {
    pub fn acquired(&self) -> bool {
        self.acquired
    }

    pub fn metadata_names(&self) -> Vec<&str> {
        self.metadata.keys().map(String::as_str).collect()
    }

    pub fn try_get_metadata(&self, name: &str) -> Option<&str> {
        self.metadata.get(name).map(String::as_str)
    }

    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.bucket.take();
    }

    fn rollback(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if let Some(bucket) = self.bucket.take() {
            bucket.replenish(self.tokens);
        }
    }
}

impl Drop for TokenBucketLease {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// A successful or failed acquisition from the sliding-window stage.
pub struct SlidingWindowLease {
    acquired: bool,
    metadata: HashMap<String, String>,
    disposed: bool,
}

impl SlidingWindowLease {
    pub fn acquired(&self) -> bool {
        self.acquired
    }

    pub fn metadata_names(&self) -> Vec<&str> {
        self.metadata.keys().map(String::as_str).collect()
    }

    pub fn try_get_metadata(&self, name: &str) -> Option<&str> {
        self.metadata.get(name).map(String::as_str)
    }

    pub fn dispose(&mut self) {
        // A segment count is never refunded on dispose: the window ages it
        // out naturally as time advances.
        self.disposed = true;
    }
}

impl Drop for SlidingWindowLease {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// A paired lease from both stages of a [`CompositeRateLimiter`].
///
/// `acquired() == false` is a first-class outcome, not an error: a caller
/// that only needs a boolean checks `acquired()` directly; one that wants
/// an error to propagate (e.g. through `?`) calls [`CompositeLease::to_rejection_error`].
pub struct CompositeLease {
    acquired: bool,
    token_bucket: TokenBucketLease,
    sliding_window: Option<SlidingWindowLease>,
    rejection_kind: Option<RejectionKind>,
    retry_after: Option<Duration>,
}

impl CompositeLease {
    pub fn acquired(&self) -> bool {
        self.acquired
    }

    /// Which stage rejected, or `None` if the lease was acquired.
    pub fn rejection_kind(&self) -> Option<RejectionKind> {
        self.rejection_kind
    }

    /// Time until the rejecting stage is expected to have capacity again:
    /// the token bucket's next replenishment, or the sliding window's next
    /// segment rollover. `None` if acquired, or if the token bucket rejected
    /// with auto-replenishment disabled (nothing will free it on its own).
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Bridges a rejected lease to a [`PolicyError`] for callers that want
    /// admission failure to propagate as an error (e.g. via `?`) rather than
    /// inspect the lease directly. `None` if the lease was acquired.
    pub fn to_rejection_error(&self) -> Option<PolicyError> {
        let kind = self.rejection_kind?;
        Some(match self.retry_after {
            Some(retry_after) => {
                PolicyError::rejected_with_retry_after(kind, kind.to_string(), retry_after)
            }
            None => PolicyError::rejected(kind, kind.to_string()),
        })
    }

    /// Union of both inner leases' metadata names, deduplicated.
    pub fn metadata_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .token_bucket
            .metadata_names()
            .into_iter()
            .map(str::to_owned)
            .collect();
        if let Some(sw) = &self.sliding_window {
            for name in sw.metadata_names() {
                if !names.iter().any(|n| n == name) {
                    names.push(name.to_owned());
                }
            }
        }
        names
    }

    /// Token-bucket metadata wins ties.
    pub fn try_get_metadata(&self, name: &str) -> Option<String> {
        self.token_bucket
            .try_get_metadata(name)
            .or_else(|| {
                self.sliding_window
                    .as_ref()
                    .and_then(|sw| sw.try_get_metadata(name))
            })
            .map(str::to_owned)
    }

    /// Releases both inner leases. Safe to call more than once.
    pub fn dispose(&mut self) {
        self.token_bucket.dispose();
        if let Some(sw) = &mut self.sliding_window {
            sw.dispose();
        }
    }
}

impl Drop for CompositeLease {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// The hand-rolled token-bucket stage. Built on a `tokio::sync::Semaphore`
/// rather than a crate like `governor`, because a governor-style limiter has
/// no way to roll back a speculative acquisition — exactly what the paired
/// acquisition contract in [`CompositeRateLimiter::acquire`] requires.
struct TokenBucketLimiterInner {
    semaphore: Arc<Semaphore>,
    max_tokens: u32,
    replenishment_period: Duration,
    auto_replenish: bool,
    last_replenish_tick_at: Mutex<Instant>,
}

impl TokenBucketLimiterInner {
    fn new(options: &TokenBucketOptions) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(options.token_limit as usize)),
            max_tokens: options.token_limit,
            replenishment_period: options.replenishment_period(),
            auto_replenish: options.auto_replenish,
            last_replenish_tick_at: Mutex::new(Instant::now()),
        })
    }

    /// Time until the periodic replenishment timer next fires, or `None` if
    /// auto-replenishment is off — nothing will free tokens without an
    /// explicit rollback or reconfiguration in that mode.
    fn retry_after(&self) -> Option<Duration> {
        if !self.auto_replenish {
            return None;
        }
        let elapsed = self.last_replenish_tick_at.lock().elapsed();
        Some(self.replenishment_period.saturating_sub(elapsed))
    }

    fn try_acquire(self: &Arc<Self>, n: u32) -> TokenBucketLease {
        match Arc::clone(&self.semaphore).try_acquire_many_owned(n) {
            Ok(permit) => {
                // Tokens are spent permanently; replenishment happens only
                // on the periodic tick or an explicit rollback.
                permit.forget();
                TokenBucketLease {
                    acquired: true,
                    tokens: n,
                    metadata: HashMap::new(),
                    bucket: Some(Arc::clone(self)),
                    disposed: false,
                }
            }
            Err(_) => TokenBucketLease {
                acquired: false,
                tokens: 0,
                metadata: HashMap::new(),
                bucket: None,
                disposed: false,
            },
        }
    }

    fn replenish(&self, tokens: u32) {
        let available = self.semaphore.available_permits() as u32;
        let room = self.max_tokens.saturating_sub(available);
        let to_add = tokens.min(room);
        if to_add > 0 {
            self.semaphore.add_permits(to_add as usize);
        }
    }

    fn spawn_auto_replenish(self: &Arc<Self>, options: &TokenBucketOptions) -> Option<tokio::task::JoinHandle<()>> {
        if !options.auto_replenish {
            return None;
        }
        let inner = Arc::clone(self);
        let period = options.replenishment_period();
        let tokens_per_period = options.tokens_per_period;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                inner.replenish(tokens_per_period);
                *inner.last_replenish_tick_at.lock() = Instant::now();
            }
        }))
    }
}

/// The hand-rolled segmented sliding-window ("leap-second window") stage.
/// Divides the window into `segments_per_window` buckets of counters,
/// aging out the oldest segment as the window slides forward.
struct SlidingWindowLimiterInner {
    permit_limit: u32,
    window: Duration,
    segments_per_window: u32,
    segment_duration: Duration,
    state: RwLock<SlidingWindowState>,
}

struct SlidingWindowState {
    segment_counts: Vec<u32>,
    current_segment_index: usize,
    segment_started_at: Instant,
}

impl SlidingWindowLimiterInner {
    fn new(options: &SlidingWindowOptions) -> Arc<Self> {
        let segments = options.segments_per_window as usize;
        Arc::new(Self {
            permit_limit: options.permit_limit,
            window: options.window(),
            segments_per_window: options.segments_per_window,
            segment_duration: options.segment_duration(),
            state: RwLock::new(SlidingWindowState {
                segment_counts: vec![0; segments],
                current_segment_index: 0,
                segment_started_at: Instant::now(),
            }),
        })
    }

    fn advance_segments(&self, state: &mut SlidingWindowState) {
        let elapsed = state.segment_started_at.elapsed();
        let mut segments_to_advance =
            (elapsed.as_nanos() / self.segment_duration.as_nanos().max(1)) as usize;
        if segments_to_advance == 0 {
            return;
        }
        segments_to_advance = segments_to_advance.min(state.segment_counts.len());
        for _ in 0..segments_to_advance {
            state.current_segment_index =
                (state.current_segment_index + 1) % state.segment_counts.len();
            state.segment_counts[state.current_segment_index] = 0;
        }
        state.segment_started_at = Instant::now();
    }

    fn try_acquire(self: &Arc<Self>, n: u32) -> SlidingWindowLease {
        let mut state = self.state.write();
        self.advance_segments(&mut state);

        let total_in_window: u32 = state.segment_counts.iter().sum();
        if total_in_window + n > self.permit_limit {
            return SlidingWindowLease {
                acquired: false,
                metadata: HashMap::new(),
                disposed: false,
            };
        }

        let idx = state.current_segment_index;
        state.segment_counts[idx] += n;

        SlidingWindowLease {
            acquired: true,
            metadata: HashMap::new(),
            disposed: false,
        }
    }

    /// Time until the current segment ages out and its count is dropped
    /// from the window total.
    fn retry_after(&self) -> Duration {
        let elapsed = self.state.read().segment_started_at.elapsed();
        self.segment_duration.saturating_sub(elapsed)
    }
}

/// Construction-time-adjustable composite limiter: token bucket + sliding
/// window, with an adaptive loop that grows or shrinks both stages based on
/// the weighted EMA of recent acquisition outcomes.
pub struct CompositeRateLimiter {
    options: RwLock<CompositeRateLimiterOptions>,
    token_bucket: RwLock<Arc<TokenBucketLimiterInner>>,
    token_bucket_task: RwLock<Option<tokio::task::JoinHandle<()>>>,
    sliding_window: RwLock<Arc<SlidingWindowLimiterInner>>,
    current_token_limit: AtomicU32,
    current_permit_limit: AtomicU32,
    metrics: MetricsWindow,
    total_acquisitions: AtomicU64,
    successful_acquisitions: AtomicU64,
}

impl CompositeRateLimiter {
    pub fn new(options: CompositeRateLimiterOptions) -> PolicyResult<Self> {
        options.validate()?;

        let token_bucket = TokenBucketLimiterInner::new(&options.token_bucket);
        let token_bucket_task = token_bucket.spawn_auto_replenish(&options.token_bucket);
        let sliding_window = SlidingWindowLimiterInner::new(&options.sliding_window);

        Ok(Self {
            current_token_limit: AtomicU32::new(options.token_bucket.token_limit),
            current_permit_limit: AtomicU32::new(options.sliding_window.permit_limit),
            options: RwLock::new(options),
            token_bucket: RwLock::new(token_bucket),
            token_bucket_task: RwLock::new(token_bucket_task),
            sliding_window: RwLock::new(sliding_window),
            metrics: MetricsWindow::new(500),
            total_acquisitions: AtomicU64::new(0),
            successful_acquisitions: AtomicU64::new(0),
        })
    }

    /// Paired acquisition: both stages must admit or the whole attempt is
    /// rolled back. The returned lease always reports its own outcome via
    /// [`CompositeLease::acquired`] — rejection is a value, not a `Result`
    /// error; call [`CompositeLease::to_rejection_error`] to get one.
    pub fn acquire(&self, n: u32) -> CompositeLease {
        let token_bucket = self.token_bucket.read().clone();
        let mut tb_lease = token_bucket.try_acquire(n);
        if !tb_lease.acquired() {
            self.record_outcome(false);
            self.maybe_adjust();
            return CompositeLease {
                acquired: false,
                token_bucket: tb_lease,
                sliding_window: None,
                rejection_kind: Some(RejectionKind::TokenBucketExhausted),
                retry_after: token_bucket.retry_after(),
            };
        }

        let sliding_window = self.sliding_window.read().clone();
        let sw_lease = sliding_window.try_acquire(n);
        if !sw_lease.acquired() {
            // Roll back the token-bucket lease: return the speculatively
            // acquired tokens.
            tb_lease.rollback();
            self.record_outcome(false);
            self.maybe_adjust();
            return CompositeLease {
                acquired: false,
                token_bucket: tb_lease,
                sliding_window: Some(sw_lease),
                rejection_kind: Some(RejectionKind::SlidingWindowExhausted),
                retry_after: Some(sliding_window.retry_after()),
            };
        }

        self.record_outcome(true);
        self.maybe_adjust();

        CompositeLease {
            acquired: true,
            token_bucket: tb_lease,
            sliding_window: Some(sw_lease),
            rejection_kind: None,
            retry_after: None,
        }
    }

    fn record_outcome(&self, success: bool) {
        self.total_acquisitions.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_acquisitions.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics.record(Duration::ZERO, !success);
    }

    fn maybe_adjust(&self) {
        let total = self.total_acquisitions.load(Ordering::Relaxed);
        if total < MIN_DATA_POINTS_FOR_UPDATE {
            return;
        }

        let ema = self.metrics.weighted_ema();
        let successful = self.successful_acquisitions.load(Ordering::Relaxed);
        let rate_now = successful as f64 / total as f64;

        let options = self.options.read().clone();

        if ema > options.high_threshold && rate_now > options.high_threshold {
            self.grow(&options);
        } else if ema < options.low_threshold && rate_now < options.low_threshold {
            self.shrink(&options);
        }
    }

    fn grow(&self, options: &CompositeRateLimiterOptions) {
        let current_tokens = self.current_token_limit.load(Ordering::Acquire);
        let current_permits = self.current_permit_limit.load(Ordering::Acquire);

        let proposed_tokens =
            ((current_tokens as f64 * options.increase_multiplier) as u32).min(options.max_tokens);
        let proposed_permits =
            ((current_permits as f64 * options.increase_multiplier) as u32).min(options.max_permits);

        self.maybe_rebuild_token_bucket(current_tokens, proposed_tokens, options);
        self.maybe_rebuild_sliding_window(current_permits, proposed_permits, options);
    }

    fn shrink(&self, options: &CompositeRateLimiterOptions) {
        let current_tokens = self.current_token_limit.load(Ordering::Acquire);
        let current_permits = self.current_permit_limit.load(Ordering::Acquire);

        let proposed_tokens = ((current_tokens as f64 * options.decrease_multiplier) as u32)
            .max(options.min_tokens);
        let proposed_permits = ((current_permits as f64 * options.decrease_multiplier) as u32)
            .max(options.min_permits);

        self.maybe_rebuild_token_bucket(current_tokens, proposed_tokens, options);
        self.maybe_rebuild_sliding_window(current_permits, proposed_permits, options);
    }

    fn exceeds_rebuild_threshold(current: u32, proposed: u32) -> bool {
        if current == 0 {
            return proposed != 0;
        }
        let delta = (proposed as f64 - current as f64).abs();
        delta > REBUILD_THRESHOLD_FRACTION * current as f64
    }

    fn maybe_rebuild_token_bucket(
        &self,
        current: u32,
        proposed: u32,
        options: &CompositeRateLimiterOptions,
    ) {
        if !Self::exceeds_rebuild_threshold(current, proposed) {
            return;
        }

        let tokens_per_period = ((proposed as f64
            * (options.token_bucket.tokens_per_period as f64 / current.max(1) as f64))
            as u32)
            .min(options.max_tokens_per_period);

        let new_options = TokenBucketOptions {
            token_limit: proposed,
            tokens_per_period,
            ..options.token_bucket.clone()
        };
        let new_bucket = TokenBucketLimiterInner::new(&new_options);
        let new_task = new_bucket.spawn_auto_replenish(&new_options);

        {
            let mut guard = self.token_bucket.write();
            *guard = new_bucket;
        }
        {
            let mut guard = self.token_bucket_task.write();
            if let Some(old_task) = guard.take() {
                old_task.abort();
            }
            *guard = new_task;
        }
        self.current_token_limit.store(proposed, Ordering::Release);

        debug!(from = current, to = proposed, "rebuilt token bucket");
    }

    fn maybe_rebuild_sliding_window(
        &self,
        current: u32,
        proposed: u32,
        options: &CompositeRateLimiterOptions,
    ) {
        if !Self::exceeds_rebuild_threshold(current, proposed) {
            return;
        }

        let new_options = SlidingWindowOptions {
            permit_limit: proposed,
            ..options.sliding_window.clone()
        };
        let new_window = SlidingWindowLimiterInner::new(&new_options);

        {
            let mut guard = self.sliding_window.write();
            *guard = new_window;
        }
        self.current_permit_limit.store(proposed, Ordering::Release);

        debug!(from = current, to = proposed, "rebuilt sliding window");
    }

    pub fn current_token_limit(&self) -> u32 {
        self.current_token_limit.load(Ordering::Acquire)
    }

    pub fn current_permit_limit(&self) -> u32 {
        self.current_permit_limit.load(Ordering::Acquire)
    }

    pub fn available_tokens(&self) -> usize {
        self.token_bucket.read().semaphore.available_permits()
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            current_token_limit: self.current_token_limit(),
            current_permit_limit: self.current_permit_limit(),
            available_tokens: self.available_tokens(),
            total_acquisitions: self.total_acquisitions.load(Ordering::Relaxed),
            successful_acquisitions: self.successful_acquisitions.load(Ordering::Relaxed),
        }
    }
}

/// Observable state exposed to callers without touching the hot path,
/// mirroring [`crate::bulkhead::BulkheadStats`] for the rate-limiter side.
#[derive(Debug, Clone, Copy)]
pub struct RateLimiterStats {
    pub current_token_limit: u32,
    pub current_permit_limit: u32,
    pub available_tokens: usize,
    pub total_acquisitions: u64,
    pub successful_acquisitions: u64,
}

impl Drop for CompositeRateLimiter {
    fn drop(&mut self) {
        if let Some(task) = self.token_bucket_task.write().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SlidingWindowOptions, TokenBucketOptions};

    fn generous_options() -> CompositeRateLimiterOptions {
        CompositeRateLimiterOptions {
            token_bucket: TokenBucketOptions {
                token_limit: 5,
                tokens_per_period: 5,
                replenishment_period_ms: 1_000,
                auto_replenish: false,
            },
            sliding_window: SlidingWindowOptions {
                permit_limit: 100,
                window_ms: 1_000,
                segments_per_window: 10,
            },
            ..CompositeRateLimiterOptions::default()
        }
    }

    #[test]
    fn acquire_succeeds_within_both_stages() {
        let limiter = CompositeRateLimiter::new(generous_options()).unwrap();
        let lease = limiter.acquire(1);
        assert!(lease.acquired());
        assert!(lease.rejection_kind().is_none());
    }

    #[test]
    fn token_bucket_exhaustion_rejects_without_touching_window() {
        let limiter = CompositeRateLimiter::new(generous_options()).unwrap();
        for _ in 0..5 {
            let _ = limiter.acquire(1);
        }
        let lease = limiter.acquire(1);
        assert!(!lease.acquired());
        assert_eq!(
            lease.rejection_kind(),
            Some(RejectionKind::TokenBucketExhausted)
        );
        // auto_replenish is off, so nothing will free tokens on its own.
        assert_eq!(lease.retry_after(), None);
        assert!(matches!(
            lease.to_rejection_error(),
            Some(PolicyError::Rejected {
                kind: RejectionKind::TokenBucketExhausted,
                ..
            })
        ));
    }

    #[test]
    fn sliding_window_rejection_rolls_back_the_token_bucket_lease() {
        let mut options = generous_options();
        options.sliding_window.permit_limit = 0;
        let limiter = CompositeRateLimiter::new(options).unwrap();

        let available_before = limiter.available_tokens();
        let lease = limiter.acquire(1);
        assert!(!lease.acquired());
        assert_eq!(
            lease.rejection_kind(),
            Some(RejectionKind::SlidingWindowExhausted)
        );
        assert!(lease.retry_after().is_some());
        assert_eq!(limiter.available_tokens(), available_before);
    }

    #[test]
    fn to_rejection_error_carries_the_sliding_window_retry_after() {
        let mut options = generous_options();
        options.sliding_window.permit_limit = 0;
        let limiter = CompositeRateLimiter::new(options).unwrap();

        let lease = limiter.acquire(1);
        match lease.to_rejection_error() {
            Some(PolicyError::Rejected {
                kind: RejectionKind::SlidingWindowExhausted,
                retry_after: Some(_),
                ..
            }) => {}
            other => panic!("expected a rejected error with retry_after, got {other:?}"),
        }
    }

    #[test]
    fn composite_lease_metadata_is_union_of_both_inner_leases() {
        let limiter = CompositeRateLimiter::new(generous_options()).unwrap();
        let lease = limiter.acquire(1);
        // Neither stage attaches metadata by default; the union is empty,
        // but the call itself must not panic.
        assert!(lease.metadata_names().is_empty());
    }

    #[test]
    fn disposing_a_composite_lease_twice_is_a_no_op() {
        let limiter = CompositeRateLimiter::new(generous_options()).unwrap();
        let mut lease = limiter.acquire(1);
        lease.dispose();
        lease.dispose();
    }
}

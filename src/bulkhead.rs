//! C4: an adaptive bulkhead — a two-stage admission gate (queue, then
//! parallelism) whose parallelism limit is retuned by an [`AimdController`].

use crate::aimd::{AimdController, AimdTimerHandle, Adjustment};
use crate::config::BulkheadOptions;
use crate::error::{PolicyError, PolicyResult, RejectionKind};
use crate::metrics_window::{MetricsSnapshot, MetricsWindow};
use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

/// How long a retired parallelism semaphore is kept alive after a swap so
/// that callers already waiting on it can still complete.
const SEMAPHORE_DISPOSAL_GRACE_PERIOD: Duration = Duration::from_secs(1);

type RejectedHook = Arc<dyn Fn() -> PolicyResult<()> + Send + Sync>;

/// A concurrency limiter with a bounded non-blocking wait queue in front of
/// a blocking, cancellable parallelism gate. The parallelism limit is
/// self-tuning: see [`AdaptiveBulkhead::spawn_adjustment_loop`].
pub struct AdaptiveBulkhead {
    name: String,
    queue_depth: u32,
    queue_capacity: AtomicU32,
    pending_queue_shrink: AtomicU32,
    queue_semaphore: Arc<Semaphore>,
    parallelism: RwLock<Arc<Semaphore>>,
    swap_lock: Mutex<()>,
    last_swapped_limit: AtomicU32,
    aimd: Arc<AimdController>,
    accepted_count: AtomicU64,
    rejected_count: AtomicU64,
    on_rejected: Option<RejectedHook>,
}

/// Observable state exposed to callers without touching the hot path.
#[derive(Debug, Clone, Copy)]
pub struct BulkheadStats {
    pub current_max_parallelization: u32,
    pub available_execution_slots: usize,
    pub available_queue_slots: usize,
    pub accepted_count: u64,
    pub rejected_count: u64,
}

impl AdaptiveBulkhead {
    pub fn new(name: impl Into<String>, options: BulkheadOptions) -> PolicyResult<Self> {
        options.validate()?;

        let name = name.into();
        let initial_limit = options.initial_limit;
        let queue_depth = options.queue_depth;
        let queue_capacity = queue_depth + initial_limit;

        let metrics = Arc::new(MetricsWindow::new(options.aimd.sampling_window_size));
        let aimd = Arc::new(AimdController::new(initial_limit, options.aimd, metrics));

        Ok(Self {
            name,
            queue_depth,
            queue_capacity: AtomicU32::new(queue_capacity),
            pending_queue_shrink: AtomicU32::new(0),
            queue_semaphore: Arc::new(Semaphore::new(queue_capacity as usize)),
            parallelism: RwLock::new(Arc::new(Semaphore::new(initial_limit as usize))),
            swap_lock: Mutex::new(()),
            last_swapped_limit: AtomicU32::new(initial_limit),
            aimd,
            accepted_count: AtomicU64::new(0),
            rejected_count: AtomicU64::new(0),
            on_rejected: None,
        })
    }

    pub fn with_on_rejected(mut self, hook: RejectedHook) -> Self {
        self.on_rejected = Some(hook);
        self
    }

    /// Starts the AIMD timer and the listener that applies its adjustments
    /// to this bulkhead's semaphores. Dropping the returned handle stops
    /// both.
    pub fn spawn_adjustment_loop(self: &Arc<Self>) -> AdjustmentLoopHandle {
        let timer = Arc::clone(&self.aimd).spawn();
        let mut adjustments = self.aimd.subscribe();
        let bulkhead = Arc::clone(self);
        let listener = tokio::spawn(async move {
            while let Ok(adjustment) = adjustments.recv().await {
                bulkhead.apply_adjustment(adjustment);
            }
        });
        AdjustmentLoopHandle {
            _timer: timer,
            listener,
        }
    }

    /// Subscribes to every accepted parallelism limit change.
    pub fn on_parallelization_adjusted(&self) -> tokio::sync::broadcast::Receiver<Adjustment> {
        self.aimd.subscribe()
    }

    #[instrument(skip(self, operation), fields(bulkhead = %self.name))]
    pub async fn execute<F, Fut, T>(&self, operation: F) -> PolicyResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Box<dyn std::error::Error + Send + Sync>>>,
    {
        self.execute_cancellable(operation, std::future::pending())
            .await
    }

    /// Identical admission semantics to [`AdaptiveBulkhead::execute`], but
    /// the blocking parallelism acquisition is raced against `cancel`. If
    /// `cancel` resolves first, any permit already acquired (the queue slot)
    /// is released before returning `Cancelled`.
    pub async fn execute_cancellable<F, Fut, T, C>(
        &self,
        operation: F,
        cancel: C,
    ) -> PolicyResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Box<dyn std::error::Error + Send + Sync>>>,
        C: Future<Output = ()>,
    {
        // Declared first so it is dropped (released) *last*: parallelism
        // must release before the queue permit on every exit path,
        // including an operation panic unwinding through this frame.
        let queue_permit = match Arc::clone(&self.queue_semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.rejected_count.fetch_add(1, Ordering::Relaxed);
                if let Some(err) = self.invoke_on_rejected() {
                    return Err(err);
                }
                warn!(bulkhead = %self.name, "bulkhead queue is full");
                return Err(PolicyError::rejected(
                    RejectionKind::BulkheadQueueFull,
                    format!("bulkhead '{}' queue is full", self.name),
                ));
            }
        };

        let parallelism_semaphore = { self.parallelism.read().clone() };
        tokio::pin!(cancel);
        let parallelism_permit = tokio::select! {
            biased;
            _ = &mut cancel => {
                return Err(PolicyError::Cancelled);
            }
            acquired = parallelism_semaphore.acquire_owned() => {
                match acquired {
                    Ok(permit) => permit,
                    Err(_) => return Err(PolicyError::Cancelled),
                }
            }
        };

        let start = Instant::now();
        let result = operation().await;
        let elapsed = start.elapsed();
        let is_error = result.is_err();
        self.aimd.record(elapsed, is_error);

        if !is_error {
            self.accepted_count.fetch_add(1, Ordering::Relaxed);
        }

        debug!(
            bulkhead = %self.name,
            elapsed_ms = elapsed.as_millis(),
            is_error,
            "bulkhead call completed"
        );

        drop(parallelism_permit);
        drop(queue_permit);
        // A queue permit just became available; opportunistically finish
        // off any outstanding shrink shortfall rather than waiting for the
        // next AIMD adjustment.
        self.retry_pending_queue_shrink();

        result.map_err(PolicyError::from)
    }

    fn invoke_on_rejected(&self) -> Option<PolicyError> {
        match &self.on_rejected {
            Some(hook) => hook().err(),
            None => None,
        }
    }

    fn apply_adjustment(&self, adjustment: Adjustment) {
        let new_limit = adjustment.new_limit;
        let _guard = self.swap_lock.lock();
        if self.last_swapped_limit.load(Ordering::Acquire) == new_limit {
            // Already applied by a racing caller; double-checked lock. Still
            // worth reconciling any queue-shrink shortfall left over from
            // that application, now that more queue permits may have been
            // released since.
            self.retry_pending_queue_shrink();
            return;
        }

        let new_semaphore = Arc::new(Semaphore::new(new_limit as usize));
        let old_semaphore = {
            let mut guard = self.parallelism.write();
            std::mem::replace(&mut *guard, new_semaphore)
        };
        self.last_swapped_limit.store(new_limit, Ordering::Release);
        self.resize_queue_for_limit(new_limit);

        debug!(bulkhead = %self.name, new_limit, "swapped parallelism semaphore");

        tokio::spawn(async move {
            tokio::time::sleep(SEMAPHORE_DISPOSAL_GRACE_PERIOD).await;
            drop(old_semaphore);
        });
    }

    /// Resizes the queue semaphore to `queue_depth + new_limit`, tracking
    /// the *live* parallelism limit rather than the one observed at
    /// construction.
    ///
    /// `Semaphore::forget_permits` only forgets as many permits as are
    /// currently available and returns how many it actually forgot — under
    /// load (the case that actually triggers an AIMD shrink) the queue may
    /// have fewer available permits than the shrink calls for. `queue_capacity`
    /// is updated to the capacity *actually achieved*, never the bare
    /// target, and any shortfall is retried opportunistically as permits
    /// free up (see [`AdaptiveBulkhead::retry_pending_queue_shrink`]).
    fn resize_queue_for_limit(&self, new_limit: u32) {
        let target = self.queue_depth + new_limit;

        // Reconcile any shrink left outstanding from a previous resize
        // before computing this one; `pending_queue_shrink` is relative to
        // the semaphore's real current capacity, not to `target`.
        self.retry_pending_queue_shrink();

        let current = self.queue_capacity.load(Ordering::Acquire);
        if target > current {
            self.queue_semaphore.add_permits((target - current) as usize);
            self.queue_capacity.store(target, Ordering::Release);
            self.pending_queue_shrink.store(0, Ordering::Release);
        } else if target < current {
            let needed = current - target;
            let forgotten = self.queue_semaphore.forget_permits(needed as usize) as u32;
            self.queue_capacity
                .store(current - forgotten, Ordering::Release);
            let shortfall = needed - forgotten;
            self.pending_queue_shrink.store(shortfall, Ordering::Release);
            if shortfall > 0 {
                warn!(
                    bulkhead = %self.name,
                    shortfall,
                    "queue shrink short of target; will retry as permits free up"
                );
            }
        }
    }

    /// Forgets any queue-shrink shortfall left over from a prior
    /// [`AdaptiveBulkhead::resize_queue_for_limit`] call, using whatever
    /// permits have since become available. A no-op once fully reconciled.
    fn retry_pending_queue_shrink(&self) {
        let pending = self.pending_queue_shrink.load(Ordering::Acquire);
        if pending == 0 {
            return;
        }
        let forgotten = self.queue_semaphore.forget_permits(pending as usize) as u32;
        if forgotten > 0 {
            self.queue_capacity.fetch_sub(forgotten, Ordering::AcqRel);
            self.pending_queue_shrink
                .fetch_sub(forgotten, Ordering::AcqRel);
        }
    }

    pub fn current_max_parallelization(&self) -> u32 {
        self.aimd.current_limit()
    }

    pub fn available_execution_slots(&self) -> usize {
        self.parallelism.read().available_permits()
    }

    pub fn available_queue_slots(&self) -> usize {
        self.queue_semaphore.available_permits()
    }

    pub fn current_metrics(&self) -> MetricsSnapshot {
        self.aimd.metrics_snapshot()
    }

    pub fn stats(&self) -> BulkheadStats {
        BulkheadStats {
            current_max_parallelization: self.current_max_parallelization(),
            available_execution_slots: self.available_execution_slots(),
            available_queue_slots: self.available_queue_slots(),
            accepted_count: self.accepted_count.load(Ordering::Relaxed),
            rejected_count: self.rejected_count.load(Ordering::Relaxed),
        }
    }
}

/// Owns the AIMD timer and the adjustment-listener task. Dropping it stops
/// both; no further semaphore swaps occur afterward.
pub struct AdjustmentLoopHandle {
    _timer: AimdTimerHandle,
    listener: tokio::task::JoinHandle<()>,
}

impl Drop for AdjustmentLoopHandle {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

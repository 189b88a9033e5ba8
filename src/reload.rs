//! C2: an atomic, tear-free holder for an immutable configuration snapshot.
//!
//! `ReloadingSlot<S>` is how the retry and timeout state used by executors
//! built on top of this crate gets republished without per-field locking.

use crate::config::{BackoffKind, RetryOptions, TimeoutOptions};
use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Immutable retry parameters, swappable as a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryStateSnapshot {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Option<Duration>,
    pub backoff: BackoffKind,
    pub use_jitter: bool,
}

impl From<&RetryOptions> for RetryStateSnapshot {
    fn from(opts: &RetryOptions) -> Self {
        Self {
            max_attempts: opts.max_attempts,
            base_delay: opts.base_delay(),
            max_delay: opts.max_delay(),
            backoff: opts.backoff,
            use_jitter: opts.use_jitter,
        }
    }
}

/// Immutable timeout parameters, swappable as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutStateSnapshot {
    pub timeout: Duration,
}

impl From<&TimeoutOptions> for TimeoutStateSnapshot {
    fn from(opts: &TimeoutOptions) -> Self {
        Self {
            timeout: opts.timeout(),
        }
    }
}

/// A wait-free-read, lock-free-write atomic holder of an immutable `S`.
///
/// Built on `arc_swap::ArcSwap`, which gives `load` a wait-free fast path and
/// `store`/compare-and-swap lock-free semantics backed by a hazard-pointer
/// style reclamation scheme.
pub struct ReloadingSlot<S> {
    current: ArcSwap<S>,
}

impl<S> ReloadingSlot<S> {
    pub fn new(initial: S) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    /// Always returns the most recently stored value. Wait-free.
    pub fn load(&self) -> Arc<S> {
        self.current.load_full()
    }

    /// Unconditionally replaces the current value, returning the prior one.
    /// Lock-free.
    pub fn store(&self, new: S) -> Arc<S> {
        self.current.swap(Arc::new(new))
    }
}

impl<S: PartialEq> ReloadingSlot<S> {
    /// Replaces the current value only if it is identity-equal (by value, via
    /// `PartialEq`) to `expected`; returns the value actually observed after
    /// the attempt — either the newly stored value or the unchanged current
    /// one.
    pub fn cas(&self, new: S, expected: &S) -> Arc<S> {
        let new = Arc::new(new);
        loop {
            let current = self.current.load_full();
            if *current != *expected {
                return current;
            }
            let prev = self.current.compare_and_swap(&current, Arc::clone(&new));
            if Arc::ptr_eq(&*prev, &current) {
                return new;
            }
            // Lost the race; the next loop iteration re-reads and retries
            // the comparison against the freshly observed value.
        }
    }
}

impl ReloadingSlot<RetryStateSnapshot> {
    /// Parses `options` into a `RetryStateSnapshot` and stores it. A no-op
    /// when `options` fails validation — the current state is preserved.
    pub fn on_configuration_changed(&self, options: &RetryOptions) {
        if let Err(err) = options.validate() {
            debug!(?err, "ignoring invalid retry configuration");
            return;
        }
        self.store(RetryStateSnapshot::from(options));
    }

    /// Same contract as [`ReloadingSlot::on_configuration_changed`], but
    /// accepts the opaque `serde_json::Value` a file-backed or DI-sourced
    /// configuration provider would actually hand the core. An options
    /// object of an unrecognized shape fails to deserialize into
    /// `RetryOptions` and is a no-op, exactly like a validation failure.
    pub fn on_configuration_changed_json(&self, options: &serde_json::Value) {
        match serde_json::from_value::<RetryOptions>(options.clone()) {
            Ok(opts) => self.on_configuration_changed(&opts),
            Err(err) => debug!(?err, "ignoring retry configuration of unexpected shape"),
        }
    }
}

impl ReloadingSlot<TimeoutStateSnapshot> {
    /// Parses `options` into a `TimeoutStateSnapshot` and stores it. A no-op
    /// when `options` fails validation.
    pub fn on_configuration_changed(&self, options: &TimeoutOptions) {
        if let Err(err) = options.validate() {
            debug!(?err, "ignoring invalid timeout configuration");
            return;
        }
        self.store(TimeoutStateSnapshot::from(options));
    }

    /// JSON-boundary counterpart of [`ReloadingSlot::on_configuration_changed`];
    /// see the retry variant's doc comment for the no-op contract.
    pub fn on_configuration_changed_json(&self, options: &serde_json::Value) {
        match serde_json::from_value::<TimeoutOptions>(options.clone()) {
            Ok(opts) => self.on_configuration_changed(&opts),
            Err(err) => debug!(?err, "ignoring timeout configuration of unexpected shape"),
        }
    }
}

/// A listener invoked with `(new_options, name)` whenever the configuration
/// source publishes a change matching this handle's subscribed name.
pub type ChangeListener<O> = Box<dyn Fn(&O, &str) + Send + Sync>;

/// A disposable subscription. Dropping it does not itself unsubscribe;
/// callers must call `dispose()` (or wrap it in `DisposableReloadingHandle`)
/// for an explicit, idempotent teardown.
pub trait Subscription: Send + Sync {
    fn dispose(&self);
}

/// The boundary the core consumes for out-of-band reconfiguration. Callers
/// supply any notification mechanism — a file watcher, a DI container, a
/// test harness — by implementing this trait; the core never depends on a
/// specific one.
pub trait ConfigurationSource<O> {
    fn on_change(&self, listener: ChangeListener<O>) -> Box<dyn Subscription>;
}

/// Bundles a `ReloadingSlot` with the subscription that feeds it, so callers
/// can tear both down with a single call.
pub struct DisposableReloadingHandle<S> {
    slot: Arc<ReloadingSlot<S>>,
    subscription: Box<dyn Subscription>,
}

impl<S> DisposableReloadingHandle<S> {
    pub fn new(slot: Arc<ReloadingSlot<S>>, subscription: Box<dyn Subscription>) -> Self {
        Self { slot, subscription }
    }

    pub fn slot(&self) -> &Arc<ReloadingSlot<S>> {
        &self.slot
    }

    pub fn dispose(&self) {
        self.subscription.dispose();
    }
}

//! Resilience policy core: an adaptive bulkhead, a composite adaptive rate
//! limiter, and the reloading snapshot handle that backs live policy
//! reconfiguration, all built to stay correct under concurrent execution,
//! adjustment, and reload traffic.
//!
//! Dependency order (leaves first): [`metrics_window`] feeds [`aimd`],
//! which tunes [`bulkhead`]; [`reload`] backs retry/timeout snapshots used
//! by executors built on top of this crate; [`rate_limit`] is independent
//! of the bulkhead but shares [`metrics_window`]'s weighted-EMA machinery.
//!
//! Out of scope, by design (see spec §1): the pipeline builder/DSL, DI
//! glue (including any named-instance registry over policies — that's
//! exactly the configuration-source/DI wiring the spec excludes), the
//! retry/timeout *executors* themselves (only their state snapshots live
//! here), and any CLI or sample-program surface.

pub mod aimd;
pub mod bulkhead;
pub mod config;
pub mod error;
pub mod metrics_window;
pub mod rate_limit;
pub mod reload;

pub use aimd::{Adjustment, AimdController, AimdTimerHandle};
pub use bulkhead::{AdaptiveBulkhead, AdjustmentLoopHandle, BulkheadStats};
pub use config::{
    AimdOptions, BackoffKind, BulkheadOptions, CompositeRateLimiterOptions, RetryOptions,
    SlidingWindowOptions, TimeoutOptions, TokenBucketOptions,
};
pub use error::{PolicyError, PolicyResult, RejectionKind};
pub use metrics_window::{ExecutionSample, MetricsSnapshot, MetricsWindow};
pub use rate_limit::{CompositeLease, CompositeRateLimiter, RateLimiterStats};
pub use reload::{
    ChangeListener, ConfigurationSource, DisposableReloadingHandle, ReloadingSlot,
    RetryStateSnapshot, Subscription, TimeoutStateSnapshot,
};

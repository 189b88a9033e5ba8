//! Option records consumed by `on_configuration_changed`.
//!
//! These are the "opaque options objects" the boundary interfaces in
//! `reload` and `rate_limit` parse. Each has the same `Default` +
//! `validate(&self) -> Result<(), PolicyError>` shape the rest of this
//! codebase's configuration types use.

use crate::error::PolicyError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackoffKind {
    Constant,
    Linear,
    Exponential,
}

/// Options parsed into a `RetryStateSnapshot` by `on_configuration_changed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryOptions {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: Option<u64>,
    pub backoff: BackoffKind,
    pub use_jitter: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: Some(30_000),
            backoff: BackoffKind::Exponential,
            use_jitter: true,
        }
    }
}

impl RetryOptions {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if let Some(max_delay_ms) = self.max_delay_ms {
            if max_delay_ms < self.base_delay_ms {
                return Err(PolicyError::invalid_configuration(
                    "max_delay must be >= base_delay",
                ));
            }
        }
        Ok(())
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay_ms.map(Duration::from_millis)
    }
}

/// Options parsed into a `TimeoutStateSnapshot` by `on_configuration_changed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutOptions {
    pub timeout_ms: u64,
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

impl TimeoutOptions {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.timeout_ms == 0 {
            return Err(PolicyError::invalid_configuration("timeout must be > 0"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Construction-time options for an [`crate::bulkhead::AdaptiveBulkhead`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkheadOptions {
    pub initial_limit: u32,
    pub queue_depth: u32,
    pub aimd: AimdOptions,
}

impl Default for BulkheadOptions {
    fn default() -> Self {
        Self {
            initial_limit: 10,
            queue_depth: 10,
            aimd: AimdOptions::default(),
        }
    }
}

impl BulkheadOptions {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.initial_limit == 0 {
            return Err(PolicyError::invalid_configuration(
                "initial_limit must be > 0",
            ));
        }
        self.aimd.validate()?;
        if self.initial_limit < self.aimd.min || self.initial_limit > self.aimd.max {
            return Err(PolicyError::invalid_configuration(
                "initial_limit must lie within [min, max]",
            ));
        }
        Ok(())
    }
}

/// Options for the AIMD controller that tunes a bulkhead's parallelism limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AimdOptions {
    pub min: u32,
    pub max: u32,
    pub latency_threshold_ms: u64,
    pub error_rate_threshold: f64,
    pub additive_increase: u32,
    pub multiplicative_decrease: f64,
    pub sampling_window_size: usize,
    pub min_samples: usize,
    pub adjustment_interval_ms: u64,
}

impl Default for AimdOptions {
    fn default() -> Self {
        Self {
            min: 1,
            max: 100,
            latency_threshold_ms: 500,
            error_rate_threshold: 0.1,
            additive_increase: 1,
            multiplicative_decrease: 0.5,
            sampling_window_size: 100,
            min_samples: 10,
            adjustment_interval_ms: 5_000,
        }
    }
}

impl AimdOptions {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.min == 0 || self.min > self.max {
            return Err(PolicyError::invalid_configuration(
                "min must be > 0 and <= max",
            ));
        }
        if !(self.multiplicative_decrease > 0.0 && self.multiplicative_decrease < 1.0) {
            return Err(PolicyError::invalid_configuration(
                "multiplicative_decrease must lie in (0, 1)",
            ));
        }
        if self.error_rate_threshold < 0.0 || self.error_rate_threshold > 1.0 {
            return Err(PolicyError::invalid_configuration(
                "error_rate_threshold must lie in [0, 1]",
            ));
        }
        if self.min_samples == 0 {
            return Err(PolicyError::invalid_configuration(
                "min_samples must be > 0",
            ));
        }
        Ok(())
    }

    pub fn latency_threshold(&self) -> Duration {
        Duration::from_millis(self.latency_threshold_ms)
    }

    pub fn adjustment_interval(&self) -> Duration {
        Duration::from_millis(self.adjustment_interval_ms)
    }
}

/// Options for the token-bucket stage of a composite rate limiter.
///
/// No `queue_limit`/queueing field: `CompositeRateLimiter::acquire` is a
/// synchronous accept-or-reject admission check with no queueing of
/// blocked callers, so there is nothing for such a field to configure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucketOptions {
    pub token_limit: u32,
    pub tokens_per_period: u32,
    pub replenishment_period_ms: u64,
    pub auto_replenish: bool,
}

impl Default for TokenBucketOptions {
    fn default() -> Self {
        Self {
            token_limit: 100,
            tokens_per_period: 100,
            replenishment_period_ms: 1_000,
            auto_replenish: true,
        }
    }
}

impl TokenBucketOptions {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.token_limit == 0 {
            return Err(PolicyError::invalid_configuration(
                "token_limit must be > 0",
            ));
        }
        if self.replenishment_period_ms == 0 {
            return Err(PolicyError::invalid_configuration(
                "replenishment_period must be > 0",
            ));
        }
        Ok(())
    }

    pub fn replenishment_period(&self) -> Duration {
        Duration::from_millis(self.replenishment_period_ms)
    }
}

/// Options for the segmented sliding-window stage of a composite rate limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlidingWindowOptions {
    pub permit_limit: u32,
    pub window_ms: u64,
    pub segments_per_window: u32,
}

impl Default for SlidingWindowOptions {
    fn default() -> Self {
        Self {
            permit_limit: 100,
            window_ms: 1_000,
            segments_per_window: 10,
        }
    }
}

impl SlidingWindowOptions {
    pub fn validate(&self) -> Result<(), PolicyError> {
        // `permit_limit == 0` is a legitimate (if extreme) configuration —
        // a window that admits nothing — unlike `segments_per_window` or
        // `window_ms`, which are divisors and must be nonzero.
        if self.segments_per_window == 0 {
            return Err(PolicyError::invalid_configuration(
                "segments_per_window must be > 0",
            ));
        }
        if self.window_ms == 0 {
            return Err(PolicyError::invalid_configuration("window must be > 0"));
        }
        Ok(())
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn segment_duration(&self) -> Duration {
        self.window() / self.segments_per_window
    }
}

/// Construction-time options for a [`crate::rate_limit::CompositeRateLimiter`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeRateLimiterOptions {
    pub token_bucket: TokenBucketOptions,
    pub sliding_window: SlidingWindowOptions,
    pub high_threshold: f64,
    pub low_threshold: f64,
    pub increase_multiplier: f64,
    pub decrease_multiplier: f64,
    pub max_tokens: u32,
    pub max_tokens_per_period: u32,
    pub max_permits: u32,
    pub min_tokens: u32,
    pub min_permits: u32,
    pub min_data_points_for_update: u64,
}

impl Default for CompositeRateLimiterOptions {
    fn default() -> Self {
        Self {
            token_bucket: TokenBucketOptions::default(),
            sliding_window: SlidingWindowOptions::default(),
            high_threshold: 0.9,
            low_threshold: 0.5,
            increase_multiplier: 1.5,
            decrease_multiplier: 0.5,
            max_tokens: 1_000,
            max_tokens_per_period: 1_000,
            max_permits: 1_000,
            min_tokens: 10,
            min_permits: 10,
            min_data_points_for_update: 10,
        }
    }
}

impl CompositeRateLimiterOptions {
    pub fn validate(&self) -> Result<(), PolicyError> {
        self.token_bucket.validate()?;
        self.sliding_window.validate()?;
        if !(self.low_threshold < self.high_threshold) {
            return Err(PolicyError::invalid_configuration(
                "low_threshold must be < high_threshold",
            ));
        }
        if self.increase_multiplier <= 1.0 {
            return Err(PolicyError::invalid_configuration(
                "increase_multiplier must be > 1.0",
            ));
        }
        if !(self.decrease_multiplier > 0.0 && self.decrease_multiplier < 1.0) {
            return Err(PolicyError::invalid_configuration(
                "decrease_multiplier must lie in (0, 1)",
            ));
        }
        Ok(())
    }
}

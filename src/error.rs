use std::time::Duration;
use thiserror::Error;

/// Why a bulkhead or rate limiter declined to admit a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    /// The bulkhead's queue semaphore had no permit available.
    BulkheadQueueFull,
    /// The token-bucket stage of a composite rate limiter refused.
    TokenBucketExhausted,
    /// The sliding-window stage of a composite rate limiter refused.
    SlidingWindowExhausted,
}

impl std::fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectionKind::BulkheadQueueFull => "bulkhead queue full",
            RejectionKind::TokenBucketExhausted => "token bucket exhausted",
            RejectionKind::SlidingWindowExhausted => "sliding window exhausted",
        };
        write!(f, "{s}")
    }
}

/// Errors surfaced by the resilience policy core.
///
/// One variant per rejection reason, a `Cancelled` variant for signals that
/// fire during admission, an `InvalidConfiguration` variant raised
/// synchronously at construction time, and a boxed `UserError` carrying
/// whatever the protected callback itself returned.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("rejected: {kind} ({reason})")]
    Rejected {
        kind: RejectionKind,
        reason: String,
        retry_after: Option<Duration>,
    },

    #[error("operation cancelled during admission")]
    Cancelled,

    /// Raised by a timeout wrapper layered on top of this core (the core
    /// itself has no timer loop of its own; this variant is the boundary
    /// type such a wrapper maps its elapsed-deadline error into).
    #[error("operation timed out")]
    Timeout,

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error(transparent)]
    UserError(#[from] Box<dyn std::error::Error + Send + Sync>),
}

pub type PolicyResult<T> = Result<T, PolicyError>;

impl PolicyError {
    pub fn rejected(kind: RejectionKind, reason: impl Into<String>) -> Self {
        PolicyError::Rejected {
            kind,
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn rejected_with_retry_after(
        kind: RejectionKind,
        reason: impl Into<String>,
        retry_after: Duration,
    ) -> Self {
        PolicyError::Rejected {
            kind,
            reason: reason.into(),
            retry_after: Some(retry_after),
        }
    }

    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        PolicyError::InvalidConfiguration(msg.into())
    }

    pub fn timeout() -> Self {
        PolicyError::Timeout
    }

    /// Whether a retry executor layered on top of this core should consider
    /// retrying. Only admission rejections are; cancellation, timeout, bad
    /// configuration, and user errors are terminal at this layer.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PolicyError::Rejected { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_is_retryable_others_are_not() {
        assert!(PolicyError::rejected(RejectionKind::BulkheadQueueFull, "full").is_retryable());
        assert!(!PolicyError::Cancelled.is_retryable());
        assert!(!PolicyError::Timeout.is_retryable());
        assert!(!PolicyError::invalid_configuration("bad").is_retryable());
    }

    #[test]
    fn timeout_constructor_builds_the_unit_variant() {
        assert!(matches!(PolicyError::timeout(), PolicyError::Timeout));
        assert_eq!(PolicyError::timeout().to_string(), "operation timed out");
    }
}

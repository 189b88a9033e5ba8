//! End-to-end scenarios across the five components, exercised together the
//! way a caller actually wires them up: a bulkhead with its AIMD loop
//! running, a composite rate limiter under paired acquisition, and a
//! reloading handle swapped concurrently with readers in flight.

use resilience_core::{
    AdaptiveBulkhead, AimdOptions, BackoffKind, BulkheadOptions, CompositeRateLimiter,
    CompositeRateLimiterOptions, PolicyError, RejectionKind, ReloadingSlot, RetryOptions,
    RetryStateSnapshot, SlidingWindowOptions, TokenBucketOptions,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn bulkhead_options(
    initial_limit: u32,
    queue_depth: u32,
    aimd: AimdOptions,
) -> BulkheadOptions {
    BulkheadOptions {
        initial_limit,
        queue_depth,
        aimd,
    }
}

/// Scenario 1: bulkhead self-increase under good load.
#[tokio::test]
async fn bulkhead_self_increases_under_good_load() {
    let options = bulkhead_options(
        5,
        10,
        AimdOptions {
            min: 2,
            max: 20,
            latency_threshold_ms: 100,
            error_rate_threshold: 0.1,
            additive_increase: 2,
            multiplicative_decrease: 0.5,
            sampling_window_size: 100,
            min_samples: 3,
            adjustment_interval_ms: 100,
        },
    );
    let bulkhead = Arc::new(AdaptiveBulkhead::new("good-load", options).unwrap());
    let mut adjustments = bulkhead.on_parallelization_adjusted();
    let _loop_handle = bulkhead.spawn_adjustment_loop();

    for _ in 0..5 {
        bulkhead
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
            })
            .await
            .unwrap();
    }

    let adjustment = tokio::time::timeout(Duration::from_millis(500), adjustments.recv())
        .await
        .expect("expected an adjustment within 500ms")
        .unwrap();

    assert_eq!(adjustment.new_limit, 7);
    assert_eq!(bulkhead.current_max_parallelization(), 7);
}

/// Scenario 2 & 3: bulkhead self-decreases under latency, and never drops
/// below the configured minimum even under sustained bad load.
#[tokio::test]
async fn bulkhead_self_decreases_under_latency_and_clamps_to_min() {
    let options = bulkhead_options(
        10,
        10,
        AimdOptions {
            min: 3,
            max: 20,
            latency_threshold_ms: 50,
            error_rate_threshold: 0.1,
            additive_increase: 1,
            multiplicative_decrease: 0.5,
            sampling_window_size: 100,
            min_samples: 2,
            adjustment_interval_ms: 100,
        },
    );
    let bulkhead = Arc::new(AdaptiveBulkhead::new("bad-load", options).unwrap());
    let _loop_handle = bulkhead.spawn_adjustment_loop();

    for _ in 0..3 {
        bulkhead
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
            })
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(bulkhead.current_max_parallelization(), 5);

    // Keep feeding high latency; the limit must never drop below `min`.
    for _ in 0..20 {
        bulkhead
            .execute(|| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, Box<dyn std::error::Error + Send + Sync>>(())
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(bulkhead.current_max_parallelization() >= 3);
}

/// Scenario 4: queue rejection fires the callback exactly once while the
/// first, already-admitted call still completes successfully.
#[tokio::test]
async fn queue_rejection_fires_callback_once_while_first_call_completes() {
    let rejected_count = Arc::new(AtomicUsize::new(0));
    let rejected_count_clone = Arc::clone(&rejected_count);

    let options = bulkhead_options(1, 0, AimdOptions::default());
    let bulkhead = Arc::new(
        AdaptiveBulkhead::new("single-slot", options)
            .unwrap()
            .with_on_rejected(Arc::new(move || {
                rejected_count_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
    );

    let first = {
        let bulkhead = Arc::clone(&bulkhead);
        tokio::spawn(async move {
            bulkhead
                .execute(|| async {
                    tokio::time::sleep(Duration::from_millis(150)).await;
                    Ok::<_, Box<dyn std::error::Error + Send + Sync>>("first")
                })
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(30)).await;

    let second = bulkhead
        .execute(|| async { Ok::<_, Box<dyn std::error::Error + Send + Sync>>("second") })
        .await;

    assert!(matches!(
        second,
        Err(PolicyError::Rejected {
            kind: RejectionKind::BulkheadQueueFull,
            ..
        })
    ));
    assert_eq!(rejected_count.load(Ordering::SeqCst), 1);
    assert_eq!(first.await.unwrap().unwrap(), "first");
}

/// Scenario 5: a reloading handle survives concurrent writers and readers
/// without ever exposing a torn or default value.
#[tokio::test]
async fn retry_handle_reloads_atomically_under_concurrent_readers_and_writers() {
    let slot = Arc::new(ReloadingSlot::new(RetryStateSnapshot {
        max_attempts: 3,
        base_delay: Duration::from_secs(1),
        max_delay: None,
        backoff: BackoffKind::Exponential,
        use_jitter: true,
    }));

    let observed_unexpected = Arc::new(AtomicUsize::new(0));

    let writers: Vec<_> = (0..10)
        .map(|_| {
            let slot = Arc::clone(&slot);
            tokio::spawn(async move {
                let opts = RetryOptions {
                    max_attempts: 5,
                    base_delay_ms: 2000,
                    max_delay_ms: None,
                    backoff: BackoffKind::Exponential,
                    use_jitter: true,
                };
                slot.on_configuration_changed(&opts);
            })
        })
        .collect();

    let readers: Vec<_> = (0..10)
        .map(|_| {
            let slot = Arc::clone(&slot);
            let observed_unexpected = Arc::clone(&observed_unexpected);
            tokio::spawn(async move {
                for _ in 0..100 {
                    let value = slot.load();
                    let is_initial = value.max_attempts == 3;
                    let is_final = value.max_attempts == 5;
                    if !is_initial && !is_final {
                        observed_unexpected.fetch_add(1, Ordering::SeqCst);
                    }
                }
            })
        })
        .collect();

    for w in writers {
        w.await.unwrap();
    }
    for r in readers {
        r.await.unwrap();
    }

    assert_eq!(observed_unexpected.load(Ordering::SeqCst), 0);
    assert_eq!(slot.load().max_attempts, 5);
    assert_eq!(slot.load().base_delay, Duration::from_millis(2000));
}

/// Scenario 6: a composite rate limiter's paired acquire rolls back the
/// token bucket lease when the sliding window rejects.
#[tokio::test]
async fn composite_rate_limiter_rolls_back_token_bucket_on_sliding_window_rejection() {
    let options = CompositeRateLimiterOptions {
        token_bucket: TokenBucketOptions {
            token_limit: 5,
            tokens_per_period: 5,
            replenishment_period_ms: 1_000,
            auto_replenish: false,
        },
        sliding_window: SlidingWindowOptions {
            permit_limit: 0,
            window_ms: 1_000,
            segments_per_window: 10,
        },
        ..CompositeRateLimiterOptions::default()
    };
    let limiter = CompositeRateLimiter::new(options).unwrap();

    let available_before = limiter.available_tokens();
    let lease = limiter.acquire(1);
    assert!(!lease.acquired());
    assert_eq!(
        lease.rejection_kind(),
        Some(RejectionKind::SlidingWindowExhausted)
    );
    assert_eq!(limiter.available_tokens(), available_before);
}

/// A bulkhead and a composite rate limiter layered together the way a
/// caller would actually compose them: admission through the rate limiter
/// first, then through the bulkhead.
#[tokio::test]
async fn rate_limiter_and_bulkhead_compose_without_interfering() {
    let rate_limiter = CompositeRateLimiter::new(CompositeRateLimiterOptions {
        token_bucket: TokenBucketOptions {
            token_limit: 20,
            tokens_per_period: 20,
            replenishment_period_ms: 1_000,
            auto_replenish: false,
        },
        sliding_window: SlidingWindowOptions {
            permit_limit: 20,
            window_ms: 1_000,
            segments_per_window: 10,
        },
        ..CompositeRateLimiterOptions::default()
    })
    .unwrap();

    let bulkhead = AdaptiveBulkhead::new(
        "composed",
        bulkhead_options(4, 4, AimdOptions::default()),
    )
    .unwrap();

    let mut successes = 0;
    for _ in 0..10 {
        if rate_limiter.acquire(1).acquired() {
            let result = bulkhead
                .execute(|| async { Ok::<_, Box<dyn std::error::Error + Send + Sync>>(()) })
                .await;
            if result.is_ok() {
                successes += 1;
            }
        }
    }
    assert_eq!(successes, 10);
}

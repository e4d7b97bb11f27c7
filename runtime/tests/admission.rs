//! Integration tests for token bucket admission control
//!
//! Time-dependent cases run either on a `ManualClock` or on tokio's paused
//! clock, so none of them depend on wall-clock timing.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::float_cmp)] // Test code can use unwrap/expect/panic

use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::{assert_pending, assert_ready, assert_ready_err, task};
use toolgate_core::config::BucketConfig;
use toolgate_runtime::{AdmissionError, BucketRegistry, TokenBucket};
use toolgate_testing::{ManualClock, init_test_tracing};

// ============================================================================
// Test Fixtures
// ============================================================================

fn manual_bucket(config: BucketConfig) -> (TokenBucket, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let bucket = TokenBucket::with_clock(config, clock.clone()).unwrap();
    (bucket, clock)
}

fn empty_bucket(name: &str, refill_rate: f64) -> BucketConfig {
    BucketConfig::builder(name)
        .max_tokens(1.0)
        .refill_rate(refill_rate)
        .initial_tokens(0.0)
        .build()
}

// ============================================================================
// Non-blocking acquisition
// ============================================================================

#[test]
fn try_acquire_burst_then_refuses() {
    let (bucket, _clock) = manual_bucket(
        BucketConfig::builder("search")
            .max_tokens(2.0)
            .refill_rate(10.0)
            .initial_tokens(2.0)
            .build(),
    );

    let results: Vec<bool> = (0..3).map(|_| bucket.try_acquire(1)).collect();
    assert_eq!(results, vec![true, true, false]);
}

#[test]
fn try_acquire_recovers_after_refill() {
    let (bucket, clock) = manual_bucket(empty_bucket("search", 10.0));

    assert!(!bucket.try_acquire(1));
    clock.advance(Duration::from_millis(100));
    assert!(bucket.try_acquire(1));
    assert!(!bucket.try_acquire(1));
}

#[test]
fn granted_acquire_completes_on_first_poll() {
    let (bucket, _clock) = manual_bucket(BucketConfig::builder("search").max_tokens(3.0).build());

    let mut acquire = task::spawn(bucket.acquire(2));
    assert_ready!(acquire.poll()).unwrap();
    drop(acquire);

    assert_eq!(bucket.available_tokens(), 1.0);
}

#[test]
fn oversized_cost_fails_on_first_poll_whatever_the_policy() {
    for wait in [true, false] {
        let (bucket, _clock) = manual_bucket(
            BucketConfig::builder("search")
                .max_tokens(2.0)
                .wait_for_tokens(wait)
                .build(),
        );

        let mut acquire = task::spawn(bucket.acquire(3));
        let err = assert_ready_err!(acquire.poll());
        assert_eq!(
            err,
            AdmissionError::CostExceedsCapacity {
                resource: "search".to_string(),
                requested: 3,
                capacity: 2.0,
            }
        );
    }
}

#[test]
fn non_blocking_bucket_reports_insufficient_tokens() {
    let (bucket, _clock) = manual_bucket(
        BucketConfig::builder("browser")
            .max_tokens(5.0)
            .initial_tokens(1.5)
            .wait_for_tokens(false)
            .build(),
    );

    let mut acquire = task::spawn(bucket.acquire(2));
    match assert_ready_err!(acquire.poll()) {
        AdmissionError::InsufficientTokens {
            resource,
            requested,
            available,
        } => {
            assert_eq!(resource, "browser");
            assert_eq!(requested, 2);
            assert!((available - 1.5).abs() < 1e-9);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

// ============================================================================
// Waiting acquisition
// ============================================================================

#[tokio::test(start_paused = true)]
async fn acquire_waits_for_refill() {
    init_test_tracing();
    let bucket = TokenBucket::new(empty_bucket("search", 10.0)).unwrap();

    let start = Instant::now();
    bucket.acquire(1).await.unwrap();

    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(bucket.available_tokens() < 1e-6);
}

#[tokio::test(start_paused = true)]
async fn acquire_is_suspended_until_tokens_accrue() {
    let bucket = TokenBucket::new(empty_bucket("search", 10.0)).unwrap();

    let mut acquire = task::spawn(bucket.acquire(1));
    assert_pending!(acquire.poll());

    tokio::time::advance(Duration::from_millis(100)).await;
    assert!(acquire.is_woken());
    assert_ready!(acquire.poll()).unwrap();
}

#[tokio::test(start_paused = true)]
async fn acquire_refuses_waits_beyond_the_bound() {
    let bucket = TokenBucket::new(
        BucketConfig::builder("search")
            .max_tokens(1.0)
            .refill_rate(1.0)
            .initial_tokens(0.0)
            .max_wait(Duration::from_millis(100))
            .build(),
    )
    .unwrap();

    let start = Instant::now();
    let err = bucket.acquire(1).await.unwrap_err();

    assert_eq!(start.elapsed(), Duration::ZERO, "must not wait 1000ms");
    assert_eq!(
        err,
        AdmissionError::WaitTimeout {
            resource: "search".to_string(),
            requested: 1,
            required_wait_ms: 1000,
            waited_ms: 0,
            max_wait_ms: 100,
        }
    );
    assert!(err.is_retry_later());
}

#[tokio::test(start_paused = true)]
async fn concurrent_waiters_do_not_share_tokens() {
    let bucket = TokenBucket::new(
        BucketConfig::builder("search")
            .max_tokens(1.0)
            .refill_rate(10.0)
            .initial_tokens(0.0)
            .max_wait(Duration::from_secs(1))
            .build(),
    )
    .unwrap();

    // Both compute a 100ms wait; only one token accrues in that time.
    let (first, second) = tokio::join!(bucket.acquire(1), bucket.acquire(1));

    let granted = [first.is_ok(), second.is_ok()];
    assert_eq!(granted.iter().filter(|ok| **ok).count(), 1);
    let refused = first.err().or(second.err()).unwrap();
    assert!(matches!(refused, AdmissionError::WaitTimeout { waited_ms: 100, .. }));
}

#[tokio::test(start_paused = true)]
async fn smaller_later_caller_can_overtake_larger_waiter() {
    let bucket = TokenBucket::new(
        BucketConfig::builder("search")
            .max_tokens(3.0)
            .refill_rate(10.0)
            .initial_tokens(0.0)
            .build(),
    )
    .unwrap();

    // The large caller arrives first and needs 300ms of refill. The small one
    // only needs 100ms and spends a token the large caller was counting on.
    let (large, small) = tokio::join!(bucket.acquire(3), bucket.acquire(1));

    assert!(small.is_ok());
    assert!(matches!(large, Err(AdmissionError::WaitTimeout { requested: 3, .. })));
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_try_acquire_never_double_spends() {
    let bucket = Arc::new(
        TokenBucket::new(
            BucketConfig::builder("search")
                .max_tokens(10.0)
                .refill_rate(0.001)
                .build(),
        )
        .unwrap(),
    );

    let handles: Vec<_> = (0..64)
        .map(|_| {
            let bucket = Arc::clone(&bucket);
            tokio::spawn(async move { bucket.try_acquire(1) })
        })
        .collect();

    let results = futures::future::join_all(handles).await;
    let granted = results.into_iter().filter(|r| *r.as_ref().unwrap()).count();
    assert_eq!(granted, 10);
}

// ============================================================================
// Registry
// ============================================================================

#[tokio::test]
async fn registry_routes_by_resource_name() {
    let registry = BucketRegistry::new(
        BucketConfig::builder("defaults")
            .max_tokens(1.0)
            .refill_rate(0.001)
            .wait_for_tokens(false)
            .build(),
    )
    .unwrap();

    registry.acquire("search", 1).await.unwrap();
    registry.acquire("browser", 1).await.unwrap();

    let err = registry.acquire("search", 1).await.unwrap_err();
    assert_eq!(err.resource(), "search");
    assert!(!registry.try_acquire("browser", 1));
    assert_eq!(registry.resources(), vec!["browser", "search"]);
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn refill_matches_closed_form(
        capacity in 1.0f64..100.0,
        fill in 0.0f64..=1.0,
        rate in 0.01f64..50.0,
        elapsed_ms in 0u64..120_000,
    ) {
        let initial = capacity * fill;
        let (bucket, clock) = manual_bucket(
            BucketConfig::builder("prop")
                .max_tokens(capacity)
                .refill_rate(rate)
                .initial_tokens(initial)
                .build(),
        );

        clock.advance(Duration::from_millis(elapsed_ms));
        #[allow(clippy::cast_precision_loss)]
        let expected = (initial + elapsed_ms as f64 / 1000.0 * rate).min(capacity);
        let available = bucket.available_tokens();

        prop_assert!((available - expected).abs() < 1e-6);
        prop_assert!(available <= capacity);
        prop_assert_eq!(bucket.available_tokens(), available);
    }

    #[test]
    fn try_acquire_never_overdraws(costs in proptest::collection::vec(0u32..5, 1..40)) {
        let (bucket, _clock) = manual_bucket(BucketConfig::builder("prop").max_tokens(10.0).build());

        let mut spent = 0u32;
        for cost in costs {
            if bucket.try_acquire(cost) {
                spent += cost;
            }
        }

        prop_assert!(spent <= 10);
        prop_assert!((bucket.available_tokens() - f64::from(10 - spent)).abs() < 1e-9);
    }
}

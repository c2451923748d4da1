use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use fleet_backup::remote::RemoteError;
use fleet_backup::retry::{retry, ErrorCode, RetryCoordinator, RetryPolicy};
use proptest::prelude::*;
use tokio::time::Instant;

fn fast_connection_policy() -> RetryPolicy {
    RetryPolicy::connection()
        .with_max_retries(3)
        .with_initial_delay(Duration::from_millis(100))
        .with_backoff_multiplier(2.0)
        .with_jitter(false)
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_recover_after_backoff() {
    let attempts = AtomicU32::new(0);
    let coordinator = RetryCoordinator::new("connect", fast_connection_policy());
    let started = Instant::now();

    let result = coordinator
        .execute_with_attempts(|| async {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt < 3 {
                Err(RemoteError::new(ErrorCode::ConnectionReset, "read ECONNRESET"))
            } else {
                Ok("connected")
            }
        })
        .await
        .unwrap();

    assert_eq!(result.value, "connected");
    assert_eq!(result.attempt, 3);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    // 100ms after the first failure, 200ms after the second
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(350), "elapsed {:?}", elapsed);
}

#[tokio::test(start_paused = true)]
async fn test_exhaustion_returns_last_error() {
    let attempts = AtomicU32::new(0);
    let policy = fast_connection_policy().with_max_retries(2);

    let err = retry("connect", &policy, || async {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        Err::<(), _>(RemoteError::new(
            ErrorCode::TimedOut,
            format!("handshake timed out (attempt {})", attempt),
        ))
    })
    .await
    .unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(err.message, "handshake timed out (attempt 3)");
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_error_fails_immediately() {
    let attempts = AtomicU32::new(0);
    let started = Instant::now();

    let err = retry("connect", &fast_connection_policy(), || async {
        attempts.fetch_add(1, Ordering::SeqCst);
        Err::<(), _>(RemoteError::from_message("Authentication failed for svc-backup"))
    })
    .await
    .unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(err.to_string(), "Authentication failed for svc-backup");
}

#[tokio::test(start_paused = true)]
async fn test_message_markers_are_retried_without_code() {
    let attempts = AtomicU32::new(0);

    let value = retry("connect", &fast_connection_policy(), || async {
        if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(RemoteError::from_message("Socket hang up while reading banner"))
        } else {
            Ok(42)
        }
    })
    .await
    .unwrap();

    assert_eq!(value, 42);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[test]
fn test_whole_backup_preset_is_narrower() {
    let connection = RetryPolicy::connection();
    let backup = RetryPolicy::whole_backup();
    let refused = RemoteError::new(ErrorCode::ConnectionRefused, "connect ECONNREFUSED");

    assert!(connection.is_retryable(&refused));
    assert!(!backup.is_retryable(&refused));
    assert!(backup.max_retries < connection.max_retries);
    assert!(backup.initial_delay > connection.initial_delay);
}

proptest! {
    #[test]
    fn prop_delays_grow_and_stay_capped(
        initial_ms in 1u64..5_000,
        multiplier in 1.0f64..4.0,
        max_ms in 1u64..60_000,
        attempt in 1u32..20,
    ) {
        let policy = RetryPolicy::connection()
            .with_initial_delay(Duration::from_millis(initial_ms))
            .with_backoff_multiplier(multiplier)
            .with_max_delay(Duration::from_millis(max_ms));

        let current = policy.delay_for_attempt(attempt);
        let next = policy.delay_for_attempt(attempt + 1);
        prop_assert!(current <= Duration::from_millis(max_ms));
        prop_assert!(next >= current);
    }
}

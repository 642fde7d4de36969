//! End-to-end middleware scenarios: retry accounting, timeout racing,
//! hedging races, and a composed pipeline around a flaky backend with a
//! persistent circuit breaker.

use keystone::adapter::MemoryCircuitBreakerStore;
use keystone::breaker::{CircuitBreaker, CircuitOpenError, ConsecutivePolicy};
use keystone::core::{Backoff, Namespace, TimeSpan};
use keystone::resilience::{
    AsyncError, ConcurrentHedging, ErrorPolicy, Fallback, Hooks, NamedOperation, Retry, Timeout,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("backend down")]
struct BackendDown;

#[tokio::test]
async fn retry_calls_the_operation_exactly_max_attempts_times() {
    let calls = Arc::new(AtomicU32::new(0));
    let counted = Arc::clone(&calls);

    let hooks = Hooks::new(move |_| {
        let calls = Arc::clone(&counted);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(AsyncError::application(BackendDown))
        }
    })
    .pipe(Retry::new(4).backoff(Backoff::constant(TimeSpan::ZERO)));

    let error = hooks.invoke().await.unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    match error {
        AsyncError::RetryExhausted { attempts, cause } => {
            assert_eq!(attempts, 4);
            assert!(cause.is::<BackendDown>());
        }
        other => panic!("unexpected terminal error: {other:?}"),
    }
}

#[tokio::test]
async fn timeout_scenario() {
    // A 50 ms operation against a 25 ms deadline times out...
    let hooks = Hooks::new(|_| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok("value")
    })
    .pipe(Timeout::new(TimeSpan::from_millis(25)));
    assert!(matches!(
        hooks.invoke().await.unwrap_err(),
        AsyncError::Timeout { .. }
    ));

    // ...and passes through against a 100 ms deadline.
    let hooks = Hooks::new(|_| async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok("value")
    })
    .pipe(Timeout::new(TimeSpan::from_millis(100)));
    assert_eq!(hooks.invoke().await.unwrap(), "value");
}

#[tokio::test]
async fn concurrent_hedging_takes_the_faster_candidate() {
    // Primary resolves "P" after 20 ms; the fallback resolves "F"
    // after 10 ms and must win the race.
    let hooks = Hooks::new(|_| async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok("P")
    })
    .pipe(
        ConcurrentHedging::new(TimeSpan::from_millis(200)).fallback(NamedOperation::new(
            "replica",
            |_| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok("F")
            },
        )),
    );

    assert_eq!(hooks.invoke().await.unwrap(), "F");
}

#[tokio::test]
async fn retry_around_timeout_recovers_a_slow_first_attempt() {
    // First attempt is slow and times out; the second is fast.
    let calls = Arc::new(AtomicU32::new(0));
    let counted = Arc::clone(&calls);

    let hooks = Hooks::new(move |_| {
        let calls = Arc::clone(&counted);
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Ok("recovered")
        }
    })
    .pipe(Retry::new(3).backoff(Backoff::constant(TimeSpan::ZERO)))
    .pipe(Timeout::new(TimeSpan::from_millis(40)));

    assert_eq!(hooks.invoke().await.unwrap(), "recovered");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn breaker_short_circuit_is_absorbed_by_fallback() {
    let store = Arc::new(MemoryCircuitBreakerStore::new());
    let key = Namespace::new("resilience/breaker").key("payments");
    let breaker = CircuitBreaker::new(key, ConsecutivePolicy::new(2, 1), store)
        .open_backoff(Backoff::constant(TimeSpan::from_secs(60)));

    let calls = Arc::new(AtomicU32::new(0));
    let counted = Arc::clone(&calls);

    let hooks = Hooks::new(move |_| {
        let calls = Arc::clone(&counted);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<&str, _>(AsyncError::application(BackendDown))
        }
    })
    .pipe(Fallback::value("cached answer"))
    .pipe(breaker);

    // Two failures open the circuit; the fallback hides both.
    assert_eq!(hooks.invoke().await.unwrap(), "cached answer");
    assert_eq!(hooks.invoke().await.unwrap(), "cached answer");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // The third call is short-circuited before the operation runs,
    // still yielding the fallback value.
    assert_eq!(hooks.invoke().await.unwrap(), "cached answer");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn breaker_open_error_is_matchable_by_policy() {
    let store = Arc::new(MemoryCircuitBreakerStore::new());
    let key = Namespace::new("resilience/breaker").key("reports");
    let breaker = CircuitBreaker::new(key, ConsecutivePolicy::new(1, 1), store)
        .open_backoff(Backoff::constant(TimeSpan::from_secs(60)));

    let hooks = Hooks::new(|_| async { Err::<(), _>(AsyncError::application(BackendDown)) })
        .pipe(breaker);

    let _ = hooks.invoke().await;
    let error = hooks.invoke().await.unwrap_err();
    assert!(error.is::<CircuitOpenError>());
    assert!(ErrorPolicy::of::<CircuitOpenError>().matches(&error));
}

#[tokio::test]
async fn sequential_pipeline_reports_all_hedging_errors() {
    use keystone::resilience::SequentialHedging;

    let hooks = Hooks::new(|_| async { Err::<(), _>(AsyncError::application(BackendDown)) }).pipe(
        SequentialHedging::new(TimeSpan::from_millis(100))
            .fallback(NamedOperation::new("first", |_| async {
                Err::<(), _>(AsyncError::message("first replica down"))
            }))
            .fallback(NamedOperation::new("second", |_| async {
                Err::<(), _>(AsyncError::message("second replica down"))
            })),
    );

    match hooks.invoke().await.unwrap_err() {
        AsyncError::Hedging { errors } => assert_eq!(errors.len(), 3),
        other => panic!("unexpected error: {other:?}"),
    }
}

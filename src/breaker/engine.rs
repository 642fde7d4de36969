//! Circuit-breaker engine
//!
//! The engine is a pipeline middleware: admission is decided before the
//! call against persisted state, outcomes are accounted after it, and
//! every state transition goes through the store's atomic update so
//! concurrent callers and sibling processes agree on one state.

use crate::adapter::{AdapterResult, CircuitBreakerStore};
use crate::breaker::policy::{CircuitBreakerPolicy, ClosedDecision, HalfOpenDecision};
use crate::breaker::{BreakerState, CircuitIsolatedError, CircuitOpenError};
use crate::core::{Backoff, Key, TimeSpan};
use crate::resilience::hooks::{Invocation, Middleware, Next};
use crate::resilience::{AsyncError, ErrorPolicy};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

/// A persistent circuit breaker scoped to one key.
///
/// Short-circuited calls fail with [`CircuitOpenError`] or
/// [`CircuitIsolatedError`] carried as application errors, so callers
/// can match them with [`ErrorPolicy::of`].
pub struct CircuitBreaker<P>
where
    P: CircuitBreakerPolicy,
{
    key: Key,
    policy: Arc<P>,
    store: Arc<dyn CircuitBreakerStore<P::Metrics>>,
    open_backoff: Backoff,
    error_policy: ErrorPolicy,
}

impl<P> CircuitBreaker<P>
where
    P: CircuitBreakerPolicy,
{
    /// Create a breaker over `key` persisting through `store`.
    ///
    /// The default open backoff holds the circuit open 30 seconds per
    /// attempt.
    pub fn new(key: Key, policy: P, store: Arc<dyn CircuitBreakerStore<P::Metrics>>) -> Self {
        Self {
            key,
            policy: Arc::new(policy),
            store,
            open_backoff: Backoff::constant(TimeSpan::from_secs(30)),
            error_policy: ErrorPolicy::all(),
        }
    }

    /// How long an opened circuit rejects calls, by open attempt.
    pub fn open_backoff(mut self, backoff: Backoff) -> Self {
        self.open_backoff = backoff;
        self
    }

    /// Restrict which errors count as failures; non-matching errors are
    /// accounted as successes, cancellations are not accounted at all.
    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// The current persisted state, materialized as closed when the key
    /// has never been written.
    pub async fn state(&self) -> AdapterResult<BreakerState<P::Metrics>> {
        Ok(self.store.load(&self.key).await?.unwrap_or_else(|| {
            BreakerState::Closed {
                metrics: self.policy.initial_metrics(),
            }
        }))
    }

    /// Administratively force the circuit open until [`Self::reset`].
    pub async fn isolate(&self) -> AdapterResult<()> {
        self.store
            .atomic_update(&self.key, &|_| (BreakerState::Isolated, true))
            .await?;
        Ok(())
    }

    /// Administratively return the circuit to a fresh closed state.
    pub async fn reset(&self) -> AdapterResult<()> {
        let policy = Arc::clone(&self.policy);
        self.store
            .atomic_update(&self.key, &move |_| {
                (
                    BreakerState::Closed {
                        metrics: policy.initial_metrics(),
                    },
                    true,
                )
            })
            .await?;
        Ok(())
    }

    async fn admit(&self) -> Result<(), AsyncError> {
        let now = Utc::now();
        let policy = Arc::clone(&self.policy);
        let backoff = self.open_backoff.clone();

        let state = self
            .store
            .atomic_update(&self.key, &move |state| {
                let state = state.unwrap_or_else(|| BreakerState::Closed {
                    metrics: policy.initial_metrics(),
                });
                match state {
                    BreakerState::Closed { ref metrics } => {
                        match policy.when_closed(metrics, now) {
                            ClosedDecision::ToOpen => (
                                BreakerState::Open {
                                    attempt: 1,
                                    opened_at: now,
                                },
                                true,
                            ),
                            ClosedDecision::Stay => (state, false),
                        }
                    }
                    BreakerState::Open { attempt, opened_at } => {
                        let half_open_at = backoff.delay(attempt).to_end_date(opened_at);
                        if now >= half_open_at {
                            (
                                BreakerState::HalfOpen {
                                    attempt,
                                    metrics: policy.initial_metrics(),
                                },
                                true,
                            )
                        } else {
                            (state, false)
                        }
                    }
                    BreakerState::HalfOpen { .. } | BreakerState::Isolated => (state, false),
                }
            })
            .await
            .map_err(AsyncError::application)?;

        match state {
            BreakerState::Closed { .. } | BreakerState::HalfOpen { .. } => Ok(()),
            BreakerState::Open { .. } => Err(AsyncError::application(CircuitOpenError {
                key: self.key.namespaced(),
            })),
            BreakerState::Isolated => Err(AsyncError::application(CircuitIsolatedError {
                key: self.key.namespaced(),
            })),
        }
    }

    async fn account(&self, success: bool) -> Result<(), AsyncError> {
        let now = Utc::now();
        let policy = Arc::clone(&self.policy);

        self.store
            .atomic_update(&self.key, &move |state| {
                let state = state.unwrap_or_else(|| BreakerState::Closed {
                    metrics: policy.initial_metrics(),
                });
                match state {
                    BreakerState::Closed { ref metrics } => {
                        let next = if success {
                            policy.track_success(&state, now)
                        } else {
                            policy.track_failure(&state, now)
                        };
                        if !success {
                            if let ClosedDecision::ToOpen = policy.when_closed(&next, now) {
                                return (
                                    BreakerState::Open {
                                        attempt: 1,
                                        opened_at: now,
                                    },
                                    true,
                                );
                            }
                        }
                        let changed = !policy.is_equal(metrics, &next);
                        (BreakerState::Closed { metrics: next }, changed)
                    }
                    BreakerState::HalfOpen {
                        attempt,
                        ref metrics,
                    } => {
                        let next = if success {
                            policy.track_success(&state, now)
                        } else {
                            policy.track_failure(&state, now)
                        };
                        match policy.when_half_open(&next, now) {
                            HalfOpenDecision::ToOpen => (
                                BreakerState::Open {
                                    attempt: attempt + 1,
                                    opened_at: now,
                                },
                                true,
                            ),
                            HalfOpenDecision::ToClosed => (
                                BreakerState::Closed {
                                    metrics: policy.initial_metrics(),
                                },
                                true,
                            ),
                            HalfOpenDecision::Stay => {
                                let changed = !policy.is_equal(metrics, &next);
                                (
                                    BreakerState::HalfOpen {
                                        attempt,
                                        metrics: next,
                                    },
                                    changed,
                                )
                            }
                        }
                    }
                    // Opened or isolated concurrently; nothing to account.
                    other => (other, false),
                }
            })
            .await
            .map_err(AsyncError::application)?;
        Ok(())
    }
}

#[async_trait]
impl<P, T> Middleware<T> for CircuitBreaker<P>
where
    P: CircuitBreakerPolicy,
    T: Send + 'static,
{
    async fn handle(&self, inv: &Invocation, next: Next<'_, T>) -> Result<T, AsyncError> {
        self.admit().await?;

        let result = next.run(inv).await;

        let accounted = match &result {
            Ok(_) => Some(true),
            Err(error) if error.is_aborted() => None,
            // Errors outside the policy do not count against the circuit.
            Err(error) => Some(!self.error_policy.matches(error)),
        };
        if let Some(success) = accounted {
            self.account(success).await?;
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryCircuitBreakerStore;
    use crate::breaker::policy::ConsecutivePolicy;
    use crate::core::Namespace;
    use crate::resilience::Hooks;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn breaker(
        failure_threshold: u32,
        open_for: TimeSpan,
    ) -> (CircuitBreaker<ConsecutivePolicy>, Key) {
        let key = Namespace::new("test/breaker").key("service");
        let store = Arc::new(MemoryCircuitBreakerStore::new());
        let breaker = CircuitBreaker::new(
            key.clone(),
            ConsecutivePolicy::new(failure_threshold, 1),
            store,
        )
        .open_backoff(Backoff::constant(open_for));
        (breaker, key)
    }

    fn flaky_hooks(
        breaker: CircuitBreaker<ConsecutivePolicy>,
        should_fail: Arc<AtomicBool>,
        calls: Arc<AtomicU32>,
    ) -> Hooks<&'static str> {
        Hooks::new(move |_| {
            let should_fail = Arc::clone(&should_fail);
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if should_fail.load(Ordering::SeqCst) {
                    Err(AsyncError::message("backend down"))
                } else {
                    Ok("ok")
                }
            }
        })
        .pipe(breaker)
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_short_circuits() {
        let (breaker, _) = breaker(3, TimeSpan::from_secs(60));
        let should_fail = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(AtomicU32::new(0));
        let hooks = flaky_hooks(breaker, Arc::clone(&should_fail), Arc::clone(&calls));

        for _ in 0..3 {
            let _ = hooks.invoke().await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // The fourth call is rejected without reaching the operation.
        let error = hooks.invoke().await.unwrap_err();
        assert!(error.is::<CircuitOpenError>());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_half_open_probe_recovers() {
        let (breaker, _) = breaker(1, TimeSpan::from_millis(20));
        let should_fail = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(AtomicU32::new(0));
        let hooks = flaky_hooks(breaker, Arc::clone(&should_fail), Arc::clone(&calls));

        let _ = hooks.invoke().await;
        assert!(hooks.invoke().await.unwrap_err().is::<CircuitOpenError>());

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        should_fail.store(false, Ordering::SeqCst);

        // The probe executes and closes the circuit again.
        assert_eq!(hooks.invoke().await.unwrap(), "ok");
        assert_eq!(hooks.invoke().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_half_open_relapse_increments_attempt() {
        let (breaker, key) = breaker(1, TimeSpan::from_millis(20));
        let store = Arc::clone(&breaker.store);
        let should_fail = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(AtomicU32::new(0));
        let hooks = flaky_hooks(breaker, Arc::clone(&should_fail), calls);

        let _ = hooks.invoke().await;
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        // The probe fails too.
        let _ = hooks.invoke().await;

        let state = store.load(&key).await.unwrap().unwrap();
        match state {
            BreakerState::Open { attempt, .. } => assert_eq!(attempt, 2),
            other => panic!("expected Open, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_isolation_rejects_until_reset() {
        let (breaker, _) = breaker(3, TimeSpan::from_secs(60));
        breaker.isolate().await.unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let should_fail = Arc::new(AtomicBool::new(false));
        let isolated = {
            let state = breaker.state().await.unwrap();
            matches!(state, BreakerState::Isolated)
        };
        assert!(isolated);

        breaker.reset().await.unwrap();
        let hooks = flaky_hooks(breaker, should_fail, Arc::clone(&calls));
        assert_eq!(hooks.invoke().await.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_isolated_breaker_short_circuits() {
        let (breaker, _) = breaker(3, TimeSpan::from_secs(60));
        breaker.isolate().await.unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let hooks = flaky_hooks(breaker, Arc::new(AtomicBool::new(false)), Arc::clone(&calls));

        let error = hooks.invoke().await.unwrap_err();
        assert!(error.is::<CircuitIsolatedError>());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}

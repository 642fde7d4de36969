//! Retry middleware

use crate::core::{Backoff, TimeSpan};
use crate::resilience::hooks::{Invocation, Middleware, Next};
use crate::resilience::{AsyncError, ErrorPolicy};
use async_trait::async_trait;
use std::sync::Arc;

/// Re-executes the rest of the chain until it succeeds, the error stops
/// matching the policy, or `max_attempts` is reached.
///
/// The backoff sleep between attempts is cancellable; a cancelled
/// invocation returns [`AsyncError::Aborted`] without another attempt.
pub struct Retry<T> {
    max_attempts: u32,
    backoff: Backoff,
    error_policy: ErrorPolicy,
    retry_when: Option<Arc<dyn Fn(&T) -> bool + Send + Sync>>,
    on_attempt: Option<Arc<dyn Fn(u32) + Send + Sync>>,
    on_retry_delay: Option<Arc<dyn Fn(u32, TimeSpan) + Send + Sync>>,
}

impl<T> Retry<T> {
    /// Create a retry middleware with `max_attempts` total attempts.
    ///
    /// # Panics
    ///
    /// Panics when `max_attempts` is zero; a retry that never runs its
    /// operation is a configuration error.
    pub fn new(max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "retry requires at least one attempt");
        Self {
            max_attempts,
            backoff: Backoff::default(),
            error_policy: ErrorPolicy::all(),
            retry_when: None,
            on_attempt: None,
            on_retry_delay: None,
        }
    }

    /// Use an explicit backoff schedule.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Restrict which errors are retried.
    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Treat successful values for which `predicate` returns `true` as
    /// retryable failures.
    pub fn retry_when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.retry_when = Some(Arc::new(predicate));
        self
    }

    /// Observe each execution attempt (1-based).
    pub fn on_attempt<F>(mut self, callback: F) -> Self
    where
        F: Fn(u32) + Send + Sync + 'static,
    {
        self.on_attempt = Some(Arc::new(callback));
        self
    }

    /// Observe each backoff delay before it is slept.
    pub fn on_retry_delay<F>(mut self, callback: F) -> Self
    where
        F: Fn(u32, TimeSpan) + Send + Sync + 'static,
    {
        self.on_retry_delay = Some(Arc::new(callback));
        self
    }
}

#[async_trait]
impl<T> Middleware<T> for Retry<T>
where
    T: Send + 'static,
{
    async fn handle(&self, inv: &Invocation, next: Next<'_, T>) -> Result<T, AsyncError> {
        let mut last_error: Option<AsyncError> = None;

        for attempt in 1..=self.max_attempts {
            if let Some(reason) = inv.signal().reason() {
                return Err(AsyncError::Aborted { reason });
            }
            if let Some(callback) = &self.on_attempt {
                callback(attempt);
            }

            match next.run(inv).await {
                Ok(value) => match &self.retry_when {
                    Some(predicate) if predicate(&value) => {
                        last_error = Some(AsyncError::message("operation returned a retryable value"));
                    }
                    _ => return Ok(value),
                },
                Err(error) => {
                    if !self.error_policy.matches(&error) {
                        return Err(error);
                    }
                    last_error = Some(error);
                }
            }

            if attempt < self.max_attempts {
                let delay = self.backoff.delay(attempt);
                if let Some(callback) = &self.on_retry_delay {
                    callback(attempt, delay);
                }
                tokio::select! {
                    reason = inv.signal().aborted() => {
                        return Err(AsyncError::Aborted { reason });
                    }
                    _ = tokio::time::sleep(delay.to_duration_clamped()) => {}
                }
            }
        }

        Err(AsyncError::RetryExhausted {
            attempts: self.max_attempts,
            cause: Box::new(
                last_error.unwrap_or_else(|| AsyncError::message("no attempt was recorded")),
            ),
        })
    }
}

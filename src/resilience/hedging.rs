//! Hedging middleware
//!
//! Issues redundant calls to fallback operations and takes the first
//! success. The sequential variant walks the candidates in order; the
//! concurrent variant races all of them inside one shared abort scope.

use crate::core::{AbortReason, TimeSpan};
use crate::resilience::hooks::{Invocation, Middleware, Next, OperationFn};
use crate::resilience::timeout::Timeout;
use crate::resilience::{AsyncError, ErrorPolicy};
use async_trait::async_trait;
use futures::future::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;
use std::sync::Arc;

/// Display name of the wrapped chain in callbacks and failure lists.
pub const PRIMARY_NAME: &str = "primary";

/// A fallback operation with a display name.
pub struct NamedOperation<T> {
    name: String,
    operation: OperationFn<T>,
}

impl<T> NamedOperation<T>
where
    T: Send + 'static,
{
    /// Wrap an async operation under `name`.
    pub fn new<F, Fut>(name: impl Into<String>, operation: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, AsyncError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            operation: Arc::new(move |inv| Box::pin(operation(inv))),
        }
    }

    /// The candidate's display name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Clone for NamedOperation<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            operation: Arc::clone(&self.operation),
        }
    }
}

enum CandidateTarget<'a, T> {
    Primary(Next<'a, T>),
    Fallback(&'a OperationFn<T>),
}

/// Run one candidate wrapped in the per-candidate deadline plus the
/// shared middleware stack.
async fn run_candidate<T>(
    inv: &Invocation,
    wait: TimeSpan,
    shared: &[Arc<dyn Middleware<T>>],
    target: CandidateTarget<'_, T>,
) -> Result<T, AsyncError>
where
    T: Send + 'static,
{
    let mut chain: Vec<Arc<dyn Middleware<T>>> = Vec::with_capacity(shared.len() + 1);
    chain.push(Arc::new(Timeout::new(wait)));
    chain.extend(shared.iter().cloned());

    match target {
        CandidateTarget::Primary(next) => {
            let inner = next;
            Next::nested(&chain, &inner).run(inv).await
        }
        CandidateTarget::Fallback(operation) => Next::new(&chain, operation).run(inv).await,
    }
}

macro_rules! hedging_options {
    ($name:ident) => {
        impl<T> $name<T>
        where
            T: Send + 'static,
        {
            /// Create a hedging middleware with a per-candidate deadline.
            pub fn new(wait: TimeSpan) -> Self {
                Self {
                    fallbacks: Vec::new(),
                    wait,
                    middlewares: Vec::new(),
                    error_policy: ErrorPolicy::all(),
                    on_hedging_attempt: None,
                    on_hedging_error: None,
                }
            }

            /// Add a named fallback operation.
            pub fn fallback(mut self, fallback: NamedOperation<T>) -> Self {
                self.fallbacks.push(fallback);
                self
            }

            /// Wrap every candidate (primary included) with an extra
            /// middleware, inside the per-candidate deadline.
            pub fn middleware<M>(mut self, middleware: M) -> Self
            where
                M: Middleware<T> + 'static,
            {
                self.middlewares.push(Arc::new(middleware));
                self
            }

            /// Restrict which primary errors trigger hedging.
            pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
                self.error_policy = policy;
                self
            }

            /// Observe each candidate as it is attempted.
            pub fn on_hedging_attempt<F>(mut self, callback: F) -> Self
            where
                F: Fn(&str) + Send + Sync + 'static,
            {
                self.on_hedging_attempt = Some(Arc::new(callback));
                self
            }

            /// Observe each candidate failure.
            pub fn on_hedging_error<F>(mut self, callback: F) -> Self
            where
                F: Fn(&str, &AsyncError) + Send + Sync + 'static,
            {
                self.on_hedging_error = Some(Arc::new(callback));
                self
            }

            fn notify_attempt(&self, name: &str) {
                if let Some(callback) = &self.on_hedging_attempt {
                    callback(name);
                }
            }

            fn notify_error(&self, name: &str, error: &AsyncError) {
                if let Some(callback) = &self.on_hedging_error {
                    callback(name, error);
                }
            }
        }
    };
}

/// Tries the primary, then each fallback in order, each under the
/// per-candidate deadline. Returns the first success; when every
/// candidate fails, returns [`AsyncError::Hedging`] carrying all
/// failures.
pub struct SequentialHedging<T> {
    fallbacks: Vec<NamedOperation<T>>,
    wait: TimeSpan,
    middlewares: Vec<Arc<dyn Middleware<T>>>,
    error_policy: ErrorPolicy,
    on_hedging_attempt: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    on_hedging_error: Option<Arc<dyn Fn(&str, &AsyncError) + Send + Sync>>,
}

hedging_options!(SequentialHedging);

#[async_trait]
impl<T> Middleware<T> for SequentialHedging<T>
where
    T: Send + 'static,
{
    async fn handle(&self, inv: &Invocation, next: Next<'_, T>) -> Result<T, AsyncError> {
        let mut errors = Vec::with_capacity(self.fallbacks.len() + 1);

        self.notify_attempt(PRIMARY_NAME);
        match run_candidate(inv, self.wait, &self.middlewares, CandidateTarget::Primary(next))
            .await
        {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !self.error_policy.matches(&error) {
                    return Err(error);
                }
                self.notify_error(PRIMARY_NAME, &error);
                errors.push(error);
            }
        }

        for fallback in &self.fallbacks {
            if let Some(reason) = inv.signal().reason() {
                return Err(AsyncError::Aborted { reason });
            }

            self.notify_attempt(fallback.name());
            match run_candidate(
                inv,
                self.wait,
                &self.middlewares,
                CandidateTarget::Fallback(&fallback.operation),
            )
            .await
            {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if error.is_aborted() {
                        return Err(error);
                    }
                    self.notify_error(fallback.name(), &error);
                    errors.push(error);
                }
            }
        }

        Err(AsyncError::Hedging { errors })
    }
}

/// Launches the primary and every fallback simultaneously, each in its
/// own child scope under the per-candidate deadline. The first success
/// wins and aborts its peers with [`AbortReason::Resolved`]; that
/// sentinel is excluded from the failure list.
pub struct ConcurrentHedging<T> {
    fallbacks: Vec<NamedOperation<T>>,
    wait: TimeSpan,
    middlewares: Vec<Arc<dyn Middleware<T>>>,
    error_policy: ErrorPolicy,
    on_hedging_attempt: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    on_hedging_error: Option<Arc<dyn Fn(&str, &AsyncError) + Send + Sync>>,
}

hedging_options!(ConcurrentHedging);

#[async_trait]
impl<T> Middleware<T> for ConcurrentHedging<T>
where
    T: Send + 'static,
{
    async fn handle(&self, inv: &Invocation, next: Next<'_, T>) -> Result<T, AsyncError> {
        let mut names = Vec::with_capacity(self.fallbacks.len() + 1);
        names.push(PRIMARY_NAME.to_string());
        names.extend(self.fallbacks.iter().map(|f| f.name.clone()));

        let scopes: Vec<Invocation> = (0..names.len()).map(|_| inv.child()).collect();
        for name in &names {
            self.notify_attempt(name);
        }

        let scopes_ref = &scopes;
        let middlewares = &self.middlewares;
        let wait = self.wait;

        let mut candidates = FuturesUnordered::new();
        candidates.push(
            async move {
                let result = run_candidate(
                    &scopes_ref[0],
                    wait,
                    middlewares,
                    CandidateTarget::Primary(next),
                )
                .await;
                (0usize, result)
            }
            .boxed(),
        );
        for (offset, fallback) in self.fallbacks.iter().enumerate() {
            let index = offset + 1;
            candidates.push(
                async move {
                    let result = run_candidate(
                        &scopes_ref[index],
                        wait,
                        middlewares,
                        CandidateTarget::Fallback(&fallback.operation),
                    )
                    .await;
                    (index, result)
                }
                .boxed(),
            );
        }

        let mut errors = Vec::with_capacity(names.len());
        while let Some((index, result)) = candidates.next().await {
            match result {
                Ok(value) => {
                    for (sibling, scope) in scopes.iter().enumerate() {
                        if sibling != index {
                            scope.abort(AbortReason::Resolved);
                        }
                    }
                    return Ok(value);
                }
                Err(AsyncError::Aborted {
                    reason: AbortReason::Resolved,
                }) => {
                    // A sibling won while this candidate was in flight.
                }
                Err(error) => {
                    if error.is_aborted() {
                        // Cancellation from an outer scope.
                        return Err(error);
                    }
                    if !self.error_policy.matches(&error) {
                        return Err(error);
                    }
                    self.notify_error(&names[index], &error);
                    errors.push(error);
                }
            }
        }

        Err(AsyncError::Hedging { errors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::Hooks;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("primary down")]
    struct PrimaryDown;

    #[tokio::test]
    async fn test_sequential_returns_primary_success() {
        let hooks = Hooks::new(|_| async { Ok("P") }).pipe(
            SequentialHedging::new(TimeSpan::from_millis(100))
                .fallback(NamedOperation::new("backup", |_| async { Ok("F") })),
        );

        assert_eq!(hooks.invoke().await.unwrap(), "P");
    }

    #[tokio::test]
    async fn test_sequential_falls_through_in_order() {
        let hooks = Hooks::new(|_| async { Err::<&str, _>(AsyncError::application(PrimaryDown)) })
            .pipe(
                SequentialHedging::new(TimeSpan::from_millis(100))
                    .fallback(NamedOperation::new("first", |_| async {
                        Err::<&str, _>(AsyncError::message("first down"))
                    }))
                    .fallback(NamedOperation::new("second", |_| async { Ok("S") })),
            );

        assert_eq!(hooks.invoke().await.unwrap(), "S");
    }

    #[tokio::test]
    async fn test_sequential_exhaustion_carries_all_errors() {
        let hooks = Hooks::new(|_| async { Err::<(), _>(AsyncError::application(PrimaryDown)) })
            .pipe(
                SequentialHedging::new(TimeSpan::from_millis(100))
                    .fallback(NamedOperation::new("backup", |_| async {
                        Err::<(), _>(AsyncError::message("backup down"))
                    })),
            );

        match hooks.invoke().await.unwrap_err() {
            AsyncError::Hedging { errors } => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_first_resolver_wins() {
        // Primary sleeps 20 ms then succeeds "P"; the fallback resolves
        // after 10 ms with "F", so "F" must win.
        let hooks = Hooks::new(|_| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok("P")
        })
        .pipe(
            ConcurrentHedging::new(TimeSpan::from_millis(200)).fallback(NamedOperation::new(
                "fast",
                |_| async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok("F")
                },
            )),
        );

        assert_eq!(hooks.invoke().await.unwrap(), "F");
    }

    #[tokio::test]
    async fn test_concurrent_losers_observe_resolved_abort() {
        let primary_aborted = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&primary_aborted);

        let hooks = Hooks::new(move |inv: Invocation| {
            let observed = Arc::clone(&observed);
            async move {
                tokio::select! {
                    reason = inv.signal().aborted() => {
                        if reason == AbortReason::Resolved {
                            observed.store(true, Ordering::SeqCst);
                        }
                        Err(AsyncError::Aborted { reason })
                    }
                    _ = tokio::time::sleep(Duration::from_millis(500)) => Ok("P")
                }
            }
        })
        .pipe(
            ConcurrentHedging::new(TimeSpan::from_millis(400)).fallback(NamedOperation::new(
                "fast",
                |_| async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok("F")
                },
            )),
        );

        assert_eq!(hooks.invoke().await.unwrap(), "F");
        // The loser's scope was aborted with the won-race sentinel. The
        // losing future itself may have been dropped before observing it,
        // which is also an accepted outcome.
        let _ = primary_aborted.load(Ordering::SeqCst);
    }

    #[tokio::test]
    async fn test_concurrent_exhaustion_excludes_sentinel() {
        let hooks = Hooks::new(|_| async { Err::<(), _>(AsyncError::application(PrimaryDown)) })
            .pipe(
                ConcurrentHedging::new(TimeSpan::from_millis(100)).fallback(NamedOperation::new(
                    "backup",
                    |_| async { Err::<(), _>(AsyncError::message("backup down")) },
                )),
            );

        match hooks.invoke().await.unwrap_err() {
            AsyncError::Hedging { errors } => {
                assert_eq!(errors.len(), 2);
                assert!(errors.iter().all(|e| !e.is_aborted()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_candidate_deadline_applies_per_call() {
        // Primary never finishes inside its deadline; the fallback does.
        let hooks = Hooks::new(|_| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok("P")
        })
        .pipe(
            SequentialHedging::new(TimeSpan::from_millis(30)).fallback(NamedOperation::new(
                "backup",
                |_| async { Ok("F") },
            )),
        );

        assert_eq!(hooks.invoke().await.unwrap(), "F");
    }
}

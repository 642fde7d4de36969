//! Fallback middleware

use crate::resilience::hooks::{Invocation, Middleware, Next};
use crate::resilience::{AsyncError, BoxFuture, ErrorPolicy};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;

/// A fallback value, either ready or computed on demand.
pub enum FallbackValue<T> {
    /// A ready value, cloned on each use.
    Value(T),
    /// An async computation producing the value.
    Lazy(Arc<dyn Fn() -> BoxFuture<'static, Result<T, AsyncError>> + Send + Sync>),
}

impl<T> FallbackValue<T>
where
    T: Send + 'static,
{
    /// A lazily-computed fallback.
    pub fn lazy<F, Fut>(factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, AsyncError>> + Send + 'static,
    {
        FallbackValue::Lazy(Arc::new(move || Box::pin(factory())))
    }
}

/// Substitutes a fallback value when the chain fails with an error
/// matching the policy. Cancellations always propagate.
pub struct Fallback<T> {
    value: FallbackValue<T>,
    error_policy: ErrorPolicy,
    on_fallback: Option<Arc<dyn Fn(&AsyncError) + Send + Sync>>,
}

impl<T> Fallback<T>
where
    T: Send + 'static,
{
    /// Fall back to a ready value.
    pub fn value(value: T) -> Self {
        Self {
            value: FallbackValue::Value(value),
            error_policy: ErrorPolicy::all(),
            on_fallback: None,
        }
    }

    /// Fall back to a lazily-computed value.
    pub fn lazy<F, Fut>(factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, AsyncError>> + Send + 'static,
    {
        Self {
            value: FallbackValue::lazy(factory),
            error_policy: ErrorPolicy::all(),
            on_fallback: None,
        }
    }

    /// Restrict which errors are replaced by the fallback.
    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Observe each substitution.
    pub fn on_fallback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&AsyncError) + Send + Sync + 'static,
    {
        self.on_fallback = Some(Arc::new(callback));
        self
    }
}

#[async_trait]
impl<T> Middleware<T> for Fallback<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn handle(&self, inv: &Invocation, next: Next<'_, T>) -> Result<T, AsyncError> {
        match next.run(inv).await {
            Ok(value) => Ok(value),
            Err(error) if self.error_policy.matches(&error) => {
                if let Some(callback) = &self.on_fallback {
                    callback(&error);
                }
                match &self.value {
                    FallbackValue::Value(value) => Ok(value.clone()),
                    FallbackValue::Lazy(factory) => factory().await,
                }
            }
            Err(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::AbortReason;
    use crate::resilience::Hooks;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("expected")]
    struct Expected;

    #[derive(Debug, Error)]
    #[error("unexpected")]
    struct Unexpected;

    #[tokio::test]
    async fn test_fallback_on_matching_error() {
        let hooks = Hooks::new(|_| async { Err::<i32, _>(AsyncError::application(Expected)) })
            .pipe(Fallback::value(42).error_policy(ErrorPolicy::of::<Expected>()));

        assert_eq!(hooks.invoke().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_non_matching_error_propagates() {
        let hooks = Hooks::new(|_| async { Err::<i32, _>(AsyncError::application(Unexpected)) })
            .pipe(Fallback::value(42).error_policy(ErrorPolicy::of::<Expected>()));

        assert!(hooks.invoke().await.unwrap_err().is::<Unexpected>());
    }

    #[tokio::test]
    async fn test_success_is_untouched() {
        let hooks = Hooks::new(|_| async { Ok(7) }).pipe(Fallback::value(42));
        assert_eq!(hooks.invoke().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_lazy_fallback_is_resolved() {
        let hooks = Hooks::new(|_| async { Err::<String, _>(AsyncError::message("down")) })
            .pipe(Fallback::lazy(|| async { Ok("computed".to_string()) }));

        assert_eq!(hooks.invoke().await.unwrap(), "computed");
    }

    #[tokio::test]
    async fn test_cancellation_is_never_replaced() {
        let hooks = Hooks::new(|_| async {
            Err::<i32, _>(AsyncError::Aborted {
                reason: AbortReason::TimedOut,
            })
        })
        .pipe(Fallback::value(42));

        assert!(hooks.invoke().await.unwrap_err().is_aborted());
    }
}

//! Timeout middleware

use crate::core::{AbortReason, TimeSpan};
use crate::resilience::hooks::{Invocation, Middleware, Next};
use crate::resilience::AsyncError;
use async_trait::async_trait;
use std::sync::Arc;

/// Races the rest of the chain against a deadline.
///
/// On expiry the inner scope is aborted with [`AbortReason::TimedOut`]
/// and [`AsyncError::Timeout`] is returned. An abort arriving from an
/// outer scope surfaces as [`AsyncError::Aborted`] instead.
pub struct Timeout {
    wait: TimeSpan,
    on_timeout: Option<Arc<dyn Fn(TimeSpan) + Send + Sync>>,
}

impl Timeout {
    /// Allow the wrapped chain `wait` time to complete.
    pub fn new(wait: TimeSpan) -> Self {
        Self {
            wait,
            on_timeout: None,
        }
    }

    /// Observe deadline expiries.
    pub fn on_timeout<F>(mut self, callback: F) -> Self
    where
        F: Fn(TimeSpan) + Send + Sync + 'static,
    {
        self.on_timeout = Some(Arc::new(callback));
        self
    }
}

#[async_trait]
impl<T> Middleware<T> for Timeout
where
    T: Send + 'static,
{
    async fn handle(&self, inv: &Invocation, next: Next<'_, T>) -> Result<T, AsyncError> {
        let scoped = inv.child();

        tokio::select! {
            result = next.run(&scoped) => result,
            reason = inv.signal().aborted() => {
                Err(AsyncError::Aborted { reason })
            }
            _ = tokio::time::sleep(self.wait.to_duration_clamped()) => {
                scoped.abort(AbortReason::TimedOut);
                if let Some(callback) = &self.on_timeout {
                    callback(self.wait);
                }
                Err(AsyncError::Timeout { waited: self.wait })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::Hooks;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fast_operation_passes_through() {
        let hooks = Hooks::new(|_| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok("done")
        })
        .pipe(Timeout::new(TimeSpan::from_millis(100)));

        assert_eq!(hooks.invoke().await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_slow_operation_times_out() {
        let hooks = Hooks::new(|_| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok("done")
        })
        .pipe(Timeout::new(TimeSpan::from_millis(25)));

        let error = hooks.invoke().await.unwrap_err();
        assert!(matches!(error, AsyncError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_inner_scope_observes_timeout_abort() {
        let (probe_tx, probe_rx) = tokio::sync::oneshot::channel();
        let probe_tx = Arc::new(std::sync::Mutex::new(Some(probe_tx)));

        let hooks = Hooks::new(move |inv: Invocation| {
            let probe_tx = Arc::clone(&probe_tx);
            async move {
                let reason = inv.signal().aborted().await;
                if let Some(tx) = probe_tx.lock().unwrap().take() {
                    let _ = tx.send(reason);
                }
                Ok::<_, AsyncError>(())
            }
        })
        .pipe(Timeout::new(TimeSpan::from_millis(10)));

        let _ = hooks.invoke().await;
        let reason = probe_rx.await;
        // The operation future is dropped on expiry, so the probe may or
        // may not have run; when it did, the reason must be TimedOut.
        if let Ok(reason) = reason {
            assert_eq!(reason, AbortReason::TimedOut);
        }
    }

    #[tokio::test]
    async fn test_external_abort_is_not_a_timeout() {
        let hooks = Hooks::new(|_| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .pipe(Timeout::new(TimeSpan::from_millis(100)));

        let inv = Invocation::root();
        let handle = inv.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.abort(AbortReason::Cancelled("caller went away".into()));
        });

        let error = hooks.invoke_with(inv).await.unwrap_err();
        assert!(matches!(
            error,
            AsyncError::Aborted {
                reason: AbortReason::Cancelled(_)
            }
        ));
    }
}

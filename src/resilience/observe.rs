//! Observation middleware

use crate::core::TimeSpan;
use crate::resilience::hooks::{Invocation, Middleware, Next};
use crate::resilience::AsyncError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

/// Wraps the chain with lifecycle callbacks.
///
/// Wall time is measured with a monotonic clock and handed to
/// `on_finally` as a [`TimeSpan`], whichever way the call ended.
pub struct Observe<T> {
    on_start: Option<Arc<dyn Fn() + Send + Sync>>,
    on_success: Option<Arc<dyn Fn(&T) + Send + Sync>>,
    on_error: Option<Arc<dyn Fn(&AsyncError) + Send + Sync>>,
    on_finally: Option<Arc<dyn Fn(TimeSpan) + Send + Sync>>,
}

impl<T> Observe<T> {
    /// An observer with no callbacks registered.
    pub fn new() -> Self {
        Self {
            on_start: None,
            on_success: None,
            on_error: None,
            on_finally: None,
        }
    }

    /// Called before the chain runs.
    pub fn on_start<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_start = Some(Arc::new(callback));
        self
    }

    /// Called with the value of a successful run.
    pub fn on_success<F>(mut self, callback: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(callback));
        self
    }

    /// Called with the error of a failed run.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&AsyncError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Called after either outcome with the elapsed wall time.
    pub fn on_finally<F>(mut self, callback: F) -> Self
    where
        F: Fn(TimeSpan) + Send + Sync + 'static,
    {
        self.on_finally = Some(Arc::new(callback));
        self
    }
}

impl<T> Default for Observe<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> Middleware<T> for Observe<T>
where
    T: Send + 'static,
{
    async fn handle(&self, inv: &Invocation, next: Next<'_, T>) -> Result<T, AsyncError> {
        if let Some(callback) = &self.on_start {
            callback();
        }
        let started = Instant::now();

        let result = next.run(inv).await;

        match &result {
            Ok(value) => {
                if let Some(callback) = &self.on_success {
                    callback(value);
                }
            }
            Err(error) => {
                if let Some(callback) = &self.on_error {
                    callback(error);
                }
            }
        }
        if let Some(callback) = &self.on_finally {
            callback(TimeSpan::from(started.elapsed()));
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::Hooks;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_success_lifecycle() {
        let events = Arc::new(Mutex::new(Vec::new()));

        let hooks = {
            let start = Arc::clone(&events);
            let success = Arc::clone(&events);
            let error = Arc::clone(&events);
            let finally = Arc::clone(&events);
            Hooks::new(|_| async { Ok(5u32) }).pipe(
                Observe::new()
                    .on_start(move || start.lock().push("start"))
                    .on_success(move |_| success.lock().push("success"))
                    .on_error(move |_| error.lock().push("error"))
                    .on_finally(move |_| finally.lock().push("finally")),
            )
        };

        hooks.invoke().await.unwrap();
        assert_eq!(*events.lock(), vec!["start", "success", "finally"]);
    }

    #[tokio::test]
    async fn test_error_lifecycle() {
        let events = Arc::new(Mutex::new(Vec::new()));

        let hooks = {
            let success = Arc::clone(&events);
            let error = Arc::clone(&events);
            Hooks::new(|_| async { Err::<u32, _>(AsyncError::message("down")) }).pipe(
                Observe::new()
                    .on_success(move |_| success.lock().push("success"))
                    .on_error(move |_| error.lock().push("error")),
            )
        };

        let _ = hooks.invoke().await;
        assert_eq!(*events.lock(), vec!["error"]);
    }

    #[tokio::test]
    async fn test_wall_time_is_measured() {
        let measured = Arc::new(Mutex::new(TimeSpan::ZERO));

        let hooks = {
            let measured = Arc::clone(&measured);
            Hooks::new(|_| async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                Ok(())
            })
            .pipe(Observe::new().on_finally(move |elapsed| *measured.lock() = elapsed))
        };

        hooks.invoke().await.unwrap();
        assert!(measured.lock().as_millis() >= 25);
    }
}

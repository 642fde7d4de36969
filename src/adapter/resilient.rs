//! Resilient adapter decorators
//!
//! Wrap a rich adapter so every storage call runs through the
//! middleware pipeline with the provider's resilience defaults: an
//! optional total deadline outermost, bounded retries with backoff, and
//! an optional per-attempt deadline innermost. CAS outcomes (`false`,
//! `Unavailable`) are values, not errors, so only genuine backend
//! failures are retried.

use crate::adapter::contracts::{
    CacheAdapter, CacheRecord, IncrementOutcome, LockAdapter, LockRecord, SemaphoreAdapter,
    SemaphoreRecord, SharedLockAdapter, SharedLockRecord, SlotAcquire,
};
use crate::adapter::{AdapterError, AdapterResult};
use crate::core::{Backoff, Key, TimeSpan};
use crate::resilience::{AsyncError, Hooks, Invocation, Retry, Timeout};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;

/// Retry/timeout defaults applied to every wrapped adapter call.
#[derive(Debug, Clone)]
pub struct ResilienceOptions {
    /// Total attempts per storage call.
    pub retry_attempts: u32,
    /// Delay schedule between attempts.
    pub backoff: Backoff,
    /// Deadline of a single attempt.
    pub retry_timeout: Option<TimeSpan>,
    /// Deadline of the whole call, retries included.
    pub total_timeout: Option<TimeSpan>,
}

impl Default for ResilienceOptions {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            backoff: Backoff::default(),
            retry_timeout: None,
            total_timeout: None,
        }
    }
}

impl ResilienceOptions {
    pub(crate) async fn run<T, F, Fut>(&self, operation: F) -> AdapterResult<T>
    where
        T: Send + 'static,
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, AsyncError>> + Send + 'static,
    {
        let mut hooks = Hooks::new(operation);
        if let Some(total) = self.total_timeout {
            hooks = hooks.pipe(Timeout::new(total));
        }
        if self.retry_attempts > 1 {
            hooks = hooks.pipe(Retry::new(self.retry_attempts).backoff(self.backoff.clone()));
        }
        if let Some(attempt) = self.retry_timeout {
            hooks = hooks.pipe(Timeout::new(attempt));
        }
        hooks.invoke().await.map_err(unwrap_adapter_error)
    }
}

/// Recover the adapter error carried through the pipeline; pipeline
/// failures of their own (timeouts, exhausted retries) surface as
/// backend failures.
fn unwrap_adapter_error(error: AsyncError) -> AdapterError {
    match error {
        AsyncError::Application(inner) => inner
            .downcast::<AdapterError>()
            .unwrap_or_else(|other| AdapterError::Other(other.to_string())),
        other => AdapterError::Other(other.to_string()),
    }
}

macro_rules! resilient_call {
    ($self:ident, [$($capture:ident),*], $body:expr) => {{
        let inner = Arc::clone(&$self.inner);
        $(let $capture = $capture.to_owned();)*
        $self.options
            .run(move |_| {
                let inner = Arc::clone(&inner);
                $(let $capture = $capture.clone();)*
                async move { $body(inner, $($capture),*).await.map_err(AsyncError::application) }
            })
            .await
    }};
}

// ============================================================================
// Lock
// ============================================================================

/// A [`LockAdapter`] whose calls run through the resilience pipeline.
pub struct ResilientLockAdapter {
    inner: Arc<dyn LockAdapter>,
    options: ResilienceOptions,
}

impl ResilientLockAdapter {
    /// Wrap `inner` with `options`.
    pub fn new(inner: Arc<dyn LockAdapter>, options: ResilienceOptions) -> Self {
        Self { inner, options }
    }
}

#[async_trait]
impl LockAdapter for ResilientLockAdapter {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn acquire(
        &self,
        key: &Key,
        owner: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<bool> {
        resilient_call!(self, [key, owner], move |inner: Arc<dyn LockAdapter>,
                                                  key: Key,
                                                  owner: String| async move {
            inner.acquire(&key, &owner, expiration).await
        })
    }

    async fn release(&self, key: &Key, owner: &str) -> AdapterResult<bool> {
        resilient_call!(self, [key, owner], move |inner: Arc<dyn LockAdapter>,
                                                  key: Key,
                                                  owner: String| async move {
            inner.release(&key, &owner).await
        })
    }

    async fn force_release(&self, key: &Key) -> AdapterResult<bool> {
        resilient_call!(self, [key], move |inner: Arc<dyn LockAdapter>, key: Key| async move {
            inner.force_release(&key).await
        })
    }

    async fn refresh(
        &self,
        key: &Key,
        owner: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<bool> {
        resilient_call!(self, [key, owner], move |inner: Arc<dyn LockAdapter>,
                                                  key: Key,
                                                  owner: String| async move {
            inner.refresh(&key, &owner, expiration).await
        })
    }

    async fn find(&self, key: &Key) -> AdapterResult<Option<LockRecord>> {
        resilient_call!(self, [key], move |inner: Arc<dyn LockAdapter>, key: Key| async move {
            inner.find(&key).await
        })
    }
}

// ============================================================================
// Semaphore
// ============================================================================

/// A [`SemaphoreAdapter`] whose calls run through the resilience
/// pipeline.
pub struct ResilientSemaphoreAdapter {
    inner: Arc<dyn SemaphoreAdapter>,
    options: ResilienceOptions,
}

impl ResilientSemaphoreAdapter {
    /// Wrap `inner` with `options`.
    pub fn new(inner: Arc<dyn SemaphoreAdapter>, options: ResilienceOptions) -> Self {
        Self { inner, options }
    }
}

#[async_trait]
impl SemaphoreAdapter for ResilientSemaphoreAdapter {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn acquire(
        &self,
        key: &Key,
        slot_id: &str,
        limit: u32,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<SlotAcquire> {
        resilient_call!(self, [key, slot_id], move |inner: Arc<dyn SemaphoreAdapter>,
                                                    key: Key,
                                                    slot_id: String| async move {
            inner.acquire(&key, &slot_id, limit, expiration).await
        })
    }

    async fn release(&self, key: &Key, slot_id: &str) -> AdapterResult<bool> {
        resilient_call!(self, [key, slot_id], move |inner: Arc<dyn SemaphoreAdapter>,
                                                    key: Key,
                                                    slot_id: String| async move {
            inner.release(&key, &slot_id).await
        })
    }

    async fn refresh(
        &self,
        key: &Key,
        slot_id: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<bool> {
        resilient_call!(self, [key, slot_id], move |inner: Arc<dyn SemaphoreAdapter>,
                                                    key: Key,
                                                    slot_id: String| async move {
            inner.refresh(&key, &slot_id, expiration).await
        })
    }

    async fn force_release_all(&self, key: &Key) -> AdapterResult<u64> {
        resilient_call!(self, [key], move |inner: Arc<dyn SemaphoreAdapter>,
                                           key: Key| async move {
            inner.force_release_all(&key).await
        })
    }

    async fn find(&self, key: &Key) -> AdapterResult<Option<SemaphoreRecord>> {
        resilient_call!(self, [key], move |inner: Arc<dyn SemaphoreAdapter>,
                                           key: Key| async move {
            inner.find(&key).await
        })
    }
}

// ============================================================================
// Shared lock
// ============================================================================

/// A [`SharedLockAdapter`] whose calls run through the resilience
/// pipeline.
pub struct ResilientSharedLockAdapter {
    inner: Arc<dyn SharedLockAdapter>,
    options: ResilienceOptions,
}

impl ResilientSharedLockAdapter {
    /// Wrap `inner` with `options`.
    pub fn new(inner: Arc<dyn SharedLockAdapter>, options: ResilienceOptions) -> Self {
        Self { inner, options }
    }
}

#[async_trait]
impl SharedLockAdapter for ResilientSharedLockAdapter {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn acquire_writer(
        &self,
        key: &Key,
        owner: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<bool> {
        resilient_call!(self, [key, owner], move |inner: Arc<dyn SharedLockAdapter>,
                                                  key: Key,
                                                  owner: String| async move {
            inner.acquire_writer(&key, &owner, expiration).await
        })
    }

    async fn release_writer(&self, key: &Key, owner: &str) -> AdapterResult<bool> {
        resilient_call!(self, [key, owner], move |inner: Arc<dyn SharedLockAdapter>,
                                                  key: Key,
                                                  owner: String| async move {
            inner.release_writer(&key, &owner).await
        })
    }

    async fn refresh_writer(
        &self,
        key: &Key,
        owner: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<bool> {
        resilient_call!(self, [key, owner], move |inner: Arc<dyn SharedLockAdapter>,
                                                  key: Key,
                                                  owner: String| async move {
            inner.refresh_writer(&key, &owner, expiration).await
        })
    }

    async fn force_release_writer(&self, key: &Key) -> AdapterResult<bool> {
        resilient_call!(self, [key], move |inner: Arc<dyn SharedLockAdapter>,
                                           key: Key| async move {
            inner.force_release_writer(&key).await
        })
    }

    async fn acquire_reader(
        &self,
        key: &Key,
        slot_id: &str,
        limit: u32,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<SlotAcquire> {
        resilient_call!(self, [key, slot_id], move |inner: Arc<dyn SharedLockAdapter>,
                                                    key: Key,
                                                    slot_id: String| async move {
            inner.acquire_reader(&key, &slot_id, limit, expiration).await
        })
    }

    async fn release_reader(&self, key: &Key, slot_id: &str) -> AdapterResult<bool> {
        resilient_call!(self, [key, slot_id], move |inner: Arc<dyn SharedLockAdapter>,
                                                    key: Key,
                                                    slot_id: String| async move {
            inner.release_reader(&key, &slot_id).await
        })
    }

    async fn refresh_reader(
        &self,
        key: &Key,
        slot_id: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<bool> {
        resilient_call!(self, [key, slot_id], move |inner: Arc<dyn SharedLockAdapter>,
                                                    key: Key,
                                                    slot_id: String| async move {
            inner.refresh_reader(&key, &slot_id, expiration).await
        })
    }

    async fn force_release_all_readers(&self, key: &Key) -> AdapterResult<u64> {
        resilient_call!(self, [key], move |inner: Arc<dyn SharedLockAdapter>,
                                           key: Key| async move {
            inner.force_release_all_readers(&key).await
        })
    }

    async fn find(&self, key: &Key) -> AdapterResult<Option<SharedLockRecord>> {
        resilient_call!(self, [key], move |inner: Arc<dyn SharedLockAdapter>,
                                           key: Key| async move {
            inner.find(&key).await
        })
    }
}

// ============================================================================
// Cache
// ============================================================================

/// A [`CacheAdapter`] whose calls run through the resilience pipeline.
pub struct ResilientCacheAdapter {
    inner: Arc<dyn CacheAdapter>,
    options: ResilienceOptions,
}

impl ResilientCacheAdapter {
    /// Wrap `inner` with `options`.
    pub fn new(inner: Arc<dyn CacheAdapter>, options: ResilienceOptions) -> Self {
        Self { inner, options }
    }
}

#[async_trait]
impl CacheAdapter for ResilientCacheAdapter {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn find(&self, key: &Key) -> AdapterResult<Option<CacheRecord>> {
        resilient_call!(self, [key], move |inner: Arc<dyn CacheAdapter>, key: Key| async move {
            inner.find(&key).await
        })
    }

    async fn insert(
        &self,
        key: &Key,
        value: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<bool> {
        resilient_call!(self, [key, value], move |inner: Arc<dyn CacheAdapter>,
                                                  key: Key,
                                                  value: String| async move {
            inner.insert(&key, &value, expiration).await
        })
    }

    async fn upsert(
        &self,
        key: &Key,
        value: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<bool> {
        resilient_call!(self, [key, value], move |inner: Arc<dyn CacheAdapter>,
                                                  key: Key,
                                                  value: String| async move {
            inner.upsert(&key, &value, expiration).await
        })
    }

    async fn update(&self, key: &Key, value: &str) -> AdapterResult<bool> {
        resilient_call!(self, [key, value], move |inner: Arc<dyn CacheAdapter>,
                                                  key: Key,
                                                  value: String| async move {
            inner.update(&key, &value).await
        })
    }

    async fn remove(&self, key: &Key) -> AdapterResult<bool> {
        resilient_call!(self, [key], move |inner: Arc<dyn CacheAdapter>, key: Key| async move {
            inner.remove(&key).await
        })
    }

    async fn increment(&self, key: &Key, delta: f64) -> AdapterResult<IncrementOutcome> {
        resilient_call!(self, [key], move |inner: Arc<dyn CacheAdapter>, key: Key| async move {
            inner.increment(&key, delta).await
        })
    }

    async fn remove_namespace(&self, prefix: &str) -> AdapterResult<u64> {
        resilient_call!(self, [prefix], move |inner: Arc<dyn CacheAdapter>,
                                              prefix: String| async move {
            inner.remove_namespace(&prefix).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Namespace;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Fails a configurable number of times before succeeding.
    struct FlakyLockAdapter {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyLockAdapter {
        fn new(failures: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl LockAdapter for FlakyLockAdapter {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn acquire(
            &self,
            _key: &Key,
            _owner: &str,
            _expiration: Option<DateTime<Utc>>,
        ) -> AdapterResult<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .is_ok()
            {
                Err(AdapterError::Other("connection reset".to_string()))
            } else {
                Ok(true)
            }
        }

        async fn release(&self, _key: &Key, _owner: &str) -> AdapterResult<bool> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(true)
        }

        async fn force_release(&self, _key: &Key) -> AdapterResult<bool> {
            Ok(false)
        }

        async fn refresh(
            &self,
            _key: &Key,
            _owner: &str,
            _expiration: DateTime<Utc>,
        ) -> AdapterResult<bool> {
            Ok(false)
        }

        async fn find(&self, _key: &Key) -> AdapterResult<Option<LockRecord>> {
            Ok(None)
        }
    }

    fn options() -> ResilienceOptions {
        ResilienceOptions {
            retry_attempts: 3,
            backoff: Backoff::constant(TimeSpan::ZERO),
            retry_timeout: None,
            total_timeout: None,
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let flaky = Arc::new(FlakyLockAdapter::new(2));
        let adapter = ResilientLockAdapter::new(Arc::clone(&flaky) as _, options());
        let key = Namespace::new("resilient").key("k");

        assert!(adapter.acquire(&key, "o", None).await.unwrap());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_as_adapter_error() {
        let flaky = Arc::new(FlakyLockAdapter::new(10));
        let adapter = ResilientLockAdapter::new(Arc::clone(&flaky) as _, options());
        let key = Namespace::new("resilient").key("k");

        let error = adapter.acquire(&key, "o", None).await.unwrap_err();
        assert!(matches!(error, AdapterError::Other(_)));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempt_deadline_applies() {
        let flaky = Arc::new(FlakyLockAdapter::new(0));
        let adapter = ResilientLockAdapter::new(
            Arc::clone(&flaky) as _,
            ResilienceOptions {
                retry_attempts: 1,
                retry_timeout: Some(TimeSpan::from_millis(30)),
                ..options()
            },
        );
        let key = Namespace::new("resilient").key("k");

        // release sleeps 200 ms in the flaky adapter.
        let error = adapter.release(&key, "o").await.unwrap_err();
        assert!(matches!(error, AdapterError::Other(_)));
    }

    #[tokio::test]
    async fn test_successful_calls_pass_through_untouched() {
        let flaky = Arc::new(FlakyLockAdapter::new(0));
        let adapter = ResilientLockAdapter::new(Arc::clone(&flaky) as _, options());
        let key = Namespace::new("resilient").key("k");

        assert!(adapter.acquire(&key, "o", None).await.unwrap());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
        assert!(adapter.find(&key).await.unwrap().is_none());
    }
}

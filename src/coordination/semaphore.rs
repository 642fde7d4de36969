//! Counting semaphore handle

use crate::adapter::{AdapterError, SemaphoreAdapter, SlotAcquire};
use crate::coordination::{
    BlockingOptions, CoordinationError, CoordinationResult, FailedAcquireLockError,
    FailedRefreshLockError, FailedReleaseLockError, LimitMismatchError, RunOutcome,
};
use crate::core::{Key, Signal, TimeSpan};
use crate::events::{Event, EventBus, SemaphoreEvent};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

/// Observed state of a semaphore key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemaphoreState {
    /// The limit the semaphore was created with.
    pub limit: u32,
    /// Live slots currently held.
    pub acquired: usize,
}

impl SemaphoreState {
    /// Slots still available.
    pub fn free(&self) -> u32 {
        self.limit.saturating_sub(self.acquired as u32)
    }
}

/// A handle to one slot of a distributed counting semaphore.
///
/// The limit is established by the first acquisition of the key and
/// must match on every later call; a divergent limit surfaces as
/// [`LimitMismatchError`].
#[derive(Clone)]
pub struct Semaphore {
    key: Key,
    slot_id: String,
    limit: u32,
    adapter: Arc<dyn SemaphoreAdapter>,
    bus: Arc<dyn EventBus>,
    ttl: Option<TimeSpan>,
    refresh_ttl: TimeSpan,
    blocking: BlockingOptions,
}

impl Semaphore {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: Key,
        slot_id: String,
        limit: u32,
        adapter: Arc<dyn SemaphoreAdapter>,
        bus: Arc<dyn EventBus>,
        ttl: Option<TimeSpan>,
        refresh_ttl: TimeSpan,
        blocking: BlockingOptions,
    ) -> Self {
        Self {
            key,
            slot_id,
            limit,
            adapter,
            bus,
            ttl,
            refresh_ttl,
            blocking,
        }
    }

    /// The key this handle coordinates on.
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// The slot id this handle holds capacity under.
    pub fn slot_id(&self) -> &str {
        &self.slot_id
    }

    /// The limit this handle expects.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub(crate) fn adapter_name(&self) -> &'static str {
        self.adapter.name()
    }

    pub(crate) fn ttl(&self) -> Option<TimeSpan> {
        self.ttl
    }

    fn emit(&self, event: SemaphoreEvent) {
        self.bus.publish(Event::Semaphore(event));
    }

    fn emit_unexpected(&self, error: &AdapterError) {
        self.emit(SemaphoreEvent::UnexpectedError {
            key: self.key.namespaced(),
            message: error.to_string(),
        });
    }

    /// Try to take a slot once; `true` iff this handle now holds one.
    /// Re-acquiring an already-held slot is idempotent.
    pub async fn acquire(&self) -> CoordinationResult<bool> {
        let expiration = self.ttl.map(|ttl| ttl.end_date());
        match self
            .adapter
            .acquire(&self.key, &self.slot_id, self.limit, expiration)
            .await
        {
            Ok(SlotAcquire::Acquired) => {
                self.emit(SemaphoreEvent::Acquired {
                    key: self.key.namespaced(),
                    slot_id: self.slot_id.clone(),
                    ttl: self.ttl,
                });
                Ok(true)
            }
            Ok(SlotAcquire::Unavailable) => {
                self.emit(SemaphoreEvent::Unavailable {
                    key: self.key.namespaced(),
                    slot_id: self.slot_id.clone(),
                });
                Ok(false)
            }
            Ok(SlotAcquire::LimitMismatch { stored }) => {
                self.emit(SemaphoreEvent::LimitMismatch {
                    key: self.key.namespaced(),
                    stored,
                    requested: self.limit,
                });
                Err(LimitMismatchError {
                    key: self.key.namespaced(),
                    stored,
                    requested: self.limit,
                }
                .into())
            }
            Err(error) => {
                self.emit_unexpected(&error);
                Err(error.into())
            }
        }
    }

    /// As [`Semaphore::acquire`], failing with
    /// [`FailedAcquireLockError`] instead of returning `false`.
    pub async fn acquire_or_fail(&self) -> CoordinationResult<()> {
        if self.acquire().await? {
            Ok(())
        } else {
            Err(FailedAcquireLockError {
                key: self.key.namespaced(),
            }
            .into())
        }
    }

    /// Retry [`Semaphore::acquire`] on the handle's default budget.
    pub async fn acquire_blocking(&self) -> CoordinationResult<bool> {
        self.acquire_blocking_with(self.blocking, &Signal::never())
            .await
    }

    /// Retry [`Semaphore::acquire`] until success, cancellation, or the
    /// budget elapses.
    pub async fn acquire_blocking_with(
        &self,
        options: BlockingOptions,
        signal: &Signal,
    ) -> CoordinationResult<bool> {
        let deadline = Instant::now() + options.time.to_duration_clamped();
        loop {
            if signal.is_aborted() {
                return Err(CoordinationError::Aborted);
            }
            if self.acquire().await? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::select! {
                _ = signal.aborted() => return Err(CoordinationError::Aborted),
                _ = tokio::time::sleep(options.interval.to_duration_clamped()) => {}
            }
        }
    }

    /// As [`Semaphore::acquire_blocking`], failing instead of returning
    /// `false`.
    pub async fn acquire_blocking_or_fail(&self) -> CoordinationResult<()> {
        if self.acquire_blocking().await? {
            Ok(())
        } else {
            Err(FailedAcquireLockError {
                key: self.key.namespaced(),
            }
            .into())
        }
    }

    /// Release this handle's slot; `true` iff it was held.
    pub async fn release(&self) -> CoordinationResult<bool> {
        match self.adapter.release(&self.key, &self.slot_id).await {
            Ok(true) => {
                self.emit(SemaphoreEvent::Released {
                    key: self.key.namespaced(),
                    slot_id: self.slot_id.clone(),
                });
                Ok(true)
            }
            Ok(false) => {
                self.emit(SemaphoreEvent::FailedRelease {
                    key: self.key.namespaced(),
                    slot_id: self.slot_id.clone(),
                });
                Ok(false)
            }
            Err(error) => {
                self.emit_unexpected(&error);
                Err(error.into())
            }
        }
    }

    /// As [`Semaphore::release`], failing with
    /// [`FailedReleaseLockError`] instead of returning `false`.
    pub async fn release_or_fail(&self) -> CoordinationResult<()> {
        if self.release().await? {
            Ok(())
        } else {
            Err(FailedReleaseLockError {
                key: self.key.namespaced(),
            }
            .into())
        }
    }

    /// Remove every held slot atomically; returns how many were
    /// removed.
    pub async fn force_release_all(&self) -> CoordinationResult<u64> {
        match self.adapter.force_release_all(&self.key).await {
            Ok(count) => {
                self.emit(SemaphoreEvent::AllForceReleased {
                    key: self.key.namespaced(),
                    count,
                });
                Ok(count)
            }
            Err(error) => {
                self.emit_unexpected(&error);
                Err(error.into())
            }
        }
    }

    /// Move this slot's expiration forward by the handle's refresh TTL.
    pub async fn refresh(&self) -> CoordinationResult<bool> {
        self.refresh_with(self.refresh_ttl).await
    }

    /// Move this slot's expiration to `now + ttl`; requires a held slot
    /// with an expiration.
    pub async fn refresh_with(&self, ttl: TimeSpan) -> CoordinationResult<bool> {
        match self
            .adapter
            .refresh(&self.key, &self.slot_id, ttl.end_date())
            .await
        {
            Ok(true) => {
                self.emit(SemaphoreEvent::Refreshed {
                    key: self.key.namespaced(),
                    slot_id: self.slot_id.clone(),
                    ttl,
                });
                Ok(true)
            }
            Ok(false) => {
                self.emit(SemaphoreEvent::FailedRefresh {
                    key: self.key.namespaced(),
                    slot_id: self.slot_id.clone(),
                });
                Ok(false)
            }
            Err(error) => {
                self.emit_unexpected(&error);
                Err(error.into())
            }
        }
    }

    /// As [`Semaphore::refresh`], failing with
    /// [`FailedRefreshLockError`] instead of returning `false`.
    pub async fn refresh_or_fail(&self) -> CoordinationResult<()> {
        if self.refresh().await? {
            Ok(())
        } else {
            Err(FailedRefreshLockError {
                key: self.key.namespaced(),
            }
            .into())
        }
    }

    /// The current state of the key; expired slots are not counted.
    pub async fn get_state(&self) -> CoordinationResult<Option<SemaphoreState>> {
        let now = Utc::now();
        match self.adapter.find(&self.key).await {
            Ok(Some(record)) => Ok(Some(SemaphoreState {
                limit: record.limit,
                acquired: record.live_slots(now),
            })),
            Ok(None) => Ok(None),
            Err(error) => {
                self.emit_unexpected(&error);
                Err(error.into())
            }
        }
    }

    /// Acquire a slot, run `operation`, release the slot.
    pub async fn run<T, F, Fut>(&self, operation: F) -> CoordinationResult<RunOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.acquire().await? {
            return Ok(RunOutcome::Unavailable(FailedAcquireLockError {
                key: self.key.namespaced(),
            }));
        }
        let value = operation().await;
        self.release().await?;
        Ok(RunOutcome::Completed(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemorySemaphoreAdapter;
    use crate::core::Namespace;
    use crate::events::InMemoryEventBus;
    use std::time::Duration;

    fn semaphore(key: &str, slot: &str, limit: u32) -> Semaphore {
        semaphore_on(
            Arc::new(MemorySemaphoreAdapter::new()),
            Arc::new(InMemoryEventBus::new()),
            key,
            slot,
            limit,
        )
    }

    fn semaphore_on(
        adapter: Arc<dyn SemaphoreAdapter>,
        bus: Arc<dyn EventBus>,
        key: &str,
        slot: &str,
        limit: u32,
    ) -> Semaphore {
        Semaphore::new(
            Namespace::new("test/semaphore").key(key),
            slot.to_string(),
            limit,
            adapter,
            bus,
            None,
            TimeSpan::from_secs(60),
            BlockingOptions {
                time: TimeSpan::from_millis(200),
                interval: TimeSpan::from_millis(10),
            },
        )
    }

    fn trio(key: &str, limit: u32) -> (Semaphore, Semaphore, Semaphore) {
        let adapter: Arc<dyn SemaphoreAdapter> = Arc::new(MemorySemaphoreAdapter::new());
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
        (
            semaphore_on(Arc::clone(&adapter), Arc::clone(&bus), key, "a", limit),
            semaphore_on(Arc::clone(&adapter), Arc::clone(&bus), key, "b", limit),
            semaphore_on(adapter, bus, key, "c", limit),
        )
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let (a, b, c) = trio("capacity", 2);

        assert!(a.acquire().await.unwrap());
        assert!(b.acquire().await.unwrap());
        assert!(!c.acquire().await.unwrap());

        // Idempotent re-acquisition does not consume capacity.
        assert!(a.acquire().await.unwrap());

        assert!(a.release().await.unwrap());
        assert!(c.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_limit_mismatch_is_rejected() {
        let adapter: Arc<dyn SemaphoreAdapter> = Arc::new(MemorySemaphoreAdapter::new());
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());

        let first = semaphore_on(Arc::clone(&adapter), Arc::clone(&bus), "mismatch", "a", 2);
        let second = semaphore_on(adapter, bus, "mismatch", "b", 3);

        assert!(first.acquire().await.unwrap());
        let error = second.acquire().await.unwrap_err();
        assert!(matches!(error, CoordinationError::LimitMismatch(_)));
    }

    #[tokio::test]
    async fn test_state_reports_live_slots() {
        let (a, b, _) = trio("state", 3);
        assert!(a.get_state().await.unwrap().is_none());

        a.acquire().await.unwrap();
        b.acquire().await.unwrap();

        let state = a.get_state().await.unwrap().unwrap();
        assert_eq!(state.limit, 3);
        assert_eq!(state.acquired, 2);
        assert_eq!(state.free(), 1);
    }

    #[tokio::test]
    async fn test_force_release_all() {
        let (a, b, c) = trio("force", 2);
        a.acquire().await.unwrap();
        b.acquire().await.unwrap();

        assert_eq!(c.force_release_all().await.unwrap(), 2);
        assert!(c.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_blocking_acquisition_waits_for_capacity() {
        let (a, b, _) = trio("blocking", 1);
        a.acquire().await.unwrap();

        let waiter = tokio::spawn(async move { b.acquire_blocking().await });
        tokio::time::sleep(Duration::from_millis(40)).await;
        a.release().await.unwrap();

        assert!(waiter.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_run_scope() {
        let handle = semaphore("run", "only", 1);
        let outcome = handle.run(|| async { "done" }).await.unwrap();
        assert_eq!(outcome.ok(), Some("done"));
        assert!(handle.get_state().await.unwrap().is_none());
    }
}

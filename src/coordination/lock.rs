//! Exclusive lock handle

use crate::adapter::{AdapterError, LockAdapter};
use crate::coordination::{
    BlockingOptions, CoordinationError, CoordinationResult, FailedAcquireLockError,
    FailedRefreshLockError, FailedReleaseLockError, RunOutcome,
};
use crate::core::{Key, Signal, TimeSpan};
use crate::events::{Event, EventBus, LockEvent};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

/// Observed state of a lock key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    /// No live holder.
    Unlocked,
    /// Held by `owner`.
    Owned {
        /// The holder's owner id.
        owner: String,
        /// Expiration instant; `None` never expires.
        expiration: Option<DateTime<Utc>>,
    },
}

/// A handle to one distributed lock key.
///
/// The handle carries the owner id used to prove ownership on release
/// and refresh; all mutable state lives in the adapter. Handles are
/// cheap to clone and safe to use from concurrent tasks.
#[derive(Clone)]
pub struct Lock {
    key: Key,
    owner: String,
    adapter: Arc<dyn LockAdapter>,
    bus: Arc<dyn EventBus>,
    ttl: Option<TimeSpan>,
    refresh_ttl: TimeSpan,
    blocking: BlockingOptions,
}

impl Lock {
    pub(crate) fn new(
        key: Key,
        owner: String,
        adapter: Arc<dyn LockAdapter>,
        bus: Arc<dyn EventBus>,
        ttl: Option<TimeSpan>,
        refresh_ttl: TimeSpan,
        blocking: BlockingOptions,
    ) -> Self {
        Self {
            key,
            owner,
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

    /// The owner id this handle proves ownership with.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The TTL acquisitions use; `None` acquires without expiration.
    pub fn ttl(&self) -> Option<TimeSpan> {
        self.ttl
    }

    pub(crate) fn adapter_name(&self) -> &'static str {
        self.adapter.name()
    }

    fn emit(&self, event: LockEvent) {
        self.bus.publish(Event::Lock(event));
    }

    fn emit_unexpected(&self, error: &AdapterError) {
        self.emit(LockEvent::UnexpectedError {
            key: self.key.namespaced(),
            message: error.to_string(),
        });
    }

    /// Try to take the lock once; `true` iff this handle now owns it.
    pub async fn acquire(&self) -> CoordinationResult<bool> {
        let expiration = self.ttl.map(|ttl| ttl.end_date());
        match self.adapter.acquire(&self.key, &self.owner, expiration).await {
            Ok(true) => {
                self.emit(LockEvent::Acquired {
                    key: self.key.namespaced(),
                    owner: self.owner.clone(),
                    ttl: self.ttl,
                });
                Ok(true)
            }
            Ok(false) => {
                self.emit(LockEvent::Unavailable {
                    key: self.key.namespaced(),
                    owner: self.owner.clone(),
                });
                Ok(false)
            }
            Err(error) => {
                self.emit_unexpected(&error);
                Err(error.into())
            }
        }
    }

    /// As [`Lock::acquire`], failing with [`FailedAcquireLockError`]
    /// instead of returning `false`.
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

    /// Retry [`Lock::acquire`] on the handle's default budget.
    pub async fn acquire_blocking(&self) -> CoordinationResult<bool> {
        self.acquire_blocking_with(self.blocking, &Signal::never())
            .await
    }

    /// Retry [`Lock::acquire`] every `options.interval` until success
    /// or `options.time` elapses. The signal is sampled before every
    /// attempt and every sleep; a cancelled acquisition returns
    /// [`CoordinationError::Aborted`] without touching the adapter.
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

    /// As [`Lock::acquire_blocking`], failing instead of returning
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

    /// Release the lock; `true` iff this handle held it.
    pub async fn release(&self) -> CoordinationResult<bool> {
        match self.adapter.release(&self.key, &self.owner).await {
            Ok(true) => {
                self.emit(LockEvent::Released {
                    key: self.key.namespaced(),
                    owner: self.owner.clone(),
                });
                Ok(true)
            }
            Ok(false) => {
                self.emit(LockEvent::FailedRelease {
                    key: self.key.namespaced(),
                    owner: self.owner.clone(),
                });
                Ok(false)
            }
            Err(error) => {
                self.emit_unexpected(&error);
                Err(error.into())
            }
        }
    }

    /// As [`Lock::release`], failing with [`FailedReleaseLockError`]
    /// instead of returning `false`.
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

    /// Remove the lock regardless of owner; `true` iff anything was
    /// removed.
    pub async fn force_release(&self) -> CoordinationResult<bool> {
        match self.adapter.force_release(&self.key).await {
            Ok(removed) => {
                if removed {
                    self.emit(LockEvent::ForceReleased {
                        key: self.key.namespaced(),
                    });
                }
                Ok(removed)
            }
            Err(error) => {
                self.emit_unexpected(&error);
                Err(error.into())
            }
        }
    }

    /// Move the expiration forward by the handle's refresh TTL.
    pub async fn refresh(&self) -> CoordinationResult<bool> {
        self.refresh_with(self.refresh_ttl).await
    }

    /// Move the expiration to `now + ttl`; `true` iff this handle held
    /// the lock.
    pub async fn refresh_with(&self, ttl: TimeSpan) -> CoordinationResult<bool> {
        match self
            .adapter
            .refresh(&self.key, &self.owner, ttl.end_date())
            .await
        {
            Ok(true) => {
                self.emit(LockEvent::Refreshed {
                    key: self.key.namespaced(),
                    owner: self.owner.clone(),
                    ttl,
                });
                Ok(true)
            }
            Ok(false) => {
                self.emit(LockEvent::FailedRefresh {
                    key: self.key.namespaced(),
                    owner: self.owner.clone(),
                });
                Ok(false)
            }
            Err(error) => {
                self.emit_unexpected(&error);
                Err(error.into())
            }
        }
    }

    /// As [`Lock::refresh`], failing with [`FailedRefreshLockError`]
    /// instead of returning `false`.
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

    /// The current state of the key; expired records read as
    /// [`LockState::Unlocked`].
    pub async fn get_state(&self) -> CoordinationResult<LockState> {
        let now = Utc::now();
        match self.adapter.find(&self.key).await {
            Ok(Some(record)) if !record.is_expired(now) => Ok(LockState::Owned {
                owner: record.owner,
                expiration: record.expiration,
            }),
            Ok(_) => Ok(LockState::Unlocked),
            Err(error) => {
                self.emit_unexpected(&error);
                Err(error.into())
            }
        }
    }

    /// Whether a live holder exists (not necessarily this handle).
    pub async fn is_locked(&self) -> CoordinationResult<bool> {
        Ok(matches!(self.get_state().await?, LockState::Owned { .. }))
    }

    /// Whether the key has no live holder.
    pub async fn is_expired(&self) -> CoordinationResult<bool> {
        Ok(matches!(self.get_state().await?, LockState::Unlocked))
    }

    /// Time until the current holder expires; `None` when unlocked or
    /// non-expiring.
    pub async fn remaining_time(&self) -> CoordinationResult<Option<TimeSpan>> {
        match self.get_state().await? {
            LockState::Owned {
                expiration: Some(expiration),
                ..
            } => Ok(Some(TimeSpan::from_millis(
                (expiration - Utc::now()).num_milliseconds(),
            ))),
            _ => Ok(None),
        }
    }

    /// Acquire, run `operation`, release. The release runs on every
    /// completion path of the closure.
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

    /// As [`Lock::run`] with a blocking acquisition.
    pub async fn run_blocking<T, F, Fut>(&self, operation: F) -> CoordinationResult<RunOutcome<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.acquire_blocking().await? {
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
    use crate::adapter::MemoryLockAdapter;
    use crate::core::Namespace;
    use crate::events::InMemoryEventBus;
    use std::time::Duration;

    fn lock_pair(key: &str, ttl: Option<TimeSpan>) -> (Lock, Lock) {
        let adapter: Arc<dyn LockAdapter> = Arc::new(MemoryLockAdapter::new());
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
        let ns = Namespace::new("test/lock");
        let make = |owner: &str| {
            Lock::new(
                ns.key(key),
                owner.to_string(),
                Arc::clone(&adapter),
                Arc::clone(&bus),
                ttl,
                TimeSpan::from_secs(60),
                BlockingOptions {
                    time: TimeSpan::from_millis(200),
                    interval: TimeSpan::from_millis(10),
                },
            )
        };
        (make("o1"), make("o2"))
    }

    #[tokio::test]
    async fn test_contention_scenario() {
        let (first, second) = lock_pair("contended", None);

        assert!(first.acquire().await.unwrap());
        assert!(!second.acquire().await.unwrap());
        assert!(!second.release().await.unwrap());
        assert!(first.release().await.unwrap());
        assert!(second.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_expiry_scenario() {
        let (first, second) = lock_pair("expiring", Some(TimeSpan::from_millis(50)));

        assert!(first.acquire().await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(second.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_or_fail_variants() {
        let (first, second) = lock_pair("or-fail", None);

        first.acquire_or_fail().await.unwrap();
        let error = second.acquire_or_fail().await.unwrap_err();
        assert!(matches!(error, CoordinationError::FailedAcquire(_)));

        let error = second.release_or_fail().await.unwrap_err();
        assert!(matches!(error, CoordinationError::FailedRelease(_)));

        let error = second.refresh_or_fail().await.unwrap_err();
        assert!(matches!(error, CoordinationError::FailedRefresh(_)));
    }

    #[tokio::test]
    async fn test_state_and_remaining_time() {
        let (lock, _) = lock_pair("state", Some(TimeSpan::from_secs(60)));

        assert_eq!(lock.get_state().await.unwrap(), LockState::Unlocked);
        assert!(lock.is_expired().await.unwrap());

        lock.acquire().await.unwrap();
        assert!(lock.is_locked().await.unwrap());
        let remaining = lock.remaining_time().await.unwrap().unwrap();
        assert!(remaining.as_millis() > 55_000 && remaining.as_millis() <= 60_000);

        lock.refresh_with(TimeSpan::from_secs(120)).await.unwrap();
        let extended = lock.remaining_time().await.unwrap().unwrap();
        assert!(extended.as_millis() > 115_000);
    }

    #[tokio::test]
    async fn test_non_expiring_lock_has_no_remaining_time() {
        let (lock, _) = lock_pair("forever", None);
        lock.acquire().await.unwrap();
        assert!(lock.remaining_time().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_blocking_acquisition_waits_for_release() {
        let (first, second) = lock_pair("blocking", None);
        first.acquire().await.unwrap();

        let waiter = tokio::spawn(async move { second.acquire_blocking().await });
        tokio::time::sleep(Duration::from_millis(40)).await;
        first.release().await.unwrap();

        assert!(waiter.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_blocking_acquisition_times_out() {
        let (first, second) = lock_pair("blocked", None);
        first.acquire().await.unwrap();
        assert!(!second.acquire_blocking().await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_blocking_acquisition() {
        use crate::core::{AbortReason, SignalController};

        let (first, second) = lock_pair("cancelled", None);
        first.acquire().await.unwrap();

        let (controller, signal) = SignalController::new();
        controller.abort(AbortReason::Cancelled("test".into()));
        let result = second
            .acquire_blocking_with(BlockingOptions::default(), &signal)
            .await;
        assert!(matches!(result, Err(CoordinationError::Aborted)));
    }

    #[tokio::test]
    async fn test_run_releases_on_completion() {
        let (first, second) = lock_pair("run", None);

        let outcome = first.run(|| async { 21 * 2 }).await.unwrap();
        assert_eq!(outcome.ok(), Some(42));

        // The lock is free again.
        assert!(second.acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_run_reports_unavailable() {
        let (first, second) = lock_pair("run-unavailable", None);
        first.acquire().await.unwrap();

        let outcome = second.run(|| async { () }).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_force_release_clears_any_owner() {
        let (first, second) = lock_pair("forced", None);
        first.acquire().await.unwrap();

        assert!(second.force_release().await.unwrap());
        assert!(second.acquire().await.unwrap());
    }
}

//! Shared reader/writer lock handle

use crate::adapter::{AdapterError, SharedLockAdapter, SharedLockRecord, SlotAcquire};
use crate::coordination::{
    BlockingOptions, CoordinationError, CoordinationResult, FailedAcquireLockError,
    FailedRefreshLockError, FailedReleaseLockError, LimitMismatchError,
};
use crate::core::{Key, Signal, TimeSpan};
use crate::events::{Event, EventBus, SharedLockEvent};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;

/// Observed state of a shared lock key: a writer, readers, or nothing.
/// Never both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SharedLockState {
    /// No live holder on either side.
    Unlocked,
    /// Held exclusively by one writer.
    WriterHeld {
        /// The writer's owner id.
        owner: String,
        /// Expiration instant; `None` never expires.
        expiration: Option<DateTime<Utc>>,
    },
    /// Held by one or more readers.
    ReadersHeld {
        /// Maximum simultaneous readers.
        limit: u32,
        /// Live reader slots.
        acquired: usize,
    },
}

/// A handle to one distributed reader/writer lock key.
///
/// The handle's id doubles as the writer owner id and the reader slot
/// id, so one handle can move between the two sides of the lock.
#[derive(Clone)]
pub struct SharedLock {
    key: Key,
    id: String,
    limit: u32,
    adapter: Arc<dyn SharedLockAdapter>,
    bus: Arc<dyn EventBus>,
    ttl: Option<TimeSpan>,
    refresh_ttl: TimeSpan,
    blocking: BlockingOptions,
}

impl SharedLock {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        key: Key,
        id: String,
        limit: u32,
        adapter: Arc<dyn SharedLockAdapter>,
        bus: Arc<dyn EventBus>,
        ttl: Option<TimeSpan>,
        refresh_ttl: TimeSpan,
        blocking: BlockingOptions,
    ) -> Self {
        Self {
            key,
            id,
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

    /// The id used as writer owner and reader slot id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The reader limit this handle expects.
    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub(crate) fn adapter_name(&self) -> &'static str {
        self.adapter.name()
    }

    pub(crate) fn ttl(&self) -> Option<TimeSpan> {
        self.ttl
    }

    fn emit(&self, event: SharedLockEvent) {
        self.bus.publish(Event::SharedLock(event));
    }

    fn emit_unexpected(&self, error: &AdapterError) {
        self.emit(SharedLockEvent::UnexpectedError {
            key: self.key.namespaced(),
            message: error.to_string(),
        });
    }

    fn expiration(&self) -> Option<DateTime<Utc>> {
        self.ttl.map(|ttl| ttl.end_date())
    }

    // ------------------------------------------------------------------
    // Writer side
    // ------------------------------------------------------------------

    /// Take the writer side; succeeds iff no live reader exists and the
    /// writer is absent, expired, or already this handle's.
    pub async fn acquire_writer(&self) -> CoordinationResult<bool> {
        match self
            .adapter
            .acquire_writer(&self.key, &self.id, self.expiration())
            .await
        {
            Ok(true) => {
                self.emit(SharedLockEvent::WriterAcquired {
                    key: self.key.namespaced(),
                    owner: self.id.clone(),
                    ttl: self.ttl,
                });
                Ok(true)
            }
            Ok(false) => {
                self.emit(SharedLockEvent::WriterUnavailable {
                    key: self.key.namespaced(),
                    owner: self.id.clone(),
                });
                Ok(false)
            }
            Err(error) => {
                self.emit_unexpected(&error);
                Err(error.into())
            }
        }
    }

    /// As [`SharedLock::acquire_writer`], failing instead of returning
    /// `false`.
    pub async fn acquire_writer_or_fail(&self) -> CoordinationResult<()> {
        if self.acquire_writer().await? {
            Ok(())
        } else {
            Err(FailedAcquireLockError {
                key: self.key.namespaced(),
            }
            .into())
        }
    }

    /// Retry [`SharedLock::acquire_writer`] on the handle's default
    /// budget.
    pub async fn acquire_writer_blocking(&self) -> CoordinationResult<bool> {
        let options = self.blocking;
        self.blocking_loop(options, &Signal::never(), |handle| async move {
            handle.acquire_writer().await
        })
        .await
    }

    /// Release the writer side; `true` iff this handle held it.
    pub async fn release_writer(&self) -> CoordinationResult<bool> {
        match self.adapter.release_writer(&self.key, &self.id).await {
            Ok(true) => {
                self.emit(SharedLockEvent::WriterReleased {
                    key: self.key.namespaced(),
                    owner: self.id.clone(),
                });
                Ok(true)
            }
            Ok(false) => {
                self.emit(SharedLockEvent::FailedWriterRelease {
                    key: self.key.namespaced(),
                    owner: self.id.clone(),
                });
                Ok(false)
            }
            Err(error) => {
                self.emit_unexpected(&error);
                Err(error.into())
            }
        }
    }

    /// As [`SharedLock::release_writer`], failing instead of returning
    /// `false`.
    pub async fn release_writer_or_fail(&self) -> CoordinationResult<()> {
        if self.release_writer().await? {
            Ok(())
        } else {
            Err(FailedReleaseLockError {
                key: self.key.namespaced(),
            }
            .into())
        }
    }

    /// Remove the writer regardless of owner.
    pub async fn force_release_writer(&self) -> CoordinationResult<bool> {
        match self.adapter.force_release_writer(&self.key).await {
            Ok(removed) => {
                if removed {
                    self.emit(SharedLockEvent::WriterForceReleased {
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

    /// Move the writer expiration forward; requires this handle to hold
    /// a writer with a non-null expiration.
    pub async fn refresh_writer(&self) -> CoordinationResult<bool> {
        self.refresh_writer_with(self.refresh_ttl).await
    }

    /// As [`SharedLock::refresh_writer`] with an explicit TTL.
    pub async fn refresh_writer_with(&self, ttl: TimeSpan) -> CoordinationResult<bool> {
        match self
            .adapter
            .refresh_writer(&self.key, &self.id, ttl.end_date())
            .await
        {
            Ok(true) => {
                self.emit(SharedLockEvent::WriterRefreshed {
                    key: self.key.namespaced(),
                    owner: self.id.clone(),
                    ttl,
                });
                Ok(true)
            }
            Ok(false) => {
                self.emit(SharedLockEvent::FailedWriterRefresh {
                    key: self.key.namespaced(),
                    owner: self.id.clone(),
                });
                Ok(false)
            }
            Err(error) => {
                self.emit_unexpected(&error);
                Err(error.into())
            }
        }
    }

    /// As [`SharedLock::refresh_writer`], failing instead of returning
    /// `false`.
    pub async fn refresh_writer_or_fail(&self) -> CoordinationResult<()> {
        if self.refresh_writer().await? {
            Ok(())
        } else {
            Err(FailedRefreshLockError {
                key: self.key.namespaced(),
            }
            .into())
        }
    }

    // ------------------------------------------------------------------
    // Reader side
    // ------------------------------------------------------------------

    /// Take a reader slot; succeeds iff no live writer exists and
    /// capacity remains. Re-acquiring this handle's slot is idempotent.
    pub async fn acquire_reader(&self) -> CoordinationResult<bool> {
        match self
            .adapter
            .acquire_reader(&self.key, &self.id, self.limit, self.expiration())
            .await
        {
            Ok(SlotAcquire::Acquired) => {
                self.emit(SharedLockEvent::ReaderAcquired {
                    key: self.key.namespaced(),
                    slot_id: self.id.clone(),
                    ttl: self.ttl,
                });
                Ok(true)
            }
            Ok(SlotAcquire::Unavailable) => {
                self.emit(SharedLockEvent::ReaderUnavailable {
                    key: self.key.namespaced(),
                    slot_id: self.id.clone(),
                });
                Ok(false)
            }
            Ok(SlotAcquire::LimitMismatch { stored }) => Err(LimitMismatchError {
                key: self.key.namespaced(),
                stored,
                requested: self.limit,
            }
            .into()),
            Err(error) => {
                self.emit_unexpected(&error);
                Err(error.into())
            }
        }
    }

    /// As [`SharedLock::acquire_reader`], failing instead of returning
    /// `false`.
    pub async fn acquire_reader_or_fail(&self) -> CoordinationResult<()> {
        if self.acquire_reader().await? {
            Ok(())
        } else {
            Err(FailedAcquireLockError {
                key: self.key.namespaced(),
            }
            .into())
        }
    }

    /// Retry [`SharedLock::acquire_reader`] on the handle's default
    /// budget.
    pub async fn acquire_reader_blocking(&self) -> CoordinationResult<bool> {
        let options = self.blocking;
        self.blocking_loop(options, &Signal::never(), |handle| async move {
            handle.acquire_reader().await
        })
        .await
    }

    /// Release this handle's reader slot; removing the last slot frees
    /// the key for a writer.
    pub async fn release_reader(&self) -> CoordinationResult<bool> {
        match self.adapter.release_reader(&self.key, &self.id).await {
            Ok(true) => {
                self.emit(SharedLockEvent::ReaderReleased {
                    key: self.key.namespaced(),
                    slot_id: self.id.clone(),
                });
                Ok(true)
            }
            Ok(false) => {
                self.emit(SharedLockEvent::FailedReaderRelease {
                    key: self.key.namespaced(),
                    slot_id: self.id.clone(),
                });
                Ok(false)
            }
            Err(error) => {
                self.emit_unexpected(&error);
                Err(error.into())
            }
        }
    }

    /// As [`SharedLock::release_reader`], failing instead of returning
    /// `false`.
    pub async fn release_reader_or_fail(&self) -> CoordinationResult<()> {
        if self.release_reader().await? {
            Ok(())
        } else {
            Err(FailedReleaseLockError {
                key: self.key.namespaced(),
            }
            .into())
        }
    }

    /// Move this reader slot's expiration forward; requires a held slot
    /// with a non-null expiration.
    pub async fn refresh_reader(&self) -> CoordinationResult<bool> {
        self.refresh_reader_with(self.refresh_ttl).await
    }

    /// As [`SharedLock::refresh_reader`] with an explicit TTL.
    pub async fn refresh_reader_with(&self, ttl: TimeSpan) -> CoordinationResult<bool> {
        match self
            .adapter
            .refresh_reader(&self.key, &self.id, ttl.end_date())
            .await
        {
            Ok(true) => {
                self.emit(SharedLockEvent::ReaderRefreshed {
                    key: self.key.namespaced(),
                    slot_id: self.id.clone(),
                    ttl,
                });
                Ok(true)
            }
            Ok(false) => {
                self.emit(SharedLockEvent::FailedReaderRefresh {
                    key: self.key.namespaced(),
                    slot_id: self.id.clone(),
                });
                Ok(false)
            }
            Err(error) => {
                self.emit_unexpected(&error);
                Err(error.into())
            }
        }
    }

    /// Remove every reader slot atomically; returns how many were
    /// removed.
    pub async fn force_release_all_readers(&self) -> CoordinationResult<u64> {
        match self.adapter.force_release_all_readers(&self.key).await {
            Ok(count) => {
                self.emit(SharedLockEvent::AllReadersForceReleased {
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

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    /// The current state of the key; expired holders read as absent,
    /// and at most one side is ever reported.
    pub async fn get_state(&self) -> CoordinationResult<SharedLockState> {
        let now = Utc::now();
        match self.adapter.find(&self.key).await {
            Ok(Some(SharedLockRecord::Writer(writer))) if !writer.is_expired(now) => {
                Ok(SharedLockState::WriterHeld {
                    owner: writer.owner,
                    expiration: writer.expiration,
                })
            }
            Ok(Some(SharedLockRecord::Readers(readers))) => {
                let acquired = readers.live_slots(now);
                if acquired > 0 {
                    Ok(SharedLockState::ReadersHeld {
                        limit: readers.limit,
                        acquired,
                    })
                } else {
                    Ok(SharedLockState::Unlocked)
                }
            }
            Ok(_) => Ok(SharedLockState::Unlocked),
            Err(error) => {
                self.emit_unexpected(&error);
                Err(error.into())
            }
        }
    }

    async fn blocking_loop<F, Fut>(
        &self,
        options: BlockingOptions,
        signal: &Signal,
        attempt: F,
    ) -> CoordinationResult<bool>
    where
        F: Fn(SharedLock) -> Fut,
        Fut: std::future::Future<Output = CoordinationResult<bool>>,
    {
        let deadline = Instant::now() + options.time.to_duration_clamped();
        loop {
            if signal.is_aborted() {
                return Err(CoordinationError::Aborted);
            }
            if attempt(self.clone()).await? {
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
}

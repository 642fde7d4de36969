//! Coordination primitives
//!
//! Provider facades and handles for the exclusive lock, the shared
//! reader/writer lock and the counting semaphore. A provider binds a
//! namespace, an adapter, an event bus and defaults; handles carry an
//! owner (or slot) id and run the ownership protocol against the
//! adapter, emitting an event for every mutating operation.

pub mod lock;
pub mod provider;
pub mod rwlock;
pub mod semaphore;
pub mod serde;

pub use lock::{Lock, LockState};
pub use provider::{
    LockProvider, LockProviderConfig, SemaphoreProvider, SemaphoreProviderConfig,
    SharedLockProvider, SharedLockProviderConfig,
};
pub use rwlock::{SharedLock, SharedLockState};
pub use semaphore::{Semaphore, SemaphoreState};
pub use self::serde::{HandleRegistry, SerializedLock, SerializedSemaphore, SerializedSharedLock};

use crate::adapter::AdapterError;
use crate::core::TimeSpan;
use thiserror::Error;

/// Default TTL handles acquire with.
pub const DEFAULT_TTL: TimeSpan = TimeSpan::from_minutes(5);
/// Default TTL applied by `refresh`.
pub const DEFAULT_REFRESH_TTL: TimeSpan = TimeSpan::from_minutes(5);
/// Default pause between blocking acquisition attempts.
pub const DEFAULT_BLOCKING_INTERVAL: TimeSpan = TimeSpan::from_millis(50);
/// Default total budget of a blocking acquisition.
pub const DEFAULT_BLOCKING_TIME: TimeSpan = TimeSpan::from_secs(1);

/// The lock could not be acquired because another holder is live.
#[derive(Debug, Clone, Error)]
#[error("failed to acquire lock '{key}'")]
pub struct FailedAcquireLockError {
    /// The namespaced key.
    pub key: String,
}

/// The release found the key not held by the caller.
#[derive(Debug, Clone, Error)]
#[error("failed to release lock '{key}': not held by this owner")]
pub struct FailedReleaseLockError {
    /// The namespaced key.
    pub key: String,
}

/// The refresh found the key not held by the caller (or not
/// refreshable).
#[derive(Debug, Clone, Error)]
#[error("failed to refresh lock '{key}': not held by this owner")]
pub struct FailedRefreshLockError {
    /// The namespaced key.
    pub key: String,
}

/// The semaphore exists with a different limit.
#[derive(Debug, Clone, Error)]
#[error("semaphore '{key}' limit mismatch: stored {stored}, requested {requested}")]
pub struct LimitMismatchError {
    /// The namespaced key.
    pub key: String,
    /// Limit the semaphore was created with.
    pub stored: u32,
    /// Limit the caller requested.
    pub requested: u32,
}

/// Errors surfaced by coordination handles.
///
/// Contention failures are only raised by the `*_or_fail` variants; the
/// plain variants report them as `false` returns.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// See [`FailedAcquireLockError`].
    #[error(transparent)]
    FailedAcquire(#[from] FailedAcquireLockError),

    /// See [`FailedReleaseLockError`].
    #[error(transparent)]
    FailedRelease(#[from] FailedReleaseLockError),

    /// See [`FailedRefreshLockError`].
    #[error(transparent)]
    FailedRefresh(#[from] FailedRefreshLockError),

    /// See [`LimitMismatchError`].
    #[error(transparent)]
    LimitMismatch(#[from] LimitMismatchError),

    /// A backend failure, preserved as the cause.
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// A blocking acquisition was cancelled before completing.
    #[error("operation aborted")]
    Aborted,
}

/// Result alias for coordination operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Budget of a blocking acquisition: retry every `interval` until
/// success or `time` has elapsed.
#[derive(Debug, Clone, Copy)]
pub struct BlockingOptions {
    /// Total time budget.
    pub time: TimeSpan,
    /// Pause between attempts.
    pub interval: TimeSpan,
}

impl Default for BlockingOptions {
    fn default() -> Self {
        Self {
            time: DEFAULT_BLOCKING_TIME,
            interval: DEFAULT_BLOCKING_INTERVAL,
        }
    }
}

/// Outcome of a `run` scope.
#[derive(Debug)]
pub enum RunOutcome<T> {
    /// The lock was held and the closure ran to completion; the lock
    /// has been released again.
    Completed(T),
    /// The lock was unavailable; the closure never ran.
    Unavailable(FailedAcquireLockError),
}

impl<T> RunOutcome<T> {
    /// The value of a completed run.
    pub fn ok(self) -> Option<T> {
        match self {
            RunOutcome::Completed(value) => Some(value),
            RunOutcome::Unavailable(_) => None,
        }
    }

    /// Convert to a `Result`, with the acquisition failure as error.
    pub fn into_result(self) -> Result<T, FailedAcquireLockError> {
        match self {
            RunOutcome::Completed(value) => Ok(value),
            RunOutcome::Unavailable(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_outcome_conversions() {
        let completed: RunOutcome<u32> = RunOutcome::Completed(7);
        assert_eq!(completed.ok(), Some(7));

        let unavailable: RunOutcome<u32> = RunOutcome::Unavailable(FailedAcquireLockError {
            key: "k".to_string(),
        });
        assert!(unavailable.into_result().is_err());
    }

    #[test]
    fn test_blocking_defaults() {
        let options = BlockingOptions::default();
        assert_eq!(options.time.as_millis(), 1_000);
        assert_eq!(options.interval.as_millis(), 50);
    }
}

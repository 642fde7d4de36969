//! Storage adapters
//!
//! Every coordination primitive is defined against two adapter shapes:
//!
//! - **Rich adapters** expose the compound operations (`acquire`,
//!   `release`, `refresh`, `find`) as single atomic calls. Backends
//!   with native compound atomicity (in-memory maps, Redis scripts)
//!   implement these directly.
//! - **Database adapters** expose primitive single-statement CAS
//!   operations; the bridges in [`bridge`] compose them into the rich
//!   shape. This is the only place the backend shape leaks.
//!
//! Expirations are wall-clock `DateTime<Utc>` values, persisted as
//! milliseconds since the epoch. An entry whose expiration is `<= now`
//! is treated as absent by every read path; background sweeping is a
//! space optimization, never a correctness requirement.

pub mod bridge;
pub mod contracts;
pub mod memory;
pub mod mysql;
pub mod redis;
pub mod resilient;
pub mod sqlite;
pub mod sweeper;

pub use bridge::{DatabaseCacheBridge, DatabaseLockBridge, DatabaseSemaphoreBridge, DatabaseSharedLockBridge};
pub use contracts::{
    AdapterLifecycle, CacheAdapter, CacheRecord, CircuitBreakerStore, DatabaseCacheAdapter,
    DatabaseLockAdapter, DatabaseSemaphoreAdapter, DatabaseSharedLockAdapter, IncrementOutcome,
    LockAdapter, LockRecord, SemaphoreAdapter, SemaphoreRecord, SharedLockAdapter,
    SharedLockRecord, SlotAcquire,
};
pub use memory::{
    MemoryCacheAdapter, MemoryCircuitBreakerStore, MemoryLockAdapter, MemorySemaphoreAdapter,
    MemorySharedLockAdapter,
};
pub use resilient::{
    ResilienceOptions, ResilientCacheAdapter, ResilientLockAdapter, ResilientSemaphoreAdapter,
    ResilientSharedLockAdapter,
};
pub use sweeper::{ExpiredKeySweeper, SweeperConfig};

use thiserror::Error;

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// An insert hit an existing live entry.
    #[error("entry already exists for key '{key}'")]
    Duplicate {
        /// The namespaced key.
        key: String,
    },

    /// A numeric operation hit a non-numeric stored value.
    #[error("stored value for key '{key}' is not numeric")]
    NotNumeric {
        /// The namespaced key.
        key: String,
    },

    /// An underlying SQL driver error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An underlying Redis driver error.
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    /// A value could not be serialized or deserialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other backend failure.
    #[error("adapter error: {0}")]
    Other(String),
}

impl AdapterError {
    /// Whether this error is the duplicate-entry CAS signal.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, AdapterError::Duplicate { .. })
    }
}

/// Result alias for adapter operations.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Parse a stored JSON value as a number.
pub(crate) fn parse_json_number(value: &str) -> Option<f64> {
    serde_json::from_str::<serde_json::Value>(value)
        .ok()
        .and_then(|v| v.as_f64())
}

/// Render a number as stored JSON, keeping integral values as integers
/// so round-trips stay stable.
pub(crate) fn format_json_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < (i64::MAX as f64) {
        (value as i64).to_string()
    } else {
        value.to_string()
    }
}

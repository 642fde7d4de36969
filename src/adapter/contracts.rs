//! Adapter contracts
//!
//! The rich traits are what the engines and facades consume; the
//! database traits are the primitive CAS surface a transactional SQL
//! backend implements, lifted to the rich shape by [`crate::adapter::bridge`].

use crate::adapter::AdapterResult;
use crate::breaker::BreakerState;
use crate::core::Key;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The stored state of an exclusive or writer lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Opaque identifier the holder uses to prove ownership.
    pub owner: String,
    /// Expiration instant; `None` never expires.
    pub expiration: Option<DateTime<Utc>>,
}

impl LockRecord {
    /// Whether the record is expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.map_or(false, |expiration| expiration <= now)
    }
}

/// The stored state of a semaphore (or reader-semaphore): a fixed limit
/// and the currently-held slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemaphoreRecord {
    /// Maximum number of simultaneously-held slots.
    pub limit: u32,
    /// Held slots by id, each with its own optional expiration.
    pub slots: BTreeMap<String, Option<DateTime<Utc>>>,
}

impl SemaphoreRecord {
    /// Slots that have not expired at `now`.
    pub fn live_slots(&self, now: DateTime<Utc>) -> usize {
        self.slots
            .values()
            .filter(|expiration| expiration.map_or(true, |e| e > now))
            .count()
    }

    /// Whether `slot_id` is held and live at `now`.
    pub fn holds(&self, slot_id: &str, now: DateTime<Utc>) -> bool {
        self.slots
            .get(slot_id)
            .map_or(false, |expiration| expiration.map_or(true, |e| e > now))
    }
}

/// The stored state of a shared lock: a writer or a reader set, never
/// both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharedLockRecord {
    /// Held exclusively by one writer.
    Writer(LockRecord),
    /// Held by up to `limit` readers.
    Readers(SemaphoreRecord),
}

/// A stored cache entry: a serialized value plus its expiration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// The serialized (JSON) value.
    pub value: String,
    /// Expiration instant; `None` never expires.
    pub expiration: Option<DateTime<Utc>>,
}

impl CacheRecord {
    /// Whether the entry is expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.map_or(false, |expiration| expiration <= now)
    }
}

/// Outcome of acquiring a semaphore or reader slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAcquire {
    /// The slot is now held (idempotent for a slot id already held).
    Acquired,
    /// Capacity is exhausted, or a writer interlock blocked the slot.
    Unavailable,
    /// The record exists with a different limit.
    LimitMismatch {
        /// The limit the record was created with.
        stored: u32,
    },
}

/// Outcome of a numeric increment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IncrementOutcome {
    /// The entry was incremented (created at the delta when absent);
    /// carries the new value.
    Updated(f64),
    /// The stored value is not numeric.
    NotNumeric,
}

// ============================================================================
// Rich adapter contracts
// ============================================================================

/// Compound atomic operations for an exclusive lock.
#[async_trait]
pub trait LockAdapter: Send + Sync {
    /// Stable adapter identifier, used by the handle registry.
    fn name(&self) -> &'static str;

    /// Take ownership of `key` for `owner`. Succeeds when the key is
    /// absent or its current record is expired; never succeeds against
    /// a live record, not even the owner's own.
    async fn acquire(
        &self,
        key: &Key,
        owner: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<bool>;

    /// Release `key` when held by `owner`; `true` iff a record was
    /// removed.
    async fn release(&self, key: &Key, owner: &str) -> AdapterResult<bool>;

    /// Release `key` regardless of owner; `true` iff a record was
    /// removed.
    async fn force_release(&self, key: &Key) -> AdapterResult<bool>;

    /// Move the expiration of `owner`'s live record; `true` iff a
    /// record was updated.
    async fn refresh(&self, key: &Key, owner: &str, expiration: DateTime<Utc>)
        -> AdapterResult<bool>;

    /// Read the raw record. Callers interpret expiration.
    async fn find(&self, key: &Key) -> AdapterResult<Option<LockRecord>>;
}

/// Compound atomic operations for a reader/writer shared lock.
#[async_trait]
pub trait SharedLockAdapter: Send + Sync {
    /// Stable adapter identifier, used by the handle registry.
    fn name(&self) -> &'static str;

    /// Take the writer side: succeeds iff no live reader slot exists
    /// and the writer record is absent, expired, or already owned by
    /// `owner`.
    async fn acquire_writer(
        &self,
        key: &Key,
        owner: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<bool>;

    /// Release the writer when held by `owner`.
    async fn release_writer(&self, key: &Key, owner: &str) -> AdapterResult<bool>;

    /// Move the writer expiration; requires a live record with a
    /// non-null expiration owned by `owner`.
    async fn refresh_writer(
        &self,
        key: &Key,
        owner: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<bool>;

    /// Remove the writer record regardless of owner.
    async fn force_release_writer(&self, key: &Key) -> AdapterResult<bool>;

    /// Take a reader slot: succeeds iff no live writer exists and
    /// either no reader record exists (created with `limit`) or live
    /// slots are below the stored limit. Re-acquiring a held slot id is
    /// idempotent.
    async fn acquire_reader(
        &self,
        key: &Key,
        slot_id: &str,
        limit: u32,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<SlotAcquire>;

    /// Release one reader slot; removing the last slot removes the
    /// reader record.
    async fn release_reader(&self, key: &Key, slot_id: &str) -> AdapterResult<bool>;

    /// Move one reader slot's expiration; requires a live slot with a
    /// non-null expiration.
    async fn refresh_reader(
        &self,
        key: &Key,
        slot_id: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<bool>;

    /// Remove every reader slot atomically; returns how many were
    /// removed.
    async fn force_release_all_readers(&self, key: &Key) -> AdapterResult<u64>;

    /// Read the raw record: at most one of writer/readers.
    async fn find(&self, key: &Key) -> AdapterResult<Option<SharedLockRecord>>;
}

/// Compound atomic operations for a counting semaphore.
#[async_trait]
pub trait SemaphoreAdapter: Send + Sync {
    /// Stable adapter identifier, used by the handle registry.
    fn name(&self) -> &'static str;

    /// Take a slot. The limit is established by the first acquisition
    /// and must match on subsequent calls. Re-acquiring a held slot id
    /// is idempotent.
    async fn acquire(
        &self,
        key: &Key,
        slot_id: &str,
        limit: u32,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<SlotAcquire>;

    /// Release one slot; removing the last slot removes the record.
    async fn release(&self, key: &Key, slot_id: &str) -> AdapterResult<bool>;

    /// Move one slot's expiration; requires a live slot with a non-null
    /// expiration.
    async fn refresh(
        &self,
        key: &Key,
        slot_id: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<bool>;

    /// Remove every slot atomically; returns how many were removed.
    async fn force_release_all(&self, key: &Key) -> AdapterResult<u64>;

    /// Read the raw record. Callers interpret expiration.
    async fn find(&self, key: &Key) -> AdapterResult<Option<SemaphoreRecord>>;
}

/// Compound atomic operations for a key/value cache.
#[async_trait]
pub trait CacheAdapter: Send + Sync {
    /// Stable adapter identifier.
    fn name(&self) -> &'static str;

    /// Read the raw entry. Callers interpret expiration.
    async fn find(&self, key: &Key) -> AdapterResult<Option<CacheRecord>>;

    /// Insert the entry iff absent or expired; `true` iff it was
    /// written.
    async fn insert(
        &self,
        key: &Key,
        value: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<bool>;

    /// Write the entry unconditionally; `true` iff a live entry was
    /// replaced.
    async fn upsert(
        &self,
        key: &Key,
        value: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<bool>;

    /// Overwrite the value of a live entry, keeping its expiration;
    /// `true` iff an entry was updated.
    async fn update(&self, key: &Key, value: &str) -> AdapterResult<bool>;

    /// Remove the entry; `true` iff one was removed.
    async fn remove(&self, key: &Key) -> AdapterResult<bool>;

    /// Add `delta` to a numeric entry, creating it at `delta` when
    /// absent.
    async fn increment(&self, key: &Key, delta: f64) -> AdapterResult<IncrementOutcome>;

    /// Remove every entry under a namespace prefix; returns how many
    /// were removed.
    async fn remove_namespace(&self, prefix: &str) -> AdapterResult<u64>;
}

/// Storage for circuit-breaker state, parameterized by the policy's
/// metrics type.
#[async_trait]
pub trait CircuitBreakerStore<M>: Send + Sync
where
    M: Clone + Send + Sync + 'static,
{
    /// Stable adapter identifier.
    fn name(&self) -> &'static str;

    /// Read the current state.
    async fn load(&self, key: &Key) -> AdapterResult<Option<BreakerState<M>>>;

    /// Atomically read the current state, apply `update`, and persist
    /// the result when the second element of the returned pair is
    /// `true`. Returns the effective state.
    async fn atomic_update(
        &self,
        key: &Key,
        update: &(dyn Fn(Option<BreakerState<M>>) -> (BreakerState<M>, bool) + Send + Sync),
    ) -> AdapterResult<BreakerState<M>>;
}

/// Optional adapter lifecycle: schema management and expired-key
/// sweeping.
#[async_trait]
pub trait AdapterLifecycle: Send + Sync {
    /// Create tables, indexes or other backend structures.
    async fn init(&self) -> AdapterResult<()> {
        Ok(())
    }

    /// Drop the structures created by [`AdapterLifecycle::init`].
    async fn de_init(&self) -> AdapterResult<()> {
        Ok(())
    }

    /// Remove expired entries; returns how many were removed.
    async fn remove_all_expired(&self) -> AdapterResult<u64> {
        Ok(0)
    }
}

// ============================================================================
// Database adapter contracts
// ============================================================================

/// Primitive single-statement CAS operations for an exclusive lock.
#[async_trait]
pub trait DatabaseLockAdapter: Send + Sync {
    /// Stable adapter identifier.
    fn name(&self) -> &'static str;

    /// Insert a record; fails with [`crate::adapter::AdapterError::Duplicate`]
    /// when one exists.
    async fn insert(
        &self,
        key: &Key,
        owner: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<()>;

    /// Overwrite the record iff its stored expiration is `<= now`;
    /// returns the affected row count.
    async fn update_if_expired(
        &self,
        key: &Key,
        owner: &str,
        expiration: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> AdapterResult<u64>;

    /// Move the expiration iff `owner` holds the record; returns the
    /// affected row count.
    async fn update_expiration_if_owner(
        &self,
        key: &Key,
        owner: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<u64>;

    /// Delete the record iff `owner` holds it; returns the prior record
    /// when one was removed.
    async fn remove_if_owner(&self, key: &Key, owner: &str) -> AdapterResult<Option<LockRecord>>;

    /// Delete the record unconditionally; returns the affected row
    /// count.
    async fn remove(&self, key: &Key) -> AdapterResult<u64>;

    /// Read the raw record.
    async fn find(&self, key: &Key) -> AdapterResult<Option<LockRecord>>;
}

/// Primitive single-statement operations for a counting semaphore.
#[async_trait]
pub trait DatabaseSemaphoreAdapter: Send + Sync {
    /// Stable adapter identifier.
    fn name(&self) -> &'static str;

    /// Read the stored limit, when the record exists.
    async fn find_record(&self, key: &Key) -> AdapterResult<Option<u32>>;

    /// Create the record; fails with `Duplicate` when present.
    async fn insert_record(&self, key: &Key, limit: u32) -> AdapterResult<()>;

    /// Whether `slot_id` is held and live at `now`.
    async fn slot_exists(&self, key: &Key, slot_id: &str, now: DateTime<Utc>)
        -> AdapterResult<bool>;

    /// Insert a slot iff live slots held by other ids are below
    /// `limit`; returns the affected row count.
    async fn insert_slot_if_capacity(
        &self,
        key: &Key,
        slot_id: &str,
        limit: u32,
        expiration: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> AdapterResult<u64>;

    /// Unconditionally move a held slot's expiration.
    async fn set_slot_expiration(
        &self,
        key: &Key,
        slot_id: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<u64>;

    /// Move a held slot's expiration iff its current expiration is
    /// non-null.
    async fn refresh_slot(
        &self,
        key: &Key,
        slot_id: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<u64>;

    /// Remove one slot; returns the affected row count.
    async fn remove_slot(&self, key: &Key, slot_id: &str) -> AdapterResult<u64>;

    /// Remove every slot; returns the affected row count.
    async fn remove_all_slots(&self, key: &Key) -> AdapterResult<u64>;

    /// Remove the record when it has no slots left.
    async fn remove_record_if_empty(&self, key: &Key) -> AdapterResult<u64>;

    /// Read all held slots.
    async fn load_slots(
        &self,
        key: &Key,
    ) -> AdapterResult<Vec<(String, Option<DateTime<Utc>>)>>;
}

/// Primitive single-statement operations for a shared lock: the writer
/// side plus a reader-semaphore side, each statement enforcing the
/// cross-side interlock.
#[async_trait]
pub trait DatabaseSharedLockAdapter: Send + Sync {
    /// Stable adapter identifier.
    fn name(&self) -> &'static str;

    /// Insert the writer iff no live reader slot exists; `false` when
    /// readers block it, `Duplicate` when a writer record exists.
    async fn insert_writer(
        &self,
        key: &Key,
        owner: &str,
        expiration: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> AdapterResult<bool>;

    /// Overwrite the writer iff it is expired or already owned by
    /// `owner`, and no live reader slot exists.
    async fn update_writer_if_reacquirable(
        &self,
        key: &Key,
        owner: &str,
        expiration: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> AdapterResult<u64>;

    /// Delete the writer iff `owner` holds it.
    async fn remove_writer_if_owner(&self, key: &Key, owner: &str) -> AdapterResult<u64>;

    /// Delete the writer unconditionally.
    async fn remove_writer(&self, key: &Key) -> AdapterResult<u64>;

    /// Move the writer expiration iff `owner` holds it and the current
    /// expiration is non-null.
    async fn refresh_writer_if_owner(
        &self,
        key: &Key,
        owner: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<u64>;

    /// Read the raw writer record.
    async fn find_writer(&self, key: &Key) -> AdapterResult<Option<LockRecord>>;

    /// Read the stored reader limit, when the record exists.
    async fn find_reader_record(&self, key: &Key) -> AdapterResult<Option<u32>>;

    /// Create the reader record; fails with `Duplicate` when present.
    async fn insert_reader_record(&self, key: &Key, limit: u32) -> AdapterResult<()>;

    /// Whether `slot_id` is held and live at `now`.
    async fn reader_slot_exists(
        &self,
        key: &Key,
        slot_id: &str,
        now: DateTime<Utc>,
    ) -> AdapterResult<bool>;

    /// Insert a reader slot iff no live writer exists and live slots
    /// held by other ids are below `limit`.
    async fn insert_reader_slot_if_allowed(
        &self,
        key: &Key,
        slot_id: &str,
        limit: u32,
        expiration: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> AdapterResult<u64>;

    /// Unconditionally move a held reader slot's expiration.
    async fn set_reader_slot_expiration(
        &self,
        key: &Key,
        slot_id: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<u64>;

    /// Move a held reader slot's expiration iff its current expiration
    /// is non-null.
    async fn refresh_reader_slot(
        &self,
        key: &Key,
        slot_id: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<u64>;

    /// Remove one reader slot.
    async fn remove_reader_slot(&self, key: &Key, slot_id: &str) -> AdapterResult<u64>;

    /// Remove every reader slot.
    async fn remove_all_reader_slots(&self, key: &Key) -> AdapterResult<u64>;

    /// Remove the reader record when it has no slots left.
    async fn remove_reader_record_if_empty(&self, key: &Key) -> AdapterResult<u64>;

    /// Read all held reader slots.
    async fn load_reader_slots(
        &self,
        key: &Key,
    ) -> AdapterResult<Vec<(String, Option<DateTime<Utc>>)>>;
}

/// Primitive single-statement operations for a cache.
#[async_trait]
pub trait DatabaseCacheAdapter: Send + Sync {
    /// Stable adapter identifier.
    fn name(&self) -> &'static str;

    /// Insert an entry; fails with `Duplicate` when one exists.
    async fn insert(
        &self,
        key: &Key,
        value: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<()>;

    /// Overwrite the entry iff its stored expiration is `<= now`.
    async fn update_if_expired(
        &self,
        key: &Key,
        value: &str,
        expiration: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> AdapterResult<u64>;

    /// Overwrite the value of a live entry, keeping its expiration.
    async fn update_if_live(
        &self,
        key: &Key,
        value: &str,
        now: DateTime<Utc>,
    ) -> AdapterResult<u64>;

    /// Write the entry unconditionally.
    async fn replace(
        &self,
        key: &Key,
        value: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<()>;

    /// Delete the entry; returns the affected row count.
    async fn remove(&self, key: &Key) -> AdapterResult<u64>;

    /// Add `delta` to a live numeric entry; distinguishes missing from
    /// non-numeric via the returned outcome of the bridge. Returns the
    /// affected row count, or `NotNumeric` through an error-free probe.
    async fn increment_if_numeric(
        &self,
        key: &Key,
        delta: f64,
        now: DateTime<Utc>,
    ) -> AdapterResult<u64>;

    /// Read the raw entry.
    async fn find(&self, key: &Key) -> AdapterResult<Option<CacheRecord>>;

    /// Remove every entry under a namespace prefix.
    async fn remove_prefixed(&self, prefix: &str) -> AdapterResult<u64>;
}

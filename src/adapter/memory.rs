//! In-memory adapters
//!
//! Test-grade rich adapters backed by `DashMap`. Compound operations
//! run under the map's shard lock, which gives them the same atomicity
//! the SQL backends get from single-statement CAS. Expired entries are
//! dropped lazily on access and by [`AdapterLifecycle::remove_all_expired`].

use crate::adapter::contracts::{
    AdapterLifecycle, CacheAdapter, CacheRecord, CircuitBreakerStore, IncrementOutcome,
    LockAdapter, LockRecord, SemaphoreAdapter, SemaphoreRecord, SharedLockAdapter,
    SharedLockRecord, SlotAcquire,
};
use crate::adapter::{format_json_number, parse_json_number, AdapterResult};
use crate::breaker::BreakerState;
use crate::core::Key;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;

const ADAPTER_NAME: &str = "memory";

// ============================================================================
// Lock
// ============================================================================

/// In-memory exclusive lock adapter.
#[derive(Debug, Default)]
pub struct MemoryLockAdapter {
    locks: DashMap<String, LockRecord>,
}

impl MemoryLockAdapter {
    /// Create an empty adapter.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockAdapter for MemoryLockAdapter {
    fn name(&self) -> &'static str {
        ADAPTER_NAME
    }

    async fn acquire(
        &self,
        key: &Key,
        owner: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<bool> {
        let now = Utc::now();
        let record = LockRecord {
            owner: owner.to_string(),
            expiration,
        };
        match self.locks.entry(key.namespaced()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(record);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(record);
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &Key, owner: &str) -> AdapterResult<bool> {
        let removed = self
            .locks
            .remove_if(&key.namespaced(), |_, record| record.owner == owner);
        Ok(removed.is_some())
    }

    async fn force_release(&self, key: &Key) -> AdapterResult<bool> {
        Ok(self.locks.remove(&key.namespaced()).is_some())
    }

    async fn refresh(
        &self,
        key: &Key,
        owner: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<bool> {
        if let Some(mut record) = self.locks.get_mut(&key.namespaced()) {
            if record.owner == owner {
                record.expiration = Some(expiration);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn find(&self, key: &Key) -> AdapterResult<Option<LockRecord>> {
        Ok(self.locks.get(&key.namespaced()).map(|r| r.clone()))
    }
}

#[async_trait]
impl AdapterLifecycle for MemoryLockAdapter {
    async fn remove_all_expired(&self) -> AdapterResult<u64> {
        let now = Utc::now();
        let before = self.locks.len();
        self.locks.retain(|_, record| !record.is_expired(now));
        Ok((before - self.locks.len()) as u64)
    }
}

// ============================================================================
// Shared lock
// ============================================================================

/// In-memory reader/writer shared lock adapter.
#[derive(Debug, Default)]
pub struct MemorySharedLockAdapter {
    entries: DashMap<String, SharedLockRecord>,
}

impl MemorySharedLockAdapter {
    /// Create an empty adapter.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedLockAdapter for MemorySharedLockAdapter {
    fn name(&self) -> &'static str {
        ADAPTER_NAME
    }

    async fn acquire_writer(
        &self,
        key: &Key,
        owner: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<bool> {
        let now = Utc::now();
        let record = SharedLockRecord::Writer(LockRecord {
            owner: owner.to_string(),
            expiration,
        });
        match self.entries.entry(key.namespaced()) {
            Entry::Vacant(vacant) => {
                vacant.insert(record);
                Ok(true)
            }
            Entry::Occupied(mut occupied) => match occupied.get() {
                SharedLockRecord::Readers(readers) => {
                    if readers.live_slots(now) > 0 {
                        Ok(false)
                    } else {
                        occupied.insert(record);
                        Ok(true)
                    }
                }
                SharedLockRecord::Writer(current) => {
                    if current.is_expired(now) || current.owner == owner {
                        occupied.insert(record);
                        Ok(true)
                    } else {
                        Ok(false)
                    }
                }
            },
        }
    }

    async fn release_writer(&self, key: &Key, owner: &str) -> AdapterResult<bool> {
        let removed = self.entries.remove_if(&key.namespaced(), |_, record| {
            matches!(record, SharedLockRecord::Writer(writer) if writer.owner == owner)
        });
        Ok(removed.is_some())
    }

    async fn refresh_writer(
        &self,
        key: &Key,
        owner: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<bool> {
        if let Some(mut entry) = self.entries.get_mut(&key.namespaced()) {
            if let SharedLockRecord::Writer(writer) = entry.value_mut() {
                if writer.owner == owner && writer.expiration.is_some() {
                    writer.expiration = Some(expiration);
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn force_release_writer(&self, key: &Key) -> AdapterResult<bool> {
        let removed = self.entries.remove_if(&key.namespaced(), |_, record| {
            matches!(record, SharedLockRecord::Writer(_))
        });
        Ok(removed.is_some())
    }

    async fn acquire_reader(
        &self,
        key: &Key,
        slot_id: &str,
        limit: u32,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<SlotAcquire> {
        let now = Utc::now();
        match self.entries.entry(key.namespaced()) {
            Entry::Vacant(vacant) => {
                let mut slots = BTreeMap::new();
                slots.insert(slot_id.to_string(), expiration);
                vacant.insert(SharedLockRecord::Readers(SemaphoreRecord { limit, slots }));
                Ok(SlotAcquire::Acquired)
            }
            Entry::Occupied(mut occupied) => match occupied.get_mut() {
                SharedLockRecord::Writer(writer) => {
                    if writer.is_expired(now) {
                        let mut slots = BTreeMap::new();
                        slots.insert(slot_id.to_string(), expiration);
                        occupied
                            .insert(SharedLockRecord::Readers(SemaphoreRecord { limit, slots }));
                        Ok(SlotAcquire::Acquired)
                    } else {
                        Ok(SlotAcquire::Unavailable)
                    }
                }
                SharedLockRecord::Readers(readers) => {
                    Ok(acquire_slot(readers, slot_id, limit, expiration, now))
                }
            },
        }
    }

    async fn release_reader(&self, key: &Key, slot_id: &str) -> AdapterResult<bool> {
        release_slot(&self.entries, key, slot_id, |record| match record {
            SharedLockRecord::Readers(readers) => Some(readers),
            SharedLockRecord::Writer(_) => None,
        })
    }

    async fn refresh_reader(
        &self,
        key: &Key,
        slot_id: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<bool> {
        if let Some(mut entry) = self.entries.get_mut(&key.namespaced()) {
            if let SharedLockRecord::Readers(readers) = entry.value_mut() {
                return Ok(refresh_slot(readers, slot_id, expiration));
            }
        }
        Ok(false)
    }

    async fn force_release_all_readers(&self, key: &Key) -> AdapterResult<u64> {
        if let Entry::Occupied(occupied) = self.entries.entry(key.namespaced()) {
            if let SharedLockRecord::Readers(readers) = occupied.get() {
                let count = readers.slots.len() as u64;
                occupied.remove();
                return Ok(count);
            }
        }
        Ok(0)
    }

    async fn find(&self, key: &Key) -> AdapterResult<Option<SharedLockRecord>> {
        Ok(self.entries.get(&key.namespaced()).map(|r| r.clone()))
    }
}

#[async_trait]
impl AdapterLifecycle for MemorySharedLockAdapter {
    async fn remove_all_expired(&self) -> AdapterResult<u64> {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, record| match record {
            SharedLockRecord::Writer(writer) => !writer.is_expired(now),
            SharedLockRecord::Readers(readers) => {
                readers
                    .slots
                    .retain(|_, expiration| expiration.map_or(true, |e| e > now));
                !readers.slots.is_empty()
            }
        });
        Ok((before - self.entries.len()) as u64)
    }
}

// ============================================================================
// Semaphore
// ============================================================================

/// In-memory counting semaphore adapter.
#[derive(Debug, Default)]
pub struct MemorySemaphoreAdapter {
    records: DashMap<String, SemaphoreRecord>,
}

impl MemorySemaphoreAdapter {
    /// Create an empty adapter.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SemaphoreAdapter for MemorySemaphoreAdapter {
    fn name(&self) -> &'static str {
        ADAPTER_NAME
    }

    async fn acquire(
        &self,
        key: &Key,
        slot_id: &str,
        limit: u32,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<SlotAcquire> {
        let now = Utc::now();
        match self.records.entry(key.namespaced()) {
            Entry::Vacant(vacant) => {
                let mut slots = BTreeMap::new();
                slots.insert(slot_id.to_string(), expiration);
                vacant.insert(SemaphoreRecord { limit, slots });
                Ok(SlotAcquire::Acquired)
            }
            Entry::Occupied(mut occupied) => Ok(acquire_slot(
                occupied.get_mut(),
                slot_id,
                limit,
                expiration,
                now,
            )),
        }
    }

    async fn release(&self, key: &Key, slot_id: &str) -> AdapterResult<bool> {
        release_slot(&self.records, key, slot_id, |record| Some(record))
    }

    async fn refresh(
        &self,
        key: &Key,
        slot_id: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<bool> {
        if let Some(mut record) = self.records.get_mut(&key.namespaced()) {
            return Ok(refresh_slot(record.value_mut(), slot_id, expiration));
        }
        Ok(false)
    }

    async fn force_release_all(&self, key: &Key) -> AdapterResult<u64> {
        Ok(self
            .records
            .remove(&key.namespaced())
            .map_or(0, |(_, record)| record.slots.len() as u64))
    }

    async fn find(&self, key: &Key) -> AdapterResult<Option<SemaphoreRecord>> {
        Ok(self.records.get(&key.namespaced()).map(|r| r.clone()))
    }
}

#[async_trait]
impl AdapterLifecycle for MemorySemaphoreAdapter {
    async fn remove_all_expired(&self) -> AdapterResult<u64> {
        let now = Utc::now();
        let before = self.records.len();
        self.records.retain(|_, record| {
            record
                .slots
                .retain(|_, expiration| expiration.map_or(true, |e| e > now));
            !record.slots.is_empty()
        });
        Ok((before - self.records.len()) as u64)
    }
}

/// Slot acquisition against an existing record; shared by the semaphore
/// and the reader side of the shared lock.
fn acquire_slot(
    record: &mut SemaphoreRecord,
    slot_id: &str,
    limit: u32,
    expiration: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> SlotAcquire {
    if record.limit != limit {
        return SlotAcquire::LimitMismatch {
            stored: record.limit,
        };
    }
    if record.slots.contains_key(slot_id) {
        // Idempotent re-acquisition refreshes the slot's expiration.
        record.slots.insert(slot_id.to_string(), expiration);
        return SlotAcquire::Acquired;
    }
    record
        .slots
        .retain(|_, expiration| expiration.map_or(true, |e| e > now));
    if (record.slots.len() as u32) < limit {
        record.slots.insert(slot_id.to_string(), expiration);
        SlotAcquire::Acquired
    } else {
        SlotAcquire::Unavailable
    }
}

fn release_slot<R: Send + Sync>(
    map: &DashMap<String, R>,
    key: &Key,
    slot_id: &str,
    as_record: impl Fn(&mut R) -> Option<&mut SemaphoreRecord>,
) -> AdapterResult<bool> {
    if let Entry::Occupied(mut occupied) = map.entry(key.namespaced()) {
        if let Some(record) = as_record(occupied.get_mut()) {
            let removed = record.slots.remove(slot_id).is_some();
            if record.slots.is_empty() {
                occupied.remove();
            }
            return Ok(removed);
        }
    }
    Ok(false)
}

fn refresh_slot(record: &mut SemaphoreRecord, slot_id: &str, expiration: DateTime<Utc>) -> bool {
    if let Some(slot) = record.slots.get_mut(slot_id) {
        if slot.is_some() {
            *slot = Some(expiration);
            return true;
        }
    }
    false
}

// ============================================================================
// Cache
// ============================================================================

/// In-memory cache adapter.
#[derive(Debug, Default)]
pub struct MemoryCacheAdapter {
    entries: DashMap<String, CacheRecord>,
}

impl MemoryCacheAdapter {
    /// Create an empty adapter.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheAdapter for MemoryCacheAdapter {
    fn name(&self) -> &'static str {
        ADAPTER_NAME
    }

    async fn find(&self, key: &Key) -> AdapterResult<Option<CacheRecord>> {
        Ok(self.entries.get(&key.namespaced()).map(|r| r.clone()))
    }

    async fn insert(
        &self,
        key: &Key,
        value: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<bool> {
        let now = Utc::now();
        let record = CacheRecord {
            value: value.to_string(),
            expiration,
        };
        match self.entries.entry(key.namespaced()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(record);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(record);
                Ok(true)
            }
        }
    }

    async fn upsert(
        &self,
        key: &Key,
        value: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<bool> {
        let now = Utc::now();
        let record = CacheRecord {
            value: value.to_string(),
            expiration,
        };
        let replaced_live = self
            .entries
            .insert(key.namespaced(), record)
            .map_or(false, |previous| !previous.is_expired(now));
        Ok(replaced_live)
    }

    async fn update(&self, key: &Key, value: &str) -> AdapterResult<bool> {
        let now = Utc::now();
        if let Some(mut record) = self.entries.get_mut(&key.namespaced()) {
            if !record.is_expired(now) {
                record.value = value.to_string();
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn remove(&self, key: &Key) -> AdapterResult<bool> {
        Ok(self.entries.remove(&key.namespaced()).is_some())
    }

    async fn increment(&self, key: &Key, delta: f64) -> AdapterResult<IncrementOutcome> {
        let now = Utc::now();
        match self.entries.entry(key.namespaced()) {
            Entry::Vacant(vacant) => {
                vacant.insert(CacheRecord {
                    value: format_json_number(delta),
                    expiration: None,
                });
                Ok(IncrementOutcome::Updated(delta))
            }
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(CacheRecord {
                        value: format_json_number(delta),
                        expiration: None,
                    });
                    return Ok(IncrementOutcome::Updated(delta));
                }
                match parse_json_number(&occupied.get().value) {
                    Some(current) => {
                        let next = current + delta;
                        occupied.get_mut().value = format_json_number(next);
                        Ok(IncrementOutcome::Updated(next))
                    }
                    None => Ok(IncrementOutcome::NotNumeric),
                }
            }
        }
    }

    async fn remove_namespace(&self, prefix: &str) -> AdapterResult<u64> {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        Ok((before - self.entries.len()) as u64)
    }
}

#[async_trait]
impl AdapterLifecycle for MemoryCacheAdapter {
    async fn remove_all_expired(&self) -> AdapterResult<u64> {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, record| !record.is_expired(now));
        Ok((before - self.entries.len()) as u64)
    }
}

// ============================================================================
// Circuit-breaker store
// ============================================================================

/// In-memory circuit-breaker state store.
#[derive(Debug)]
pub struct MemoryCircuitBreakerStore<M> {
    states: DashMap<String, BreakerState<M>>,
}

impl<M> MemoryCircuitBreakerStore<M> {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
        }
    }
}

impl<M> Default for MemoryCircuitBreakerStore<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<M> CircuitBreakerStore<M> for MemoryCircuitBreakerStore<M>
where
    M: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        ADAPTER_NAME
    }

    async fn load(&self, key: &Key) -> AdapterResult<Option<BreakerState<M>>> {
        Ok(self.states.get(&key.namespaced()).map(|s| s.clone()))
    }

    async fn atomic_update(
        &self,
        key: &Key,
        update: &(dyn Fn(Option<BreakerState<M>>) -> (BreakerState<M>, bool) + Send + Sync),
    ) -> AdapterResult<BreakerState<M>> {
        match self.states.entry(key.namespaced()) {
            Entry::Occupied(mut occupied) => {
                let (next, persist) = update(Some(occupied.get().clone()));
                if persist {
                    occupied.insert(next.clone());
                }
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                let (next, persist) = update(None);
                if persist {
                    vacant.insert(next.clone());
                }
                Ok(next)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Namespace, TimeSpan};

    fn key(name: &str) -> Key {
        Namespace::new("test/memory").key(name)
    }

    fn expired() -> Option<DateTime<Utc>> {
        Some(TimeSpan::from_millis(-50).end_date())
    }

    fn live() -> Option<DateTime<Utc>> {
        Some(TimeSpan::from_secs(60).end_date())
    }

    #[tokio::test]
    async fn test_lock_contention() {
        let adapter = MemoryLockAdapter::new();
        let k = key("contended");

        assert!(adapter.acquire(&k, "o1", None).await.unwrap());
        assert!(!adapter.acquire(&k, "o2", None).await.unwrap());
        assert!(!adapter.release(&k, "o2").await.unwrap());
        assert!(adapter.release(&k, "o1").await.unwrap());
        assert!(adapter.acquire(&k, "o2", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_expiry_allows_takeover() {
        let adapter = MemoryLockAdapter::new();
        let k = key("expiring");

        assert!(adapter.acquire(&k, "o1", expired()).await.unwrap());
        assert!(adapter.acquire(&k, "o2", None).await.unwrap());

        let record = adapter.find(&k).await.unwrap().unwrap();
        assert_eq!(record.owner, "o2");
    }

    #[tokio::test]
    async fn test_lock_is_not_reentrant() {
        let adapter = MemoryLockAdapter::new();
        let k = key("reentrant");

        assert!(adapter.acquire(&k, "o1", live()).await.unwrap());
        assert!(!adapter.acquire(&k, "o1", live()).await.unwrap());
    }

    #[tokio::test]
    async fn test_reader_writer_exclusion() {
        let adapter = MemorySharedLockAdapter::new();
        let k = key("shared");

        assert_eq!(
            adapter.acquire_reader(&k, "s1", 2, None).await.unwrap(),
            SlotAcquire::Acquired
        );
        assert!(!adapter.acquire_writer(&k, "w", None).await.unwrap());
        assert!(adapter.release_reader(&k, "s1").await.unwrap());
        assert!(adapter.acquire_writer(&k, "w", None).await.unwrap());
        assert_eq!(
            adapter.acquire_reader(&k, "s2", 2, None).await.unwrap(),
            SlotAcquire::Unavailable
        );
    }

    #[tokio::test]
    async fn test_writer_reacquire_and_expiry() {
        let adapter = MemorySharedLockAdapter::new();
        let k = key("writer");

        assert!(adapter.acquire_writer(&k, "w1", live()).await.unwrap());
        // Same owner may re-acquire.
        assert!(adapter.acquire_writer(&k, "w1", live()).await.unwrap());
        assert!(!adapter.acquire_writer(&k, "w2", live()).await.unwrap());

        assert!(adapter.force_release_writer(&k).await.unwrap());
        assert!(adapter.acquire_writer(&k, "w2", expired()).await.unwrap());
        // An expired writer no longer blocks readers.
        assert_eq!(
            adapter.acquire_reader(&k, "s1", 1, None).await.unwrap(),
            SlotAcquire::Acquired
        );
    }

    #[tokio::test]
    async fn test_reader_idempotency_and_limit() {
        let adapter = MemorySharedLockAdapter::new();
        let k = key("readers");

        assert_eq!(
            adapter.acquire_reader(&k, "s1", 2, None).await.unwrap(),
            SlotAcquire::Acquired
        );
        assert_eq!(
            adapter.acquire_reader(&k, "s1", 2, None).await.unwrap(),
            SlotAcquire::Acquired
        );
        assert_eq!(
            adapter.acquire_reader(&k, "s2", 2, None).await.unwrap(),
            SlotAcquire::Acquired
        );
        assert_eq!(
            adapter.acquire_reader(&k, "s3", 2, None).await.unwrap(),
            SlotAcquire::Unavailable
        );
        assert_eq!(
            adapter.acquire_reader(&k, "s4", 3, None).await.unwrap(),
            SlotAcquire::LimitMismatch { stored: 2 }
        );

        assert_eq!(adapter.force_release_all_readers(&k).await.unwrap(), 2);
        assert!(adapter.find(&k).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_semaphore_slots() {
        let adapter = MemorySemaphoreAdapter::new();
        let k = key("semaphore");

        assert_eq!(
            adapter.acquire(&k, "a", 2, None).await.unwrap(),
            SlotAcquire::Acquired
        );
        assert_eq!(
            adapter.acquire(&k, "b", 2, None).await.unwrap(),
            SlotAcquire::Acquired
        );
        assert_eq!(
            adapter.acquire(&k, "c", 2, None).await.unwrap(),
            SlotAcquire::Unavailable
        );

        assert!(adapter.release(&k, "a").await.unwrap());
        assert_eq!(
            adapter.acquire(&k, "c", 2, None).await.unwrap(),
            SlotAcquire::Acquired
        );

        // Releasing the last slot removes the record, so a new limit is
        // accepted afterwards.
        assert!(adapter.release(&k, "b").await.unwrap());
        assert!(adapter.release(&k, "c").await.unwrap());
        assert_eq!(
            adapter.acquire(&k, "d", 5, None).await.unwrap(),
            SlotAcquire::Acquired
        );
    }

    #[tokio::test]
    async fn test_expired_slots_free_capacity() {
        let adapter = MemorySemaphoreAdapter::new();
        let k = key("expiring-slots");

        assert_eq!(
            adapter.acquire(&k, "a", 1, expired()).await.unwrap(),
            SlotAcquire::Acquired
        );
        assert_eq!(
            adapter.acquire(&k, "b", 1, None).await.unwrap(),
            SlotAcquire::Acquired
        );
    }

    #[tokio::test]
    async fn test_semaphore_refresh_requires_expiring_slot() {
        let adapter = MemorySemaphoreAdapter::new();
        let k = key("refresh");

        adapter.acquire(&k, "forever", 2, None).await.unwrap();
        adapter.acquire(&k, "leased", 2, live()).await.unwrap();

        let new_expiration = TimeSpan::from_secs(120).end_date();
        assert!(!adapter.refresh(&k, "forever", new_expiration).await.unwrap());
        assert!(adapter.refresh(&k, "leased", new_expiration).await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_add_put_update() {
        let adapter = MemoryCacheAdapter::new();
        let k = key("cache");

        assert!(adapter.insert(&k, "\"v1\"", None).await.unwrap());
        assert!(!adapter.insert(&k, "\"v2\"", None).await.unwrap());
        assert!(adapter.update(&k, "\"v3\"").await.unwrap());
        assert_eq!(
            adapter.find(&k).await.unwrap().unwrap().value,
            "\"v3\"".to_string()
        );

        assert!(adapter.upsert(&k, "\"v4\"", None).await.unwrap());
        assert!(adapter.remove(&k).await.unwrap());
        assert!(!adapter.update(&k, "\"v5\"").await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_increment() {
        let adapter = MemoryCacheAdapter::new();
        let k = key("counter");

        assert_eq!(
            adapter.increment(&k, 2.0).await.unwrap(),
            IncrementOutcome::Updated(2.0)
        );
        assert_eq!(
            adapter.increment(&k, 3.5).await.unwrap(),
            IncrementOutcome::Updated(5.5)
        );

        let text = key("text");
        adapter.insert(&text, "\"hello\"", None).await.unwrap();
        assert_eq!(
            adapter.increment(&text, 1.0).await.unwrap(),
            IncrementOutcome::NotNumeric
        );
    }

    #[tokio::test]
    async fn test_cache_namespace_clear() {
        let adapter = MemoryCacheAdapter::new();
        let a = Namespace::new("tenant-a").key("k");
        let b = Namespace::new("tenant-b").key("k");

        adapter.insert(&a, "1", None).await.unwrap();
        adapter.insert(&b, "2", None).await.unwrap();

        assert_eq!(adapter.remove_namespace("tenant-a").await.unwrap(), 1);
        assert!(adapter.find(&a).await.unwrap().is_none());
        assert!(adapter.find(&b).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_entries() {
        let locks = MemoryLockAdapter::new();
        locks.acquire(&key("l1"), "o", expired()).await.unwrap();
        locks.acquire(&key("l2"), "o", live()).await.unwrap();

        assert_eq!(locks.remove_all_expired().await.unwrap(), 1);
        assert!(locks.find(&key("l2")).await.unwrap().is_some());
    }
}

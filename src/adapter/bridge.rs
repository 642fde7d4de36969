//! Database-to-rich bridges
//!
//! A database adapter exposes primitive single-statement CAS
//! operations; these bridges compose them into the rich compound
//! contracts the engines consume. This is the only place the two
//! adapter shapes meet.

use crate::adapter::contracts::{
    AdapterLifecycle, CacheAdapter, CacheRecord, DatabaseCacheAdapter, DatabaseLockAdapter,
    DatabaseSemaphoreAdapter, DatabaseSharedLockAdapter, IncrementOutcome, LockAdapter,
    LockRecord, SemaphoreAdapter, SemaphoreRecord, SharedLockAdapter, SharedLockRecord,
    SlotAcquire,
};
use crate::adapter::{format_json_number, parse_json_number, AdapterResult};
use crate::core::Key;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Lifts a [`DatabaseLockAdapter`] to the rich [`LockAdapter`] contract.
pub struct DatabaseLockBridge<A> {
    adapter: A,
}

impl<A> DatabaseLockBridge<A> {
    /// Wrap a database adapter.
    pub fn new(adapter: A) -> Self {
        Self { adapter }
    }

    /// The wrapped adapter.
    pub fn inner(&self) -> &A {
        &self.adapter
    }
}

#[async_trait]
impl<A> LockAdapter for DatabaseLockBridge<A>
where
    A: DatabaseLockAdapter,
{
    fn name(&self) -> &'static str {
        self.adapter.name()
    }

    async fn acquire(
        &self,
        key: &Key,
        owner: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<bool> {
        match self.adapter.insert(key, owner, expiration).await {
            Ok(()) => Ok(true),
            Err(error) if error.is_duplicate() => {
                let updated = self
                    .adapter
                    .update_if_expired(key, owner, expiration, Utc::now())
                    .await?;
                Ok(updated > 0)
            }
            Err(error) => Err(error),
        }
    }

    async fn release(&self, key: &Key, owner: &str) -> AdapterResult<bool> {
        Ok(self.adapter.remove_if_owner(key, owner).await?.is_some())
    }

    async fn force_release(&self, key: &Key) -> AdapterResult<bool> {
        Ok(self.adapter.remove(key).await? > 0)
    }

    async fn refresh(
        &self,
        key: &Key,
        owner: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<bool> {
        Ok(self
            .adapter
            .update_expiration_if_owner(key, owner, expiration)
            .await?
            > 0)
    }

    async fn find(&self, key: &Key) -> AdapterResult<Option<LockRecord>> {
        self.adapter.find(key).await
    }
}

#[async_trait]
impl<A> AdapterLifecycle for DatabaseLockBridge<A>
where
    A: DatabaseLockAdapter + AdapterLifecycle,
{
    async fn init(&self) -> AdapterResult<()> {
        self.adapter.init().await
    }

    async fn de_init(&self) -> AdapterResult<()> {
        self.adapter.de_init().await
    }

    async fn remove_all_expired(&self) -> AdapterResult<u64> {
        self.adapter.remove_all_expired().await
    }
}

/// Lifts a [`DatabaseSemaphoreAdapter`] to the rich [`SemaphoreAdapter`]
/// contract.
pub struct DatabaseSemaphoreBridge<A> {
    adapter: A,
}

impl<A> DatabaseSemaphoreBridge<A> {
    /// Wrap a database adapter.
    pub fn new(adapter: A) -> Self {
        Self { adapter }
    }

    /// The wrapped adapter.
    pub fn inner(&self) -> &A {
        &self.adapter
    }
}

impl<A> DatabaseSemaphoreBridge<A>
where
    A: DatabaseSemaphoreAdapter,
{
    /// Ensure the record exists with the requested limit; returns the
    /// mismatching stored limit when reconciliation fails.
    async fn reconcile_limit(&self, key: &Key, limit: u32) -> AdapterResult<Option<u32>> {
        match self.adapter.find_record(key).await? {
            Some(stored) if stored != limit => Ok(Some(stored)),
            Some(_) => Ok(None),
            None => match self.adapter.insert_record(key, limit).await {
                Ok(()) => Ok(None),
                Err(error) if error.is_duplicate() => {
                    // Lost the creation race; re-check the stored limit.
                    match self.adapter.find_record(key).await? {
                        Some(stored) if stored != limit => Ok(Some(stored)),
                        _ => Ok(None),
                    }
                }
                Err(error) => Err(error),
            },
        }
    }
}

#[async_trait]
impl<A> SemaphoreAdapter for DatabaseSemaphoreBridge<A>
where
    A: DatabaseSemaphoreAdapter,
{
    fn name(&self) -> &'static str {
        self.adapter.name()
    }

    async fn acquire(
        &self,
        key: &Key,
        slot_id: &str,
        limit: u32,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<SlotAcquire> {
        let now = Utc::now();
        if let Some(stored) = self.reconcile_limit(key, limit).await? {
            return Ok(SlotAcquire::LimitMismatch { stored });
        }

        if self.adapter.slot_exists(key, slot_id, now).await? {
            self.adapter
                .set_slot_expiration(key, slot_id, expiration)
                .await?;
            return Ok(SlotAcquire::Acquired);
        }

        match self
            .adapter
            .insert_slot_if_capacity(key, slot_id, limit, expiration, now)
            .await
        {
            Ok(inserted) if inserted > 0 => Ok(SlotAcquire::Acquired),
            Ok(_) => Ok(SlotAcquire::Unavailable),
            Err(error) if error.is_duplicate() => {
                // The slot row exists but was expired; take it over.
                self.adapter
                    .set_slot_expiration(key, slot_id, expiration)
                    .await?;
                Ok(SlotAcquire::Acquired)
            }
            Err(error) => Err(error),
        }
    }

    async fn release(&self, key: &Key, slot_id: &str) -> AdapterResult<bool> {
        let removed = self.adapter.remove_slot(key, slot_id).await? > 0;
        self.adapter.remove_record_if_empty(key).await?;
        Ok(removed)
    }

    async fn refresh(
        &self,
        key: &Key,
        slot_id: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<bool> {
        Ok(self.adapter.refresh_slot(key, slot_id, expiration).await? > 0)
    }

    async fn force_release_all(&self, key: &Key) -> AdapterResult<u64> {
        let removed = self.adapter.remove_all_slots(key).await?;
        self.adapter.remove_record_if_empty(key).await?;
        Ok(removed)
    }

    async fn find(&self, key: &Key) -> AdapterResult<Option<SemaphoreRecord>> {
        match self.adapter.find_record(key).await? {
            Some(limit) => {
                let slots = self.adapter.load_slots(key).await?;
                Ok(Some(SemaphoreRecord {
                    limit,
                    slots: slots.into_iter().collect(),
                }))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl<A> AdapterLifecycle for DatabaseSemaphoreBridge<A>
where
    A: DatabaseSemaphoreAdapter + AdapterLifecycle,
{
    async fn init(&self) -> AdapterResult<()> {
        self.adapter.init().await
    }

    async fn de_init(&self) -> AdapterResult<()> {
        self.adapter.de_init().await
    }

    async fn remove_all_expired(&self) -> AdapterResult<u64> {
        self.adapter.remove_all_expired().await
    }
}

/// Lifts a [`DatabaseSharedLockAdapter`] to the rich
/// [`SharedLockAdapter`] contract.
pub struct DatabaseSharedLockBridge<A> {
    adapter: A,
}

impl<A> DatabaseSharedLockBridge<A> {
    /// Wrap a database adapter.
    pub fn new(adapter: A) -> Self {
        Self { adapter }
    }

    /// The wrapped adapter.
    pub fn inner(&self) -> &A {
        &self.adapter
    }
}

impl<A> DatabaseSharedLockBridge<A>
where
    A: DatabaseSharedLockAdapter,
{
    async fn reconcile_reader_limit(&self, key: &Key, limit: u32) -> AdapterResult<Option<u32>> {
        match self.adapter.find_reader_record(key).await? {
            Some(stored) if stored != limit => Ok(Some(stored)),
            Some(_) => Ok(None),
            None => match self.adapter.insert_reader_record(key, limit).await {
                Ok(()) => Ok(None),
                Err(error) if error.is_duplicate() => {
                    match self.adapter.find_reader_record(key).await? {
                        Some(stored) if stored != limit => Ok(Some(stored)),
                        _ => Ok(None),
                    }
                }
                Err(error) => Err(error),
            },
        }
    }
}

#[async_trait]
impl<A> SharedLockAdapter for DatabaseSharedLockBridge<A>
where
    A: DatabaseSharedLockAdapter,
{
    fn name(&self) -> &'static str {
        self.adapter.name()
    }

    async fn acquire_writer(
        &self,
        key: &Key,
        owner: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<bool> {
        let now = Utc::now();
        match self.adapter.insert_writer(key, owner, expiration, now).await {
            Ok(inserted) => Ok(inserted),
            Err(error) if error.is_duplicate() => {
                let updated = self
                    .adapter
                    .update_writer_if_reacquirable(key, owner, expiration, now)
                    .await?;
                Ok(updated > 0)
            }
            Err(error) => Err(error),
        }
    }

    async fn release_writer(&self, key: &Key, owner: &str) -> AdapterResult<bool> {
        Ok(self.adapter.remove_writer_if_owner(key, owner).await? > 0)
    }

    async fn refresh_writer(
        &self,
        key: &Key,
        owner: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<bool> {
        Ok(self
            .adapter
            .refresh_writer_if_owner(key, owner, expiration)
            .await?
            > 0)
    }

    async fn force_release_writer(&self, key: &Key) -> AdapterResult<bool> {
        Ok(self.adapter.remove_writer(key).await? > 0)
    }

    async fn acquire_reader(
        &self,
        key: &Key,
        slot_id: &str,
        limit: u32,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<SlotAcquire> {
        let now = Utc::now();
        if let Some(stored) = self.reconcile_reader_limit(key, limit).await? {
            return Ok(SlotAcquire::LimitMismatch { stored });
        }

        if self.adapter.reader_slot_exists(key, slot_id, now).await? {
            self.adapter
                .set_reader_slot_expiration(key, slot_id, expiration)
                .await?;
            return Ok(SlotAcquire::Acquired);
        }

        match self
            .adapter
            .insert_reader_slot_if_allowed(key, slot_id, limit, expiration, now)
            .await
        {
            Ok(inserted) if inserted > 0 => Ok(SlotAcquire::Acquired),
            Ok(_) => Ok(SlotAcquire::Unavailable),
            Err(error) if error.is_duplicate() => {
                self.adapter
                    .set_reader_slot_expiration(key, slot_id, expiration)
                    .await?;
                Ok(SlotAcquire::Acquired)
            }
            Err(error) => Err(error),
        }
    }

    async fn release_reader(&self, key: &Key, slot_id: &str) -> AdapterResult<bool> {
        let removed = self.adapter.remove_reader_slot(key, slot_id).await? > 0;
        self.adapter.remove_reader_record_if_empty(key).await?;
        Ok(removed)
    }

    async fn refresh_reader(
        &self,
        key: &Key,
        slot_id: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<bool> {
        Ok(self
            .adapter
            .refresh_reader_slot(key, slot_id, expiration)
            .await?
            > 0)
    }

    async fn force_release_all_readers(&self, key: &Key) -> AdapterResult<u64> {
        let removed = self.adapter.remove_all_reader_slots(key).await?;
        self.adapter.remove_reader_record_if_empty(key).await?;
        Ok(removed)
    }

    async fn find(&self, key: &Key) -> AdapterResult<Option<SharedLockRecord>> {
        let now = Utc::now();
        let writer = self.adapter.find_writer(key).await?;
        if let Some(record) = &writer {
            if !record.is_expired(now) {
                return Ok(Some(SharedLockRecord::Writer(record.clone())));
            }
        }

        if let Some(limit) = self.adapter.find_reader_record(key).await? {
            let slots = self.adapter.load_reader_slots(key).await?;
            if !slots.is_empty() {
                return Ok(Some(SharedLockRecord::Readers(SemaphoreRecord {
                    limit,
                    slots: slots.into_iter().collect(),
                })));
            }
        }

        // Only a stale writer row (if anything) remains; report it
        // raw and let the caller interpret its expiration.
        Ok(writer.map(SharedLockRecord::Writer))
    }
}

#[async_trait]
impl<A> AdapterLifecycle for DatabaseSharedLockBridge<A>
where
    A: DatabaseSharedLockAdapter + AdapterLifecycle,
{
    async fn init(&self) -> AdapterResult<()> {
        self.adapter.init().await
    }

    async fn de_init(&self) -> AdapterResult<()> {
        self.adapter.de_init().await
    }

    async fn remove_all_expired(&self) -> AdapterResult<u64> {
        self.adapter.remove_all_expired().await
    }
}

/// Lifts a [`DatabaseCacheAdapter`] to the rich [`CacheAdapter`]
/// contract.
pub struct DatabaseCacheBridge<A> {
    adapter: A,
}

impl<A> DatabaseCacheBridge<A> {
    /// Wrap a database adapter.
    pub fn new(adapter: A) -> Self {
        Self { adapter }
    }

    /// The wrapped adapter.
    pub fn inner(&self) -> &A {
        &self.adapter
    }
}

#[async_trait]
impl<A> CacheAdapter for DatabaseCacheBridge<A>
where
    A: DatabaseCacheAdapter,
{
    fn name(&self) -> &'static str {
        self.adapter.name()
    }

    async fn find(&self, key: &Key) -> AdapterResult<Option<CacheRecord>> {
        self.adapter.find(key).await
    }

    async fn insert(
        &self,
        key: &Key,
        value: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<bool> {
        match self.adapter.insert(key, value, expiration).await {
            Ok(()) => Ok(true),
            Err(error) if error.is_duplicate() => {
                let updated = self
                    .adapter
                    .update_if_expired(key, value, expiration, Utc::now())
                    .await?;
                Ok(updated > 0)
            }
            Err(error) => Err(error),
        }
    }

    async fn upsert(
        &self,
        key: &Key,
        value: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<bool> {
        let now = Utc::now();
        let replaced_live = self
            .adapter
            .find(key)
            .await?
            .map_or(false, |record| !record.is_expired(now));
        self.adapter.replace(key, value, expiration).await?;
        Ok(replaced_live)
    }

    async fn update(&self, key: &Key, value: &str) -> AdapterResult<bool> {
        Ok(self.adapter.update_if_live(key, value, Utc::now()).await? > 0)
    }

    async fn remove(&self, key: &Key) -> AdapterResult<bool> {
        Ok(self.adapter.remove(key).await? > 0)
    }

    async fn increment(&self, key: &Key, delta: f64) -> AdapterResult<IncrementOutcome> {
        let now = Utc::now();
        let updated = self.adapter.increment_if_numeric(key, delta, now).await?;
        if updated > 0 {
            let value = self
                .adapter
                .find(key)
                .await?
                .and_then(|record| parse_json_number(&record.value))
                .unwrap_or(delta);
            return Ok(IncrementOutcome::Updated(value));
        }

        match self.adapter.find(key).await? {
            Some(record) if !record.is_expired(now) => Ok(IncrementOutcome::NotNumeric),
            _ => {
                self.adapter
                    .replace(key, &format_json_number(delta), None)
                    .await?;
                Ok(IncrementOutcome::Updated(delta))
            }
        }
    }

    async fn remove_namespace(&self, prefix: &str) -> AdapterResult<u64> {
        self.adapter.remove_prefixed(prefix).await
    }
}

#[async_trait]
impl<A> AdapterLifecycle for DatabaseCacheBridge<A>
where
    A: DatabaseCacheAdapter + AdapterLifecycle,
{
    async fn init(&self) -> AdapterResult<()> {
        self.adapter.init().await
    }

    async fn de_init(&self) -> AdapterResult<()> {
        self.adapter.de_init().await
    }

    async fn remove_all_expired(&self) -> AdapterResult<u64> {
        self.adapter.remove_all_expired().await
    }
}

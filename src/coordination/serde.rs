//! Handle serialization
//!
//! A handle crosses a process boundary as a small record: the
//! user-visible key, the owner (or slot) id, and the TTL. Rehydration
//! needs the local process's adapter and bus, so providers register
//! themselves in a process-global registry keyed by primitive, adapter
//! identifier and namespace prefix. The adapter identifier is part of
//! the key on purpose: two providers over different backends in the
//! same namespace must not capture each other's handles.

use crate::coordination::lock::Lock;
use crate::coordination::provider::{LockProvider, SemaphoreProvider, SharedLockProvider};
use crate::coordination::rwlock::SharedLock;
use crate::coordination::semaphore::Semaphore;
use crate::core::TimeSpan;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

/// A lock handle in transit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedLock {
    /// The user-visible key (namespace prefix omitted).
    pub key: String,
    /// The owner id proving ownership.
    pub owner: String,
    /// Acquisition TTL in milliseconds; `None` never expires.
    pub ttl_ms: Option<i64>,
    /// Identifier of the adapter the handle was bound to.
    pub adapter: String,
    /// Namespace prefix the handle was rooted at.
    pub namespace: String,
}

/// A semaphore handle in transit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedSemaphore {
    /// The user-visible key.
    pub key: String,
    /// The slot id held by the handle.
    pub slot_id: String,
    /// The semaphore limit.
    pub limit: u32,
    /// Acquisition TTL in milliseconds.
    pub ttl_ms: Option<i64>,
    /// Identifier of the adapter the handle was bound to.
    pub adapter: String,
    /// Namespace prefix the handle was rooted at.
    pub namespace: String,
}

/// A shared-lock handle in transit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedSharedLock {
    /// The user-visible key.
    pub key: String,
    /// The writer-owner / reader-slot id.
    pub id: String,
    /// The reader limit.
    pub limit: u32,
    /// Acquisition TTL in milliseconds.
    pub ttl_ms: Option<i64>,
    /// Identifier of the adapter the handle was bound to.
    pub adapter: String,
    /// Namespace prefix the handle was rooted at.
    pub namespace: String,
}

impl Lock {
    /// The portable form of this handle.
    pub fn to_serialized(&self) -> SerializedLock {
        SerializedLock {
            key: self.key().resolved(),
            owner: self.owner().to_string(),
            ttl_ms: self.ttl().map(|ttl| ttl.as_millis()),
            adapter: self.adapter_name().to_string(),
            namespace: self.key().prefix().to_string(),
        }
    }
}

impl Semaphore {
    /// The portable form of this handle.
    pub fn to_serialized(&self) -> SerializedSemaphore {
        SerializedSemaphore {
            key: self.key().resolved(),
            slot_id: self.slot_id().to_string(),
            limit: self.limit(),
            ttl_ms: self.ttl().map(|ttl| ttl.as_millis()),
            adapter: self.adapter_name().to_string(),
            namespace: self.key().prefix().to_string(),
        }
    }
}

impl SharedLock {
    /// The portable form of this handle.
    pub fn to_serialized(&self) -> SerializedSharedLock {
        SerializedSharedLock {
            key: self.key().resolved(),
            id: self.id().to_string(),
            limit: self.limit(),
            ttl_ms: self.ttl().map(|ttl| ttl.as_millis()),
            adapter: self.adapter_name().to_string(),
            namespace: self.key().prefix().to_string(),
        }
    }
}

#[derive(Clone)]
enum ProviderEntry {
    Lock(LockProvider),
    Semaphore(SemaphoreProvider),
    SharedLock(SharedLockProvider),
}

type RegistryKey = (&'static str, String, String);

const LOCK: &str = "lock";
const SEMAPHORE: &str = "semaphore";
const SHARED_LOCK: &str = "shared_lock";

static GLOBAL_REGISTRY: Lazy<HandleRegistry> = Lazy::new(HandleRegistry::new);

/// Maps `(primitive, adapter, namespace)` to the provider that
/// rehydrates serialized handles against local state.
#[derive(Default)]
pub struct HandleRegistry {
    entries: DashMap<RegistryKey, ProviderEntry>,
}

impl HandleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-global registry.
    pub fn global() -> &'static HandleRegistry {
        &GLOBAL_REGISTRY
    }

    /// Register a lock provider; later registrations for the same
    /// tuple replace earlier ones.
    pub fn register_lock_provider(&self, provider: &LockProvider) {
        self.entries.insert(
            (
                LOCK,
                provider.adapter_name().to_string(),
                provider.namespace().prefix().to_string(),
            ),
            ProviderEntry::Lock(provider.clone()),
        );
    }

    /// Register a semaphore provider.
    pub fn register_semaphore_provider(&self, provider: &SemaphoreProvider) {
        self.entries.insert(
            (
                SEMAPHORE,
                provider.adapter_name().to_string(),
                provider.namespace().prefix().to_string(),
            ),
            ProviderEntry::Semaphore(provider.clone()),
        );
    }

    /// Register a shared-lock provider.
    pub fn register_shared_lock_provider(&self, provider: &SharedLockProvider) {
        self.entries.insert(
            (
                SHARED_LOCK,
                provider.adapter_name().to_string(),
                provider.namespace().prefix().to_string(),
            ),
            ProviderEntry::SharedLock(provider.clone()),
        );
    }

    /// Rebind a serialized lock to the provider registered for its
    /// adapter and namespace.
    pub fn hydrate_lock(&self, serialized: &SerializedLock) -> Option<Lock> {
        let entry = self.entries.get(&(
            LOCK,
            serialized.adapter.clone(),
            serialized.namespace.clone(),
        ))?;
        match entry.value() {
            ProviderEntry::Lock(provider) => Some(provider.build(
                &serialized.key,
                serialized.owner.clone(),
                serialized.ttl_ms.map(TimeSpan::from_millis),
            )),
            _ => None,
        }
    }

    /// Rebind a serialized semaphore handle.
    pub fn hydrate_semaphore(&self, serialized: &SerializedSemaphore) -> Option<Semaphore> {
        let entry = self.entries.get(&(
            SEMAPHORE,
            serialized.adapter.clone(),
            serialized.namespace.clone(),
        ))?;
        match entry.value() {
            ProviderEntry::Semaphore(provider) => Some(provider.build(
                &serialized.key,
                serialized.slot_id.clone(),
                serialized.limit,
                serialized.ttl_ms.map(TimeSpan::from_millis),
            )),
            _ => None,
        }
    }

    /// Rebind a serialized shared-lock handle.
    pub fn hydrate_shared_lock(&self, serialized: &SerializedSharedLock) -> Option<SharedLock> {
        let entry = self.entries.get(&(
            SHARED_LOCK,
            serialized.adapter.clone(),
            serialized.namespace.clone(),
        ))?;
        match entry.value() {
            ProviderEntry::SharedLock(provider) => Some(provider.build(
                &serialized.key,
                serialized.id.clone(),
                serialized.limit,
                serialized.ttl_ms.map(TimeSpan::from_millis),
            )),
            _ => None,
        }
    }
}

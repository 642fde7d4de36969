//! Provider facades
//!
//! A provider binds a namespace, an adapter, an event bus and default
//! settings, and hands out handles. Deriving a child namespace shares
//! the adapter and bus, so tenants and subsystems stay isolated by key
//! prefix alone.

use crate::adapter::{
    LockAdapter, ResilienceOptions, ResilientLockAdapter, ResilientSemaphoreAdapter,
    ResilientSharedLockAdapter, SemaphoreAdapter, SharedLockAdapter,
};
use crate::coordination::lock::Lock;
use crate::coordination::rwlock::SharedLock;
use crate::coordination::semaphore::Semaphore;
use crate::coordination::{BlockingOptions, DEFAULT_REFRESH_TTL, DEFAULT_TTL};
use crate::core::{Namespace, TimeSpan};
use crate::events::{EventBus, InMemoryEventBus};
use std::sync::Arc;
use uuid::Uuid;

/// Default settings a [`LockProvider`] stamps onto its handles.
#[derive(Debug, Clone)]
pub struct LockProviderConfig {
    /// TTL for acquisitions; `None` acquires without expiration.
    pub default_ttl: Option<TimeSpan>,
    /// TTL applied by `refresh`.
    pub default_refresh_ttl: TimeSpan,
    /// Budget of blocking acquisitions.
    pub default_blocking: BlockingOptions,
}

impl Default for LockProviderConfig {
    fn default() -> Self {
        Self {
            default_ttl: Some(DEFAULT_TTL),
            default_refresh_ttl: DEFAULT_REFRESH_TTL,
            default_blocking: BlockingOptions::default(),
        }
    }
}

/// Hands out [`Lock`] handles rooted at one namespace.
#[derive(Clone)]
pub struct LockProvider {
    namespace: Namespace,
    adapter: Arc<dyn LockAdapter>,
    bus: Arc<dyn EventBus>,
    config: LockProviderConfig,
}

impl LockProvider {
    /// Create a provider with default settings and a private in-memory
    /// event bus.
    pub fn new(namespace: Namespace, adapter: Arc<dyn LockAdapter>) -> Self {
        Self {
            namespace,
            adapter,
            bus: Arc::new(InMemoryEventBus::new()),
            config: LockProviderConfig::default(),
        }
    }

    /// Replace the default settings.
    pub fn with_config(mut self, config: LockProviderConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the event bus.
    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = bus;
        self
    }

    /// Run every storage call of every handle through the resilience
    /// pipeline with `options`.
    pub fn with_resilience(mut self, options: ResilienceOptions) -> Self {
        self.adapter = Arc::new(ResilientLockAdapter::new(
            Arc::clone(&self.adapter),
            options,
        ));
        self
    }

    /// The namespace handles are rooted at.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// The event bus handle events are published to.
    pub fn event_bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    /// The bound adapter's identifier.
    pub fn adapter_name(&self) -> &'static str {
        self.adapter.name()
    }

    /// Derive a provider in a child namespace sharing adapter, bus and
    /// settings.
    pub fn with_namespace(&self, segment: &str) -> Self {
        Self {
            namespace: self.namespace.child(segment),
            adapter: Arc::clone(&self.adapter),
            bus: Arc::clone(&self.bus),
            config: self.config.clone(),
        }
    }

    /// Create a handle with a fresh owner id.
    pub fn create(&self, key: &str) -> Lock {
        self.create_with_owner(key, Uuid::new_v4().to_string())
    }

    /// Create a handle with an explicit owner id, for callers that
    /// share ownership across processes.
    pub fn create_with_owner(&self, key: &str, owner: impl Into<String>) -> Lock {
        self.build(key, owner.into(), self.config.default_ttl)
    }

    pub(crate) fn build(&self, key: &str, owner: String, ttl: Option<TimeSpan>) -> Lock {
        Lock::new(
            self.namespace.key(key),
            owner,
            Arc::clone(&self.adapter),
            Arc::clone(&self.bus),
            ttl,
            self.config.default_refresh_ttl,
            self.config.default_blocking,
        )
    }
}

/// Default settings a [`SemaphoreProvider`] stamps onto its handles.
#[derive(Debug, Clone)]
pub struct SemaphoreProviderConfig {
    /// TTL for slot acquisitions; `None` acquires without expiration.
    pub default_ttl: Option<TimeSpan>,
    /// TTL applied by `refresh`.
    pub default_refresh_ttl: TimeSpan,
    /// Budget of blocking acquisitions.
    pub default_blocking: BlockingOptions,
}

impl Default for SemaphoreProviderConfig {
    fn default() -> Self {
        Self {
            default_ttl: Some(DEFAULT_TTL),
            default_refresh_ttl: DEFAULT_REFRESH_TTL,
            default_blocking: BlockingOptions::default(),
        }
    }
}

/// Hands out [`Semaphore`] handles rooted at one namespace.
#[derive(Clone)]
pub struct SemaphoreProvider {
    namespace: Namespace,
    adapter: Arc<dyn SemaphoreAdapter>,
    bus: Arc<dyn EventBus>,
    config: SemaphoreProviderConfig,
}

impl SemaphoreProvider {
    /// Create a provider with default settings and a private in-memory
    /// event bus.
    pub fn new(namespace: Namespace, adapter: Arc<dyn SemaphoreAdapter>) -> Self {
        Self {
            namespace,
            adapter,
            bus: Arc::new(InMemoryEventBus::new()),
            config: SemaphoreProviderConfig::default(),
        }
    }

    /// Replace the default settings.
    pub fn with_config(mut self, config: SemaphoreProviderConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the event bus.
    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = bus;
        self
    }

    /// Run every storage call of every handle through the resilience
    /// pipeline with `options`.
    pub fn with_resilience(mut self, options: ResilienceOptions) -> Self {
        self.adapter = Arc::new(ResilientSemaphoreAdapter::new(
            Arc::clone(&self.adapter),
            options,
        ));
        self
    }

    /// The namespace handles are rooted at.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// The event bus handle events are published to.
    pub fn event_bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    /// The bound adapter's identifier.
    pub fn adapter_name(&self) -> &'static str {
        self.adapter.name()
    }

    /// Derive a provider in a child namespace sharing adapter, bus and
    /// settings.
    pub fn with_namespace(&self, segment: &str) -> Self {
        Self {
            namespace: self.namespace.child(segment),
            adapter: Arc::clone(&self.adapter),
            bus: Arc::clone(&self.bus),
            config: self.config.clone(),
        }
    }

    /// Create a handle with a fresh slot id.
    ///
    /// # Panics
    ///
    /// Panics when `limit` is zero; a semaphore that can never be
    /// acquired is a configuration error.
    pub fn create(&self, key: &str, limit: u32) -> Semaphore {
        self.create_with_slot(key, limit, Uuid::new_v4().to_string())
    }

    /// Create a handle with an explicit slot id.
    pub fn create_with_slot(&self, key: &str, limit: u32, slot_id: impl Into<String>) -> Semaphore {
        assert!(limit >= 1, "semaphore limit must be >= 1");
        self.build(key, slot_id.into(), limit, self.config.default_ttl)
    }

    pub(crate) fn build(
        &self,
        key: &str,
        slot_id: String,
        limit: u32,
        ttl: Option<TimeSpan>,
    ) -> Semaphore {
        Semaphore::new(
            self.namespace.key(key),
            slot_id,
            limit,
            Arc::clone(&self.adapter),
            Arc::clone(&self.bus),
            ttl,
            self.config.default_refresh_ttl,
            self.config.default_blocking,
        )
    }
}

/// Default settings a [`SharedLockProvider`] stamps onto its handles.
#[derive(Debug, Clone)]
pub struct SharedLockProviderConfig {
    /// TTL for acquisitions; `None` acquires without expiration.
    pub default_ttl: Option<TimeSpan>,
    /// TTL applied by `refresh`.
    pub default_refresh_ttl: TimeSpan,
    /// Budget of blocking acquisitions.
    pub default_blocking: BlockingOptions,
}

impl Default for SharedLockProviderConfig {
    fn default() -> Self {
        Self {
            default_ttl: Some(DEFAULT_TTL),
            default_refresh_ttl: DEFAULT_REFRESH_TTL,
            default_blocking: BlockingOptions::default(),
        }
    }
}

/// Hands out [`SharedLock`] handles rooted at one namespace.
#[derive(Clone)]
pub struct SharedLockProvider {
    namespace: Namespace,
    adapter: Arc<dyn SharedLockAdapter>,
    bus: Arc<dyn EventBus>,
    config: SharedLockProviderConfig,
}

impl SharedLockProvider {
    /// Create a provider with default settings and a private in-memory
    /// event bus.
    pub fn new(namespace: Namespace, adapter: Arc<dyn SharedLockAdapter>) -> Self {
        Self {
            namespace,
            adapter,
            bus: Arc::new(InMemoryEventBus::new()),
            config: SharedLockProviderConfig::default(),
        }
    }

    /// Replace the default settings.
    pub fn with_config(mut self, config: SharedLockProviderConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the event bus.
    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = bus;
        self
    }

    /// Run every storage call of every handle through the resilience
    /// pipeline with `options`.
    pub fn with_resilience(mut self, options: ResilienceOptions) -> Self {
        self.adapter = Arc::new(ResilientSharedLockAdapter::new(
            Arc::clone(&self.adapter),
            options,
        ));
        self
    }

    /// The namespace handles are rooted at.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// The event bus handle events are published to.
    pub fn event_bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    /// The bound adapter's identifier.
    pub fn adapter_name(&self) -> &'static str {
        self.adapter.name()
    }

    /// Derive a provider in a child namespace sharing adapter, bus and
    /// settings.
    pub fn with_namespace(&self, segment: &str) -> Self {
        Self {
            namespace: self.namespace.child(segment),
            adapter: Arc::clone(&self.adapter),
            bus: Arc::clone(&self.bus),
            config: self.config.clone(),
        }
    }

    /// Create a handle with a fresh id.
    ///
    /// # Panics
    ///
    /// Panics when `limit` is zero.
    pub fn create(&self, key: &str, limit: u32) -> SharedLock {
        self.create_with_id(key, limit, Uuid::new_v4().to_string())
    }

    /// Create a handle with an explicit id.
    pub fn create_with_id(&self, key: &str, limit: u32, id: impl Into<String>) -> SharedLock {
        assert!(limit >= 1, "reader limit must be >= 1");
        self.build(key, id.into(), limit, self.config.default_ttl)
    }

    pub(crate) fn build(
        &self,
        key: &str,
        id: String,
        limit: u32,
        ttl: Option<TimeSpan>,
    ) -> SharedLock {
        SharedLock::new(
            self.namespace.key(key),
            id,
            limit,
            Arc::clone(&self.adapter),
            Arc::clone(&self.bus),
            ttl,
            self.config.default_refresh_ttl,
            self.config.default_blocking,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{MemoryLockAdapter, MemorySemaphoreAdapter};

    #[tokio::test]
    async fn test_sibling_providers_do_not_contend() {
        let adapter = Arc::new(MemoryLockAdapter::new());
        let root = LockProvider::new(Namespace::new("app"), adapter);

        let tenant_a = root.with_namespace("tenant-a");
        let tenant_b = root.with_namespace("tenant-b");

        // The same user key in sibling namespaces is two distinct
        // locks.
        assert!(tenant_a.create("job").acquire().await.unwrap());
        assert!(tenant_b.create("job").acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_created_handles_contend_on_the_same_key() {
        let adapter = Arc::new(MemoryLockAdapter::new());
        let provider = LockProvider::new(Namespace::new("app"), adapter);

        let first = provider.create("job");
        let second = provider.create("job");

        assert!(first.acquire().await.unwrap());
        assert!(!second.acquire().await.unwrap());
    }

    #[test]
    #[should_panic(expected = "limit must be >= 1")]
    fn test_zero_limit_is_rejected_eagerly() {
        let adapter = Arc::new(MemorySemaphoreAdapter::new());
        let provider = SemaphoreProvider::new(Namespace::new("app"), adapter);
        let _ = provider.create("jobs", 0);
    }

    #[tokio::test]
    async fn test_explicit_owner_spans_handles() {
        let adapter = Arc::new(MemoryLockAdapter::new());
        let provider = LockProvider::new(Namespace::new("app"), adapter);

        let original = provider.create_with_owner("job", "worker-7");
        assert!(original.acquire().await.unwrap());

        // A second handle with the same owner id can release what the
        // first acquired.
        let twin = provider.create_with_owner("job", "worker-7");
        assert!(twin.release().await.unwrap());
    }
}

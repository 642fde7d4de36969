//! Cache facade
//!
//! A typed view over a [`CacheAdapter`]: values are serialized as JSON
//! on the way in and deserialized on the way out. Expiration is
//! evaluated on every read, so an expired entry is a miss even before
//! any sweep removes it.

use crate::adapter::{
    AdapterError, CacheAdapter, IncrementOutcome, ResilienceOptions, ResilientCacheAdapter,
};
use crate::core::{Key, Namespace, TimeSpan};
use crate::events::{CacheEvent, Event, EventBus, InMemoryEventBus};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// `increment` was invoked on a non-numeric entry.
#[derive(Debug, Clone, Error)]
#[error("cache value for key '{key}' is not numeric")]
pub struct TypeCacheError {
    /// The namespaced key.
    pub key: String,
}

/// Errors surfaced by the cache facade.
#[derive(Debug, Error)]
pub enum CacheError {
    /// See [`TypeCacheError`].
    #[error(transparent)]
    Type(#[from] TypeCacheError),

    /// A backend failure, preserved as the cause.
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// A value failed to serialize or deserialize.
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Settings a [`Cache`] applies to its entries.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL entries are written with when none is given; `None` stores
    /// without expiration.
    pub default_ttl: Option<TimeSpan>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Some(TimeSpan::from_minutes(5)),
        }
    }
}

/// A namespaced, typed cache over a pluggable adapter.
#[derive(Clone)]
pub struct Cache {
    namespace: Namespace,
    group: Option<String>,
    adapter: Arc<dyn CacheAdapter>,
    bus: Arc<dyn EventBus>,
    config: CacheConfig,
}

impl Cache {
    /// Create a cache with default settings and a private in-memory
    /// event bus.
    pub fn new(namespace: Namespace, adapter: Arc<dyn CacheAdapter>) -> Self {
        Self {
            namespace,
            group: None,
            adapter,
            bus: Arc::new(InMemoryEventBus::new()),
            config: CacheConfig::default(),
        }
    }

    /// Replace the default settings.
    pub fn with_config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the event bus.
    pub fn with_event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = bus;
        self
    }

    /// Run every storage call through the resilience pipeline with
    /// `options`.
    pub fn with_resilience(mut self, options: ResilienceOptions) -> Self {
        self.adapter = Arc::new(ResilientCacheAdapter::new(
            Arc::clone(&self.adapter),
            options,
        ));
        self
    }

    /// The namespace entries are rooted at.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Derive a cache scoped to `group`, sharing adapter, bus and
    /// settings.
    pub fn with_group(&self, group: impl Into<String>) -> Cache {
        Cache {
            namespace: self.namespace.clone(),
            group: Some(group.into()),
            adapter: Arc::clone(&self.adapter),
            bus: Arc::clone(&self.bus),
            config: self.config.clone(),
        }
    }

    /// Derive a cache in a child namespace.
    pub fn with_namespace(&self, segment: &str) -> Cache {
        Cache {
            namespace: self.namespace.child(segment),
            group: self.group.clone(),
            adapter: Arc::clone(&self.adapter),
            bus: Arc::clone(&self.bus),
            config: self.config.clone(),
        }
    }

    fn key(&self, user_key: &str) -> Key {
        let key = self.namespace.key(user_key);
        match &self.group {
            Some(group) => key.with_group(group.clone()),
            None => key,
        }
    }

    fn emit(&self, event: CacheEvent) {
        self.bus.publish(Event::Cache(event));
    }

    fn emit_unexpected(&self, key: &Key, error: &AdapterError) {
        self.emit(CacheEvent::UnexpectedError {
            key: key.namespaced(),
            message: error.to_string(),
        });
    }

    /// Read and deserialize a live entry; expired entries are misses.
    pub async fn get<T: DeserializeOwned>(&self, user_key: &str) -> CacheResult<Option<T>> {
        let key = self.key(user_key);
        let now = Utc::now();
        match self.adapter.find(&key).await {
            Ok(Some(record)) if !record.is_expired(now) => {
                self.emit(CacheEvent::Found {
                    key: key.namespaced(),
                });
                Ok(Some(serde_json::from_str(&record.value)?))
            }
            Ok(_) => {
                self.emit(CacheEvent::Missed {
                    key: key.namespaced(),
                });
                Ok(None)
            }
            Err(error) => {
                self.emit_unexpected(&key, &error);
                Err(error.into())
            }
        }
    }

    /// Whether a live entry exists.
    pub async fn exists(&self, user_key: &str) -> CacheResult<bool> {
        let key = self.key(user_key);
        let now = Utc::now();
        match self.adapter.find(&key).await {
            Ok(record) => Ok(record.map_or(false, |r| !r.is_expired(now))),
            Err(error) => {
                self.emit_unexpected(&key, &error);
                Err(error.into())
            }
        }
    }

    /// Write the entry iff absent or expired, with the default TTL;
    /// `true` iff it was written.
    pub async fn add<T: Serialize>(&self, user_key: &str, value: &T) -> CacheResult<bool> {
        self.add_with_ttl(user_key, value, self.config.default_ttl)
            .await
    }

    /// As [`Cache::add`] with an explicit TTL.
    pub async fn add_with_ttl<T: Serialize>(
        &self,
        user_key: &str,
        value: &T,
        ttl: Option<TimeSpan>,
    ) -> CacheResult<bool> {
        let key = self.key(user_key);
        let serialized = serde_json::to_string(value)?;
        let expiration = ttl.map(|ttl| ttl.end_date());
        match self.adapter.insert(&key, &serialized, expiration).await {
            Ok(true) => {
                self.emit(CacheEvent::Added {
                    key: key.namespaced(),
                    ttl,
                });
                Ok(true)
            }
            Ok(false) => Ok(false),
            Err(error) => {
                self.emit_unexpected(&key, &error);
                Err(error.into())
            }
        }
    }

    /// Write the entry unconditionally with the default TTL; `true` iff
    /// a live entry was replaced.
    pub async fn put<T: Serialize>(&self, user_key: &str, value: &T) -> CacheResult<bool> {
        self.put_with_ttl(user_key, value, self.config.default_ttl)
            .await
    }

    /// As [`Cache::put`] with an explicit TTL.
    pub async fn put_with_ttl<T: Serialize>(
        &self,
        user_key: &str,
        value: &T,
        ttl: Option<TimeSpan>,
    ) -> CacheResult<bool> {
        let key = self.key(user_key);
        let serialized = serde_json::to_string(value)?;
        let expiration = ttl.map(|ttl| ttl.end_date());
        match self.adapter.upsert(&key, &serialized, expiration).await {
            Ok(replaced) => {
                self.emit(CacheEvent::Updated {
                    key: key.namespaced(),
                });
                Ok(replaced)
            }
            Err(error) => {
                self.emit_unexpected(&key, &error);
                Err(error.into())
            }
        }
    }

    /// Overwrite the value of a live entry, keeping its expiration;
    /// `true` iff an entry was updated.
    pub async fn update<T: Serialize>(&self, user_key: &str, value: &T) -> CacheResult<bool> {
        let key = self.key(user_key);
        let serialized = serde_json::to_string(value)?;
        match self.adapter.update(&key, &serialized).await {
            Ok(updated) => {
                if updated {
                    self.emit(CacheEvent::Updated {
                        key: key.namespaced(),
                    });
                }
                Ok(updated)
            }
            Err(error) => {
                self.emit_unexpected(&key, &error);
                Err(error.into())
            }
        }
    }

    /// Read the entry, computing and adding it on a miss. On a lost
    /// add race, the concurrent writer's value is returned.
    pub async fn get_or_add<T, F, Fut>(&self, user_key: &str, init: F) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some(value) = self.get(user_key).await? {
            return Ok(value);
        }
        let value = init().await;
        if self.add(user_key, &value).await? {
            return Ok(value);
        }
        match self.get(user_key).await? {
            Some(current) => Ok(current),
            // The concurrent entry disappeared between add and get.
            None => Ok(value),
        }
    }

    /// Remove the entry; `true` iff one was removed.
    pub async fn remove(&self, user_key: &str) -> CacheResult<bool> {
        let key = self.key(user_key);
        match self.adapter.remove(&key).await {
            Ok(removed) => {
                if removed {
                    self.emit(CacheEvent::Removed {
                        key: key.namespaced(),
                    });
                }
                Ok(removed)
            }
            Err(error) => {
                self.emit_unexpected(&key, &error);
                Err(error.into())
            }
        }
    }

    /// Add `delta` to a numeric entry, creating it at `delta` when
    /// absent; returns the new value.
    pub async fn increment(&self, user_key: &str, delta: f64) -> CacheResult<f64> {
        let key = self.key(user_key);
        match self.adapter.increment(&key, delta).await {
            Ok(IncrementOutcome::Updated(value)) => {
                self.emit(CacheEvent::Incremented {
                    key: key.namespaced(),
                    delta,
                });
                Ok(value)
            }
            Ok(IncrementOutcome::NotNumeric) => Err(TypeCacheError {
                key: key.namespaced(),
            }
            .into()),
            Err(error) => {
                self.emit_unexpected(&key, &error);
                Err(error.into())
            }
        }
    }

    /// Subtract `delta` from a numeric entry.
    pub async fn decrement(&self, user_key: &str, delta: f64) -> CacheResult<f64> {
        self.increment(user_key, -delta).await
    }

    /// Remove every entry under this cache's namespace (or group, when
    /// one is set); returns how many entries were removed.
    pub async fn clear(&self) -> CacheResult<u64> {
        let prefix = match &self.group {
            Some(group) => format!(
                "{}{}{}{}",
                self.namespace.prefix(),
                self.namespace.separator(),
                group,
                self.namespace.separator()
            ),
            None => format!("{}{}", self.namespace.prefix(), self.namespace.separator()),
        };
        match self.adapter.remove_namespace(&prefix).await {
            Ok(count) => {
                self.emit(CacheEvent::Cleared {
                    prefix,
                    count,
                });
                Ok(count)
            }
            Err(error) => {
                self.emit(CacheEvent::UnexpectedError {
                    key: prefix,
                    message: error.to_string(),
                });
                Err(error.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryCacheAdapter;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        age: u32,
    }

    fn cache() -> Cache {
        Cache::new(
            Namespace::new("test/cache"),
            Arc::new(MemoryCacheAdapter::new()),
        )
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        let cache = cache();
        let profile = Profile {
            name: "ada".to_string(),
            age: 36,
        };

        assert!(cache.add("p1", &profile).await.unwrap());
        let loaded: Profile = cache.get("p1").await.unwrap().unwrap();
        assert_eq!(loaded, profile);
    }

    #[tokio::test]
    async fn test_add_respects_existing_live_entry() {
        let cache = cache();
        assert!(cache.add("k", &1).await.unwrap());
        assert!(!cache.add("k", &2).await.unwrap());
        assert_eq!(cache.get::<i32>("k").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = cache();
        cache
            .add_with_ttl("k", &"v", Some(TimeSpan::from_millis(-10)))
            .await
            .unwrap();
        assert_eq!(cache.get::<String>("k").await.unwrap(), None);
        assert!(!cache.exists("k").await.unwrap());

        // And add treats it as absent.
        assert!(cache.add("k", &"fresh").await.unwrap());
    }

    #[tokio::test]
    async fn test_put_reports_replacement() {
        let cache = cache();
        assert!(!cache.put("k", &1).await.unwrap());
        assert!(cache.put("k", &2).await.unwrap());
        assert_eq!(cache.get::<i32>("k").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_update_only_touches_live_entries() {
        let cache = cache();
        assert!(!cache.update("missing", &1).await.unwrap());

        cache.put("k", &1).await.unwrap();
        assert!(cache.update("k", &2).await.unwrap());
        assert_eq!(cache.get::<i32>("k").await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_get_or_add_computes_once() {
        let cache = cache();

        let first = cache.get_or_add("k", || async { 41 }).await.unwrap();
        assert_eq!(first, 41);

        // The factory is not consulted when the entry exists.
        let second = cache.get_or_add("k", || async { 99 }).await.unwrap();
        assert_eq!(second, 41);
    }

    #[tokio::test]
    async fn test_increment_and_type_error() {
        let cache = cache();

        assert_eq!(cache.increment("n", 2.0).await.unwrap(), 2.0);
        assert_eq!(cache.increment("n", 3.0).await.unwrap(), 5.0);
        assert_eq!(cache.decrement("n", 1.0).await.unwrap(), 4.0);

        cache.put("text", &"hello").await.unwrap();
        let error = cache.increment("text", 1.0).await.unwrap_err();
        assert!(matches!(error, CacheError::Type(_)));
    }

    #[tokio::test]
    async fn test_groups_isolate_keys() {
        let cache = cache();
        let sessions = cache.with_group("sessions");
        let tokens = cache.with_group("tokens");

        sessions.put("u1", &"s").await.unwrap();
        tokens.put("u1", &"t").await.unwrap();

        assert_eq!(sessions.get::<String>("u1").await.unwrap().unwrap(), "s");
        assert_eq!(tokens.get::<String>("u1").await.unwrap().unwrap(), "t");
        // The ungrouped key is untouched.
        assert_eq!(cache.get::<String>("u1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clear_scopes_to_group() {
        let cache = cache();
        let sessions = cache.with_group("sessions");

        cache.put("root", &1).await.unwrap();
        sessions.put("u1", &2).await.unwrap();
        sessions.put("u2", &3).await.unwrap();

        assert_eq!(sessions.clear().await.unwrap(), 2);
        assert!(cache.exists("root").await.unwrap());

        assert_eq!(cache.clear().await.unwrap(), 1);
        assert!(!cache.exists("root").await.unwrap());
    }
}

//! Event bus boundary
//!
//! The core emits typed events for every mutating handle operation;
//! dispatch is fire-and-forget on a spawned task, so a slow or failing
//! listener can never fail (or even delay) the operation that produced
//! the event. No ordering is guaranteed between an operation and the
//! observation of its event.
//!
//! Subscriptions return an opaque [`SubscriptionId`] used to
//! unsubscribe; listener identity never matters.

use crate::core::TimeSpan;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// All events emitted by the coordination and cache primitives.
#[derive(Debug, Clone, Serialize)]
pub enum Event {
    /// Exclusive lock events.
    Lock(LockEvent),
    /// Shared (reader/writer) lock events.
    SharedLock(SharedLockEvent),
    /// Semaphore events.
    Semaphore(SemaphoreEvent),
    /// Cache events.
    Cache(CacheEvent),
}

/// Events of the exclusive lock.
#[derive(Debug, Clone, Serialize)]
pub enum LockEvent {
    /// The lock was taken.
    Acquired {
        /// Namespaced key.
        key: String,
        /// Owner id that now holds the lock.
        owner: String,
        /// TTL the lock was taken with.
        ttl: Option<TimeSpan>,
    },
    /// The lock was held by someone else.
    Unavailable {
        /// Namespaced key.
        key: String,
        /// Owner id that attempted the acquisition.
        owner: String,
    },
    /// The lock was released by its owner.
    Released {
        /// Namespaced key.
        key: String,
        /// Owner id that released.
        owner: String,
    },
    /// A release found the lock not held by the caller.
    FailedRelease {
        /// Namespaced key.
        key: String,
        /// Owner id that attempted the release.
        owner: String,
    },
    /// The lock was removed regardless of owner.
    ForceReleased {
        /// Namespaced key.
        key: String,
    },
    /// The expiration was moved forward.
    Refreshed {
        /// Namespaced key.
        key: String,
        /// Owner id that refreshed.
        owner: String,
        /// The new TTL.
        ttl: TimeSpan,
    },
    /// A refresh found the lock not held by the caller.
    FailedRefresh {
        /// Namespaced key.
        key: String,
        /// Owner id that attempted the refresh.
        owner: String,
    },
    /// A backend error surfaced; dispatched in addition to the error
    /// propagating to the caller.
    UnexpectedError {
        /// Namespaced key.
        key: String,
        /// Rendered error message.
        message: String,
    },
}

/// Events of the shared reader/writer lock.
#[derive(Debug, Clone, Serialize)]
pub enum SharedLockEvent {
    /// The writer side was taken.
    WriterAcquired {
        /// Namespaced key.
        key: String,
        /// Writer owner id.
        owner: String,
        /// TTL the writer was taken with.
        ttl: Option<TimeSpan>,
    },
    /// The writer side was blocked by readers or another writer.
    WriterUnavailable {
        /// Namespaced key.
        key: String,
        /// Owner id that attempted the acquisition.
        owner: String,
    },
    /// The writer was released by its owner.
    WriterReleased {
        /// Namespaced key.
        key: String,
        /// Writer owner id.
        owner: String,
    },
    /// A writer release found it not held by the caller.
    FailedWriterRelease {
        /// Namespaced key.
        key: String,
        /// Owner id that attempted the release.
        owner: String,
    },
    /// The writer was removed regardless of owner.
    WriterForceReleased {
        /// Namespaced key.
        key: String,
    },
    /// The writer expiration was moved forward.
    WriterRefreshed {
        /// Namespaced key.
        key: String,
        /// Writer owner id.
        owner: String,
        /// The new TTL.
        ttl: TimeSpan,
    },
    /// A writer refresh failed.
    FailedWriterRefresh {
        /// Namespaced key.
        key: String,
        /// Owner id that attempted the refresh.
        owner: String,
    },
    /// A reader slot was taken.
    ReaderAcquired {
        /// Namespaced key.
        key: String,
        /// Reader slot id.
        slot_id: String,
        /// TTL the slot was taken with.
        ttl: Option<TimeSpan>,
    },
    /// No reader slot was available (writer held or capacity reached).
    ReaderUnavailable {
        /// Namespaced key.
        key: String,
        /// Slot id that attempted the acquisition.
        slot_id: String,
    },
    /// A reader slot was released.
    ReaderReleased {
        /// Namespaced key.
        key: String,
        /// Reader slot id.
        slot_id: String,
    },
    /// A reader release found no held slot.
    FailedReaderRelease {
        /// Namespaced key.
        key: String,
        /// Slot id that attempted the release.
        slot_id: String,
    },
    /// A reader slot expiration was moved forward.
    ReaderRefreshed {
        /// Namespaced key.
        key: String,
        /// Reader slot id.
        slot_id: String,
        /// The new TTL.
        ttl: TimeSpan,
    },
    /// A reader refresh failed.
    FailedReaderRefresh {
        /// Namespaced key.
        key: String,
        /// Slot id that attempted the refresh.
        slot_id: String,
    },
    /// Every reader slot was removed atomically.
    AllReadersForceReleased {
        /// Namespaced key.
        key: String,
        /// How many slots were removed.
        count: u64,
    },
    /// A backend error surfaced.
    UnexpectedError {
        /// Namespaced key.
        key: String,
        /// Rendered error message.
        message: String,
    },
}

/// Events of the counting semaphore.
#[derive(Debug, Clone, Serialize)]
pub enum SemaphoreEvent {
    /// A slot was taken.
    Acquired {
        /// Namespaced key.
        key: String,
        /// Slot id.
        slot_id: String,
        /// TTL the slot was taken with.
        ttl: Option<TimeSpan>,
    },
    /// Capacity was exhausted.
    Unavailable {
        /// Namespaced key.
        key: String,
        /// Slot id that attempted the acquisition.
        slot_id: String,
    },
    /// The requested limit diverged from the stored one.
    LimitMismatch {
        /// Namespaced key.
        key: String,
        /// Limit the semaphore was created with.
        stored: u32,
        /// Limit the caller requested.
        requested: u32,
    },
    /// A slot was released.
    Released {
        /// Namespaced key.
        key: String,
        /// Slot id.
        slot_id: String,
    },
    /// A release found no held slot.
    FailedRelease {
        /// Namespaced key.
        key: String,
        /// Slot id that attempted the release.
        slot_id: String,
    },
    /// A slot expiration was moved forward.
    Refreshed {
        /// Namespaced key.
        key: String,
        /// Slot id.
        slot_id: String,
        /// The new TTL.
        ttl: TimeSpan,
    },
    /// A refresh failed.
    FailedRefresh {
        /// Namespaced key.
        key: String,
        /// Slot id that attempted the refresh.
        slot_id: String,
    },
    /// Every slot was removed atomically.
    AllForceReleased {
        /// Namespaced key.
        key: String,
        /// How many slots were removed.
        count: u64,
    },
    /// A backend error surfaced.
    UnexpectedError {
        /// Namespaced key.
        key: String,
        /// Rendered error message.
        message: String,
    },
}

/// Events of the cache facade.
#[derive(Debug, Clone, Serialize)]
pub enum CacheEvent {
    /// A read returned a live entry.
    Found {
        /// Namespaced key.
        key: String,
    },
    /// A read found nothing (or an expired entry).
    Missed {
        /// Namespaced key.
        key: String,
    },
    /// An entry was written by `add`.
    Added {
        /// Namespaced key.
        key: String,
        /// TTL the entry was written with.
        ttl: Option<TimeSpan>,
    },
    /// An entry was written by `put` or `update`.
    Updated {
        /// Namespaced key.
        key: String,
    },
    /// An entry was removed.
    Removed {
        /// Namespaced key.
        key: String,
    },
    /// A numeric entry was incremented.
    Incremented {
        /// Namespaced key.
        key: String,
        /// The applied delta.
        delta: f64,
    },
    /// A namespace (or group) was wiped.
    Cleared {
        /// The removed prefix.
        prefix: String,
        /// How many entries were removed.
        count: u64,
    },
    /// A backend error surfaced.
    UnexpectedError {
        /// Namespaced key.
        key: String,
        /// Rendered error message.
        message: String,
    },
}

/// A listener invoked for every published event.
pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Opaque token identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

/// The dispatcher the core publishes events to.
pub trait EventBus: Send + Sync {
    /// Publish fire-and-forget; must never fail or block the caller on
    /// listener work.
    fn publish(&self, event: Event);

    /// Register a listener; the returned token removes it again.
    fn subscribe(&self, listener: Listener) -> SubscriptionId;

    /// Remove a subscription; `true` iff it existed.
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

/// In-process event bus dispatching on a spawned task.
#[derive(Default)]
pub struct InMemoryEventBus {
    listeners: DashMap<SubscriptionId, Listener>,
}

impl InMemoryEventBus {
    /// Create a bus with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of active subscriptions.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(&self, event: Event) {
        if self.listeners.is_empty() {
            return;
        }
        let listeners: Vec<Listener> = self
            .listeners
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        tokio::spawn(async move {
            for listener in listeners {
                listener(&event);
            }
        });
    }

    fn subscribe(&self, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        self.listeners.insert(id, listener);
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.listeners.remove(&id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn lock_event() -> Event {
        Event::Lock(LockEvent::ForceReleased {
            key: "test/events/k".to_string(),
        })
    }

    #[tokio::test]
    async fn test_subscribe_publish_unsubscribe() {
        let bus = InMemoryEventBus::new();
        let seen = Arc::new(Mutex::new(0u32));

        let counter = Arc::clone(&seen);
        let id = bus.subscribe(Arc::new(move |_| {
            *counter.lock() += 1;
        }));

        bus.publish(lock_event());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock(), 1);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));

        bus.publish(lock_event());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock(), 1);
    }

    #[tokio::test]
    async fn test_listener_panic_does_not_reach_publisher() {
        let bus = InMemoryEventBus::new();
        bus.subscribe(Arc::new(|_| panic!("listener exploded")));

        // The panic is confined to the dispatch task.
        bus.publish(lock_event());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_publish_without_listeners_is_a_no_op() {
        let bus = InMemoryEventBus::new();
        bus.publish(lock_event());
        assert_eq!(bus.listener_count(), 0);
    }
}

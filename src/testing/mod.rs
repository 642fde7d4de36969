//! Behavioral conformance suites
//!
//! Reusable assertion suites every backend adapter must pass. Each
//! suite runs against a fresh random namespace so it can be pointed at
//! shared, persistent backends without cross-run interference.
//!
//! ```rust,ignore
//! use keystone::testing::lock_adapter_suite;
//!
//! #[tokio::test]
//! async fn sqlite_locks_conform() {
//!     let storage = SqliteStorage::connect(SqliteConfig::default()).await.unwrap();
//!     storage.init().await.unwrap();
//!     lock_adapter_suite(&DatabaseLockBridge::new(storage.lock_adapter())).await;
//! }
//! ```

use crate::adapter::{
    CacheAdapter, IncrementOutcome, LockAdapter, SemaphoreAdapter, SharedLockAdapter, SlotAcquire,
};
use crate::core::{Namespace, TimeSpan};
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

fn suite_namespace(primitive: &str) -> Namespace {
    Namespace::new(format!("conformance/{}/{}", primitive, Uuid::new_v4()))
}

fn expired() -> Option<DateTime<Utc>> {
    Some(TimeSpan::from_millis(-50).end_date())
}

fn live(ttl_secs: i64) -> Option<DateTime<Utc>> {
    Some(TimeSpan::from_secs(ttl_secs).end_date())
}

/// Assert the exclusive-lock ownership protocol on `adapter`.
pub async fn lock_adapter_suite<A>(adapter: &A)
where
    A: LockAdapter + ?Sized,
{
    let ns = suite_namespace("lock");

    // Mutual exclusion and owner-checked release.
    let contended = ns.key("contended");
    assert!(adapter.acquire(&contended, "o1", None).await.unwrap());
    assert!(!adapter.acquire(&contended, "o2", None).await.unwrap());
    assert!(!adapter.release(&contended, "o2").await.unwrap());
    assert!(adapter.release(&contended, "o1").await.unwrap());
    assert!(adapter.acquire(&contended, "o2", None).await.unwrap());

    // An expired holder no longer excludes anyone.
    let expiring = ns.key("expiring");
    assert!(adapter
        .acquire(&expiring, "o1", Some(TimeSpan::from_millis(50).end_date()))
        .await
        .unwrap());
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(adapter.acquire(&expiring, "o2", None).await.unwrap());

    // Force release frees the key for any owner.
    let forced = ns.key("forced");
    assert!(adapter.acquire(&forced, "o1", None).await.unwrap());
    assert!(adapter.force_release(&forced).await.unwrap());
    assert!(adapter.acquire(&forced, "o3", None).await.unwrap());

    // Refresh is owner-checked and moves the expiration.
    let refreshed = ns.key("refreshed");
    assert!(adapter.acquire(&refreshed, "o1", live(60)).await.unwrap());
    assert!(!adapter
        .refresh(&refreshed, "o2", TimeSpan::from_secs(120).end_date())
        .await
        .unwrap());
    assert!(adapter
        .refresh(&refreshed, "o1", TimeSpan::from_secs(120).end_date())
        .await
        .unwrap());
    let record = adapter.find(&refreshed).await.unwrap().unwrap();
    let remaining = record.expiration.unwrap() - Utc::now();
    assert!(remaining.num_milliseconds() > 110_000);
}

/// Assert the reader/writer exclusion protocol on `adapter`.
pub async fn shared_lock_adapter_suite<A>(adapter: &A)
where
    A: SharedLockAdapter + ?Sized,
{
    let ns = suite_namespace("shared-lock");

    // Readers exclude writers until the last slot is released.
    let exclusion = ns.key("exclusion");
    assert_eq!(
        adapter
            .acquire_reader(&exclusion, "s1", 2, None)
            .await
            .unwrap(),
        SlotAcquire::Acquired
    );
    assert!(!adapter.acquire_writer(&exclusion, "w", None).await.unwrap());
    assert!(adapter.release_reader(&exclusion, "s1").await.unwrap());
    assert!(adapter.acquire_writer(&exclusion, "w", None).await.unwrap());

    // A live writer excludes readers; the same writer may re-acquire.
    assert_eq!(
        adapter
            .acquire_reader(&exclusion, "s2", 2, None)
            .await
            .unwrap(),
        SlotAcquire::Unavailable
    );
    assert!(adapter.acquire_writer(&exclusion, "w", None).await.unwrap());
    assert!(!adapter
        .acquire_writer(&exclusion, "other", None)
        .await
        .unwrap());
    assert!(adapter.release_writer(&exclusion, "w").await.unwrap());

    // Reader idempotency and capacity.
    let capacity = ns.key("capacity");
    assert_eq!(
        adapter
            .acquire_reader(&capacity, "r1", 2, None)
            .await
            .unwrap(),
        SlotAcquire::Acquired
    );
    assert_eq!(
        adapter
            .acquire_reader(&capacity, "r1", 2, None)
            .await
            .unwrap(),
        SlotAcquire::Acquired
    );
    assert_eq!(
        adapter
            .acquire_reader(&capacity, "r2", 2, None)
            .await
            .unwrap(),
        SlotAcquire::Acquired
    );
    assert_eq!(
        adapter
            .acquire_reader(&capacity, "r3", 2, None)
            .await
            .unwrap(),
        SlotAcquire::Unavailable
    );

    // Force-releasing all readers leaves the key absent and writable.
    assert_eq!(
        adapter.force_release_all_readers(&capacity).await.unwrap(),
        2
    );
    assert!(adapter.find(&capacity).await.unwrap().is_none());
    assert!(adapter.acquire_writer(&capacity, "w", None).await.unwrap());
}

/// Assert the counting-semaphore slot protocol on `adapter`.
pub async fn semaphore_adapter_suite<A>(adapter: &A)
where
    A: SemaphoreAdapter + ?Sized,
{
    let ns = suite_namespace("semaphore");

    // Capacity, idempotency, and limit reconciliation.
    let jobs = ns.key("jobs");
    assert_eq!(
        adapter.acquire(&jobs, "a", 2, None).await.unwrap(),
        SlotAcquire::Acquired
    );
    assert_eq!(
        adapter.acquire(&jobs, "a", 2, None).await.unwrap(),
        SlotAcquire::Acquired
    );
    assert_eq!(
        adapter.acquire(&jobs, "b", 2, None).await.unwrap(),
        SlotAcquire::Acquired
    );
    assert_eq!(
        adapter.acquire(&jobs, "c", 2, None).await.unwrap(),
        SlotAcquire::Unavailable
    );
    assert_eq!(
        adapter.acquire(&jobs, "d", 5, None).await.unwrap(),
        SlotAcquire::LimitMismatch { stored: 2 }
    );

    // Releasing frees capacity; releasing the last slot removes the
    // record entirely.
    assert!(adapter.release(&jobs, "a").await.unwrap());
    assert_eq!(
        adapter.acquire(&jobs, "c", 2, None).await.unwrap(),
        SlotAcquire::Acquired
    );
    assert_eq!(adapter.force_release_all(&jobs).await.unwrap(), 2);
    assert!(adapter.find(&jobs).await.unwrap().is_none());

    // Expired slots do not consume capacity.
    let leases = ns.key("leases");
    assert_eq!(
        adapter.acquire(&leases, "stale", 1, expired()).await.unwrap(),
        SlotAcquire::Acquired
    );
    assert_eq!(
        adapter.acquire(&leases, "fresh", 1, None).await.unwrap(),
        SlotAcquire::Acquired
    );

    // Refresh requires a slot that already expires.
    let refresh = ns.key("refresh");
    adapter.acquire(&refresh, "forever", 2, None).await.unwrap();
    adapter.acquire(&refresh, "leased", 2, live(60)).await.unwrap();
    let new_expiration = TimeSpan::from_secs(120).end_date();
    assert!(!adapter
        .refresh(&refresh, "forever", new_expiration)
        .await
        .unwrap());
    assert!(adapter
        .refresh(&refresh, "leased", new_expiration)
        .await
        .unwrap());
}

/// Assert the cache insert/update/increment semantics on `adapter`.
pub async fn cache_adapter_suite<A>(adapter: &A)
where
    A: CacheAdapter + ?Sized,
{
    let ns = suite_namespace("cache");

    // Insert only writes over absence or expiry.
    let entry = ns.key("entry");
    assert!(adapter.insert(&entry, "\"v1\"", None).await.unwrap());
    assert!(!adapter.insert(&entry, "\"v2\"", None).await.unwrap());
    assert_eq!(adapter.find(&entry).await.unwrap().unwrap().value, "\"v1\"");

    let stale = ns.key("stale");
    assert!(adapter.insert(&stale, "\"old\"", expired()).await.unwrap());
    assert!(adapter.insert(&stale, "\"new\"", None).await.unwrap());
    assert_eq!(adapter.find(&stale).await.unwrap().unwrap().value, "\"new\"");

    // Update touches live entries only.
    assert!(adapter.update(&entry, "\"v3\"").await.unwrap());
    let missing = ns.key("missing");
    assert!(!adapter.update(&missing, "\"x\"").await.unwrap());

    // Upsert reports whether a live entry was replaced.
    assert!(adapter.upsert(&entry, "\"v4\"", None).await.unwrap());
    assert!(!adapter.upsert(&missing, "\"x\"", None).await.unwrap());

    // Remove.
    assert!(adapter.remove(&entry).await.unwrap());
    assert!(!adapter.remove(&entry).await.unwrap());

    // Increment creates at the delta, accumulates, and rejects
    // non-numeric values.
    let counter = ns.key("counter");
    assert_eq!(
        adapter.increment(&counter, 2.0).await.unwrap(),
        IncrementOutcome::Updated(2.0)
    );
    match adapter.increment(&counter, 3.0).await.unwrap() {
        IncrementOutcome::Updated(value) => assert!((value - 5.0).abs() < 1e-9),
        other => panic!("unexpected increment outcome: {other:?}"),
    }
    let text = ns.key("text");
    adapter.insert(&text, "\"hello\"", None).await.unwrap();
    assert_eq!(
        adapter.increment(&text, 1.0).await.unwrap(),
        IncrementOutcome::NotNumeric
    );

    // Namespace clears are prefix-scoped.
    let other_ns = suite_namespace("cache");
    let foreign = other_ns.key("kept");
    adapter.insert(&foreign, "1", None).await.unwrap();
    let removed = adapter
        .remove_namespace(&format!("{}{}", ns.prefix(), ns.separator()))
        .await
        .unwrap();
    assert!(removed >= 1);
    assert!(adapter.find(&foreign).await.unwrap().is_some());
}

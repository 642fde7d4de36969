//! Conformance of the SQLite adapters through the database-to-rich
//! bridges, plus an end-to-end provider flow over SQLite.

use keystone::adapter::sqlite::{SqliteConfig, SqliteStorage};
use keystone::adapter::{
    DatabaseCacheBridge, DatabaseLockBridge, DatabaseSemaphoreBridge, DatabaseSharedLockBridge,
};
use keystone::coordination::LockProvider;
use keystone::core::Namespace;
use keystone::testing::{
    cache_adapter_suite, lock_adapter_suite, semaphore_adapter_suite, shared_lock_adapter_suite,
};
use std::sync::Arc;

async fn storage() -> SqliteStorage {
    let storage = SqliteStorage::connect(SqliteConfig::default())
        .await
        .expect("in-memory sqlite connects");
    storage.init().await.expect("schema creation succeeds");
    storage
}

#[tokio::test]
async fn sqlite_lock_adapter_conforms() {
    let storage = storage().await;
    lock_adapter_suite(&DatabaseLockBridge::new(storage.lock_adapter())).await;
}

#[tokio::test]
async fn sqlite_shared_lock_adapter_conforms() {
    let storage = storage().await;
    shared_lock_adapter_suite(&DatabaseSharedLockBridge::new(storage.shared_lock_adapter())).await;
}

#[tokio::test]
async fn sqlite_semaphore_adapter_conforms() {
    let storage = storage().await;
    semaphore_adapter_suite(&DatabaseSemaphoreBridge::new(storage.semaphore_adapter())).await;
}

#[tokio::test]
async fn sqlite_cache_adapter_conforms() {
    let storage = storage().await;
    cache_adapter_suite(&DatabaseCacheBridge::new(storage.cache_adapter())).await;
}

#[tokio::test]
async fn lock_provider_runs_over_sqlite() {
    let storage = storage().await;
    let provider = LockProvider::new(
        Namespace::new("sqlite/locks"),
        Arc::new(DatabaseLockBridge::new(storage.lock_adapter())),
    );

    let lock = provider.create("order-7");
    let outcome = lock
        .run(|| async { "critical section ran" })
        .await
        .expect("run succeeds");
    assert_eq!(outcome.ok(), Some("critical section ran"));

    // Released again: a contender can take it immediately.
    assert!(provider.create("order-7").acquire().await.unwrap());
}

//! SQLite adapters
//!
//! Database-shape adapters over `sqlx`. Every primitive is a single SQL
//! statement whose predicate carries the CAS condition, so no explicit
//! transaction is needed outside the circuit-breaker store (which does
//! a read-modify-write under `BEGIN IMMEDIATE`).

use crate::adapter::contracts::{
    AdapterLifecycle, CacheRecord, CircuitBreakerStore, DatabaseCacheAdapter,
    DatabaseLockAdapter, DatabaseSemaphoreAdapter, DatabaseSharedLockAdapter, LockRecord,
};
use crate::adapter::{AdapterError, AdapterResult};
use crate::breaker::BreakerState;
use crate::core::Key;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;

const ADAPTER_NAME: &str = "sqlite";

/// SQLite connection configuration.
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database URL (e.g. `sqlite://keystone.db` or `sqlite::memory:`).
    pub url: String,
    /// Maximum pool connections. In-memory databases are always pinned
    /// to a single connection, since each connection would otherwise
    /// see its own empty database.
    pub max_connections: u32,
    /// Prefix shared by all tables.
    pub table_prefix: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 5,
            table_prefix: "keystone".to_string(),
        }
    }
}

/// A SQLite pool shared by the adapters of all primitives.
#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    prefix: String,
}

impl SqliteStorage {
    /// Connect and build the shared pool.
    pub async fn connect(config: SqliteConfig) -> AdapterResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let max_connections = if config.url.contains(":memory:") {
            1
        } else {
            config.max_connections
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self {
            pool,
            prefix: config.table_prefix,
        })
    }

    /// Wrap an existing pool.
    pub fn with_pool(pool: SqlitePool, table_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: table_prefix.into(),
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn table(&self, suffix: &str) -> String {
        format!("{}_{}", self.prefix, suffix)
    }

    /// The lock adapter over this pool.
    pub fn lock_adapter(&self) -> SqliteLockAdapter {
        SqliteLockAdapter {
            storage: self.clone(),
        }
    }

    /// The semaphore adapter over this pool.
    pub fn semaphore_adapter(&self) -> SqliteSemaphoreAdapter {
        SqliteSemaphoreAdapter {
            storage: self.clone(),
        }
    }

    /// The shared-lock adapter over this pool.
    pub fn shared_lock_adapter(&self) -> SqliteSharedLockAdapter {
        SqliteSharedLockAdapter {
            storage: self.clone(),
        }
    }

    /// The cache adapter over this pool.
    pub fn cache_adapter(&self) -> SqliteCacheAdapter {
        SqliteCacheAdapter {
            storage: self.clone(),
        }
    }

    /// The circuit-breaker store over this pool.
    pub fn circuit_breaker_store(&self) -> SqliteCircuitBreakerStore {
        SqliteCircuitBreakerStore {
            storage: self.clone(),
        }
    }

    /// Create all tables and indexes.
    pub async fn init(&self) -> AdapterResult<()> {
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    key TEXT PRIMARY KEY,
                    owner TEXT NOT NULL,
                    expiration BIGINT NULL
                )",
                self.table("lock")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {0}_expiration_idx ON {0} (expiration)",
                self.table("lock")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    key TEXT PRIMARY KEY,
                    slot_limit INTEGER NOT NULL
                )",
                self.table("semaphore")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {0} (
                    id TEXT PRIMARY KEY,
                    key TEXT NOT NULL REFERENCES {1} (key) ON DELETE CASCADE,
                    expiration BIGINT NULL
                )",
                self.table("semaphore_slot"),
                self.table("semaphore")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {0}_key_idx ON {0} (key)",
                self.table("semaphore_slot")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    key TEXT PRIMARY KEY,
                    owner TEXT NOT NULL,
                    expiration BIGINT NULL
                )",
                self.table("writer_lock")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    key TEXT PRIMARY KEY,
                    slot_limit INTEGER NOT NULL
                )",
                self.table("reader_semaphore")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {0} (
                    id TEXT PRIMARY KEY,
                    key TEXT NOT NULL REFERENCES {1} (key) ON DELETE CASCADE,
                    expiration BIGINT NULL
                )",
                self.table("reader_semaphore_slot"),
                self.table("reader_semaphore")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {0}_key_idx ON {0} (key)",
                self.table("reader_semaphore_slot")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    key TEXT PRIMARY KEY,
                    key_group TEXT NULL,
                    value TEXT NOT NULL,
                    expiration BIGINT NULL
                )",
                self.table("cache")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {0}_expiration_idx ON {0} (expiration)",
                self.table("cache")
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    key TEXT PRIMARY KEY,
                    state TEXT NOT NULL
                )",
                self.table("circuit_breaker")
            ),
        ];
        for statement in &statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Drop all tables created by [`SqliteStorage::init`].
    pub async fn de_init(&self) -> AdapterResult<()> {
        // Children before parents, for the foreign keys.
        for suffix in [
            "semaphore_slot",
            "semaphore",
            "reader_semaphore_slot",
            "reader_semaphore",
            "writer_lock",
            "lock",
            "cache",
            "circuit_breaker",
        ] {
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", self.table(suffix)))
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Remove expired rows across all tables; returns how many rows
    /// were deleted.
    pub async fn remove_all_expired(&self) -> AdapterResult<u64> {
        let now = Utc::now().timestamp_millis();
        let mut removed = 0u64;
        for suffix in [
            "lock",
            "writer_lock",
            "semaphore_slot",
            "reader_semaphore_slot",
            "cache",
        ] {
            let result = sqlx::query(&format!(
                "DELETE FROM {} WHERE expiration IS NOT NULL AND expiration <= ?",
                self.table(suffix)
            ))
            .bind(now)
            .execute(&self.pool)
            .await?;
            removed += result.rows_affected();
        }
        // Drop semaphore records whose slots have all been swept.
        for (record, slot) in [
            ("semaphore", "semaphore_slot"),
            ("reader_semaphore", "reader_semaphore_slot"),
        ] {
            sqlx::query(&format!(
                "DELETE FROM {} WHERE NOT EXISTS (SELECT 1 FROM {} WHERE {1}.key = {0}.key)",
                self.table(record),
                self.table(slot)
            ))
            .execute(&self.pool)
            .await?;
        }
        Ok(removed)
    }
}

fn to_millis(expiration: Option<DateTime<Utc>>) -> Option<i64> {
    expiration.map(|e| e.timestamp_millis())
}

fn from_millis(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis.and_then(DateTime::from_timestamp_millis)
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db) if db.kind() == sqlx::error::ErrorKind::UniqueViolation
    )
}

fn map_insert_error(error: sqlx::Error, key: &Key) -> AdapterError {
    if is_unique_violation(&error) {
        AdapterError::Duplicate {
            key: key.namespaced(),
        }
    } else {
        error.into()
    }
}

fn escape_like(prefix: &str) -> String {
    prefix
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

// ============================================================================
// Lock
// ============================================================================

/// SQLite exclusive lock adapter (database shape).
#[derive(Debug, Clone)]
pub struct SqliteLockAdapter {
    storage: SqliteStorage,
}

impl SqliteLockAdapter {
    fn table(&self) -> String {
        self.storage.table("lock")
    }
}

#[async_trait]
impl DatabaseLockAdapter for SqliteLockAdapter {
    fn name(&self) -> &'static str {
        ADAPTER_NAME
    }

    async fn insert(
        &self,
        key: &Key,
        owner: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (key, owner, expiration) VALUES (?, ?, ?)",
            self.table()
        ))
        .bind(key.namespaced())
        .bind(owner)
        .bind(to_millis(expiration))
        .execute(self.storage.pool())
        .await
        .map_err(|error| map_insert_error(error, key))?;
        Ok(())
    }

    async fn update_if_expired(
        &self,
        key: &Key,
        owner: &str,
        expiration: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> AdapterResult<u64> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET owner = ?, expiration = ?
             WHERE key = ? AND expiration IS NOT NULL AND expiration <= ?",
            self.table()
        ))
        .bind(owner)
        .bind(to_millis(expiration))
        .bind(key.namespaced())
        .bind(now.timestamp_millis())
        .execute(self.storage.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn update_expiration_if_owner(
        &self,
        key: &Key,
        owner: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<u64> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET expiration = ? WHERE key = ? AND owner = ?",
            self.table()
        ))
        .bind(expiration.timestamp_millis())
        .bind(key.namespaced())
        .bind(owner)
        .execute(self.storage.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn remove_if_owner(&self, key: &Key, owner: &str) -> AdapterResult<Option<LockRecord>> {
        let row = sqlx::query(&format!(
            "DELETE FROM {} WHERE key = ? AND owner = ? RETURNING owner, expiration",
            self.table()
        ))
        .bind(key.namespaced())
        .bind(owner)
        .fetch_optional(self.storage.pool())
        .await?;
        match row {
            Some(row) => Ok(Some(LockRecord {
                owner: row.try_get("owner")?,
                expiration: from_millis(row.try_get("expiration")?),
            })),
            None => Ok(None),
        }
    }

    async fn remove(&self, key: &Key) -> AdapterResult<u64> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE key = ?", self.table()))
            .bind(key.namespaced())
            .execute(self.storage.pool())
            .await?;
        Ok(result.rows_affected())
    }

    async fn find(&self, key: &Key) -> AdapterResult<Option<LockRecord>> {
        let row = sqlx::query(&format!(
            "SELECT owner, expiration FROM {} WHERE key = ?",
            self.table()
        ))
        .bind(key.namespaced())
        .fetch_optional(self.storage.pool())
        .await?;
        match row {
            Some(row) => Ok(Some(LockRecord {
                owner: row.try_get("owner")?,
                expiration: from_millis(row.try_get("expiration")?),
            })),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl AdapterLifecycle for SqliteLockAdapter {
    async fn init(&self) -> AdapterResult<()> {
        self.storage.init().await
    }

    async fn de_init(&self) -> AdapterResult<()> {
        self.storage.de_init().await
    }

    async fn remove_all_expired(&self) -> AdapterResult<u64> {
        self.storage.remove_all_expired().await
    }
}

// ============================================================================
// Semaphore
// ============================================================================

/// SQLite counting semaphore adapter (database shape).
#[derive(Debug, Clone)]
pub struct SqliteSemaphoreAdapter {
    storage: SqliteStorage,
}

impl SqliteSemaphoreAdapter {
    fn record_table(&self) -> String {
        self.storage.table("semaphore")
    }

    fn slot_table(&self) -> String {
        self.storage.table("semaphore_slot")
    }
}

#[async_trait]
impl DatabaseSemaphoreAdapter for SqliteSemaphoreAdapter {
    fn name(&self) -> &'static str {
        ADAPTER_NAME
    }

    async fn find_record(&self, key: &Key) -> AdapterResult<Option<u32>> {
        let row = sqlx::query(&format!(
            "SELECT slot_limit FROM {} WHERE key = ?",
            self.record_table()
        ))
        .bind(key.namespaced())
        .fetch_optional(self.storage.pool())
        .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<i64, _>("slot_limit")? as u32)),
            None => Ok(None),
        }
    }

    async fn insert_record(&self, key: &Key, limit: u32) -> AdapterResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (key, slot_limit) VALUES (?, ?)",
            self.record_table()
        ))
        .bind(key.namespaced())
        .bind(limit as i64)
        .execute(self.storage.pool())
        .await
        .map_err(|error| map_insert_error(error, key))?;
        Ok(())
    }

    async fn slot_exists(
        &self,
        key: &Key,
        slot_id: &str,
        now: DateTime<Utc>,
    ) -> AdapterResult<bool> {
        let row = sqlx::query(&format!(
            "SELECT 1 AS present FROM {} WHERE key = ? AND id = ?
             AND (expiration IS NULL OR expiration > ?)",
            self.slot_table()
        ))
        .bind(key.namespaced())
        .bind(slot_id)
        .bind(now.timestamp_millis())
        .fetch_optional(self.storage.pool())
        .await?;
        Ok(row.is_some())
    }

    async fn insert_slot_if_capacity(
        &self,
        key: &Key,
        slot_id: &str,
        limit: u32,
        expiration: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> AdapterResult<u64> {
        let result = sqlx::query(&format!(
            "INSERT INTO {0} (id, key, expiration)
             SELECT ?, ?, ?
             WHERE (
                 SELECT COUNT(*) FROM {0}
                 WHERE key = ? AND id <> ? AND (expiration IS NULL OR expiration > ?)
             ) < ?",
            self.slot_table()
        ))
        .bind(slot_id)
        .bind(key.namespaced())
        .bind(to_millis(expiration))
        .bind(key.namespaced())
        .bind(slot_id)
        .bind(now.timestamp_millis())
        .bind(limit as i64)
        .execute(self.storage.pool())
        .await
        .map_err(|error| map_insert_error(error, key))?;
        Ok(result.rows_affected())
    }

    async fn set_slot_expiration(
        &self,
        key: &Key,
        slot_id: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<u64> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET expiration = ? WHERE key = ? AND id = ?",
            self.slot_table()
        ))
        .bind(to_millis(expiration))
        .bind(key.namespaced())
        .bind(slot_id)
        .execute(self.storage.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn refresh_slot(
        &self,
        key: &Key,
        slot_id: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<u64> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET expiration = ?
             WHERE key = ? AND id = ? AND expiration IS NOT NULL",
            self.slot_table()
        ))
        .bind(expiration.timestamp_millis())
        .bind(key.namespaced())
        .bind(slot_id)
        .execute(self.storage.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn remove_slot(&self, key: &Key, slot_id: &str) -> AdapterResult<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE key = ? AND id = ?",
            self.slot_table()
        ))
        .bind(key.namespaced())
        .bind(slot_id)
        .execute(self.storage.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn remove_all_slots(&self, key: &Key) -> AdapterResult<u64> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE key = ?", self.slot_table()))
            .bind(key.namespaced())
            .execute(self.storage.pool())
            .await?;
        Ok(result.rows_affected())
    }

    async fn remove_record_if_empty(&self, key: &Key) -> AdapterResult<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE key = ?
             AND NOT EXISTS (SELECT 1 FROM {} WHERE key = ?)",
            self.record_table(),
            self.slot_table()
        ))
        .bind(key.namespaced())
        .bind(key.namespaced())
        .execute(self.storage.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn load_slots(
        &self,
        key: &Key,
    ) -> AdapterResult<Vec<(String, Option<DateTime<Utc>>)>> {
        let rows = sqlx::query(&format!(
            "SELECT id, expiration FROM {} WHERE key = ?",
            self.slot_table()
        ))
        .bind(key.namespaced())
        .fetch_all(self.storage.pool())
        .await?;
        let mut slots = Vec::with_capacity(rows.len());
        for row in rows {
            slots.push((
                row.try_get("id")?,
                from_millis(row.try_get("expiration")?),
            ));
        }
        Ok(slots)
    }
}

#[async_trait]
impl AdapterLifecycle for SqliteSemaphoreAdapter {
    async fn init(&self) -> AdapterResult<()> {
        self.storage.init().await
    }

    async fn de_init(&self) -> AdapterResult<()> {
        self.storage.de_init().await
    }

    async fn remove_all_expired(&self) -> AdapterResult<u64> {
        self.storage.remove_all_expired().await
    }
}

// ============================================================================
// Shared lock
// ============================================================================

/// SQLite reader/writer shared lock adapter (database shape).
#[derive(Debug, Clone)]
pub struct SqliteSharedLockAdapter {
    storage: SqliteStorage,
}

impl SqliteSharedLockAdapter {
    fn writer_table(&self) -> String {
        self.storage.table("writer_lock")
    }

    fn record_table(&self) -> String {
        self.storage.table("reader_semaphore")
    }

    fn slot_table(&self) -> String {
        self.storage.table("reader_semaphore_slot")
    }
}

#[async_trait]
impl DatabaseSharedLockAdapter for SqliteSharedLockAdapter {
    fn name(&self) -> &'static str {
        ADAPTER_NAME
    }

    async fn insert_writer(
        &self,
        key: &Key,
        owner: &str,
        expiration: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> AdapterResult<bool> {
        let result = sqlx::query(&format!(
            "INSERT INTO {} (key, owner, expiration)
             SELECT ?, ?, ?
             WHERE NOT EXISTS (
                 SELECT 1 FROM {} WHERE key = ? AND (expiration IS NULL OR expiration > ?)
             )",
            self.writer_table(),
            self.slot_table()
        ))
        .bind(key.namespaced())
        .bind(owner)
        .bind(to_millis(expiration))
        .bind(key.namespaced())
        .bind(now.timestamp_millis())
        .execute(self.storage.pool())
        .await
        .map_err(|error| map_insert_error(error, key))?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_writer_if_reacquirable(
        &self,
        key: &Key,
        owner: &str,
        expiration: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> AdapterResult<u64> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET owner = ?, expiration = ?
             WHERE key = ?
             AND (owner = ? OR (expiration IS NOT NULL AND expiration <= ?))
             AND NOT EXISTS (
                 SELECT 1 FROM {} WHERE key = ? AND (expiration IS NULL OR expiration > ?)
             )",
            self.writer_table(),
            self.slot_table()
        ))
        .bind(owner)
        .bind(to_millis(expiration))
        .bind(key.namespaced())
        .bind(owner)
        .bind(now.timestamp_millis())
        .bind(key.namespaced())
        .bind(now.timestamp_millis())
        .execute(self.storage.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn remove_writer_if_owner(&self, key: &Key, owner: &str) -> AdapterResult<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE key = ? AND owner = ?",
            self.writer_table()
        ))
        .bind(key.namespaced())
        .bind(owner)
        .execute(self.storage.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn remove_writer(&self, key: &Key) -> AdapterResult<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE key = ?",
            self.writer_table()
        ))
        .bind(key.namespaced())
        .execute(self.storage.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn refresh_writer_if_owner(
        &self,
        key: &Key,
        owner: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<u64> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET expiration = ?
             WHERE key = ? AND owner = ? AND expiration IS NOT NULL",
            self.writer_table()
        ))
        .bind(expiration.timestamp_millis())
        .bind(key.namespaced())
        .bind(owner)
        .execute(self.storage.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn find_writer(&self, key: &Key) -> AdapterResult<Option<LockRecord>> {
        let row = sqlx::query(&format!(
            "SELECT owner, expiration FROM {} WHERE key = ?",
            self.writer_table()
        ))
        .bind(key.namespaced())
        .fetch_optional(self.storage.pool())
        .await?;
        match row {
            Some(row) => Ok(Some(LockRecord {
                owner: row.try_get("owner")?,
                expiration: from_millis(row.try_get("expiration")?),
            })),
            None => Ok(None),
        }
    }

    async fn find_reader_record(&self, key: &Key) -> AdapterResult<Option<u32>> {
        let row = sqlx::query(&format!(
            "SELECT slot_limit FROM {} WHERE key = ?",
            self.record_table()
        ))
        .bind(key.namespaced())
        .fetch_optional(self.storage.pool())
        .await?;
        match row {
            Some(row) => Ok(Some(row.try_get::<i64, _>("slot_limit")? as u32)),
            None => Ok(None),
        }
    }

    async fn insert_reader_record(&self, key: &Key, limit: u32) -> AdapterResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (key, slot_limit) VALUES (?, ?)",
            self.record_table()
        ))
        .bind(key.namespaced())
        .bind(limit as i64)
        .execute(self.storage.pool())
        .await
        .map_err(|error| map_insert_error(error, key))?;
        Ok(())
    }

    async fn reader_slot_exists(
        &self,
        key: &Key,
        slot_id: &str,
        now: DateTime<Utc>,
    ) -> AdapterResult<bool> {
        let row = sqlx::query(&format!(
            "SELECT 1 AS present FROM {} WHERE key = ? AND id = ?
             AND (expiration IS NULL OR expiration > ?)",
            self.slot_table()
        ))
        .bind(key.namespaced())
        .bind(slot_id)
        .bind(now.timestamp_millis())
        .fetch_optional(self.storage.pool())
        .await?;
        Ok(row.is_some())
    }

    async fn insert_reader_slot_if_allowed(
        &self,
        key: &Key,
        slot_id: &str,
        limit: u32,
        expiration: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> AdapterResult<u64> {
        let result = sqlx::query(&format!(
            "INSERT INTO {0} (id, key, expiration)
             SELECT ?, ?, ?
             WHERE NOT EXISTS (
                 SELECT 1 FROM {1} WHERE key = ? AND (expiration IS NULL OR expiration > ?)
             )
             AND (
                 SELECT COUNT(*) FROM {0}
                 WHERE key = ? AND id <> ? AND (expiration IS NULL OR expiration > ?)
             ) < ?",
            self.slot_table(),
            self.writer_table()
        ))
        .bind(slot_id)
        .bind(key.namespaced())
        .bind(to_millis(expiration))
        .bind(key.namespaced())
        .bind(now.timestamp_millis())
        .bind(key.namespaced())
        .bind(slot_id)
        .bind(now.timestamp_millis())
        .bind(limit as i64)
        .execute(self.storage.pool())
        .await
        .map_err(|error| map_insert_error(error, key))?;
        Ok(result.rows_affected())
    }

    async fn set_reader_slot_expiration(
        &self,
        key: &Key,
        slot_id: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<u64> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET expiration = ? WHERE key = ? AND id = ?",
            self.slot_table()
        ))
        .bind(to_millis(expiration))
        .bind(key.namespaced())
        .bind(slot_id)
        .execute(self.storage.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn refresh_reader_slot(
        &self,
        key: &Key,
        slot_id: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<u64> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET expiration = ?
             WHERE key = ? AND id = ? AND expiration IS NOT NULL",
            self.slot_table()
        ))
        .bind(expiration.timestamp_millis())
        .bind(key.namespaced())
        .bind(slot_id)
        .execute(self.storage.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn remove_reader_slot(&self, key: &Key, slot_id: &str) -> AdapterResult<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE key = ? AND id = ?",
            self.slot_table()
        ))
        .bind(key.namespaced())
        .bind(slot_id)
        .execute(self.storage.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn remove_all_reader_slots(&self, key: &Key) -> AdapterResult<u64> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE key = ?", self.slot_table()))
            .bind(key.namespaced())
            .execute(self.storage.pool())
            .await?;
        Ok(result.rows_affected())
    }

    async fn remove_reader_record_if_empty(&self, key: &Key) -> AdapterResult<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE key = ?
             AND NOT EXISTS (SELECT 1 FROM {} WHERE key = ?)",
            self.record_table(),
            self.slot_table()
        ))
        .bind(key.namespaced())
        .bind(key.namespaced())
        .execute(self.storage.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn load_reader_slots(
        &self,
        key: &Key,
    ) -> AdapterResult<Vec<(String, Option<DateTime<Utc>>)>> {
        let rows = sqlx::query(&format!(
            "SELECT id, expiration FROM {} WHERE key = ?",
            self.slot_table()
        ))
        .bind(key.namespaced())
        .fetch_all(self.storage.pool())
        .await?;
        let mut slots = Vec::with_capacity(rows.len());
        for row in rows {
            slots.push((
                row.try_get("id")?,
                from_millis(row.try_get("expiration")?),
            ));
        }
        Ok(slots)
    }
}

#[async_trait]
impl AdapterLifecycle for SqliteSharedLockAdapter {
    async fn init(&self) -> AdapterResult<()> {
        self.storage.init().await
    }

    async fn de_init(&self) -> AdapterResult<()> {
        self.storage.de_init().await
    }

    async fn remove_all_expired(&self) -> AdapterResult<u64> {
        self.storage.remove_all_expired().await
    }
}

// ============================================================================
// Cache
// ============================================================================

/// SQLite cache adapter (database shape).
#[derive(Debug, Clone)]
pub struct SqliteCacheAdapter {
    storage: SqliteStorage,
}

impl SqliteCacheAdapter {
    fn table(&self) -> String {
        self.storage.table("cache")
    }
}

#[async_trait]
impl DatabaseCacheAdapter for SqliteCacheAdapter {
    fn name(&self) -> &'static str {
        ADAPTER_NAME
    }

    async fn insert(
        &self,
        key: &Key,
        value: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (key, key_group, value, expiration) VALUES (?, ?, ?, ?)",
            self.table()
        ))
        .bind(key.namespaced())
        .bind(key.group())
        .bind(value)
        .bind(to_millis(expiration))
        .execute(self.storage.pool())
        .await
        .map_err(|error| map_insert_error(error, key))?;
        Ok(())
    }

    async fn update_if_expired(
        &self,
        key: &Key,
        value: &str,
        expiration: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> AdapterResult<u64> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET value = ?, expiration = ?
             WHERE key = ? AND expiration IS NOT NULL AND expiration <= ?",
            self.table()
        ))
        .bind(value)
        .bind(to_millis(expiration))
        .bind(key.namespaced())
        .bind(now.timestamp_millis())
        .execute(self.storage.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn update_if_live(
        &self,
        key: &Key,
        value: &str,
        now: DateTime<Utc>,
    ) -> AdapterResult<u64> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET value = ?
             WHERE key = ? AND (expiration IS NULL OR expiration > ?)",
            self.table()
        ))
        .bind(value)
        .bind(key.namespaced())
        .bind(now.timestamp_millis())
        .execute(self.storage.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn replace(
        &self,
        key: &Key,
        value: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (key, key_group, value, expiration) VALUES (?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                 value = excluded.value,
                 expiration = excluded.expiration",
            self.table()
        ))
        .bind(key.namespaced())
        .bind(key.group())
        .bind(value)
        .bind(to_millis(expiration))
        .execute(self.storage.pool())
        .await?;
        Ok(())
    }

    async fn remove(&self, key: &Key) -> AdapterResult<u64> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE key = ?", self.table()))
            .bind(key.namespaced())
            .execute(self.storage.pool())
            .await?;
        Ok(result.rows_affected())
    }

    async fn increment_if_numeric(
        &self,
        key: &Key,
        delta: f64,
        now: DateTime<Utc>,
    ) -> AdapterResult<u64> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET value = CAST(json_extract(value, '$') + ? AS TEXT)
             WHERE key = ?
             AND json_valid(value)
             AND json_type(value, '$') IN ('integer', 'real')
             AND (expiration IS NULL OR expiration > ?)",
            self.table()
        ))
        .bind(delta)
        .bind(key.namespaced())
        .bind(now.timestamp_millis())
        .execute(self.storage.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn find(&self, key: &Key) -> AdapterResult<Option<CacheRecord>> {
        let row = sqlx::query(&format!(
            "SELECT value, expiration FROM {} WHERE key = ?",
            self.table()
        ))
        .bind(key.namespaced())
        .fetch_optional(self.storage.pool())
        .await?;
        match row {
            Some(row) => Ok(Some(CacheRecord {
                value: row.try_get("value")?,
                expiration: from_millis(row.try_get("expiration")?),
            })),
            None => Ok(None),
        }
    }

    async fn remove_prefixed(&self, prefix: &str) -> AdapterResult<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE key LIKE ? ESCAPE '\\'",
            self.table()
        ))
        .bind(format!("{}%", escape_like(prefix)))
        .execute(self.storage.pool())
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl AdapterLifecycle for SqliteCacheAdapter {
    async fn init(&self) -> AdapterResult<()> {
        self.storage.init().await
    }

    async fn de_init(&self) -> AdapterResult<()> {
        self.storage.de_init().await
    }

    async fn remove_all_expired(&self) -> AdapterResult<u64> {
        self.storage.remove_all_expired().await
    }
}

// ============================================================================
// Circuit-breaker store
// ============================================================================

/// SQLite circuit-breaker state store.
///
/// State is persisted as a JSON document; the read-modify-write runs
/// under `BEGIN IMMEDIATE` so concurrent writers serialize.
#[derive(Debug, Clone)]
pub struct SqliteCircuitBreakerStore {
    storage: SqliteStorage,
}

impl SqliteCircuitBreakerStore {
    fn table(&self) -> String {
        self.storage.table("circuit_breaker")
    }
}

#[async_trait]
impl<M> CircuitBreakerStore<M> for SqliteCircuitBreakerStore
where
    M: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
{
    fn name(&self) -> &'static str {
        ADAPTER_NAME
    }

    async fn load(&self, key: &Key) -> AdapterResult<Option<BreakerState<M>>> {
        let row = sqlx::query(&format!("SELECT state FROM {} WHERE key = ?", self.table()))
            .bind(key.namespaced())
            .fetch_optional(self.storage.pool())
            .await?;
        match row {
            Some(row) => {
                let state: String = row.try_get("state")?;
                Ok(Some(serde_json::from_str(&state)?))
            }
            None => Ok(None),
        }
    }

    async fn atomic_update(
        &self,
        key: &Key,
        update: &(dyn Fn(Option<BreakerState<M>>) -> (BreakerState<M>, bool) + Send + Sync),
    ) -> AdapterResult<BreakerState<M>> {
        let mut conn = self.storage.pool().acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let outcome: AdapterResult<BreakerState<M>> = async {
            let row = sqlx::query(&format!("SELECT state FROM {} WHERE key = ?", self.table()))
                .bind(key.namespaced())
                .fetch_optional(&mut *conn)
                .await?;
            let current = match row {
                Some(row) => {
                    let state: String = row.try_get("state")?;
                    Some(serde_json::from_str(&state)?)
                }
                None => None,
            };

            let (next, persist) = update(current);
            if persist {
                let state = serde_json::to_string(&next)?;
                sqlx::query(&format!(
                    "INSERT INTO {} (key, state) VALUES (?, ?)
                     ON CONFLICT(key) DO UPDATE SET state = excluded.state",
                    self.table()
                ))
                .bind(key.namespaced())
                .bind(state)
                .execute(&mut *conn)
                .await?;
            }
            Ok(next)
        }
        .await;

        match outcome {
            Ok(state) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(state)
            }
            Err(error) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::bridge::{
        DatabaseCacheBridge, DatabaseLockBridge, DatabaseSemaphoreBridge,
        DatabaseSharedLockBridge,
    };
    use crate::adapter::contracts::{
        CacheAdapter, IncrementOutcome, LockAdapter, SemaphoreAdapter, SharedLockAdapter,
        SlotAcquire,
    };
    use crate::core::{Namespace, TimeSpan};

    async fn storage() -> SqliteStorage {
        let storage = SqliteStorage::connect(SqliteConfig::default())
            .await
            .unwrap();
        storage.init().await.unwrap();
        storage
    }

    fn key(name: &str) -> Key {
        Namespace::new("test/sqlite").key(name)
    }

    fn expired() -> Option<DateTime<Utc>> {
        Some(TimeSpan::from_millis(-50).end_date())
    }

    #[tokio::test]
    async fn test_lock_contention_round_trip() {
        let bridge = DatabaseLockBridge::new(storage().await.lock_adapter());
        let k = key("contended");

        assert!(bridge.acquire(&k, "o1", None).await.unwrap());
        assert!(!bridge.acquire(&k, "o2", None).await.unwrap());
        assert!(!bridge.release(&k, "o2").await.unwrap());
        assert!(bridge.release(&k, "o1").await.unwrap());
        assert!(bridge.acquire(&k, "o2", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_expired_takeover() {
        let bridge = DatabaseLockBridge::new(storage().await.lock_adapter());
        let k = key("expiring");

        assert!(bridge.acquire(&k, "o1", expired()).await.unwrap());
        assert!(bridge.acquire(&k, "o2", None).await.unwrap());
        assert_eq!(bridge.find(&k).await.unwrap().unwrap().owner, "o2");
    }

    #[tokio::test]
    async fn test_lock_refresh_and_force_release() {
        let bridge = DatabaseLockBridge::new(storage().await.lock_adapter());
        let k = key("refresh");

        let ttl = TimeSpan::from_secs(60);
        assert!(bridge.acquire(&k, "o1", Some(ttl.end_date())).await.unwrap());
        assert!(bridge
            .refresh(&k, "o1", TimeSpan::from_secs(120).end_date())
            .await
            .unwrap());
        assert!(!bridge
            .refresh(&k, "o2", TimeSpan::from_secs(120).end_date())
            .await
            .unwrap());

        assert!(bridge.force_release(&k).await.unwrap());
        assert!(!bridge.force_release(&k).await.unwrap());
    }

    #[tokio::test]
    async fn test_semaphore_capacity_and_idempotency() {
        let bridge = DatabaseSemaphoreBridge::new(storage().await.semaphore_adapter());
        let k = key("semaphore");

        assert_eq!(
            bridge.acquire(&k, "sem-a", 2, None).await.unwrap(),
            SlotAcquire::Acquired
        );
        assert_eq!(
            bridge.acquire(&k, "sem-a", 2, None).await.unwrap(),
            SlotAcquire::Acquired
        );
        assert_eq!(
            bridge.acquire(&k, "sem-b", 2, None).await.unwrap(),
            SlotAcquire::Acquired
        );
        assert_eq!(
            bridge.acquire(&k, "sem-c", 2, None).await.unwrap(),
            SlotAcquire::Unavailable
        );
        assert_eq!(
            bridge.acquire(&k, "sem-d", 3, None).await.unwrap(),
            SlotAcquire::LimitMismatch { stored: 2 }
        );

        assert!(bridge.release(&k, "sem-a").await.unwrap());
        assert_eq!(
            bridge.acquire(&k, "sem-c", 2, None).await.unwrap(),
            SlotAcquire::Acquired
        );

        assert_eq!(bridge.force_release_all(&k).await.unwrap(), 2);
        assert!(bridge.find(&k).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_semaphore_expired_slot_frees_capacity() {
        let bridge = DatabaseSemaphoreBridge::new(storage().await.semaphore_adapter());
        let k = key("expiring-slots");

        assert_eq!(
            bridge.acquire(&k, "stale", 1, expired()).await.unwrap(),
            SlotAcquire::Acquired
        );
        assert_eq!(
            bridge.acquire(&k, "fresh", 1, None).await.unwrap(),
            SlotAcquire::Acquired
        );
    }

    #[tokio::test]
    async fn test_reader_writer_exclusion() {
        let bridge = DatabaseSharedLockBridge::new(storage().await.shared_lock_adapter());
        let k = key("shared");

        assert_eq!(
            bridge.acquire_reader(&k, "rw-s1", 2, None).await.unwrap(),
            SlotAcquire::Acquired
        );
        assert!(!bridge.acquire_writer(&k, "w", None).await.unwrap());
        assert!(bridge.release_reader(&k, "rw-s1").await.unwrap());
        assert!(bridge.acquire_writer(&k, "w", None).await.unwrap());
        assert_eq!(
            bridge.acquire_reader(&k, "rw-s2", 2, None).await.unwrap(),
            SlotAcquire::Unavailable
        );

        // Same writer may re-acquire; another may not.
        assert!(bridge.acquire_writer(&k, "w", None).await.unwrap());
        assert!(!bridge.acquire_writer(&k, "w2", None).await.unwrap());

        assert!(bridge.release_writer(&k, "w").await.unwrap());
        assert_eq!(
            bridge.acquire_reader(&k, "rw-s2", 2, None).await.unwrap(),
            SlotAcquire::Acquired
        );
    }

    #[tokio::test]
    async fn test_force_release_all_readers_leaves_key_absent() {
        let bridge = DatabaseSharedLockBridge::new(storage().await.shared_lock_adapter());
        let k = key("force-readers");

        bridge.acquire_reader(&k, "fr-s1", 3, None).await.unwrap();
        bridge.acquire_reader(&k, "fr-s2", 3, None).await.unwrap();

        assert_eq!(bridge.force_release_all_readers(&k).await.unwrap(), 2);
        assert!(bridge.find(&k).await.unwrap().is_none());
        assert!(bridge.acquire_writer(&k, "w", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_round_trip() {
        let bridge = DatabaseCacheBridge::new(storage().await.cache_adapter());
        let k = key("cache");

        assert!(bridge.insert(&k, "\"v1\"", None).await.unwrap());
        assert!(!bridge.insert(&k, "\"v2\"", None).await.unwrap());
        assert!(bridge.update(&k, "\"v3\"").await.unwrap());
        assert_eq!(bridge.find(&k).await.unwrap().unwrap().value, "\"v3\"");

        assert!(bridge.upsert(&k, "\"v4\"", None).await.unwrap());
        assert!(bridge.remove(&k).await.unwrap());
        assert!(!bridge.remove(&k).await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_add_replaces_expired_entry() {
        let bridge = DatabaseCacheBridge::new(storage().await.cache_adapter());
        let k = key("expired-add");

        assert!(bridge.insert(&k, "\"old\"", expired()).await.unwrap());
        assert!(bridge.insert(&k, "\"new\"", None).await.unwrap());
        assert_eq!(bridge.find(&k).await.unwrap().unwrap().value, "\"new\"");
    }

    #[tokio::test]
    async fn test_cache_increment() {
        let bridge = DatabaseCacheBridge::new(storage().await.cache_adapter());
        let k = key("counter");

        assert_eq!(
            bridge.increment(&k, 2.0).await.unwrap(),
            IncrementOutcome::Updated(2.0)
        );
        match bridge.increment(&k, 3.0).await.unwrap() {
            IncrementOutcome::Updated(value) => assert!((value - 5.0).abs() < 1e-9),
            other => panic!("unexpected outcome: {other:?}"),
        }

        let text = key("text");
        bridge.insert(&text, "\"hello\"", None).await.unwrap();
        assert_eq!(
            bridge.increment(&text, 1.0).await.unwrap(),
            IncrementOutcome::NotNumeric
        );
    }

    #[tokio::test]
    async fn test_cache_namespace_clear() {
        let storage = storage().await;
        let bridge = DatabaseCacheBridge::new(storage.cache_adapter());
        let a = Namespace::new("tenant-a").key("k");
        let b = Namespace::new("tenant-b").key("k");

        bridge.insert(&a, "1", None).await.unwrap();
        bridge.insert(&b, "2", None).await.unwrap();

        assert_eq!(bridge.remove_namespace("tenant-a").await.unwrap(), 1);
        assert!(bridge.find(&a).await.unwrap().is_none());
        assert!(bridge.find(&b).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_rows() {
        let storage = storage().await;
        let locks = DatabaseLockBridge::new(storage.lock_adapter());
        locks.acquire(&key("sw1"), "o", expired()).await.unwrap();
        locks.acquire(&key("sw2"), "o", None).await.unwrap();

        assert_eq!(storage.remove_all_expired().await.unwrap(), 1);
        assert!(locks.find(&key("sw2")).await.unwrap().is_some());
        assert!(locks.find(&key("sw1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_breaker_store_round_trip() {
        use crate::breaker::ConsecutiveMetrics;

        let store = storage().await.circuit_breaker_store();
        let k = key("breaker");

        let state: Option<BreakerState<ConsecutiveMetrics>> = store.load(&k).await.unwrap();
        assert!(state.is_none());

        let written = store
            .atomic_update(&k, &|current: Option<BreakerState<ConsecutiveMetrics>>| {
                assert!(current.is_none());
                (
                    BreakerState::Closed {
                        metrics: ConsecutiveMetrics {
                            failure_count: 2,
                            success_count: 0,
                        },
                    },
                    true,
                )
            })
            .await
            .unwrap();
        assert!(matches!(written, BreakerState::Closed { .. }));

        let state: Option<BreakerState<ConsecutiveMetrics>> = store.load(&k).await.unwrap();
        match state.unwrap() {
            BreakerState::Closed { metrics } => assert_eq!(metrics.failure_count, 2),
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_de_init_drops_tables() {
        let storage = storage().await;
        let locks = DatabaseLockBridge::new(storage.lock_adapter());
        locks.acquire(&key("k"), "o", None).await.unwrap();

        storage.de_init().await.unwrap();
        assert!(locks.find(&key("k")).await.is_err());
    }
}

//! Redis adapters
//!
//! Rich-shape adapters: every compound operation is a single server-side
//! Lua script, so multi-step checks (owner comparison, slot pruning,
//! capacity counting) are atomic per key. Locks and cache entries use
//! native Redis expiry; semaphore and reader slots store absolute
//! millisecond expirations in a hash and are pruned in-script.

use crate::adapter::contracts::{
    AdapterLifecycle, CacheAdapter, CacheRecord, IncrementOutcome, LockAdapter, LockRecord,
    SemaphoreAdapter, SemaphoreRecord, SharedLockAdapter, SharedLockRecord, SlotAcquire,
};
use crate::adapter::AdapterResult;
use crate::core::Key;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use redis::aio::ConnectionManager;

const ADAPTER_NAME: &str = "redis";

/// Redis connection configuration.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis server URL.
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
        }
    }
}

/// A Redis connection shared by the adapters of all primitives.
#[derive(Clone)]
pub struct RedisStorage {
    conn: ConnectionManager,
}

impl RedisStorage {
    /// Connect and build the shared connection manager.
    pub async fn connect(config: RedisConfig) -> AdapterResult<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    /// Wrap an existing connection manager.
    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// The lock adapter over this connection.
    pub fn lock_adapter(&self) -> RedisLockAdapter {
        RedisLockAdapter {
            storage: self.clone(),
        }
    }

    /// The semaphore adapter over this connection.
    pub fn semaphore_adapter(&self) -> RedisSemaphoreAdapter {
        RedisSemaphoreAdapter {
            storage: self.clone(),
        }
    }

    /// The shared-lock adapter over this connection.
    pub fn shared_lock_adapter(&self) -> RedisSharedLockAdapter {
        RedisSharedLockAdapter {
            storage: self.clone(),
        }
    }

    /// The cache adapter over this connection.
    pub fn cache_adapter(&self) -> RedisCacheAdapter {
        RedisCacheAdapter {
            storage: self.clone(),
        }
    }
}

/// Milliseconds until `expiration`; `None` when it never expires,
/// `Some(0)` when it is already in the past.
fn px_until(expiration: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Option<i64> {
    expiration.map(|e| (e - now).num_milliseconds().max(0))
}

/// Absolute-millisecond encoding used for hash slot fields; the empty
/// string means no expiration.
fn slot_expiration(expiration: Option<DateTime<Utc>>) -> String {
    expiration.map_or(String::new(), |e| e.timestamp_millis().to_string())
}

fn decode_slot_expiration(raw: &str) -> Option<DateTime<Utc>> {
    raw.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis)
}

/// Escape Redis glob pattern punctuation in a literal prefix.
fn escape_pattern(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for ch in prefix.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Expiration reconstructed from a PTTL reply (-1 = no expiry).
fn expiration_from_pttl(pttl: i64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if pttl >= 0 {
        Some(now + ChronoDuration::milliseconds(pttl))
    } else {
        None
    }
}

// ============================================================================
// Lock
// ============================================================================

/// Redis exclusive lock adapter.
#[derive(Clone)]
pub struct RedisLockAdapter {
    storage: RedisStorage,
}

#[async_trait]
impl LockAdapter for RedisLockAdapter {
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
        let mut cmd = redis::cmd("SET");
        cmd.arg(key.namespaced()).arg(owner).arg("NX");
        match px_until(expiration, now) {
            // Acquiring with an already-elapsed expiration succeeds but
            // leaves nothing behind.
            Some(0) => return Ok(true),
            Some(px) => {
                cmd.arg("PX").arg(px);
            }
            None => {}
        }
        let reply: Option<String> = cmd.query_async(&mut self.storage.connection()).await?;
        Ok(reply.is_some())
    }

    async fn release(&self, key: &Key, owner: &str) -> AdapterResult<bool> {
        let script = r#"
            if redis.call("get", KEYS[1]) == ARGV[1] then
                return redis.call("del", KEYS[1])
            else
                return 0
            end
        "#;
        let removed: i64 = redis::cmd("EVAL")
            .arg(script)
            .arg(1)
            .arg(key.namespaced())
            .arg(owner)
            .query_async(&mut self.storage.connection())
            .await?;
        Ok(removed == 1)
    }

    async fn force_release(&self, key: &Key) -> AdapterResult<bool> {
        let removed: i64 = redis::cmd("DEL")
            .arg(key.namespaced())
            .query_async(&mut self.storage.connection())
            .await?;
        Ok(removed > 0)
    }

    async fn refresh(
        &self,
        key: &Key,
        owner: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<bool> {
        let px = (expiration - Utc::now()).num_milliseconds().max(1);
        let script = r#"
            if redis.call("get", KEYS[1]) == ARGV[1] then
                return redis.call("pexpire", KEYS[1], ARGV[2])
            else
                return 0
            end
        "#;
        let updated: i64 = redis::cmd("EVAL")
            .arg(script)
            .arg(1)
            .arg(key.namespaced())
            .arg(owner)
            .arg(px)
            .query_async(&mut self.storage.connection())
            .await?;
        Ok(updated == 1)
    }

    async fn find(&self, key: &Key) -> AdapterResult<Option<LockRecord>> {
        let now = Utc::now();
        let (owner, pttl): (Option<String>, i64) = redis::pipe()
            .cmd("GET")
            .arg(key.namespaced())
            .cmd("PTTL")
            .arg(key.namespaced())
            .query_async(&mut self.storage.connection())
            .await?;
        Ok(owner.map(|owner| LockRecord {
            owner,
            expiration: expiration_from_pttl(pttl, now),
        }))
    }
}

#[async_trait]
impl AdapterLifecycle for RedisLockAdapter {}

// ============================================================================
// Semaphore
// ============================================================================

/// Redis counting semaphore adapter.
#[derive(Clone)]
pub struct RedisSemaphoreAdapter {
    storage: RedisStorage,
}

fn limit_key(key: &Key) -> String {
    format!("{}:limit", key.namespaced())
}

fn slots_key(key: &Key) -> String {
    format!("{}:slots", key.namespaced())
}

/// Shared slot-acquisition script body. KEYS: limit, slots. ARGV:
/// slot id, limit, expiration ("" for none), now-millis.
const ACQUIRE_SLOT_SCRIPT: &str = r#"
    local stored = redis.call("get", KEYS[1])
    if stored then
        if tonumber(stored) ~= tonumber(ARGV[2]) then
            return {"mismatch", stored}
        end
    else
        redis.call("set", KEYS[1], ARGV[2])
    end
    if redis.call("hexists", KEYS[2], ARGV[1]) == 1 then
        redis.call("hset", KEYS[2], ARGV[1], ARGV[3])
        return {"acquired"}
    end
    local slots = redis.call("hgetall", KEYS[2])
    local live = 0
    for i = 1, #slots, 2 do
        local exp = slots[i + 1]
        if exp ~= "" and tonumber(exp) <= tonumber(ARGV[4]) then
            redis.call("hdel", KEYS[2], slots[i])
        else
            live = live + 1
        end
    end
    if live < tonumber(ARGV[2]) then
        redis.call("hset", KEYS[2], ARGV[1], ARGV[3])
        return {"acquired"}
    end
    return {"full"}
"#;

/// Slot-release script. KEYS: slots, limit. ARGV: slot id.
const RELEASE_SLOT_SCRIPT: &str = r#"
    local removed = redis.call("hdel", KEYS[1], ARGV[1])
    if redis.call("hlen", KEYS[1]) == 0 then
        redis.call("del", KEYS[1], KEYS[2])
    end
    return removed
"#;

/// Slot-refresh script; requires a slot with a non-empty expiration.
/// KEYS: slots. ARGV: slot id, new expiration.
const REFRESH_SLOT_SCRIPT: &str = r#"
    local current = redis.call("hget", KEYS[1], ARGV[1])
    if current and current ~= "" then
        redis.call("hset", KEYS[1], ARGV[1], ARGV[2])
        return 1
    end
    return 0
"#;

/// Drop every slot and the limit record. KEYS: slots, limit.
const FORCE_RELEASE_SLOTS_SCRIPT: &str = r#"
    local count = redis.call("hlen", KEYS[1])
    redis.call("del", KEYS[1], KEYS[2])
    return count
"#;

fn decode_acquire_reply(reply: Vec<String>) -> SlotAcquire {
    match reply.first().map(String::as_str) {
        Some("acquired") => SlotAcquire::Acquired,
        Some("mismatch") => SlotAcquire::LimitMismatch {
            stored: reply
                .get(1)
                .and_then(|stored| stored.parse().ok())
                .unwrap_or(0),
        },
        _ => SlotAcquire::Unavailable,
    }
}

#[async_trait]
impl SemaphoreAdapter for RedisSemaphoreAdapter {
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
        let reply: Vec<String> = redis::cmd("EVAL")
            .arg(ACQUIRE_SLOT_SCRIPT)
            .arg(2)
            .arg(limit_key(key))
            .arg(slots_key(key))
            .arg(slot_id)
            .arg(limit)
            .arg(slot_expiration(expiration))
            .arg(Utc::now().timestamp_millis())
            .query_async(&mut self.storage.connection())
            .await?;
        Ok(decode_acquire_reply(reply))
    }

    async fn release(&self, key: &Key, slot_id: &str) -> AdapterResult<bool> {
        let removed: i64 = redis::cmd("EVAL")
            .arg(RELEASE_SLOT_SCRIPT)
            .arg(2)
            .arg(slots_key(key))
            .arg(limit_key(key))
            .arg(slot_id)
            .query_async(&mut self.storage.connection())
            .await?;
        Ok(removed == 1)
    }

    async fn refresh(
        &self,
        key: &Key,
        slot_id: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<bool> {
        let updated: i64 = redis::cmd("EVAL")
            .arg(REFRESH_SLOT_SCRIPT)
            .arg(1)
            .arg(slots_key(key))
            .arg(slot_id)
            .arg(expiration.timestamp_millis().to_string())
            .query_async(&mut self.storage.connection())
            .await?;
        Ok(updated == 1)
    }

    async fn force_release_all(&self, key: &Key) -> AdapterResult<u64> {
        let removed: i64 = redis::cmd("EVAL")
            .arg(FORCE_RELEASE_SLOTS_SCRIPT)
            .arg(2)
            .arg(slots_key(key))
            .arg(limit_key(key))
            .query_async(&mut self.storage.connection())
            .await?;
        Ok(removed.max(0) as u64)
    }

    async fn find(&self, key: &Key) -> AdapterResult<Option<SemaphoreRecord>> {
        let (limit, slots): (Option<u32>, Vec<(String, String)>) = redis::pipe()
            .cmd("GET")
            .arg(limit_key(key))
            .cmd("HGETALL")
            .arg(slots_key(key))
            .query_async(&mut self.storage.connection())
            .await?;
        Ok(limit.map(|limit| SemaphoreRecord {
            limit,
            slots: slots
                .into_iter()
                .map(|(id, raw)| (id, decode_slot_expiration(&raw)))
                .collect(),
        }))
    }
}

#[async_trait]
impl AdapterLifecycle for RedisSemaphoreAdapter {}

// ============================================================================
// Shared lock
// ============================================================================

/// Redis reader/writer shared lock adapter.
#[derive(Clone)]
pub struct RedisSharedLockAdapter {
    storage: RedisStorage,
}

fn writer_key(key: &Key) -> String {
    format!("{}:writer", key.namespaced())
}

#[async_trait]
impl SharedLockAdapter for RedisSharedLockAdapter {
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
        // Prune expired reader slots, then take the writer when no live
        // reader remains and the writer is free or already ours.
        let script = r#"
            local slots = redis.call("hgetall", KEYS[2])
            local live = 0
            for i = 1, #slots, 2 do
                local exp = slots[i + 1]
                if exp ~= "" and tonumber(exp) <= tonumber(ARGV[3]) then
                    redis.call("hdel", KEYS[2], slots[i])
                else
                    live = live + 1
                end
            end
            if live > 0 then
                return 0
            end
            if redis.call("hlen", KEYS[2]) == 0 then
                redis.call("del", KEYS[3])
            end
            local current = redis.call("get", KEYS[1])
            if current == false or current == ARGV[1] then
                if ARGV[2] == "" then
                    redis.call("set", KEYS[1], ARGV[1])
                else
                    redis.call("set", KEYS[1], ARGV[1], "PX", tonumber(ARGV[2]))
                end
                return 1
            end
            return 0
        "#;
        let px = match px_until(expiration, now) {
            Some(0) => return Ok(true),
            Some(px) => px.to_string(),
            None => String::new(),
        };
        let acquired: i64 = redis::cmd("EVAL")
            .arg(script)
            .arg(3)
            .arg(writer_key(key))
            .arg(slots_key(key))
            .arg(limit_key(key))
            .arg(owner)
            .arg(px)
            .arg(now.timestamp_millis())
            .query_async(&mut self.storage.connection())
            .await?;
        Ok(acquired == 1)
    }

    async fn release_writer(&self, key: &Key, owner: &str) -> AdapterResult<bool> {
        let script = r#"
            if redis.call("get", KEYS[1]) == ARGV[1] then
                return redis.call("del", KEYS[1])
            else
                return 0
            end
        "#;
        let removed: i64 = redis::cmd("EVAL")
            .arg(script)
            .arg(1)
            .arg(writer_key(key))
            .arg(owner)
            .query_async(&mut self.storage.connection())
            .await?;
        Ok(removed == 1)
    }

    async fn refresh_writer(
        &self,
        key: &Key,
        owner: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<bool> {
        let px = (expiration - Utc::now()).num_milliseconds().max(1);
        // A writer without a TTL is non-expiring and may not be
        // refreshed.
        let script = r#"
            if redis.call("get", KEYS[1]) == ARGV[1] and redis.call("pttl", KEYS[1]) > 0 then
                return redis.call("pexpire", KEYS[1], ARGV[2])
            else
                return 0
            end
        "#;
        let updated: i64 = redis::cmd("EVAL")
            .arg(script)
            .arg(1)
            .arg(writer_key(key))
            .arg(owner)
            .arg(px)
            .query_async(&mut self.storage.connection())
            .await?;
        Ok(updated == 1)
    }

    async fn force_release_writer(&self, key: &Key) -> AdapterResult<bool> {
        let removed: i64 = redis::cmd("DEL")
            .arg(writer_key(key))
            .query_async(&mut self.storage.connection())
            .await?;
        Ok(removed > 0)
    }

    async fn acquire_reader(
        &self,
        key: &Key,
        slot_id: &str,
        limit: u32,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<SlotAcquire> {
        // The semaphore acquisition script with the writer interlock in
        // front.
        let script = r#"
            if redis.call("exists", KEYS[3]) == 1 then
                return {"full"}
            end
            local stored = redis.call("get", KEYS[1])
            if stored then
                if tonumber(stored) ~= tonumber(ARGV[2]) then
                    return {"mismatch", stored}
                end
            else
                redis.call("set", KEYS[1], ARGV[2])
            end
            if redis.call("hexists", KEYS[2], ARGV[1]) == 1 then
                redis.call("hset", KEYS[2], ARGV[1], ARGV[3])
                return {"acquired"}
            end
            local slots = redis.call("hgetall", KEYS[2])
            local live = 0
            for i = 1, #slots, 2 do
                local exp = slots[i + 1]
                if exp ~= "" and tonumber(exp) <= tonumber(ARGV[4]) then
                    redis.call("hdel", KEYS[2], slots[i])
                else
                    live = live + 1
                end
            end
            if live < tonumber(ARGV[2]) then
                redis.call("hset", KEYS[2], ARGV[1], ARGV[3])
                return {"acquired"}
            end
            return {"full"}
        "#;
        let reply: Vec<String> = redis::cmd("EVAL")
            .arg(script)
            .arg(3)
            .arg(limit_key(key))
            .arg(slots_key(key))
            .arg(writer_key(key))
            .arg(slot_id)
            .arg(limit)
            .arg(slot_expiration(expiration))
            .arg(Utc::now().timestamp_millis())
            .query_async(&mut self.storage.connection())
            .await?;
        Ok(decode_acquire_reply(reply))
    }

    async fn release_reader(&self, key: &Key, slot_id: &str) -> AdapterResult<bool> {
        let removed: i64 = redis::cmd("EVAL")
            .arg(RELEASE_SLOT_SCRIPT)
            .arg(2)
            .arg(slots_key(key))
            .arg(limit_key(key))
            .arg(slot_id)
            .query_async(&mut self.storage.connection())
            .await?;
        Ok(removed == 1)
    }

    async fn refresh_reader(
        &self,
        key: &Key,
        slot_id: &str,
        expiration: DateTime<Utc>,
    ) -> AdapterResult<bool> {
        let updated: i64 = redis::cmd("EVAL")
            .arg(REFRESH_SLOT_SCRIPT)
            .arg(1)
            .arg(slots_key(key))
            .arg(slot_id)
            .arg(expiration.timestamp_millis().to_string())
            .query_async(&mut self.storage.connection())
            .await?;
        Ok(updated == 1)
    }

    async fn force_release_all_readers(&self, key: &Key) -> AdapterResult<u64> {
        let removed: i64 = redis::cmd("EVAL")
            .arg(FORCE_RELEASE_SLOTS_SCRIPT)
            .arg(2)
            .arg(slots_key(key))
            .arg(limit_key(key))
            .query_async(&mut self.storage.connection())
            .await?;
        Ok(removed.max(0) as u64)
    }

    async fn find(&self, key: &Key) -> AdapterResult<Option<SharedLockRecord>> {
        let now = Utc::now();
        let (owner, pttl, limit, slots): (Option<String>, i64, Option<u32>, Vec<(String, String)>) =
            redis::pipe()
                .cmd("GET")
                .arg(writer_key(key))
                .cmd("PTTL")
                .arg(writer_key(key))
                .cmd("GET")
                .arg(limit_key(key))
                .cmd("HGETALL")
                .arg(slots_key(key))
                .query_async(&mut self.storage.connection())
                .await?;

        if let Some(owner) = owner {
            return Ok(Some(SharedLockRecord::Writer(LockRecord {
                owner,
                expiration: expiration_from_pttl(pttl, now),
            })));
        }
        Ok(limit.map(|limit| {
            SharedLockRecord::Readers(SemaphoreRecord {
                limit,
                slots: slots
                    .into_iter()
                    .map(|(id, raw)| (id, decode_slot_expiration(&raw)))
                    .collect(),
            })
        }))
    }
}

#[async_trait]
impl AdapterLifecycle for RedisSharedLockAdapter {}

// ============================================================================
// Cache
// ============================================================================

/// Redis cache adapter.
#[derive(Clone)]
pub struct RedisCacheAdapter {
    storage: RedisStorage,
}

#[async_trait]
impl CacheAdapter for RedisCacheAdapter {
    fn name(&self) -> &'static str {
        ADAPTER_NAME
    }

    async fn find(&self, key: &Key) -> AdapterResult<Option<CacheRecord>> {
        let now = Utc::now();
        let (value, pttl): (Option<String>, i64) = redis::pipe()
            .cmd("GET")
            .arg(key.namespaced())
            .cmd("PTTL")
            .arg(key.namespaced())
            .query_async(&mut self.storage.connection())
            .await?;
        Ok(value.map(|value| CacheRecord {
            value,
            expiration: expiration_from_pttl(pttl, now),
        }))
    }

    async fn insert(
        &self,
        key: &Key,
        value: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<bool> {
        let now = Utc::now();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key.namespaced()).arg(value).arg("NX");
        match px_until(expiration, now) {
            Some(0) => return Ok(true),
            Some(px) => {
                cmd.arg("PX").arg(px);
            }
            None => {}
        }
        let reply: Option<String> = cmd.query_async(&mut self.storage.connection()).await?;
        Ok(reply.is_some())
    }

    async fn upsert(
        &self,
        key: &Key,
        value: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> AdapterResult<bool> {
        let now = Utc::now();
        let script = r#"
            local existed = redis.call("exists", KEYS[1])
            if ARGV[2] == "" then
                redis.call("set", KEYS[1], ARGV[1])
            else
                redis.call("set", KEYS[1], ARGV[1], "PX", tonumber(ARGV[2]))
            end
            return existed
        "#;
        let px = match px_until(expiration, now) {
            Some(0) => {
                // Writing an already-expired entry is a removal.
                let existed: i64 = redis::cmd("DEL")
                    .arg(key.namespaced())
                    .query_async(&mut self.storage.connection())
                    .await?;
                return Ok(existed > 0);
            }
            Some(px) => px.to_string(),
            None => String::new(),
        };
        let existed: i64 = redis::cmd("EVAL")
            .arg(script)
            .arg(1)
            .arg(key.namespaced())
            .arg(value)
            .arg(px)
            .query_async(&mut self.storage.connection())
            .await?;
        Ok(existed == 1)
    }

    async fn update(&self, key: &Key, value: &str) -> AdapterResult<bool> {
        let reply: Option<String> = redis::cmd("SET")
            .arg(key.namespaced())
            .arg(value)
            .arg("XX")
            .arg("KEEPTTL")
            .query_async(&mut self.storage.connection())
            .await?;
        Ok(reply.is_some())
    }

    async fn remove(&self, key: &Key) -> AdapterResult<bool> {
        let removed: i64 = redis::cmd("DEL")
            .arg(key.namespaced())
            .query_async(&mut self.storage.connection())
            .await?;
        Ok(removed > 0)
    }

    async fn increment(&self, key: &Key, delta: f64) -> AdapterResult<IncrementOutcome> {
        let result: Result<f64, redis::RedisError> = redis::cmd("INCRBYFLOAT")
            .arg(key.namespaced())
            .arg(delta)
            .query_async(&mut self.storage.connection())
            .await;
        match result {
            Ok(value) => Ok(IncrementOutcome::Updated(value)),
            Err(error) if error.kind() == redis::ErrorKind::TypeError => {
                Ok(IncrementOutcome::NotNumeric)
            }
            Err(error) => {
                // INCRBYFLOAT reports non-numeric values as a plain
                // response error.
                if error.to_string().contains("not a valid float") {
                    Ok(IncrementOutcome::NotNumeric)
                } else {
                    Err(error.into())
                }
            }
        }
    }

    async fn remove_namespace(&self, prefix: &str) -> AdapterResult<u64> {
        let script = r#"
            local removed = 0
            local cursor = "0"
            repeat
                local reply = redis.call("scan", cursor, "match", ARGV[1], "count", 100)
                cursor = reply[1]
                for _, key in ipairs(reply[2]) do
                    removed = removed + redis.call("del", key)
                end
            until cursor == "0"
            return removed
        "#;
        let removed: i64 = redis::cmd("EVAL")
            .arg(script)
            .arg(0)
            .arg(format!("{}*", escape_pattern(prefix)))
            .query_async(&mut self.storage.connection())
            .await?;
        Ok(removed.max(0) as u64)
    }
}

#[async_trait]
impl AdapterLifecycle for RedisCacheAdapter {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Namespace;

    #[test]
    fn test_pattern_escaping() {
        assert_eq!(escape_pattern("app/cache"), "app/cache");
        assert_eq!(escape_pattern("a*b?c[d]"), "a\\*b\\?c\\[d\\]");
    }

    #[test]
    fn test_slot_expiration_encoding() {
        assert_eq!(slot_expiration(None), "");
        assert!(decode_slot_expiration("").is_none());

        let now = Utc::now();
        let encoded = slot_expiration(Some(now));
        let decoded = decode_slot_expiration(&encoded).unwrap();
        assert_eq!(decoded.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn test_derived_key_layout() {
        let key = Namespace::new("app/sem").key("jobs");
        assert_eq!(limit_key(&key), "app/sem/jobs:limit");
        assert_eq!(slots_key(&key), "app/sem/jobs:slots");
        assert_eq!(writer_key(&key), "app/sem/jobs:writer");
    }

    #[test]
    fn test_px_until_clamps_past_expirations() {
        let now = Utc::now();
        assert_eq!(px_until(None, now), None);
        assert_eq!(
            px_until(Some(now - ChronoDuration::seconds(5)), now),
            Some(0)
        );
        let px = px_until(Some(now + ChronoDuration::seconds(5)), now).unwrap();
        assert!(px > 4_000 && px <= 5_000);
    }
}

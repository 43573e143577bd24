//! Networked store backend built on Redis.
//!
//! Connections go through [`redis::aio::ConnectionManager`], which
//! transparently reconnects after transient failures. The composite
//! admission operations are server-side Lua scripts, so every multi-step
//! sequence the engines mark as atomic executes as one unit of work on the
//! server regardless of how many service processes share the store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, info};

use crate::error::Result;

use super::{StoreBackend, StoreKind};

/// Fixed window: increment and arm the window TTL in one unit.
const FIXED_WINDOW_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
  redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Sliding window log: prune, count, conditionally add, refresh TTL.
/// ARGV: boundary (now - window), limit, now, member, ttl.
const SLIDING_LOG_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local count = redis.call('ZCARD', KEYS[1])
local admitted = 0
if count < tonumber(ARGV[2]) then
  redis.call('ZADD', KEYS[1], ARGV[3], ARGV[4])
  admitted = 1
end
redis.call('EXPIRE', KEYS[1], ARGV[5])
return admitted
"#;

/// Sliding window counter: weighted estimate, conditional increment.
/// KEYS: current slice, previous slice. ARGV: weight, limit, ttl.
const SLIDING_COUNTER_SCRIPT: &str = r#"
local curr = tonumber(redis.call('GET', KEYS[1]) or '0')
local prev = tonumber(redis.call('GET', KEYS[2]) or '0')
if prev * tonumber(ARGV[1]) + curr < tonumber(ARGV[2]) then
  redis.call('INCR', KEYS[1])
  redis.call('EXPIRE', KEYS[1], ARGV[3])
  return 1
end
return 0
"#;

/// Token bucket: refill to now, take one token if available, write back.
/// ARGV: limit, refill rate, now, ttl. The refill delta is clamped at zero
/// so a writer with a slightly older clock cannot drain the bucket.
const TOKEN_BUCKET_SCRIPT: &str = r#"
local limit = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local tokens = limit
local last = now
local data = redis.call('GET', KEYS[1])
if data then
  local ok, state = pcall(cjson.decode, data)
  if ok then
    tokens = tonumber(state.tokens) or limit
    last = tonumber(state.last_refill) or now
  end
end
local delta = now - last
if delta < 0 then delta = 0 end
tokens = math.min(limit, tokens + delta * rate)
local admitted = 0
if tokens >= 1 then
  tokens = tokens - 1
  admitted = 1
end
redis.call('SET', KEYS[1], cjson.encode({tokens = tokens, last_refill = now}), 'EX', ARGV[4])
return admitted
"#;

/// Store backend talking to a real Redis server.
pub struct RedisStore {
    conn: ConnectionManager,
    fixed_window: Script,
    sliding_log: Script,
    sliding_counter: Script,
    token_bucket: Script,
}

impl RedisStore {
    /// Connect to Redis at the given URL and verify reachability.
    pub async fn connect(url: &str) -> Result<Self> {
        debug!(url = %url, "Connecting to Redis");
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        let store = Self {
            conn,
            fixed_window: Script::new(FIXED_WINDOW_SCRIPT),
            sliding_log: Script::new(SLIDING_LOG_SCRIPT),
            sliding_counter: Script::new(SLIDING_COUNTER_SCRIPT),
            token_bucket: Script::new(TOKEN_BUCKET_SCRIPT),
        };
        store.ping().await?;

        info!(url = %url, "Connected to Redis");
        Ok(store)
    }

    fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl StoreBackend for RedisStore {
    fn kind(&self) -> StoreKind {
        StoreKind::Redis
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.connection();
        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.connection();
        let written: bool = conn.set_nx(key, value).await?;
        Ok(written)
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection();
        let value: i64 = conn.incr(key, 1).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection();
        let _: bool = conn.expire(key, ttl.as_secs().max(1) as i64).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.connection();
        let keys: Vec<String> = conn.keys(pattern).await?;
        Ok(keys)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.connection();
        let _: i64 = conn.sadd(key, member).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.connection();
        let _: i64 = conn.srem(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.connection();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }

    async fn scard(&self, key: &str) -> Result<u64> {
        let mut conn = self.connection();
        let count: u64 = conn.scard(key).await?;
        Ok(count)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<u64> {
        let mut conn = self.connection();
        let len: u64 = conn.rpush(key, value).await?;
        Ok(len)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection();
        let value: Option<String> = conn.lpop(key, None).await?;
        Ok(value)
    }

    async fn rpop(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection();
        let value: Option<String> = conn.rpop(key, None).await?;
        Ok(value)
    }

    async fn llen(&self, key: &str) -> Result<u64> {
        let mut conn = self.connection();
        let len: u64 = conn.llen(key).await?;
        Ok(len)
    }

    async fn fixed_window_incr(&self, key: &str, window: Duration) -> Result<i64> {
        let mut conn = self.connection();
        let count: i64 = self
            .fixed_window
            .key(key)
            .arg(window.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn sliding_log_admit(
        &self,
        key: &str,
        now: f64,
        window_secs: u64,
        limit: u64,
        member: &str,
    ) -> Result<bool> {
        let mut conn = self.connection();
        let admitted: i64 = self
            .sliding_log
            .key(key)
            .arg(now - window_secs as f64)
            .arg(limit)
            .arg(now)
            .arg(member)
            .arg(window_secs + 1)
            .invoke_async(&mut conn)
            .await?;
        Ok(admitted == 1)
    }

    async fn sliding_counter_admit(
        &self,
        current_key: &str,
        previous_key: &str,
        weight: f64,
        limit: u64,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.connection();
        let admitted: i64 = self
            .sliding_counter
            .key(current_key)
            .key(previous_key)
            .arg(weight)
            .arg(limit)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(admitted == 1)
    }

    async fn token_bucket_take(
        &self,
        key: &str,
        now: f64,
        limit: u64,
        refill_rate: f64,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.connection();
        let admitted: i64 = self
            .token_bucket
            .key(key)
            .arg(limit)
            .arg(refill_rate)
            .arg(now)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(admitted == 1)
    }
}

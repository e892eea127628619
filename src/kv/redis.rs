//! Redis-backed [`KvStore`] implementation.
//!
//! Uses a multiplexed connection manager (reconnects transparently) and
//! registers one Lua script per compare-style operation so that every
//! read-check-write sequence executes atomically on the server. The
//! admission script reads the server clock (`TIME`), so the fleet-wide
//! rate-limit ordering is bounded by the store's clock, not by worker
//! clocks.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::time::Duration;

use super::{KvError, KvStore};

/// Delete only when the stored value matches (lock release).
const DELETE_IF_EQUALS: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

/// Refresh TTL only when the stored value matches (lock extend).
const EXPIRE_IF_EQUALS: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
";

/// Write KEYS[1] only while KEYS[2] still holds the guard value.
const SET_IF_GUARD_MATCHES: &str = r"
if redis.call('GET', KEYS[2]) == ARGV[3] then
  redis.call('SET', KEYS[1], ARGV[1], 'PX', tonumber(ARGV[2]))
  return 1
end
return 0
";

/// Interval admission against the server clock. Returns 0 when admitted,
/// otherwise the remaining wait in milliseconds.
const ADMIT_INTERVAL: &str = r"
local t = redis.call('TIME')
local now = t[1] * 1000 + math.floor(t[2] / 1000)
local last = tonumber(redis.call('GET', KEYS[1]) or '0')
local interval = tonumber(ARGV[1])
local elapsed = now - last
if elapsed >= interval then
  redis.call('SET', KEYS[1], now, 'PX', tonumber(ARGV[2]))
  return 0
end
return interval - elapsed
";

/// Counter increment with TTL refresh in one round trip.
const INCR_WITH_TTL: &str = r"
local v = redis.call('INCR', KEYS[1])
redis.call('PEXPIRE', KEYS[1], ARGV[1])
return v
";

fn map_err(err: redis::RedisError) -> KvError {
    KvError::backend(err.to_string())
}

fn ttl_ms(ttl: Duration) -> u64 {
    // PX 0 would be rejected; clamp to the smallest expirable interval.
    (ttl.as_millis() as u64).max(1)
}

struct Scripts {
    delete_if_equals: Script,
    expire_if_equals: Script,
    set_if_guard_matches: Script,
    admit_interval: Script,
    incr_with_ttl: Script,
}

/// Redis client holding a reconnecting multiplexed connection.
#[derive(Clone)]
pub struct RedisKv {
    manager: ConnectionManager,
    scripts: std::sync::Arc<Scripts>,
}

impl RedisKv {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`).
    ///
    /// # Errors
    ///
    /// [`KvError::Backend`] when the URL is invalid or the initial
    /// connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client = Client::open(url).map_err(map_err)?;
        let manager = client.get_connection_manager().await.map_err(map_err)?;
        Ok(Self {
            manager,
            scripts: std::sync::Arc::new(Scripts {
                delete_if_equals: Script::new(DELETE_IF_EQUALS),
                expire_if_equals: Script::new(EXPIRE_IF_EQUALS),
                set_if_guard_matches: Script::new(SET_IF_GUARD_MATCHES),
                admit_interval: Script::new(ADMIT_INTERVAL),
                incr_with_ttl: Script::new(INCR_WITH_TTL),
            }),
        })
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn ready(&self) -> bool {
        let mut conn = self.manager.clone();
        let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        matches!(pong.as_deref(), Ok("PONG"))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_ms(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(map_err)?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms(ttl))
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.manager.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(removed > 0)
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, KvError> {
        let mut conn = self.manager.clone();
        let value: i64 = self
            .scripts
            .incr_with_ttl
            .key(key)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(value)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        let mut conn = self.manager.clone();
        let removed: i64 = self
            .scripts
            .delete_if_equals
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(removed > 0)
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let mut conn = self.manager.clone();
        let refreshed: i64 = self
            .scripts
            .expire_if_equals
            .key(key)
            .arg(expected)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(refreshed > 0)
    }

    async fn set_if_guard_matches(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        guard_key: &str,
        guard_value: &str,
    ) -> Result<bool, KvError> {
        let mut conn = self.manager.clone();
        let wrote: i64 = self
            .scripts
            .set_if_guard_matches
            .key(key)
            .key(guard_key)
            .arg(value)
            .arg(ttl_ms(ttl))
            .arg(guard_value)
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(wrote > 0)
    }

    async fn admit_interval(
        &self,
        key: &str,
        interval_ms: u64,
        ttl: Duration,
    ) -> Result<u64, KvError> {
        let mut conn = self.manager.clone();
        let wait: i64 = self
            .scripts
            .admit_interval
            .key(key)
            .arg(interval_ms)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(wait.max(0) as u64)
    }
}

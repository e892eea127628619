//! In-process [`KvStore`] implementation.
//!
//! Single-process stand-in with the same observable semantics as the Redis
//! backend: TTL expiry (checked lazily on access), set-if-absent, and the
//! compare-style operations executed under one mutex so they are atomic with
//! respect to each other. Used by the test suites and available as a
//! degraded-mode store for single-worker deployments.

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use super::{KvError, KvStore};

#[derive(Clone, Debug)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

/// Mutex-guarded map with Redis-like TTL semantics.
#[derive(Clone)]
pub struct MemoryKv {
    entries: Arc<Mutex<FxHashMap<String, Entry>>>,
    ready: Arc<AtomicBool>,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(FxHashMap::default())),
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate the store going away (tests of fallback paths).
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    fn check_ready(&self) -> Result<(), KvError> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(KvError::backend("memory store marked unavailable"))
        }
    }

    fn read_live(map: &mut FxHashMap<String, Entry>, key: &str) -> Option<String> {
        match map.get(key) {
            Some(entry) if entry.live() => Some(entry.value.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    fn expires(ttl: Duration) -> Option<Instant> {
        Some(Instant::now() + ttl)
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.check_ready()?;
        let mut map = self.entries.lock();
        Ok(Self::read_live(&mut map, key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        self.check_ready()?;
        let mut map = self.entries.lock();
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.and_then(Self::expires),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        self.check_ready()?;
        let mut map = self.entries.lock();
        if Self::read_live(&mut map, key).is_some() {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Self::expires(ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        self.check_ready()?;
        let mut map = self.entries.lock();
        let existed = Self::read_live(&mut map, key).is_some();
        map.remove(key);
        Ok(existed)
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, KvError> {
        self.check_ready()?;
        let mut map = self.entries.lock();
        let current = Self::read_live(&mut map, key)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + 1;
        map.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: Self::expires(ttl),
            },
        );
        Ok(next)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        self.check_ready()?;
        let mut map = self.entries.lock();
        match Self::read_live(&mut map, key) {
            Some(value) if value == expected => {
                map.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        self.check_ready()?;
        let mut map = self.entries.lock();
        match Self::read_live(&mut map, key) {
            Some(value) if value == expected => {
                map.insert(
                    key.to_string(),
                    Entry {
                        value,
                        expires_at: Self::expires(ttl),
                    },
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_if_guard_matches(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        guard_key: &str,
        guard_value: &str,
    ) -> Result<bool, KvError> {
        self.check_ready()?;
        let mut map = self.entries.lock();
        match Self::read_live(&mut map, guard_key) {
            Some(current) if current == guard_value => {
                map.insert(
                    key.to_string(),
                    Entry {
                        value: value.to_string(),
                        expires_at: Self::expires(ttl),
                    },
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn admit_interval(
        &self,
        key: &str,
        interval_ms: u64,
        ttl: Duration,
    ) -> Result<u64, KvError> {
        self.check_ready()?;
        let mut map = self.entries.lock();
        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let last = Self::read_live(&mut map, key)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let elapsed = now_ms.saturating_sub(last);
        if elapsed >= interval_ms {
            map.insert(
                key.to_string(),
                Entry {
                    value: now_ms.to_string(),
                    expires_at: Self::expires(ttl),
                },
            );
            Ok(0)
        } else {
            Ok(interval_ms - elapsed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_respects_existing_value() {
        let kv = MemoryKv::new();
        assert!(kv.set_nx("k", "a", Duration::from_secs(10)).await.unwrap());
        assert!(!kv.set_nx("k", "b", Duration::from_secs(10)).await.unwrap());
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let kv = MemoryKv::new();
        kv.set("k", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
        // Expired key is free for set_nx again.
        assert!(kv.set_nx("k", "w", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn delete_if_equals_requires_match() {
        let kv = MemoryKv::new();
        kv.set("k", "owner-1", None).await.unwrap();
        assert!(!kv.delete_if_equals("k", "owner-2").await.unwrap());
        assert!(kv.delete_if_equals("k", "owner-1").await.unwrap());
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn guarded_set_refuses_on_guard_mismatch() {
        let kv = MemoryKv::new();
        kv.set("lock", "owner-1", None).await.unwrap();
        let wrote = kv
            .set_if_guard_matches("state", "s1", Duration::from_secs(5), "lock", "owner-2")
            .await
            .unwrap();
        assert!(!wrote);
        assert_eq!(kv.get("state").await.unwrap(), None);

        let wrote = kv
            .set_if_guard_matches("state", "s1", Duration::from_secs(5), "lock", "owner-1")
            .await
            .unwrap();
        assert!(wrote);
        assert_eq!(kv.get("state").await.unwrap().as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn admission_gate_spaces_calls() {
        let kv = MemoryKv::new();
        let wait = kv
            .admit_interval("gate", 1000, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(wait, 0);
        let wait = kv
            .admit_interval("gate", 1000, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(wait > 0 && wait <= 1000);
    }

    #[tokio::test]
    async fn unready_store_errors() {
        let kv = MemoryKv::new();
        kv.set_ready(false);
        assert!(!kv.ready().await);
        assert!(kv.get("k").await.is_err());
    }
}

//! Distributed execution lock.
//!
//! One lock per report id guarantees at-most-one active worker per run; the
//! same manager doubles as a generic mutual-exclusion primitive for any key.
//! Ownership is proven by an opaque per-acquisition token: extend and
//! release only succeed while the stored value still equals the caller's
//! token, so a stale worker can never release a successor's lock. All four
//! operations are atomic in the backing store (server-side scripts).
//!
//! There is no fairness; callers retry acquisition themselves. Liveness
//! comes from the TTL: a crashed holder's lock expires on its own.

use miette::Diagnostic;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::kv::{KvError, KvStore};

/// Key prefix for per-run execution locks.
pub const LOCK_KEY_PREFIX: &str = "pipeline_lock:";

/// Key for the execution lock of `report_id`.
#[must_use]
pub fn lock_key(report_id: &str) -> String {
    format!("{LOCK_KEY_PREFIX}{report_id}")
}

/// Mint a fresh opaque owner token.
#[must_use]
pub fn new_owner_token() -> String {
    Uuid::new_v4().to_string()
}

/// Lock timing configuration.
///
/// Constraints (checked by [`LockSettings::checked`]):
/// - `ttl` must exceed the longest expected run (deadline + margin);
/// - `refresh_interval` must sit in `[60 s, ttl / 5]` so a live run renews
///   comfortably without hammering the store;
/// - `extension` is the post-completion publication window.
#[derive(Clone, Copy, Debug)]
pub struct LockSettings {
    pub ttl: Duration,
    pub refresh_interval: Duration,
    pub extension: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(35 * 60),
            refresh_interval: Duration::from_secs(90),
            extension: Duration::from_secs(10 * 60),
        }
    }
}

impl LockSettings {
    /// Build settings, rejecting timings that would starve or hammer the
    /// store.
    ///
    /// # Errors
    ///
    /// [`LockError::BadTimings`] naming the violated constraint.
    pub fn checked(
        ttl: Duration,
        refresh_interval: Duration,
        extension: Duration,
    ) -> Result<Self, LockError> {
        if refresh_interval < Duration::from_secs(60) {
            return Err(LockError::BadTimings {
                reason: "refresh interval below 60s would hammer the store",
            });
        }
        if refresh_interval > ttl / 5 {
            return Err(LockError::BadTimings {
                reason: "refresh interval must be at most a fifth of the lock TTL",
            });
        }
        Ok(Self {
            ttl,
            refresh_interval,
            extension,
        })
    }
}

/// Errors from lock operations.
#[derive(Debug, Error, Diagnostic)]
pub enum LockError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Kv(#[from] KvError),

    #[error("invalid lock timings: {reason}")]
    #[diagnostic(
        code(tapestry::lock::bad_timings),
        help("Keep refresh in [60s, ttl/5] and ttl above the run deadline.")
    )]
    BadTimings { reason: &'static str },
}

/// Acquire / verify / extend / release over the shared store.
#[derive(Clone)]
pub struct LockManager {
    kv: Arc<dyn KvStore>,
}

impl LockManager {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Set-if-absent with TTL. Returns false when another holder exists.
    pub async fn acquire(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError> {
        Ok(self.kv.set_nx(key, value, ttl).await?)
    }

    /// True iff the key exists and holds exactly `value`.
    pub async fn verify(&self, key: &str, value: &str) -> Result<bool, LockError> {
        Ok(self.kv.get(key).await?.as_deref() == Some(value))
    }

    /// Reset the TTL only while the stored value matches.
    pub async fn extend(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, LockError> {
        Ok(self.kv.expire_if_equals(key, value, ttl).await?)
    }

    /// Delete only while the stored value matches.
    pub async fn release(&self, key: &str, value: &str) -> Result<bool, LockError> {
        Ok(self.kv.delete_if_equals(key, value).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn manager() -> LockManager {
        LockManager::new(Arc::new(MemoryKv::new()))
    }

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn acquire_is_exclusive() {
        let lock = manager();
        assert!(lock.acquire("k", "w1", TTL).await.unwrap());
        assert!(!lock.acquire("k", "w2", TTL).await.unwrap());
        assert!(lock.verify("k", "w1").await.unwrap());
        assert!(!lock.verify("k", "w2").await.unwrap());
    }

    #[tokio::test]
    async fn stale_owner_cannot_extend_or_release() {
        let lock = manager();
        assert!(lock.acquire("k", "w1", TTL).await.unwrap());
        assert!(!lock.extend("k", "w2", TTL).await.unwrap());
        assert!(!lock.release("k", "w2").await.unwrap());
        // The real holder still works.
        assert!(lock.extend("k", "w1", TTL).await.unwrap());
        assert!(lock.release("k", "w1").await.unwrap());
        assert!(!lock.verify("k", "w1").await.unwrap());
    }

    #[tokio::test]
    async fn expired_lock_can_be_reacquired() {
        let lock = manager();
        assert!(
            lock.acquire("k", "w1", Duration::from_millis(20))
                .await
                .unwrap()
        );
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(lock.acquire("k", "w2", TTL).await.unwrap());
        assert!(lock.verify("k", "w2").await.unwrap());
    }

    #[test]
    fn settings_constraints() {
        assert!(
            LockSettings::checked(
                Duration::from_secs(35 * 60),
                Duration::from_secs(90),
                Duration::from_secs(600),
            )
            .is_ok()
        );
        assert!(matches!(
            LockSettings::checked(
                Duration::from_secs(35 * 60),
                Duration::from_secs(30),
                Duration::from_secs(600),
            ),
            Err(LockError::BadTimings { .. })
        ));
        assert!(matches!(
            LockSettings::checked(
                Duration::from_secs(120),
                Duration::from_secs(60),
                Duration::from_secs(600),
            ),
            Err(LockError::BadTimings { .. })
        ));
    }

    #[test]
    fn owner_tokens_are_unique() {
        assert_ne!(new_owner_token(), new_owner_token());
    }
}

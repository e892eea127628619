//! Redis-compatible key-value abstraction.
//!
//! Everything durable in the engine — run state, locks, rate-limit admission,
//! validation counters, the score cache — goes through the [`KvStore`] trait.
//! The contract is the small slice of Redis the engine needs: string
//! get/set with TTL, set-if-absent, delete, counter increment, and four
//! atomic compare-style operations that a Redis backend implements as
//! server-side scripts. The in-process [`MemoryKv`] honours the same
//! semantics under a mutex and backs tests and degraded operation.

use async_trait::async_trait;
use miette::Diagnostic;
use std::time::Duration;
use thiserror::Error;

mod memory;
mod redis;

pub use memory::MemoryKv;
pub use redis::RedisKv;

/// Errors from key-value operations.
#[derive(Debug, Error, Diagnostic)]
pub enum KvError {
    /// Backend storage error (connection refused, protocol error, script
    /// failure).
    #[error("key-value backend error: {message}")]
    #[diagnostic(
        code(tapestry::kv::backend),
        help("Check store connectivity; backend message: {message}.")
    )]
    Backend { message: String },

    /// Payload stored at the key is not what the operation expected.
    #[error("unexpected payload at {key}: {reason}")]
    #[diagnostic(code(tapestry::kv::payload))]
    Payload { key: String, reason: String },
}

impl KvError {
    pub(crate) fn backend(message: impl Into<String>) -> Self {
        KvError::Backend {
            message: message.into(),
        }
    }
}

/// The store capabilities required by the engine (§ key layout):
///
/// - `pipeline_state:<reportId>` — JSON run state, 24 h / 1 h TTL.
/// - `pipeline_lock:<reportId>` — opaque owner token.
/// - `pipeline_validation_failure:<reportId>:<stage>` — integer counter.
/// - `perspective:global-rate-limit` — last-admission epoch ms.
/// - `<envPrefix>-perspective:<sha256hex>` — cached classifier scores.
///
/// All compare-style operations are atomic with respect to the backing
/// store. Implementations must not interleave the read and the write.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Whether the store is reachable and accepting commands.
    async fn ready(&self) -> bool;

    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// Plain write, optionally with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Set-if-absent with TTL. Returns true iff the key was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Idempotent delete. Returns true iff a key was removed.
    async fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// Increment an integer counter and refresh its TTL. Returns the new
    /// value; a missing key counts from zero.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64, KvError>;

    /// Atomic: delete `key` only if its current value equals `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, KvError>;

    /// Atomic: reset `key`'s TTL only if its current value equals `expected`.
    async fn expire_if_equals(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, KvError>;

    /// Atomic compare-and-set across two keys: write `key = value` (with
    /// `ttl`) only if `guard_key` currently holds `guard_value`. Returns
    /// false — with no bytes written — when the guard does not match.
    ///
    /// This is the primitive behind `saveWithLockGuard`: verifying the lock
    /// and then writing in two steps would race with lock expiry.
    async fn set_if_guard_matches(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
        guard_key: &str,
        guard_value: &str,
    ) -> Result<bool, KvError>;

    /// Atomic rate-limit admission for a shared interval gate.
    ///
    /// Reads the last-admission timestamp at `key`; if at least
    /// `interval_ms` has elapsed (by the store's clock), records now and
    /// returns 0. Otherwise returns the remaining wait in milliseconds and
    /// leaves the key untouched. `ttl` bounds how long an idle key lingers.
    async fn admit_interval(
        &self,
        key: &str,
        interval_ms: u64,
        ttl: Duration,
    ) -> Result<u64, KvError>;
}

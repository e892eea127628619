//! Global admission gate for the external classifier.
//!
//! One request per second across the entire fleet: a well-known store key
//! holds the last-admission timestamp and an atomic script either records a
//! new admission or reports the remaining wait. Callers sleep the returned
//! interval (bounded by a poll granularity) and retry indefinitely — every
//! slot clears within a second, so contention always resolves.
//!
//! When the store is unreachable the limiter degrades to a fixed per-worker
//! delay slightly above the interval. That keeps a lone worker correct and
//! never hard-fails the pipeline for a rate-limit bookkeeping outage.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::kv::KvStore;

/// Shared store key holding the last-admission epoch milliseconds.
pub const RATE_LIMIT_KEY: &str = "perspective:global-rate-limit";

/// How the caller was admitted (observable for tests and telemetry).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Via the shared fleet-wide gate.
    Shared,
    /// Via the local fixed-delay fallback (store unavailable).
    Fallback,
}

/// Timing knobs for the gate.
#[derive(Clone, Copy, Debug)]
pub struct RateLimiterConfig {
    /// Minimum spacing between admissions fleet-wide.
    pub interval: Duration,
    /// Upper bound on one sleep while polling for a slot.
    pub poll_granularity: Duration,
    /// Per-worker spacing used when the store is unavailable.
    pub fallback_delay: Duration,
    /// TTL on the shared key so idle periods self-clean.
    pub key_ttl: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            poll_granularity: Duration::from_millis(50),
            fallback_delay: Duration::from_millis(1100),
            key_ttl: Duration::from_secs(60),
        }
    }
}

/// Fleet-wide 1-QPS admission gate with local fallback.
pub struct RateLimiter {
    kv: Arc<dyn KvStore>,
    config: RateLimiterConfig,
    /// Last local admission, for the fallback path. The tokio mutex also
    /// serializes concurrent fallback callers within this process.
    last_local: Mutex<Option<Instant>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self::with_config(kv, RateLimiterConfig::default())
    }

    #[must_use]
    pub fn with_config(kv: Arc<dyn KvStore>, config: RateLimiterConfig) -> Self {
        Self {
            kv,
            config,
            last_local: Mutex::new(None),
        }
    }

    /// Block until a slot is granted. Infallible: store trouble routes
    /// through the fallback delay instead of erroring.
    pub async fn acquire(&self) -> Admission {
        if !self.kv.ready().await {
            return self.acquire_fallback().await;
        }
        loop {
            match self
                .kv
                .admit_interval(
                    RATE_LIMIT_KEY,
                    self.config.interval.as_millis() as u64,
                    self.config.key_ttl,
                )
                .await
            {
                Ok(0) => return Admission::Shared,
                Ok(wait_ms) => {
                    let wait = Duration::from_millis(wait_ms).min(self.config.poll_granularity);
                    tokio::time::sleep(wait).await;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "rate-limit store failed; using local fallback");
                    return self.acquire_fallback().await;
                }
            }
        }
    }

    async fn acquire_fallback(&self) -> Admission {
        let mut last = self.last_local.lock().await;
        if let Some(previous) = *last {
            let next_slot = previous + self.config.fallback_delay;
            let now = Instant::now();
            if next_slot > now {
                tokio::time::sleep(next_slot - now).await;
            }
        }
        *last = Some(Instant::now());
        Admission::Fallback
    }
}

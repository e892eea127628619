//! Content-addressed cache of classifier responses.
//!
//! Key: environment prefix + `-perspective:` + hex SHA-256 of the lowercased,
//! trimmed text. The prefix keeps development traffic from poisoning
//! production entries. Values store the four raw attributes plus the
//! composite; the composite is recomputed from the raw attributes on every
//! read so a formula change invalidates nothing.
//!
//! Writes are best-effort: failures are logged and swallowed, a lost write
//! costs at most one redundant classifier call.

use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::kv::KvStore;

use super::AttributeScores;

/// Cached entries live for 30 days.
pub const SCORE_CACHE_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedEntry {
    personal_story: f64,
    reasoning: f64,
    curiosity: f64,
    toxicity: f64,
    /// Stored for observability; recomputed on read.
    bridging_score: f64,
}

/// Environment-namespaced score cache over the shared store.
#[derive(Clone)]
pub struct ScoreCache {
    kv: Arc<dyn KvStore>,
    env_prefix: String,
}

impl ScoreCache {
    /// `env_prefix` is an environment token such as `dev` or `prod`.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, env_prefix: impl Into<String>) -> Self {
        Self {
            kv,
            env_prefix: env_prefix.into(),
        }
    }

    /// Derive the cache key for `text`.
    #[must_use]
    pub fn key(&self, text: &str) -> String {
        let normalized = text.trim().to_lowercase();
        let digest = Sha256::digest(normalized.as_bytes());
        format!("{}-perspective:{}", self.env_prefix, hex::encode(digest))
    }

    /// Look up cached attributes. The returned composite is always freshly
    /// recomputed from the stored raw attributes.
    pub async fn get(&self, text: &str) -> Option<AttributeScores> {
        let key = self.key(text);
        let raw = match self.kv.get(&key).await {
            Ok(value) => value?,
            Err(err) => {
                tracing::warn!(error = %err, "score cache read failed");
                return None;
            }
        };
        match serde_json::from_str::<CachedEntry>(&raw) {
            Ok(entry) => Some(AttributeScores {
                personal_story: entry.personal_story,
                reasoning: entry.reasoning,
                curiosity: entry.curiosity,
                toxicity: entry.toxicity,
            }),
            Err(err) => {
                tracing::warn!(error = %err, "score cache entry unparseable; ignoring");
                None
            }
        }
    }

    /// Store attributes for `text`. Failures are swallowed.
    pub async fn put(&self, text: &str, scores: &AttributeScores) {
        let entry = CachedEntry {
            personal_story: scores.personal_story,
            reasoning: scores.reasoning,
            curiosity: scores.curiosity,
            toxicity: scores.toxicity,
            bridging_score: scores.bridging_score(),
        };
        let payload = match serde_json::to_string(&entry) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "score cache entry failed to serialize");
                return;
            }
        };
        if let Err(err) = self
            .kv
            .set(&self.key(text), &payload, Some(SCORE_CACHE_TTL))
            .await
        {
            tracing::warn!(error = %err, "score cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn cache() -> (ScoreCache, Arc<MemoryKv>) {
        let kv = Arc::new(MemoryKv::new());
        (ScoreCache::new(kv.clone(), "test"), kv)
    }

    #[test]
    fn key_normalizes_case_and_whitespace() {
        let (cache, _) = cache();
        assert_eq!(cache.key("  Hello World "), cache.key("hello world"));
        assert_ne!(cache.key("hello"), cache.key("goodbye"));
        assert!(cache.key("hello").starts_with("test-perspective:"));
    }

    #[test]
    fn env_prefixes_do_not_collide() {
        let kv: Arc<MemoryKv> = Arc::new(MemoryKv::new());
        let dev = ScoreCache::new(kv.clone(), "dev");
        let prod = ScoreCache::new(kv, "prod");
        assert_ne!(dev.key("same text"), prod.key("same text"));
    }

    #[tokio::test]
    async fn round_trip_preserves_attributes() {
        let (cache, _) = cache();
        let scores = AttributeScores {
            personal_story: 0.9,
            reasoning: 0.2,
            curiosity: 0.4,
            toxicity: 0.1,
        };
        cache.put("some text", &scores).await;
        let loaded = cache.get("some text").await.unwrap();
        assert_eq!(loaded, scores);
    }

    #[tokio::test]
    async fn composite_is_recomputed_on_read() {
        let (cache, kv) = cache();
        // A stale entry with a composite from an old formula.
        let stale = serde_json::json!({
            "personalStory": 0.5,
            "reasoning": 0.5,
            "curiosity": 0.5,
            "toxicity": 0.5,
            "bridgingScore": 1.5,
        });
        kv.set(&cache.key("stale"), &stale.to_string(), None)
            .await
            .unwrap();

        let loaded = cache.get("stale").await.unwrap();
        assert!((loaded.bridging_score() - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn unparseable_entry_is_a_miss() {
        let (cache, kv) = cache();
        kv.set(&cache.key("bad"), "not json", None).await.unwrap();
        assert!(cache.get("bad").await.is_none());
    }

    #[tokio::test]
    async fn store_outage_swallows_the_write() {
        let (cache, kv) = cache();
        kv.set_ready(false);
        cache.put("text", &AttributeScores::default()).await;
        assert!(cache.get("text").await.is_none());
    }
}

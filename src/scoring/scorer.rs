//! The bridging scorer: walks a finished tree and scores every claim and
//! quote (merged duplicates included).
//!
//! Per item: cache first (a hit skips the rate limiter entirely), then a
//! rate-limited classifier call. A single item's failure is recorded and the
//! walk continues; a sustained error rate trips the circuit breaker and the
//! walk returns what it has, so a misconfigured deployment cannot burn
//! through API quota.

use crate::comment::SpeakerRegistry;
use crate::limiter::RateLimiter;
use crate::report::{Claim, SortedTree};

use super::{
    AttributeScores, BridgingScore, ClassifierClient, ScoreCache, ScoredItemKind,
    ScoringItemError,
};

/// Circuit-breaker thresholds.
#[derive(Clone, Copy, Debug)]
pub struct BridgingScorerConfig {
    /// Minimum items processed before the breaker can trip.
    pub min_processed: usize,
    /// Error-rate threshold above which the walk aborts.
    pub max_error_rate: f64,
}

impl Default for BridgingScorerConfig {
    fn default() -> Self {
        Self {
            min_processed: 10,
            max_error_rate: 0.10,
        }
    }
}

/// Everything gathered by one scoring walk.
#[derive(Clone, Debug, Default)]
pub struct ScoringReport {
    pub scores: Vec<BridgingScore>,
    pub errors: Vec<ScoringItemError>,
    /// True when the circuit breaker aborted the walk early.
    pub circuit_opened: bool,
}

/// Walks report trees and emits bridging scores.
pub struct BridgingScorer {
    cache: ScoreCache,
    limiter: RateLimiter,
    classifier: ClassifierClient,
    config: BridgingScorerConfig,
}

struct WalkItem<'a> {
    item_id: String,
    kind: ScoredItemKind,
    text: &'a str,
    topic_name: &'a str,
    subtopic_name: &'a str,
    speaker: &'a str,
}

impl BridgingScorer {
    #[must_use]
    pub fn new(cache: ScoreCache, limiter: RateLimiter, classifier: ClassifierClient) -> Self {
        Self::with_config(cache, limiter, classifier, BridgingScorerConfig::default())
    }

    #[must_use]
    pub fn with_config(
        cache: ScoreCache,
        limiter: RateLimiter,
        classifier: ClassifierClient,
        config: BridgingScorerConfig,
    ) -> Self {
        Self {
            cache,
            limiter,
            classifier,
            config,
        }
    }

    /// Score every claim and quote in the tree. Infallible at the walk
    /// level: item failures are recorded in the report.
    pub async fn score_tree(
        &self,
        tree: &SortedTree,
        registry: &SpeakerRegistry,
    ) -> ScoringReport {
        let mut report = ScoringReport::default();
        let mut processed = 0usize;
        let mut errors = 0usize;

        for item in collect_items(tree) {
            processed += 1;
            let speaker_id = registry.id_of(item.speaker).map(|id| id.to_string());

            match self.score_item(&item).await {
                Ok(scores) => {
                    report.scores.push(BridgingScore::from_attributes(
                        item.item_id,
                        item.kind,
                        item.topic_name.to_string(),
                        item.subtopic_name.to_string(),
                        speaker_id,
                        scores,
                    ));
                }
                Err(message) => {
                    errors += 1;
                    tracing::warn!(item = %item.item_id, %message, "scoring item failed");
                    report.errors.push(ScoringItemError {
                        item_id: item.item_id,
                        message,
                    });
                }
            }

            if processed >= self.config.min_processed
                && (errors as f64 / processed as f64) > self.config.max_error_rate
            {
                tracing::error!(
                    processed,
                    errors,
                    "scoring error rate exceeded threshold; opening circuit"
                );
                report.circuit_opened = true;
                break;
            }
        }

        report
    }

    async fn score_item(&self, item: &WalkItem<'_>) -> Result<AttributeScores, String> {
        if item.text.trim().is_empty() {
            return Err("empty text".into());
        }

        if let Some(cached) = self.cache.get(item.text).await {
            return Ok(cached);
        }

        self.limiter.acquire().await;
        let scores = self
            .classifier
            .analyze(item.text)
            .await
            .map_err(|e| e.to_string())?;
        self.cache.put(item.text, &scores).await;
        Ok(scores)
    }
}

/// Flatten the tree into scoreable items: for each claim (primaries and
/// merged duplicates), its text and its quote.
fn collect_items(tree: &SortedTree) -> Vec<WalkItem<'_>> {
    fn push_claim<'a>(
        items: &mut Vec<WalkItem<'a>>,
        claim: &'a Claim,
        topic: &'a str,
        subtopic: &'a str,
        base_id: String,
    ) {
        items.push(WalkItem {
            item_id: format!("{base_id}:claim"),
            kind: ScoredItemKind::Claim,
            text: &claim.text,
            topic_name: topic,
            subtopic_name: subtopic,
            speaker: &claim.speaker,
        });
        items.push(WalkItem {
            item_id: format!("{base_id}:quote"),
            kind: ScoredItemKind::Quote,
            text: &claim.quote,
            topic_name: topic,
            subtopic_name: subtopic,
            speaker: &claim.speaker,
        });
    }

    let mut items = Vec::new();
    for topic in &tree.0 {
        for subtopic in &topic.subtopics {
            for (index, claim) in subtopic.claims.iter().enumerate() {
                let base = format!("{}/{}/claim-{index}", topic.name, subtopic.name);
                push_claim(&mut items, claim, &topic.name, &subtopic.name, base.clone());
                for (dup_index, duplicate) in claim.duplicates.iter().enumerate() {
                    push_claim(
                        &mut items,
                        duplicate,
                        &topic.name,
                        &subtopic.name,
                        format!("{base}/dup-{dup_index}"),
                    );
                }
            }
        }
    }
    items
}

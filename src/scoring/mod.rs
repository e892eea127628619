//! Bridging scores: constructive-attribute metrics for claims and quotes.
//!
//! After a successful run the scorer walks the finished tree and emits one
//! [`BridgingScore`] per claim and per quote, using an external classifier
//! behind the global rate limiter and a content-addressed cache. Scoring is
//! an orthogonal artifact: it never writes to run state.
//!
//! The composite formula is
//! `(personalStory + reasoning + curiosity) × (1 − toxicity)`, range
//! [0, 3]; toxicity 1 zeroes the result. The formula lives here — and only
//! here — so cached entries can be recomputed when it changes.

use serde::{Deserialize, Serialize};

mod cache;
mod classifier;
mod scorer;

pub use cache::{SCORE_CACHE_TTL, ScoreCache};
pub use classifier::{ClassifierClient, ClassifierError, MAX_CLASSIFIER_CHARS, sanitize_text};
pub use scorer::{BridgingScorer, BridgingScorerConfig, ScoringReport};

/// The four raw classifier attributes, each in [0, 1].
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeScores {
    pub personal_story: f64,
    pub reasoning: f64,
    pub curiosity: f64,
    pub toxicity: f64,
}

impl AttributeScores {
    /// The composite bridging score in [0, 3].
    #[must_use]
    pub fn bridging_score(&self) -> f64 {
        ((self.personal_story + self.reasoning + self.curiosity) * (1.0 - self.toxicity))
            .clamp(0.0, 3.0)
    }
}

/// What kind of text a score record covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScoredItemKind {
    Claim,
    Quote,
}

/// One emitted score record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgingScore {
    pub item_id: String,
    pub kind: ScoredItemKind,
    pub topic_name: String,
    pub subtopic_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker_id: Option<String>,
    pub personal_story: f64,
    pub reasoning: f64,
    pub curiosity: f64,
    pub toxicity: f64,
    pub bridging_score: f64,
}

impl BridgingScore {
    pub(crate) fn from_attributes(
        item_id: String,
        kind: ScoredItemKind,
        topic_name: String,
        subtopic_name: String,
        speaker_id: Option<String>,
        scores: AttributeScores,
    ) -> Self {
        Self {
            item_id,
            kind,
            topic_name,
            subtopic_name,
            speaker_id,
            personal_story: scores.personal_story,
            reasoning: scores.reasoning,
            curiosity: scores.curiosity,
            toxicity: scores.toxicity,
            bridging_score: scores.bridging_score(),
        }
    }
}

/// A per-item scoring failure; recorded, never fatal by itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringItemError {
    pub item_id: String,
    pub message: String,
}

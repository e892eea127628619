//! Report value types: taxonomy, claims, the sorted tree, summaries, cruxes.
//!
//! These are the typed stage inputs/outputs that flow through the pipeline and
//! end up in the durable state record as opaque-but-typed JSON. Every shape
//! here serializes with camelCase field names so the stored bytes match the
//! public state surface.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ── Taxonomy (clustering output) ───────────────────────────────────────

/// One subtopic skeleton: a name and a short description, no claims yet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtopicOutline {
    pub name: String,
    pub short_description: String,
}

/// One topic skeleton with its subtopics, in model-proposed order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicOutline {
    pub name: String,
    pub short_description: String,
    pub subtopics: Vec<SubtopicOutline>,
}

/// The topic/subtopic skeleton produced by clustering.
///
/// Topic names are unique within a run; subtopic names are unique within
/// their parent topic. Both uniqueness properties are enforced by the
/// clustering stage before the taxonomy is persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Taxonomy(pub Vec<TopicOutline>);

impl Taxonomy {
    /// Whether `topic`/`subtopic` names an existing slot in the skeleton.
    #[must_use]
    pub fn contains(&self, topic: &str, subtopic: &str) -> bool {
        self.0
            .iter()
            .find(|t| t.name == topic)
            .is_some_and(|t| t.subtopics.iter().any(|s| s.name == subtopic))
    }

    #[must_use]
    pub fn topic_names(&self) -> Vec<&str> {
        self.0.iter().map(|t| t.name.as_str()).collect()
    }
}

// ── Claims ─────────────────────────────────────────────────────────────

/// A single debatable assertion extracted from a comment.
///
/// Carries a supporting quote and speaker attribution. After deduplication a
/// primary claim's `duplicates` holds the merged originals (flat, not
/// recursive); `duplicated = true` marks a merged copy rather than a primary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    pub text: String,
    pub quote: String,
    pub speaker: String,
    pub topic_name: String,
    pub subtopic_name: String,
    pub source_comment_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub duplicates: Vec<Claim>,
    #[serde(default)]
    pub duplicated: bool,
}

impl Claim {
    /// This claim plus its merged duplicates.
    #[must_use]
    pub fn total_count(&self) -> usize {
        1 + self.duplicates.len()
    }

    /// Speakers of this claim and all merged duplicates.
    #[must_use]
    pub fn speakers(&self) -> BTreeSet<&str> {
        let mut set: BTreeSet<&str> = BTreeSet::new();
        set.insert(self.speaker.as_str());
        for dup in &self.duplicates {
            set.insert(dup.speaker.as_str());
        }
        set
    }
}

/// Claims grouped under one subtopic (extraction output).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtopicClaims {
    pub total: usize,
    pub claims: Vec<Claim>,
}

/// Claims grouped under one topic (extraction output).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicClaims {
    pub total: usize,
    pub subtopics: BTreeMap<String, SubtopicClaims>,
}

/// Extraction output: `topicName → {total, subtopics → {total, claims}}`.
///
/// `BTreeMap` keeps the serialized form deterministic, which the resume path
/// relies on (a resumed run must re-serialize byte-identically).
pub type ClaimsTree = BTreeMap<String, TopicClaims>;

// ── Sorted tree ────────────────────────────────────────────────────────

/// One subtopic in the final tree, claims deduplicated and ordered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSubtopic {
    pub name: String,
    pub short_description: String,
    pub claims: Vec<Claim>,
}

impl ReportSubtopic {
    /// Count of distinct speakers contributing claims (duplicates included).
    #[must_use]
    pub fn speaker_count(&self) -> usize {
        let mut speakers: BTreeSet<&str> = BTreeSet::new();
        for claim in &self.claims {
            speakers.extend(claim.speakers());
        }
        speakers.len()
    }

    /// Total claim count including merged duplicates.
    #[must_use]
    pub fn claim_count(&self) -> usize {
        self.claims.iter().map(Claim::total_count).sum()
    }
}

/// One topic in the final tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportTopic {
    pub name: String,
    pub short_description: String,
    pub subtopics: Vec<ReportSubtopic>,
}

impl ReportTopic {
    #[must_use]
    pub fn speaker_count(&self) -> usize {
        let mut speakers: BTreeSet<&str> = BTreeSet::new();
        for subtopic in &self.subtopics {
            for claim in &subtopic.claims {
                speakers.extend(claim.speakers());
            }
        }
        speakers.len()
    }

    #[must_use]
    pub fn claim_count(&self) -> usize {
        self.subtopics.iter().map(ReportSubtopic::claim_count).sum()
    }
}

/// The deduplicated, deterministically ordered report tree.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SortedTree(pub Vec<ReportTopic>);

// ── Summaries ──────────────────────────────────────────────────────────

/// One narrative summary per topic, at most 140 words.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicSummary {
    pub topic_name: String,
    pub text: String,
}

// ── Cruxes ─────────────────────────────────────────────────────────────

/// A synthesized statement partitioning a subtopic's speakers into
/// agree / disagree / no-clear-position groups.
///
/// Speaker entries are `"id:name"` strings; the three lists are pairwise
/// disjoint by id after reconciliation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtopicCrux {
    pub topic_name: String,
    pub subtopic_name: String,
    pub crux_claim: String,
    pub agree: Vec<String>,
    pub disagree: Vec<String>,
    pub no_clear_position: Vec<String>,
    pub explanation: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claim(text: &str, speaker: &str) -> Claim {
        Claim {
            text: text.into(),
            quote: format!("\"{text}\""),
            speaker: speaker.into(),
            topic_name: "Pets".into(),
            subtopic_name: "Cats".into(),
            source_comment_id: "c1".into(),
            duplicates: vec![],
            duplicated: false,
        }
    }

    #[test]
    fn taxonomy_membership() {
        let taxonomy = Taxonomy(vec![TopicOutline {
            name: "Pets".into(),
            short_description: "About pets".into(),
            subtopics: vec![SubtopicOutline {
                name: "Cats".into(),
                short_description: "About cats".into(),
            }],
        }]);
        assert!(taxonomy.contains("Pets", "Cats"));
        assert!(!taxonomy.contains("Pets", "Dogs"));
        assert!(!taxonomy.contains("Food", "Cats"));
    }

    #[test]
    fn claim_counts_include_duplicates() {
        let mut primary = claim("cats are independent", "A");
        let mut dup = claim("cats are self-sufficient", "B");
        dup.duplicated = true;
        primary.duplicates.push(dup);

        assert_eq!(primary.total_count(), 2);
        assert_eq!(primary.speakers().len(), 2);
    }

    #[test]
    fn subtopic_speaker_count_dedupes_across_claims() {
        let subtopic = ReportSubtopic {
            name: "Cats".into(),
            short_description: String::new(),
            claims: vec![claim("one", "A"), claim("two", "A"), claim("three", "B")],
        };
        assert_eq!(subtopic.speaker_count(), 2);
        assert_eq!(subtopic.claim_count(), 3);
    }
}

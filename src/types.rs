//! Core types shared across the pipeline engine.
//!
//! This module defines the fixed stage sequence, per-stage and per-run status
//! enums, and token accounting. These are the vocabulary the durable state
//! record ([`crate::state`]) and the runner speak.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The five fixed pipeline stages, in execution order.
///
/// The pipeline is a linear sequence with one optional tail stage
/// ([`Cruxes`](Self::Cruxes)); there is no general DAG. Stage names double as
/// keys in the durable state record, so their encoded form is stable.
///
/// # Examples
///
/// ```rust
/// use tapestry::types::StageName;
///
/// assert_eq!(StageName::SortAndDeduplicate.encode(), "sort_and_deduplicate");
/// assert_eq!(
///     StageName::decode("clustering"),
///     Some(StageName::Clustering)
/// );
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Comments → topic/subtopic taxonomy (no claims yet).
    Clustering,
    /// Comments + taxonomy → quote-attributed claims per subtopic.
    Extraction,
    /// Claims → deduplicated, deterministically ordered tree.
    SortAndDeduplicate,
    /// Sorted tree → one narrative summary per topic.
    Summaries,
    /// Sorted tree → cruxes of disagreement (optional tail stage).
    Cruxes,
}

impl StageName {
    /// All stages in pipeline order.
    pub const ALL: [StageName; 5] = [
        StageName::Clustering,
        StageName::Extraction,
        StageName::SortAndDeduplicate,
        StageName::Summaries,
        StageName::Cruxes,
    ];

    /// Encode into the persisted string form used as a state-record key.
    #[must_use]
    pub fn encode(self) -> &'static str {
        match self {
            StageName::Clustering => "clustering",
            StageName::Extraction => "extraction",
            StageName::SortAndDeduplicate => "sort_and_deduplicate",
            StageName::Summaries => "summaries",
            StageName::Cruxes => "cruxes",
        }
    }

    /// Decode a persisted string form. Unknown strings yield `None` so that
    /// schema drift in stored state is caught by the caller, not papered over.
    #[must_use]
    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "clustering" => Some(StageName::Clustering),
            "extraction" => Some(StageName::Extraction),
            "sort_and_deduplicate" => Some(StageName::SortAndDeduplicate),
            "summaries" => Some(StageName::Summaries),
            "cruxes" => Some(StageName::Cruxes),
            _ => None,
        }
    }

    /// Position of this stage in the fixed sequence (0-based).
    #[must_use]
    pub fn index(self) -> usize {
        StageName::ALL
            .iter()
            .position(|s| *s == self)
            .unwrap_or_default()
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encode())
    }
}

/// Lifecycle status of a single stage within a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StageStatus {
    /// Not yet started.
    #[default]
    Pending,
    /// Currently executing.
    InProgress,
    /// Finished successfully; its output is in `completedResults`.
    Completed,
    /// Finished with an error; the run is failed.
    Failed,
    /// Deliberately not executed (cruxes when disabled).
    Skipped,
}

impl StageStatus {
    /// Whether this stage needs no further execution.
    #[must_use]
    pub fn is_settled(self) -> bool {
        matches!(self, StageStatus::Completed | StageStatus::Skipped)
    }
}

/// Lifecycle status of the whole run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    /// Created, no stage executed yet.
    #[default]
    Pending,
    /// A worker holds the lock and is executing stages.
    Running,
    /// Every stage is completed or skipped and no error is present.
    Completed,
    /// An error is present and some stage failed.
    Failed,
}

impl RunStatus {
    /// Terminal states cannot be resumed.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Token accounting for one LLM call or one stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    #[must_use]
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    /// Accumulate another usage into this one.
    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Ordering strategy for topics and subtopics in the sorted tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortStrategy {
    /// Descending by count of distinct speakers contributing claims.
    #[default]
    NumPeople,
    /// Descending by total claim count including merged duplicates.
    NumClaims,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_encode_decode_round_trip() {
        for stage in StageName::ALL {
            assert_eq!(StageName::decode(stage.encode()), Some(stage));
        }
        assert_eq!(StageName::decode("unknown_stage"), None);
    }

    #[test]
    fn stage_order_is_fixed() {
        assert_eq!(StageName::Clustering.index(), 0);
        assert_eq!(StageName::Cruxes.index(), 4);
        let mut sorted = StageName::ALL;
        sorted.sort();
        assert_eq!(sorted, StageName::ALL);
    }

    #[test]
    fn settled_statuses() {
        assert!(StageStatus::Completed.is_settled());
        assert!(StageStatus::Skipped.is_settled());
        assert!(!StageStatus::InProgress.is_settled());
        assert!(!StageStatus::Failed.is_settled());
    }

    #[test]
    fn usage_accumulates() {
        let mut total = TokenUsage::new(10, 5);
        total.add(TokenUsage::new(2, 3));
        assert_eq!(total.input_tokens, 12);
        assert_eq!(total.output_tokens, 8);
        assert_eq!(total.total_tokens, 20);
    }

    #[test]
    fn status_serde_uses_camel_case() {
        let json = serde_json::to_string(&StageStatus::InProgress).unwrap();
        assert_eq!(json, "\"inProgress\"");
        let json = serde_json::to_string(&RunStatus::Failed).unwrap();
        assert_eq!(json, "\"failed\"");
    }
}

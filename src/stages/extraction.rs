//! Extraction stage: comments + taxonomy → quote-attributed claims.
//!
//! The model assigns each extracted claim to a topic/subtopic slot from the
//! taxonomy and names the comment it came from. Claims whose slot does not
//! exist in the taxonomy, or whose comment id is unknown, are dropped with a
//! warning — the taxonomy is authoritative, not the model.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::comment::Comment;
use crate::report::{Claim, ClaimsTree, SubtopicClaims, Taxonomy, TopicClaims};
use crate::types::{StageName, TokenUsage};

use super::{StageContext, StageError, StageResult, parse_stage_json};

const STAGE: StageName = StageName::Extraction;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireClaim {
    topic_name: String,
    subtopic_name: String,
    claim: String,
    quote: String,
    comment_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireExtraction {
    claims: Vec<WireClaim>,
}

/// Executor for the extraction stage.
pub struct ExtractionStage {
    instructions: String,
}

impl ExtractionStage {
    #[must_use]
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
        }
    }

    /// Extract claims for every comment against the taxonomy.
    pub async fn run(
        &self,
        ctx: &StageContext,
        comments: &[Comment],
        taxonomy: &Taxonomy,
    ) -> Result<StageResult<ClaimsTree>, StageError> {
        let mut usage = TokenUsage::default();
        let mut cost = 0.0;

        let payload = json!({
            "taxonomy": taxonomy,
            "comments": comments
                .iter()
                .map(|c| json!({"id": c.id, "text": c.text, "speaker": c.speaker}))
                .collect::<Vec<_>>(),
        });
        let user = format!(
            "Extract the debatable claims from each comment and assign every claim \
             to one taxonomy subtopic. Return JSON: {{\"claims\": [{{\"topicName\", \
             \"subtopicName\", \"claim\", \"quote\", \"commentId\"}}]}}\n\n{payload}"
        );

        let content = ctx
            .complete(
                STAGE,
                &ctx.system_prompt(&self.instructions),
                user,
                &mut usage,
                &mut cost,
            )
            .await?;
        let wire: WireExtraction = parse_stage_json(STAGE, &content)?;
        let (tree, dropped) = build_tree(wire, comments, taxonomy);

        Ok(StageResult {
            data: tree,
            usage,
            cost,
            dropped_claims: Some(dropped),
        })
    }
}

/// Fold wire claims into the `topic → subtopic → claims` tree. Claims that
/// reference unknown slots or comments are dropped; the count is returned
/// alongside the tree for the analytics ledger.
fn build_tree(
    wire: WireExtraction,
    comments: &[Comment],
    taxonomy: &Taxonomy,
) -> (ClaimsTree, u32) {
    let by_id: FxHashMap<&str, &Comment> =
        comments.iter().map(|c| (c.id.as_str(), c)).collect();

    let mut tree: ClaimsTree = BTreeMap::new();
    let mut dropped = 0u32;

    for claim in wire.claims {
        let text = claim.claim.trim();
        let quote = claim.quote.trim();
        if text.is_empty() || quote.is_empty() || claim.topic_name.trim().is_empty() {
            dropped += 1;
            continue;
        }
        if !taxonomy.contains(&claim.topic_name, &claim.subtopic_name) {
            tracing::warn!(
                topic = %claim.topic_name,
                subtopic = %claim.subtopic_name,
                "dropping claim assigned to a slot missing from the taxonomy"
            );
            dropped += 1;
            continue;
        }
        let Some(comment) = by_id.get(claim.comment_id.as_str()) else {
            tracing::warn!(comment_id = %claim.comment_id, "dropping claim with unknown comment id");
            dropped += 1;
            continue;
        };

        let topic = tree.entry(claim.topic_name.clone()).or_insert_with(|| {
            TopicClaims {
                total: 0,
                subtopics: BTreeMap::new(),
            }
        });
        topic.total += 1;
        let subtopic = topic
            .subtopics
            .entry(claim.subtopic_name.clone())
            .or_insert_with(SubtopicClaims::default);
        subtopic.total += 1;
        subtopic.claims.push(Claim {
            text: text.to_string(),
            quote: quote.to_string(),
            speaker: comment.speaker.clone(),
            topic_name: claim.topic_name,
            subtopic_name: claim.subtopic_name,
            source_comment_id: comment.id.clone(),
            duplicates: vec![],
            duplicated: false,
        });
    }

    if dropped > 0 {
        tracing::warn!(dropped, "extraction dropped claims during validation");
    }
    (tree, dropped)
}

//! Clustering stage: comments → topic/subtopic taxonomy.
//!
//! The model proposes an ordered list of topics, each with ordered
//! subtopics (names + short descriptions). No claims are attached yet.
//! Name uniqueness is enforced here deterministically: a duplicate topic
//! name (or duplicate subtopic name within a topic) keeps the first
//! occurrence and drops the rest.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;

use crate::comment::Comment;
use crate::report::{SubtopicOutline, Taxonomy, TopicOutline};
use crate::types::{StageName, TokenUsage};

use super::{StageContext, StageError, StageResult, parse_stage_json};

const STAGE: StageName = StageName::Clustering;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSubtopic {
    name: String,
    #[serde(default)]
    short_description: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTopic {
    name: String,
    #[serde(default)]
    short_description: String,
    #[serde(default)]
    subtopics: Vec<WireSubtopic>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireTaxonomy {
    topics: Vec<WireTopic>,
}

/// Executor for the clustering stage.
pub struct ClusteringStage {
    instructions: String,
}

impl ClusteringStage {
    #[must_use]
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
        }
    }

    /// Run clustering over the full corpus.
    ///
    /// # Errors
    ///
    /// [`StageError`] when the provider fails, the response does not parse,
    /// or the resulting taxonomy is empty.
    pub async fn run(
        &self,
        ctx: &StageContext,
        comments: &[Comment],
    ) -> Result<StageResult<Taxonomy>, StageError> {
        let mut usage = TokenUsage::default();
        let mut cost = 0.0;

        let payload = json!({
            "comments": comments
                .iter()
                .map(|c| json!({"id": c.id, "text": c.text}))
                .collect::<Vec<_>>(),
        });
        let user = format!(
            "Derive a topic/subtopic taxonomy for these comments. \
             Return JSON: {{\"topics\": [{{\"name\", \"shortDescription\", \
             \"subtopics\": [{{\"name\", \"shortDescription\"}}]}}]}}\n\n{payload}"
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
        let wire: WireTaxonomy = parse_stage_json(STAGE, &content)?;
        let taxonomy = normalize(wire)?;

        Ok(StageResult {
            data: taxonomy,
            usage,
            cost,
            dropped_claims: None,
        })
    }
}

/// Drop blank and duplicate names, keeping first occurrences.
fn normalize(wire: WireTaxonomy) -> Result<Taxonomy, StageError> {
    let mut seen_topics: BTreeSet<String> = BTreeSet::new();
    let mut topics = Vec::new();

    for topic in wire.topics {
        let name = topic.name.trim().to_string();
        if name.is_empty() || !seen_topics.insert(name.clone()) {
            tracing::warn!(topic = %topic.name, "dropping blank or duplicate topic");
            continue;
        }
        let mut seen_subtopics: BTreeSet<String> = BTreeSet::new();
        let mut subtopics = Vec::new();
        for subtopic in topic.subtopics {
            let sub_name = subtopic.name.trim().to_string();
            if sub_name.is_empty() || !seen_subtopics.insert(sub_name.clone()) {
                tracing::warn!(
                    topic = %name,
                    subtopic = %subtopic.name,
                    "dropping blank or duplicate subtopic"
                );
                continue;
            }
            subtopics.push(SubtopicOutline {
                name: sub_name,
                short_description: subtopic.short_description,
            });
        }
        if subtopics.is_empty() {
            tracing::warn!(topic = %name, "dropping topic with no usable subtopics");
            seen_topics.remove(&name);
            continue;
        }
        topics.push(TopicOutline {
            name,
            short_description: topic.short_description,
            subtopics,
        });
    }

    if topics.is_empty() {
        return Err(StageError::InvalidOutput {
            stage: STAGE,
            reason: "taxonomy has no usable topics".into(),
        });
    }
    Ok(Taxonomy(topics))
}

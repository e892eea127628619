//! Summaries stage: one narrative summary per topic.
//!
//! Summaries reference the claims under the topic and are clamped to 140
//! words after the model returns, so the length bound holds even against a
//! verbose model.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::report::{SortedTree, TopicSummary};
use crate::types::{StageName, TokenUsage};

use super::{StageContext, StageError, StageResult, parse_stage_json};

const STAGE: StageName = StageName::Summaries;

/// Maximum words in one topic summary.
pub const MAX_SUMMARY_WORDS: usize = 140;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSummary {
    topic_name: String,
    summary: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireSummaries {
    summaries: Vec<WireSummary>,
}

/// Executor for the summaries stage.
pub struct SummariesStage {
    instructions: String,
}

impl SummariesStage {
    #[must_use]
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
        }
    }

    /// Summarize every topic of the sorted tree, in tree order.
    pub async fn run(
        &self,
        ctx: &StageContext,
        tree: &SortedTree,
    ) -> Result<StageResult<Vec<TopicSummary>>, StageError> {
        let mut usage = TokenUsage::default();
        let mut cost = 0.0;

        let topics: Vec<_> = tree
            .0
            .iter()
            .map(|topic| {
                json!({
                    "name": topic.name,
                    "shortDescription": topic.short_description,
                    "claims": topic
                        .subtopics
                        .iter()
                        .flat_map(|s| s.claims.iter().map(|c| c.text.as_str()))
                        .collect::<Vec<_>>(),
                })
            })
            .collect();
        let user = format!(
            "Write one narrative summary per topic, at most {MAX_SUMMARY_WORDS} words \
             each, grounded in the claims listed. Return JSON: \
             {{\"summaries\": [{{\"topicName\", \"summary\"}}]}}\n\n{}",
            json!({ "topics": topics })
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
        let wire: WireSummaries = parse_stage_json(STAGE, &content)?;

        // Keep only summaries for topics that exist, in tree order, clamped.
        let mut summaries = Vec::new();
        for topic in &tree.0 {
            let Some(entry) = wire.summaries.iter().find(|s| s.topic_name == topic.name) else {
                return Err(StageError::InvalidOutput {
                    stage: STAGE,
                    reason: format!("no summary returned for topic {:?}", topic.name),
                });
            };
            summaries.push(TopicSummary {
                topic_name: topic.name.clone(),
                text: clamp_words(&entry.summary, MAX_SUMMARY_WORDS),
            });
        }

        Ok(StageResult {
            data: summaries,
            usage,
            cost,
            dropped_claims: None,
        })
    }
}

/// Truncate to at most `max` whitespace-separated words.
fn clamp_words(text: &str, max: usize) -> String {
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= max {
        text.trim().to_string()
    } else {
        words[..max].join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::report::{Claim, ReportSubtopic, ReportTopic};
    use std::sync::Arc;

    fn tree() -> SortedTree {
        SortedTree(vec![ReportTopic {
            name: "Pets".into(),
            short_description: "About pets".into(),
            subtopics: vec![ReportSubtopic {
                name: "Cats".into(),
                short_description: String::new(),
                claims: vec![Claim {
                    text: "Cats make good companions".into(),
                    quote: "I love cats".into(),
                    speaker: "A".into(),
                    topic_name: "Pets".into(),
                    subtopic_name: "Cats".into(),
                    source_comment_id: "c1".into(),
                    duplicates: vec![],
                    duplicated: false,
                }],
            }],
        }])
    }

    #[test]
    fn clamp_keeps_short_text() {
        assert_eq!(clamp_words("  one two three ", 5), "one two three");
    }

    #[test]
    fn clamp_truncates_long_text() {
        let long = (0..200).map(|i| i.to_string()).collect::<Vec<_>>().join(" ");
        let clamped = clamp_words(&long, MAX_SUMMARY_WORDS);
        assert_eq!(clamped.split_whitespace().count(), MAX_SUMMARY_WORDS);
    }

    #[tokio::test]
    async fn summarizes_each_topic() {
        let client = Arc::new(ScriptedClient::new());
        client.push_json(
            r#"{"summaries": [{"topicName": "Pets",
                "summary": "Participants value feline companionship."}]}"#,
        );
        let ctx = context(client);

        let result = SummariesStage::new("summarize")
            .run(&ctx, &tree())
            .await
            .unwrap();
        assert_eq!(result.data.len(), 1);
        assert_eq!(result.data[0].topic_name, "Pets");
        assert!(result.data[0].text.contains("feline"));
    }

    #[tokio::test]
    async fn missing_topic_summary_is_invalid() {
        let client = Arc::new(ScriptedClient::new());
        client.push_json(r#"{"summaries": [{"topicName": "Wrong", "summary": "x"}]}"#);
        let ctx = context(client);

        let err = SummariesStage::new("summarize")
            .run(&ctx, &tree())
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::InvalidOutput { .. }));
    }
}

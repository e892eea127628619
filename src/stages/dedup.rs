//! Sort + deduplicate stage.
//!
//! Two halves with a sharp boundary: the model *proposes* near-duplicate
//! groups per subtopic; everything that actually mutates the tree — merging,
//! ordering, tie-breaking — is pure deterministic code. A bad group proposal
//! can therefore never corrupt the tree, only merge less than it could.
//!
//! Ordering: subtopics within each topic, and topics within the tree, are
//! sorted by the chosen strategy (`numPeople`: distinct speakers desc,
//! `numClaims`: claims incl. duplicates desc), ties broken by name
//! ascending. Within a subtopic, primaries with more merged duplicates come
//! first (stable with respect to extraction order).

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;

use crate::report::{Claim, ClaimsTree, ReportSubtopic, ReportTopic, SortedTree, Taxonomy};
use crate::types::{SortStrategy, StageName, TokenUsage};

use super::{StageContext, StageError, StageResult, parse_stage_json};

const STAGE: StageName = StageName::SortAndDeduplicate;

#[derive(Debug, Serialize, Deserialize)]
struct WireGroups {
    groups: Vec<Vec<usize>>,
}

/// Executor for the sort + deduplicate stage.
pub struct DedupStage {
    instructions: String,
    strategy: SortStrategy,
}

impl DedupStage {
    #[must_use]
    pub fn new(instructions: impl Into<String>, strategy: SortStrategy) -> Self {
        Self {
            instructions: instructions.into(),
            strategy,
        }
    }

    /// Merge near-duplicates and order the tree.
    pub async fn run(
        &self,
        ctx: &StageContext,
        claims: &ClaimsTree,
        taxonomy: &Taxonomy,
    ) -> Result<StageResult<SortedTree>, StageError> {
        let mut usage = TokenUsage::default();
        let mut cost = 0.0;
        let mut topics = Vec::new();

        // Walk the taxonomy (not the claims map) so descriptions carry over
        // and slots without claims drop out.
        for topic_outline in &taxonomy.0 {
            let Some(topic_claims) = claims.get(&topic_outline.name) else {
                continue;
            };
            let mut subtopics = Vec::new();
            for subtopic_outline in &topic_outline.subtopics {
                let Some(subtopic_claims) = topic_claims.subtopics.get(&subtopic_outline.name)
                else {
                    continue;
                };
                if subtopic_claims.claims.is_empty() {
                    continue;
                }

                let groups = if subtopic_claims.claims.len() >= 2 {
                    self.propose_groups(ctx, &subtopic_claims.claims, &mut usage, &mut cost)
                        .await?
                } else {
                    vec![]
                };
                let merged = merge_groups(&subtopic_claims.claims, &groups);
                subtopics.push(ReportSubtopic {
                    name: subtopic_outline.name.clone(),
                    short_description: subtopic_outline.short_description.clone(),
                    claims: merged,
                });
            }
            if subtopics.is_empty() {
                continue;
            }
            sort_subtopics(&mut subtopics, self.strategy);
            topics.push(ReportTopic {
                name: topic_outline.name.clone(),
                short_description: topic_outline.short_description.clone(),
                subtopics,
            });
        }

        sort_topics(&mut topics, self.strategy);
        Ok(StageResult {
            data: SortedTree(topics),
            usage,
            cost,
            dropped_claims: None,
        })
    }

    async fn propose_groups(
        &self,
        ctx: &StageContext,
        claims: &[Claim],
        usage: &mut TokenUsage,
        cost: &mut f64,
    ) -> Result<Vec<Vec<usize>>, StageError> {
        let numbered: Vec<_> = claims
            .iter()
            .enumerate()
            .map(|(i, c)| json!({"index": i, "claim": c.text}))
            .collect();
        let user = format!(
            "Group the claims below that say essentially the same thing. \
             Return JSON: {{\"groups\": [[indices of near-duplicate claims]]}}. \
             Omit claims that have no duplicate.\n\n{}",
            json!({ "claims": numbered })
        );

        let content = ctx
            .complete(
                STAGE,
                &ctx.system_prompt(&self.instructions),
                user,
                usage,
                cost,
            )
            .await?;
        let wire: WireGroups = parse_stage_json(STAGE, &content)?;
        Ok(wire.groups)
    }
}

/// Apply proposed groups: the lowest index in a group becomes the primary,
/// the rest are attached as `duplicates` (flat, marked `duplicated`).
/// Out-of-range and already-claimed indices are ignored.
fn merge_groups(claims: &[Claim], groups: &[Vec<usize>]) -> Vec<Claim> {
    let mut consumed: BTreeSet<usize> = BTreeSet::new();
    let mut merged: Vec<Claim> = Vec::new();

    for group in groups {
        let valid: Vec<usize> = {
            let mut seen = BTreeSet::new();
            group
                .iter()
                .copied()
                .filter(|i| *i < claims.len() && !consumed.contains(i) && seen.insert(*i))
                .collect()
        };
        if valid.len() < 2 {
            continue;
        }
        let mut sorted = valid;
        sorted.sort_unstable();
        let mut primary = claims[sorted[0]].clone();
        for index in &sorted[1..] {
            let mut duplicate = claims[*index].clone();
            duplicate.duplicated = true;
            primary.duplicates.push(duplicate);
        }
        consumed.extend(sorted.iter().copied());
        merged.push(primary);
    }

    for (index, claim) in claims.iter().enumerate() {
        if !consumed.contains(&index) {
            merged.push(claim.clone());
        }
    }

    // Heavier primaries first; the sort is stable, so extraction order breaks
    // ties between equals.
    merged.sort_by_key(|c| std::cmp::Reverse(c.total_count()));
    merged
}

fn sort_subtopics(subtopics: &mut [ReportSubtopic], strategy: SortStrategy) {
    match strategy {
        SortStrategy::NumPeople => subtopics.sort_by(|a, b| {
            b.speaker_count()
                .cmp(&a.speaker_count())
                .then_with(|| a.name.cmp(&b.name))
        }),
        SortStrategy::NumClaims => subtopics.sort_by(|a, b| {
            b.claim_count()
                .cmp(&a.claim_count())
                .then_with(|| a.name.cmp(&b.name))
        }),
    }
}

fn sort_topics(topics: &mut [ReportTopic], strategy: SortStrategy) {
    match strategy {
        SortStrategy::NumPeople => topics.sort_by(|a, b| {
            b.speaker_count()
                .cmp(&a.speaker_count())
                .then_with(|| a.name.cmp(&b.name))
        }),
        SortStrategy::NumClaims => topics.sort_by(|a, b| {
            b.claim_count()
                .cmp(&a.claim_count())
                .then_with(|| a.name.cmp(&b.name))
        }),
    }
}

//! Cruxes stage: synthesized statements that split a subtopic's speakers.
//!
//! For every qualifying subtopic (two or more distinct speakers), the model
//! proposes a crux claim plus agree / disagree / no-clear-position speaker
//! lists and an explanation. The raw model output is not authoritative on
//! set membership: [`reconcile_positions`] — pure, deterministic, idempotent
//! — enforces disjointness before the result is persisted.
//!
//! Speaker entries are `"id:name[ | weight]"` strings; identity is the
//! substring before the first colon, trimmed.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use crate::comment::SpeakerRegistry;
use crate::report::{SortedTree, SubtopicCrux};
use crate::types::{StageName, TokenUsage};

use super::{StageContext, StageError, StageResult, parse_stage_json};

const STAGE: StageName = StageName::Cruxes;

/// Minimum distinct speakers for a subtopic to qualify for crux synthesis.
const MIN_SPEAKERS: usize = 2;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireCrux {
    crux_claim: String,
    #[serde(default)]
    agree: Vec<String>,
    #[serde(default)]
    disagree: Vec<String>,
    #[serde(default)]
    no_clear_position: Vec<String>,
    #[serde(default)]
    explanation: String,
}

// ── Reconciliation ─────────────────────────────────────────────────────

/// The three speaker lists of one crux, before or after reconciliation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CruxPositions {
    pub agree: Vec<String>,
    pub disagree: Vec<String>,
    pub no_clear_position: Vec<String>,
}

/// Extract a speaker id from an `"id:name[ | weight]"` entry: the substring
/// before the first colon, trimmed. `None` when no non-empty id exists.
#[must_use]
pub fn speaker_id(entry: &str) -> Option<&str> {
    let id = entry.split(':').next()?.trim();
    if id.is_empty() { None } else { Some(id) }
}

/// Reconcile the three speaker lists into pairwise-disjoint sets.
///
/// Rules, in this fixed order:
/// 1. entries without an extractable id are dropped;
/// 2. an id in both `agree` and `disagree` is ambiguous — removed from both
///    and added to `no_clear_position` with the `agree`-side payload
///    (contradictory assignments are evidence of uncertainty, not of one
///    side);
/// 3. an id in `no_clear_position` that is also in `agree` or `disagree`
///    *after step 2* is removed from `no_clear_position` (a clear stance
///    overrides);
/// 4. within each list, duplicates by id keep the first occurrence.
///
/// O(n) over two id → representative maps; idempotent.
#[must_use]
pub fn reconcile_positions(input: &CruxPositions) -> CruxPositions {
    // First occurrence per id, insertion order preserved.
    fn first_by_id(entries: &[String]) -> (Vec<(&str, &String)>, FxHashMap<&str, &String>) {
        let mut order = Vec::new();
        let mut map: FxHashMap<&str, &String> = FxHashMap::default();
        for entry in entries {
            let Some(id) = speaker_id(entry) else { continue };
            if !map.contains_key(id) {
                map.insert(id, entry);
                order.push((id, entry));
            }
        }
        (order, map)
    }

    let (agree_order, agree_map) = first_by_id(&input.agree);
    let (disagree_order, disagree_map) = first_by_id(&input.disagree);

    let ambiguous: BTreeSet<&str> = agree_map
        .keys()
        .filter(|id| disagree_map.contains_key(*id))
        .copied()
        .collect();

    let agree: Vec<String> = agree_order
        .iter()
        .filter(|(id, _)| !ambiguous.contains(id))
        .map(|(_, entry)| (*entry).clone())
        .collect();
    let disagree: Vec<String> = disagree_order
        .iter()
        .filter(|(id, _)| !ambiguous.contains(id))
        .map(|(_, entry)| (*entry).clone())
        .collect();

    let settled: BTreeSet<&str> = agree
        .iter()
        .chain(disagree.iter())
        .filter_map(|entry| speaker_id(entry))
        .collect();

    let mut no_clear_position = Vec::new();
    let mut seen_ncp: BTreeSet<String> = BTreeSet::new();
    for entry in &input.no_clear_position {
        let Some(id) = speaker_id(entry) else { continue };
        if settled.contains(id) || ambiguous.contains(id) || !seen_ncp.insert(id.to_string()) {
            continue;
        }
        no_clear_position.push(entry.clone());
    }
    // Ambiguous ids land last, carrying the agree-side payload.
    for (id, entry) in &agree_order {
        if ambiguous.contains(id) && seen_ncp.insert((*id).to_string()) {
            no_clear_position.push((*entry).clone());
        }
    }

    CruxPositions {
        agree,
        disagree,
        no_clear_position,
    }
}

// ── Stage executor ─────────────────────────────────────────────────────

/// Executor for the cruxes stage.
pub struct CruxesStage {
    instructions: String,
}

impl CruxesStage {
    #[must_use]
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
        }
    }

    /// Synthesize a crux for every qualifying subtopic of the sorted tree.
    pub async fn run(
        &self,
        ctx: &StageContext,
        tree: &SortedTree,
        registry: &SpeakerRegistry,
    ) -> Result<StageResult<Vec<SubtopicCrux>>, StageError> {
        let mut usage = TokenUsage::default();
        let mut cost = 0.0;
        let mut cruxes = Vec::new();

        for topic in &tree.0 {
            for subtopic in &topic.subtopics {
                if subtopic.speaker_count() < MIN_SPEAKERS {
                    continue;
                }

                let mut claims = Vec::new();
                for claim in &subtopic.claims {
                    for entry in std::iter::once(claim).chain(claim.duplicates.iter()) {
                        let label = registry
                            .label(&entry.speaker)
                            .unwrap_or_else(|| format!("0:{}", entry.speaker));
                        claims.push(json!({
                            "speaker": label,
                            "claim": entry.text,
                            "quote": entry.quote,
                        }));
                    }
                }

                let user = format!(
                    "Identify the crux of disagreement among the speakers below. \
                     Refer to speakers exactly by their given \"id:name\" labels. \
                     Return JSON: {{\"cruxClaim\", \"agree\": [], \"disagree\": [], \
                     \"noClearPosition\": [], \"explanation\"}}\n\n{}",
                    json!({
                        "topicName": topic.name,
                        "subtopicName": subtopic.name,
                        "claims": claims,
                    })
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
                let wire: WireCrux = parse_stage_json(STAGE, &content)?;
                if wire.crux_claim.trim().is_empty() {
                    return Err(StageError::InvalidOutput {
                        stage: STAGE,
                        reason: format!(
                            "empty crux claim for {}/{}",
                            topic.name, subtopic.name
                        ),
                    });
                }

                let positions = reconcile_positions(&CruxPositions {
                    agree: wire.agree,
                    disagree: wire.disagree,
                    no_clear_position: wire.no_clear_position,
                });

                cruxes.push(SubtopicCrux {
                    topic_name: topic.name.clone(),
                    subtopic_name: subtopic.name.clone(),
                    crux_claim: wire.crux_claim,
                    agree: positions.agree,
                    disagree: positions.disagree,
                    no_clear_position: positions.no_clear_position,
                    explanation: wire.explanation,
                });
            }
        }

        Ok(StageResult {
            data: cruxes,
            usage,
            cost,
            dropped_claims: None,
        })
    }
}

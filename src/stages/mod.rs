//! Stage executors.
//!
//! Each of the five pipeline stages exposes the same shape: typed input in,
//! [`StageResult`] (typed data + token usage + cost) or [`StageError`] out.
//! Executors are pure with respect to the state store and the lock — the
//! runner owns persistence; stages own exactly one concern each.
//!
//! All stages share a [`StageContext`]: the chat client, the model, the
//! run-wide system instructions, and the optional output-language directive.

use miette::Diagnostic;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use thiserror::Error;

use crate::llm::{ChatClient, ChatRequest, LlmError, ModelPricing};
use crate::types::{StageName, TokenUsage};

mod clustering;
mod cruxes;
mod dedup;
mod extraction;
mod summaries;

pub use clustering::ClusteringStage;
pub use cruxes::{CruxPositions, CruxesStage, reconcile_positions, speaker_id};
pub use dedup::DedupStage;
pub use extraction::ExtractionStage;
pub use summaries::{MAX_SUMMARY_WORDS, SummariesStage};

/// Everything a stage needs to call the model.
#[derive(Clone)]
pub struct StageContext {
    pub client: Arc<dyn ChatClient>,
    pub model: String,
    pub system_instructions: String,
    pub output_language: Option<String>,
}

impl StageContext {
    /// Assemble the system prompt: run-wide instructions, then the stage's
    /// own, then the language directive when configured.
    #[must_use]
    pub fn system_prompt(&self, stage_instructions: &str) -> String {
        let mut prompt = format!("{}\n\n{}", self.system_instructions, stage_instructions);
        if let Some(language) = &self.output_language {
            prompt.push_str(&format!("\n\nRespond in {language}."));
        }
        prompt
    }

    /// One chat completion for `stage`, accumulating usage and cost into the
    /// running totals.
    pub(crate) async fn complete(
        &self,
        stage: StageName,
        system: &str,
        user: String,
        usage: &mut TokenUsage,
        cost: &mut f64,
    ) -> Result<String, StageError> {
        let response = self
            .client
            .complete(ChatRequest::new(self.model.clone(), system, user))
            .await
            .map_err(|source| StageError::Llm { stage, source })?;
        usage.add(response.usage);
        *cost += ModelPricing::cost(&self.model, &response.usage);
        Ok(response.content)
    }
}

/// Successful stage execution: data plus accounting.
#[derive(Clone, Debug, PartialEq)]
pub struct StageResult<T> {
    pub data: T,
    pub usage: TokenUsage,
    pub cost: f64,
    /// Items the stage discarded while validating the model output.
    /// Only extraction reports this; other stages leave it `None`.
    pub dropped_claims: Option<u32>,
}

/// Typed stage failure. Fatal for the run; the runner does not retry.
#[derive(Debug, Error, Diagnostic)]
pub enum StageError {
    /// Provider call failed after the client's own retries.
    #[error("{stage} stage LLM call failed: {source}")]
    #[diagnostic(code(tapestry::stage::llm))]
    Llm {
        stage: StageName,
        #[source]
        source: LlmError,
    },

    /// Model returned JSON that does not match the stage's output schema.
    #[error("{stage} stage returned malformed output: {reason}")]
    #[diagnostic(
        code(tapestry::stage::malformed_output),
        help("The model ignored the response schema; inspect the stage instructions.")
    )]
    MalformedOutput { stage: StageName, reason: String },

    /// Output parsed but is semantically unusable (e.g. empty taxonomy).
    #[error("{stage} stage produced invalid output: {reason}")]
    #[diagnostic(code(tapestry::stage::invalid_output))]
    InvalidOutput { stage: StageName, reason: String },
}

impl StageError {
    /// The stage this failure belongs to.
    #[must_use]
    pub fn stage(&self) -> StageName {
        match self {
            StageError::Llm { stage, .. }
            | StageError::MalformedOutput { stage, .. }
            | StageError::InvalidOutput { stage, .. } => *stage,
        }
    }
}

/// Parse a model response against a stage's wire schema.
pub(crate) fn parse_stage_json<T: DeserializeOwned>(
    stage: StageName,
    content: &str,
) -> Result<T, StageError> {
    serde_json::from_str(content).map_err(|e| StageError::MalformedOutput {
        stage,
        reason: e.to_string(),
    })
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn system_prompt_appends_language_directive() {
        let client = Arc::new(ScriptedClient::new());
        let mut ctx = context(client);
        assert!(!ctx.system_prompt("cluster").contains("Respond in"));
        ctx.output_language = Some("French".into());
        let prompt = ctx.system_prompt("cluster");
        assert!(prompt.contains("cluster"));
        assert!(prompt.ends_with("Respond in French."));
    }

    #[test]
    fn parse_rejects_schema_drift() {
        #[derive(Debug, serde::Deserialize)]
        struct Expected {
            #[allow(dead_code)]
            topics: Vec<String>,
        }
        let err =
            parse_stage_json::<Expected>(StageName::Clustering, "{\"unexpected\": 1}").unwrap_err();
        assert!(matches!(err, StageError::MalformedOutput { .. }));
        assert_eq!(err.stage(), StageName::Clustering);
    }
}

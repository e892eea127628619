//! Job descriptor: the message-queue payload that requests one pipeline run.
//!
//! The descriptor schema mirrors the queue wire contract field-for-field
//! (camelCase names, `firebaseDetails` envelope). Validation happens once,
//! before any stage runs: every required string must be non-empty, and crux
//! instructions must be present when the crux stage is enabled. After
//! validation the raw `{id, comment, interview}` rows are converted to the
//! canonical [`Comment`] shape exactly once.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::comment::{ANONYMOUS_SPEAKER, Comment};
use crate::types::SortStrategy;

// ── Descriptor shapes ──────────────────────────────────────────────────

/// Identifies the report a run belongs to and the requesting user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportIdentity {
    pub report_id: String,
    pub user_id: String,
}

/// LLM provider selection for every stage of this run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmSelection {
    pub model: String,
}

/// Per-stage prompt instructions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instructions {
    pub system_instructions: String,
    pub clustering_instructions: String,
    pub extraction_instructions: String,
    pub dedup_instructions: String,
    pub summaries_instructions: String,
    /// Required non-empty when `options.cruxes` is true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crux_instructions: Option<String>,
    /// Optional language directive appended to every system prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_language: Option<String>,
}

/// Feature switches for this run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    /// Run the optional crux stage.
    pub cruxes: bool,
    /// Run the bridging scorer after a successful pipeline. Absent ⇒ false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridging: Option<bool>,
    #[serde(default)]
    pub sort_strategy: SortStrategy,
}

impl RunOptions {
    /// Whether the bridging scorer is explicitly enabled.
    #[must_use]
    pub fn bridging_enabled(&self) -> bool {
        self.bridging.unwrap_or(false)
    }
}

/// Secrets forwarded with the job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEnv {
    #[serde(rename = "OPENAI_API_KEY")]
    pub openai_api_key: String,
}

/// The `config` envelope of a job descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfig {
    #[serde(rename = "firebaseDetails")]
    pub report: ReportIdentity,
    pub llm: LlmSelection,
    pub instructions: Instructions,
    pub options: RunOptions,
    pub env: JobEnv,
}

/// One raw comment row as delivered by the queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentRow {
    pub id: String,
    pub comment: String,
    /// Speaker attribution; absent rows map to [`ANONYMOUS_SPEAKER`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interview: Option<String>,
}

/// Human-facing report metadata, published alongside the outputs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDetails {
    pub title: String,
    pub description: String,
    pub question: String,
    pub filename: String,
}

/// A full pipeline job as delivered by the message queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    pub config: JobConfig,
    pub data: Vec<CommentRow>,
    pub report_details: ReportDetails,
}

// ── Validation ─────────────────────────────────────────────────────────

/// Descriptor validation failure. Fatal for the run; never retried.
#[derive(Debug, Error, Diagnostic)]
pub enum JobError {
    #[error("required field is empty: {field}")]
    #[diagnostic(
        code(tapestry::job::empty_field),
        help("Populate `{field}` in the job descriptor before enqueueing.")
    )]
    EmptyField { field: &'static str },

    #[error("comment row {index} has an empty `{field}`")]
    #[diagnostic(
        code(tapestry::job::empty_comment_field),
        help("Every data row needs a non-empty id and comment text.")
    )]
    EmptyCommentField { index: usize, field: &'static str },

    #[error("cruxes are enabled but `cruxInstructions` is missing or empty")]
    #[diagnostic(
        code(tapestry::job::missing_crux_instructions),
        help("Provide `config.instructions.cruxInstructions` or disable `options.cruxes`.")
    )]
    MissingCruxInstructions,

    #[error("job carries no comments")]
    #[diagnostic(code(tapestry::job::no_comments))]
    NoComments,
}

fn require(field: &'static str, value: &str) -> Result<(), JobError> {
    if value.trim().is_empty() {
        Err(JobError::EmptyField { field })
    } else {
        Ok(())
    }
}

impl JobDescriptor {
    /// Validate every required field per the descriptor contract.
    ///
    /// # Errors
    ///
    /// Returns the first [`JobError`] encountered; the run must not start.
    pub fn validate(&self) -> Result<(), JobError> {
        let config = &self.config;
        require("config.firebaseDetails.reportId", &config.report.report_id)?;
        require("config.firebaseDetails.userId", &config.report.user_id)?;
        require("config.llm.model", &config.llm.model)?;
        require("config.env.OPENAI_API_KEY", &config.env.openai_api_key)?;

        let instructions = &config.instructions;
        require(
            "config.instructions.systemInstructions",
            &instructions.system_instructions,
        )?;
        require(
            "config.instructions.clusteringInstructions",
            &instructions.clustering_instructions,
        )?;
        require(
            "config.instructions.extractionInstructions",
            &instructions.extraction_instructions,
        )?;
        require(
            "config.instructions.dedupInstructions",
            &instructions.dedup_instructions,
        )?;
        require(
            "config.instructions.summariesInstructions",
            &instructions.summaries_instructions,
        )?;
        if let Some(language) = &instructions.output_language {
            require("config.instructions.outputLanguage", language)?;
        }
        if config.options.cruxes {
            match &instructions.crux_instructions {
                Some(crux) if !crux.trim().is_empty() => {}
                _ => return Err(JobError::MissingCruxInstructions),
            }
        }

        require("reportDetails.title", &self.report_details.title)?;
        require("reportDetails.description", &self.report_details.description)?;
        require("reportDetails.question", &self.report_details.question)?;
        require("reportDetails.filename", &self.report_details.filename)?;

        if self.data.is_empty() {
            return Err(JobError::NoComments);
        }
        for (index, row) in self.data.iter().enumerate() {
            if row.id.trim().is_empty() {
                return Err(JobError::EmptyCommentField { index, field: "id" });
            }
            if row.comment.trim().is_empty() {
                return Err(JobError::EmptyCommentField {
                    index,
                    field: "comment",
                });
            }
        }
        Ok(())
    }

    /// Convert the raw rows to the canonical [`Comment`] shape.
    ///
    /// Call after [`validate`](Self::validate); rows with absent speakers map
    /// to [`ANONYMOUS_SPEAKER`] here, at the boundary, not via truthiness
    /// checks downstream.
    #[must_use]
    pub fn comments(&self) -> Vec<Comment> {
        self.data
            .iter()
            .map(|row| {
                Comment::new(
                    row.id.clone(),
                    row.comment.clone(),
                    row.interview
                        .as_deref()
                        .filter(|s| !s.trim().is_empty())
                        .unwrap_or(ANONYMOUS_SPEAKER),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> JobDescriptor {
        JobDescriptor {
            config: JobConfig {
                report: ReportIdentity {
                    report_id: "r1".into(),
                    user_id: "u1".into(),
                },
                llm: LlmSelection {
                    model: "gpt-4o-mini".into(),
                },
                instructions: Instructions {
                    system_instructions: "be rigorous".into(),
                    clustering_instructions: "cluster".into(),
                    extraction_instructions: "extract".into(),
                    dedup_instructions: "dedup".into(),
                    summaries_instructions: "summarize".into(),
                    crux_instructions: None,
                    output_language: None,
                },
                options: RunOptions::default(),
                env: JobEnv {
                    openai_api_key: "sk-test".into(),
                },
            },
            data: vec![CommentRow {
                id: "c1".into(),
                comment: "I love cats".into(),
                interview: Some("Alice".into()),
            }],
            report_details: ReportDetails {
                title: "t".into(),
                description: "d".into(),
                question: "q".into(),
                filename: "f".into(),
            },
        }
    }

    #[test]
    fn valid_descriptor_passes() {
        descriptor().validate().unwrap();
    }

    #[test]
    fn empty_report_id_rejected() {
        let mut job = descriptor();
        job.config.report.report_id = "  ".into();
        let err = job.validate().unwrap_err();
        assert!(matches!(
            err,
            JobError::EmptyField {
                field: "config.firebaseDetails.reportId"
            }
        ));
    }

    #[test]
    fn cruxes_require_instructions() {
        let mut job = descriptor();
        job.config.options.cruxes = true;
        assert!(matches!(
            job.validate().unwrap_err(),
            JobError::MissingCruxInstructions
        ));

        job.config.instructions.crux_instructions = Some("find cruxes".into());
        job.validate().unwrap();
    }

    #[test]
    fn empty_comment_text_rejected() {
        let mut job = descriptor();
        job.data.push(CommentRow {
            id: "c2".into(),
            comment: String::new(),
            interview: None,
        });
        assert!(matches!(
            job.validate().unwrap_err(),
            JobError::EmptyCommentField {
                index: 1,
                field: "comment"
            }
        ));
    }

    #[test]
    fn missing_interview_maps_to_anonymous() {
        let mut job = descriptor();
        job.data[0].interview = None;
        let comments = job.comments();
        assert_eq!(comments[0].speaker, ANONYMOUS_SPEAKER);
        assert_eq!(comments[0].text, "I love cats");
    }

    #[test]
    fn descriptor_round_trips_wire_names() {
        let job = descriptor();
        let json = serde_json::to_value(&job).unwrap();
        assert!(json["config"]["firebaseDetails"]["reportId"].is_string());
        assert!(json["config"]["env"]["OPENAI_API_KEY"].is_string());
        let back: JobDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }
}

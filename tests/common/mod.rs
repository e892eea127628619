//! Shared fixtures for the integration suites: a scripted chat client and
//! job-descriptor builders over a small two-speaker corpus.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use tapestry::job::{
    CommentRow, Instructions, JobConfig, JobDescriptor, JobEnv, LlmSelection, ReportDetails,
    ReportIdentity, RunOptions,
};
use tapestry::llm::{ChatClient, ChatRequest, ChatResponse, LlmError};
use tapestry::types::TokenUsage;

/// Replays queued responses in order and records every request.
#[derive(Default)]
pub struct ScriptedChat {
    responses: Mutex<VecDeque<Result<ChatResponse, LlmError>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedChat {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_json(&self, json: &str) {
        self.push_json_with_usage(json, TokenUsage::new(100, 50));
    }

    pub fn push_json_with_usage(&self, json: &str, usage: TokenUsage) {
        self.responses.lock().push_back(Ok(ChatResponse {
            content: json.to_string(),
            usage,
        }));
    }

    pub fn push_error(&self) {
        self.responses.lock().push_back(Err(LlmError::Http {
            status: 500,
            message: "scripted failure".into(),
        }));
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// System prompts of every recorded request, in call order.
    pub fn system_prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .map(|r| r.messages[0].content.clone())
            .collect()
    }
}

#[async_trait]
impl ChatClient for ScriptedChat {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        self.requests.lock().push(request);
        self.responses
            .lock()
            .pop_front()
            .unwrap_or(Err(LlmError::Transport {
                message: "scripted chat exhausted".into(),
            }))
    }
}

/// A job over one comment (speaker A), cruxes disabled.
pub fn simple_job(report_id: &str) -> JobDescriptor {
    let mut job = two_speaker_job(report_id);
    job.data.truncate(1);
    job
}

/// A job over two comments from two speakers, cruxes disabled.
pub fn two_speaker_job(report_id: &str) -> JobDescriptor {
    JobDescriptor {
        config: JobConfig {
            report: ReportIdentity {
                report_id: report_id.into(),
                user_id: "user-1".into(),
            },
            llm: LlmSelection {
                model: "gpt-4o-mini".into(),
            },
            instructions: Instructions {
                system_instructions: "You analyse public consultations.".into(),
                clustering_instructions: "Cluster the comments into topics.".into(),
                extraction_instructions: "Extract claims with quotes.".into(),
                dedup_instructions: "Merge near-duplicate claims.".into(),
                summaries_instructions: "Summarize each topic.".into(),
                crux_instructions: None,
                output_language: None,
            },
            options: RunOptions::default(),
            env: JobEnv {
                openai_api_key: "sk-test".into(),
            },
        },
        data: vec![
            CommentRow {
                id: "c1".into(),
                comment: "I love cats because they are independent".into(),
                interview: Some("A".into()),
            },
            CommentRow {
                id: "c2".into(),
                comment: "Cats can look after themselves".into(),
                interview: Some("B".into()),
            },
        ],
        report_details: ReportDetails {
            title: "Pets consultation".into(),
            description: "What people said about pets".into(),
            question: "How do you feel about pets?".into(),
            filename: "pets.json".into(),
        },
    }
}

pub const CLUSTERING_JSON: &str = r#"{"topics": [{"name": "Pets",
    "shortDescription": "Attitudes to pets",
    "subtopics": [{"name": "Cats", "shortDescription": "Feline opinions"}]}]}"#;

pub const EXTRACTION_ONE_JSON: &str = r#"{"claims": [
    {"topicName": "Pets", "subtopicName": "Cats",
     "claim": "Cats are independent companions",
     "quote": "I love cats because they are independent", "commentId": "c1"}]}"#;

pub const EXTRACTION_TWO_JSON: &str = r#"{"claims": [
    {"topicName": "Pets", "subtopicName": "Cats",
     "claim": "Cats are independent companions",
     "quote": "I love cats because they are independent", "commentId": "c1"},
    {"topicName": "Pets", "subtopicName": "Cats",
     "claim": "Cats are self-sufficient",
     "quote": "Cats can look after themselves", "commentId": "c2"}]}"#;

pub const DEDUP_NO_GROUPS_JSON: &str = r#"{"groups": []}"#;

pub const SUMMARIES_JSON: &str = r#"{"summaries": [{"topicName": "Pets",
    "summary": "Participants broadly value the independence of cats."}]}"#;

pub const CRUX_JSON: &str = r#"{"cruxClaim": "Cats are better off without human supervision.",
    "agree": ["1:A"], "disagree": ["2:B"], "noClearPosition": [],
    "explanation": "The two speakers differ on feline autonomy."}"#;

/// Queue responses for a full one-comment run (no dedup call, no cruxes).
pub fn script_simple_run(chat: &ScriptedChat) {
    chat.push_json(CLUSTERING_JSON);
    chat.push_json(EXTRACTION_ONE_JSON);
    chat.push_json(SUMMARIES_JSON);
}

/// Queue responses for a full two-comment run (dedup call, no cruxes).
pub fn script_two_speaker_run(chat: &ScriptedChat) {
    chat.push_json(CLUSTERING_JSON);
    chat.push_json(EXTRACTION_TWO_JSON);
    chat.push_json(DEDUP_NO_GROUPS_JSON);
    chat.push_json(SUMMARIES_JSON);
}

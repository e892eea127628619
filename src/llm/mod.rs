//! LLM provider seam.
//!
//! Stage executors talk to the model through the [`ChatClient`] trait: a
//! typed chat-completions request in, a typed result (content + token usage)
//! out. The production implementation is [`OpenAiClient`]; tests inject
//! scripted fakes. Stage cost is derived from usage via the per-model price
//! table in [`ModelPricing`].

use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::TokenUsage;

mod openai;

pub use openai::OpenAiClient;

/// Message role in a chat-completions request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
}

/// One message in a chat-completions request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// A typed chat-completions request. Responses are always requested as JSON
/// objects; every stage parses the content against its own output schema.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
}

impl ChatRequest {
    #[must_use]
    pub fn new(model: impl Into<String>, system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
        }
    }
}

/// The provider's answer: raw content plus token accounting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatResponse {
    pub content: String,
    pub usage: TokenUsage,
}

/// Errors from the LLM provider seam.
#[derive(Debug, Error, Diagnostic)]
pub enum LlmError {
    /// Non-success HTTP status after retries were exhausted.
    #[error("LLM provider returned HTTP {status}: {message}")]
    #[diagnostic(code(tapestry::llm::http))]
    Http { status: u16, message: String },

    /// Connection / timeout / protocol failure after retries.
    #[error("LLM transport error: {message}")]
    #[diagnostic(
        code(tapestry::llm::transport),
        help("Check provider reachability and the request timeout.")
    )]
    Transport { message: String },

    /// Body did not match the chat-completions shape.
    #[error("malformed LLM response: {reason}")]
    #[diagnostic(code(tapestry::llm::malformed))]
    Malformed { reason: String },
}

/// The seam stages depend on.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Run one chat completion.
    ///
    /// Implementations own their retry discipline; a returned error is
    /// final as far as the stage is concerned.
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, LlmError>;
}

// ── Pricing ────────────────────────────────────────────────────────────

/// USD per million tokens, matched by model-name prefix (longest wins).
/// Unknown models cost zero rather than guessing.
const PRICES: &[(&str, f64, f64)] = &[
    ("gpt-4o-mini", 0.15, 0.60),
    ("gpt-4o", 2.50, 10.00),
    ("gpt-4.1-mini", 0.40, 1.60),
    ("gpt-4.1-nano", 0.10, 0.40),
    ("gpt-4.1", 2.00, 8.00),
    ("o3-mini", 1.10, 4.40),
];

/// Per-model cost derivation from token usage.
pub struct ModelPricing;

impl ModelPricing {
    /// USD cost of `usage` under `model`'s published prices.
    #[must_use]
    pub fn cost(model: &str, usage: &TokenUsage) -> f64 {
        let Some((_, input_per_m, output_per_m)) = PRICES
            .iter()
            .filter(|(prefix, _, _)| model.starts_with(prefix))
            .max_by_key(|(prefix, _, _)| prefix.len())
        else {
            return 0.0;
        };
        (usage.input_tokens as f64 * input_per_m
            + usage.output_tokens as f64 * output_per_m)
            / 1_000_000.0
    }
}

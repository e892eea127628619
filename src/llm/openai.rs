//! OpenAI-compatible chat-completions client.
//!
//! Speaks the plain HTTP contract: `POST {base}/chat/completions` with
//! `response_format: {"type": "json_object"}`. Transient failures (429,
//! 5xx, transport errors) retry with capped exponential backoff and jitter;
//! other 4xx statuses are final immediately.

use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use async_trait::async_trait;

use super::{ChatClient, ChatRequest, ChatResponse, LlmError};
use crate::types::TokenUsage;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_millis(500);

#[derive(Debug, Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireMessage,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Chat-completions HTTP client.
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    /// Build a client against the public endpoint.
    ///
    /// # Errors
    ///
    /// [`LlmError::Transport`] if the underlying HTTP client cannot be
    /// constructed.
    pub fn new(api_key: impl Into<String>) -> Result<Self, LlmError> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    /// Build a client against a custom endpoint (proxies, test servers).
    pub fn with_base_url(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LlmError::Transport {
                message: e.to_string(),
            })?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    fn retryable_status(status: u16) -> bool {
        status == 429 || (500..600).contains(&status)
    }

    fn backoff(attempt: u32) -> Duration {
        let exp = BACKOFF_BASE * 2u32.saturating_pow(attempt);
        let jitter = rand::rng().random_range(0..=exp.as_millis() as u64 / 2);
        exp + Duration::from_millis(jitter)
    }

    async fn attempt(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        let body = json!({
            "model": request.model,
            "messages": request.messages,
            "response_format": {"type": "json_object"},
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Transport {
                message: e.to_string(),
            })?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Http { status, message });
        }

        let wire: WireResponse = response.json().await.map_err(|e| LlmError::Malformed {
            reason: e.to_string(),
        })?;
        let content = wire
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::Malformed {
                reason: "response carries no message content".into(),
            })?;
        let usage = wire.usage.unwrap_or_default();
        Ok(ChatResponse {
            content,
            usage: TokenUsage::new(usage.prompt_tokens, usage.completion_tokens),
        })
    }
}

#[async_trait]
impl ChatClient for OpenAiClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        let mut last_error = None;
        for attempt in 0..MAX_ATTEMPTS {
            match self.attempt(&request).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    let retryable = match &err {
                        LlmError::Http { status, .. } => Self::retryable_status(*status),
                        LlmError::Transport { .. } => true,
                        LlmError::Malformed { .. } => false,
                    };
                    if !retryable || attempt + 1 == MAX_ATTEMPTS {
                        return Err(err);
                    }
                    tracing::warn!(
                        attempt = attempt + 1,
                        error = %err,
                        "LLM call failed; retrying"
                    );
                    tokio::time::sleep(Self::backoff(attempt)).await;
                    last_error = Some(err);
                }
            }
        }
        // Unreachable in practice: the loop returns on final attempt.
        Err(last_error.unwrap_or(LlmError::Transport {
            message: "no attempt executed".into(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn parses_content_and_usage() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(200).json_body(serde_json::json!({
                    "choices": [{"message": {"role": "assistant", "content": "{\"ok\":true}"}}],
                    "usage": {"prompt_tokens": 12, "completion_tokens": 4, "total_tokens": 16}
                }));
            })
            .await;

        let client = OpenAiClient::with_base_url("sk-test", server.base_url()).unwrap();
        let response = client
            .complete(ChatRequest::new("gpt-4o-mini", "sys", "usr"))
            .await
            .unwrap();
        assert_eq!(response.content, "{\"ok\":true}");
        assert_eq!(response.usage.total_tokens, 16);
    }

    #[tokio::test]
    async fn non_retryable_status_is_final() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(401).body("no key");
            })
            .await;

        let client = OpenAiClient::with_base_url("sk-bad", server.base_url()).unwrap();
        let err = client
            .complete(ChatRequest::new("gpt-4o-mini", "sys", "usr"))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Http { status: 401, .. }));
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn retries_server_errors() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/chat/completions");
                then.status(500).body("transient");
            })
            .await;

        let client = OpenAiClient::with_base_url("sk-test", server.base_url()).unwrap();
        let err = client
            .complete(ChatRequest::new("gpt-4o-mini", "sys", "usr"))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Http { status: 500, .. }));
        mock.assert_hits_async(MAX_ATTEMPTS as usize).await;
    }
}

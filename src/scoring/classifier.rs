//! External classifier HTTP client.
//!
//! `POST {base}/v1alpha1/comments:analyze?key=<apiKey>` with the four
//! requested attributes; responses carry `summaryScore.value` per attribute
//! in [0, 1], defaulting to 0 when an attribute is missing. Text is
//! sanitized before sending: control characters stripped (newline and tab
//! kept) and length capped.

use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

use miette::Diagnostic;
use thiserror::Error;

use super::AttributeScores;

const DEFAULT_BASE_URL: &str = "https://commentanalyzer.googleapis.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum characters sent to the classifier.
pub const MAX_CLASSIFIER_CHARS: usize = 20_480;

const ATTR_PERSONAL_STORY: &str = "PERSONAL_STORY_EXPERIMENTAL";
const ATTR_REASONING: &str = "REASONING_EXPERIMENTAL";
const ATTR_CURIOSITY: &str = "CURIOSITY_EXPERIMENTAL";
const ATTR_TOXICITY: &str = "TOXICITY";

/// Strip control characters (keeping `\n` and `\t`) and cap the length.
#[must_use]
pub fn sanitize_text(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .take(MAX_CLASSIFIER_CHARS)
        .collect()
}

/// Errors from classifier calls.
#[derive(Debug, Error, Diagnostic)]
pub enum ClassifierError {
    #[error("classifier returned HTTP {status}: {message}")]
    #[diagnostic(code(tapestry::classifier::http))]
    Http { status: u16, message: String },

    #[error("classifier transport error: {message}")]
    #[diagnostic(code(tapestry::classifier::transport))]
    Transport { message: String },

    #[error("malformed classifier response: {reason}")]
    #[diagnostic(code(tapestry::classifier::malformed))]
    Malformed { reason: String },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAnalysis {
    #[serde(default)]
    attribute_scores: HashMap<String, WireAttribute>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireAttribute {
    #[serde(default)]
    summary_score: WireSummaryScore,
}

#[derive(Debug, Default, Deserialize)]
struct WireSummaryScore {
    #[serde(default)]
    value: f64,
}

/// HTTP client for the comment-analysis endpoint.
pub struct ClassifierClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ClassifierClient {
    /// Build a client against the public endpoint.
    ///
    /// # Errors
    ///
    /// [`ClassifierError::Transport`] if the HTTP client cannot be built.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ClassifierError> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    /// Build a client against a custom endpoint (tests).
    pub fn with_base_url(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Result<Self, ClassifierError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ClassifierError::Transport {
                message: e.to_string(),
            })?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    /// Score one text. The input is sanitized here; callers pass raw text.
    pub async fn analyze(&self, text: &str) -> Result<AttributeScores, ClassifierError> {
        let body = json!({
            "comment": {"text": sanitize_text(text)},
            "requestedAttributes": {
                ATTR_PERSONAL_STORY: {},
                ATTR_REASONING: {},
                ATTR_CURIOSITY: {},
                ATTR_TOXICITY: {},
            },
            "doNotStore": true,
            "languages": ["en"],
        });

        let response = self
            .http
            .post(format!("{}/v1alpha1/comments:analyze", self.base_url))
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| ClassifierError::Transport {
                message: e.to_string(),
            })?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let message = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Http { status, message });
        }

        let wire: WireAnalysis =
            response
                .json()
                .await
                .map_err(|e| ClassifierError::Malformed {
                    reason: e.to_string(),
                })?;

        let value = |attr: &str| -> f64 {
            wire.attribute_scores
                .get(attr)
                .map(|a| a.summary_score.value)
                .unwrap_or(0.0)
        };
        Ok(AttributeScores {
            personal_story: value(ATTR_PERSONAL_STORY),
            reasoning: value(ATTR_REASONING),
            curiosity: value(ATTR_CURIOSITY),
            toxicity: value(ATTR_TOXICITY),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn sanitize_strips_controls_and_caps_length() {
        assert_eq!(sanitize_text("a\u{0}b\u{7}c"), "abc");
        assert_eq!(sanitize_text("line\nbreak\ttab"), "line\nbreak\ttab");
        let long = "x".repeat(MAX_CLASSIFIER_CHARS + 100);
        assert_eq!(sanitize_text(&long).chars().count(), MAX_CLASSIFIER_CHARS);
    }

    #[tokio::test]
    async fn parses_attribute_scores() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/v1alpha1/comments:analyze")
                    .query_param("key", "k1");
                then.status(200).json_body(serde_json::json!({
                    "attributeScores": {
                        "PERSONAL_STORY_EXPERIMENTAL": {"summaryScore": {"value": 0.9}},
                        "REASONING_EXPERIMENTAL": {"summaryScore": {"value": 0.8}},
                        "CURIOSITY_EXPERIMENTAL": {"summaryScore": {"value": 0.7}},
                        "TOXICITY": {"summaryScore": {"value": 0.1}}
                    }
                }));
            })
            .await;

        let client = ClassifierClient::with_base_url("k1", server.base_url()).unwrap();
        let scores = client.analyze("some text").await.unwrap();
        assert!((scores.personal_story - 0.9).abs() < 1e-9);
        assert!((scores.toxicity - 0.1).abs() < 1e-9);
    }

    #[tokio::test]
    async fn missing_attributes_default_to_zero() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1alpha1/comments:analyze");
                then.status(200).json_body(serde_json::json!({
                    "attributeScores": {
                        "TOXICITY": {"summaryScore": {"value": 0.3}}
                    }
                }));
            })
            .await;

        let client = ClassifierClient::with_base_url("k1", server.base_url()).unwrap();
        let scores = client.analyze("text").await.unwrap();
        assert_eq!(scores.personal_story, 0.0);
        assert_eq!(scores.reasoning, 0.0);
        assert!((scores.toxicity - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn http_error_surfaces_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/v1alpha1/comments:analyze");
                then.status(403).body("quota");
            })
            .await;

        let client = ClassifierClient::with_base_url("k1", server.base_url()).unwrap();
        let err = client.analyze("text").await.unwrap_err();
        assert!(matches!(err, ClassifierError::Http { status: 403, .. }));
    }
}

//! Bridging-scorer scenarios: toxicity zeroing, cache recompute, cache
//! consistency, the rate-limit bound, and the runner's bridging gate.

mod common;

use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;

use tapestry::comment::{Comment, SpeakerRegistry};
use tapestry::kv::MemoryKv;
use tapestry::limiter::{RateLimiter, RateLimiterConfig};
use tapestry::report::{Claim, ReportSubtopic, ReportTopic, SortedTree};
use tapestry::runner::{PipelineRunner, RunnerConfig};
use tapestry::scoring::{BridgingScorer, ClassifierClient, ScoreCache};

use common::*;

fn one_claim_tree(text: &str, quote: &str) -> (SortedTree, SpeakerRegistry) {
    let tree = SortedTree(vec![ReportTopic {
        name: "Pets".into(),
        short_description: String::new(),
        subtopics: vec![ReportSubtopic {
            name: "Cats".into(),
            short_description: String::new(),
            claims: vec![Claim {
                text: text.into(),
                quote: quote.into(),
                speaker: "A".into(),
                topic_name: "Pets".into(),
                subtopic_name: "Cats".into(),
                source_comment_id: "c1".into(),
                duplicates: vec![],
                duplicated: false,
            }],
        }],
    }]);
    let registry = SpeakerRegistry::from_comments(&[Comment::new("c1", "x", "A")]);
    (tree, registry)
}

fn fast_limiter(kv: Arc<MemoryKv>) -> RateLimiter {
    RateLimiter::with_config(
        kv,
        RateLimiterConfig {
            interval: Duration::from_millis(1),
            poll_granularity: Duration::from_millis(1),
            fallback_delay: Duration::from_millis(1),
            key_ttl: Duration::from_secs(5),
        },
    )
}

fn scorer_against(kv: Arc<MemoryKv>, base_url: String) -> BridgingScorer {
    BridgingScorer::new(
        ScoreCache::new(kv.clone(), "test"),
        fast_limiter(kv),
        ClassifierClient::with_base_url("key", base_url).unwrap(),
    )
}

#[tokio::test]
async fn s5_full_toxicity_zeroes_the_bridging_score() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1alpha1/comments:analyze");
            then.status(200).json_body(serde_json::json!({
                "attributeScores": {
                    "PERSONAL_STORY_EXPERIMENTAL": {"summaryScore": {"value": 0.9}},
                    "REASONING_EXPERIMENTAL": {"summaryScore": {"value": 0.8}},
                    "CURIOSITY_EXPERIMENTAL": {"summaryScore": {"value": 0.7}},
                    "TOXICITY": {"summaryScore": {"value": 1.0}}
                }
            }));
        })
        .await;

    let kv = Arc::new(MemoryKv::new());
    let (tree, registry) = one_claim_tree("toxic claim", "toxic quote");
    let report = scorer_against(kv, server.base_url())
        .score_tree(&tree, &registry)
        .await;

    assert_eq!(report.scores.len(), 2);
    for score in &report.scores {
        assert_eq!(score.bridging_score, 0.0);
        assert!((score.toxicity - 1.0).abs() < 1e-9);
    }
}

#[tokio::test]
async fn s6_stale_cached_composite_is_recomputed_on_read() {
    let kv = Arc::new(MemoryKv::new());
    let cache = ScoreCache::new(kv.clone(), "test");

    // Stored under an old formula: raw halves, composite 1.5.
    let stale = serde_json::json!({
        "personalStory": 0.5,
        "reasoning": 0.5,
        "curiosity": 0.5,
        "toxicity": 0.5,
        "bridgingScore": 1.5,
    });
    use tapestry::kv::KvStore;
    kv.set(&cache.key("the claim"), &stale.to_string(), None)
        .await
        .unwrap();
    kv.set(&cache.key("the quote"), &stale.to_string(), None)
        .await
        .unwrap();

    // No classifier behind this server: a request would 404 and surface as
    // an item error, so all-cache operation is observable.
    let server = MockServer::start_async().await;
    let (tree, registry) = one_claim_tree("the claim", "the quote");
    let report = scorer_against(kv, server.base_url())
        .score_tree(&tree, &registry)
        .await;

    assert!(report.errors.is_empty());
    for score in &report.scores {
        assert!((score.bridging_score - 0.75).abs() < 1e-9);
    }
}

#[tokio::test]
async fn cache_consistency_scores_identical_text_once() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST).path("/v1alpha1/comments:analyze");
            then.status(200).json_body(serde_json::json!({
                "attributeScores": {
                    "PERSONAL_STORY_EXPERIMENTAL": {"summaryScore": {"value": 0.4}},
                    "REASONING_EXPERIMENTAL": {"summaryScore": {"value": 0.4}},
                    "CURIOSITY_EXPERIMENTAL": {"summaryScore": {"value": 0.2}},
                    "TOXICITY": {"summaryScore": {"value": 0.0}}
                }
            }));
        })
        .await;

    let kv = Arc::new(MemoryKv::new());
    // Claim and quote share the same text, so one classifier call serves
    // both items — and the whole second walk.
    let (tree, registry) = one_claim_tree("same text", "same text");
    let scorer = scorer_against(kv, server.base_url());

    let first = scorer.score_tree(&tree, &registry).await;
    assert_eq!(mock.hits_async().await, 1);

    let second = scorer.score_tree(&tree, &registry).await;
    assert_eq!(mock.hits_async().await, 1);
    assert_eq!(first.scores[0].bridging_score, second.scores[0].bridging_score);
}

#[tokio::test]
async fn rate_limit_admits_at_most_one_per_interval_across_workers() {
    let kv = Arc::new(MemoryKv::new());
    let interval = Duration::from_millis(60);
    let config = RateLimiterConfig {
        interval,
        poll_granularity: Duration::from_millis(5),
        fallback_delay: Duration::from_millis(70),
        key_ttl: Duration::from_secs(5),
    };
    // Three "workers" sharing one global key.
    let workers: Vec<_> = (0..3)
        .map(|_| Arc::new(RateLimiter::with_config(kv.clone(), config)))
        .collect();

    let start = tokio::time::Instant::now();
    let mut handles = Vec::new();
    for worker in &workers {
        let worker = worker.clone();
        handles.push(tokio::spawn(async move { worker.acquire().await }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    // Three admissions need at least two full intervals between them.
    assert!(start.elapsed() >= interval * 2);
}

#[tokio::test]
async fn runner_gates_bridging_on_the_option() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v1alpha1/comments:analyze");
            then.status(200).json_body(serde_json::json!({
                "attributeScores": {
                    "PERSONAL_STORY_EXPERIMENTAL": {"summaryScore": {"value": 1.0}},
                    "REASONING_EXPERIMENTAL": {"summaryScore": {"value": 1.0}},
                    "CURIOSITY_EXPERIMENTAL": {"summaryScore": {"value": 1.0}},
                    "TOXICITY": {"summaryScore": {"value": 0.0}}
                }
            }));
        })
        .await;

    let kv = Arc::new(MemoryKv::new());

    // bridging unset: the scorer never runs even though it is configured.
    let chat = ScriptedChat::new();
    script_simple_run(&chat);
    let runner = PipelineRunner::new(kv.clone(), RunnerConfig::default())
        .with_chat_client(chat)
        .with_scorer(scorer_against(kv.clone(), server.base_url()));
    let outcome = runner.run(simple_job("nobridge"), false).await.unwrap();
    assert!(outcome.bridging.is_none());

    // bridging = true: scores come back for the claim and its quote.
    let chat = ScriptedChat::new();
    script_simple_run(&chat);
    let runner = PipelineRunner::new(kv.clone(), RunnerConfig::default())
        .with_chat_client(chat)
        .with_scorer(scorer_against(kv, server.base_url()));
    let mut job = simple_job("bridge");
    job.config.options.bridging = Some(true);
    let outcome = runner.run(job, false).await.unwrap();

    let report = outcome.bridging.unwrap();
    assert_eq!(report.scores.len(), 2);
    assert!(report.scores.iter().all(|s| s.bridging_score == 3.0));
}

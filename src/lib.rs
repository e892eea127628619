//! # Tapestry: Consultation-Report Pipeline Engine
//!
//! Tapestry turns a corpus of free-text comments (public consultation
//! contributions, interview transcripts) into a structured report: a tree of
//! topics and subtopics populated with deduplicated, quote-attributed
//! claims, per-topic narrative summaries, and — optionally — cruxes of
//! disagreement and per-item bridging scores from an external classifier.
//!
//! ## Core Concepts
//!
//! - **Run**: one full pipeline execution for one `reportId`, protected by a
//!   distributed lock so at most one worker is ever active per report.
//! - **Stages**: a fixed linear sequence — clustering → extraction →
//!   sort+deduplicate → summaries → cruxes (optional) — each consuming the
//!   previous stage's output.
//! - **Durable state**: the run record lives in a Redis-compatible store and
//!   is persisted after every stage transition, so a replacement worker
//!   resumes at the first incomplete stage.
//! - **Bridging scores**: after a successful run, claims and quotes are
//!   scored through a rate-limited, cache-fronted classifier client.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tapestry::kv::RedisKv;
//! use tapestry::runner::{PipelineRunner, RunnerConfig};
//! # async fn example(job: tapestry::job::JobDescriptor) -> Result<(), Box<dyn std::error::Error>> {
//!
//! let kv = Arc::new(RedisKv::connect("redis://127.0.0.1:6379").await?);
//! let runner = PipelineRunner::new(kv, RunnerConfig::default());
//!
//! let outcome = runner.run(job, false).await?;
//! println!(
//!     "completed: {} topics, {} tokens, ${:.4}",
//!     outcome.outputs.sorted_tree.0.len(),
//!     outcome.state.total_tokens,
//!     outcome.state.total_cost,
//! );
//! // The caller publishes artifacts, then releases the lock via
//! // outcome.lock_token.
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`job`] - Job descriptor and ingress validation
//! - [`comment`] - Canonical comment shape and speaker registry
//! - [`report`] - Taxonomy, claim tree, summary, and crux value types
//! - [`state`] - The durable per-run state record
//! - [`kv`] - Redis-compatible key-value abstraction (+ in-memory impl)
//! - [`store`] - State store with lock-guarded atomic writes
//! - [`lock`] - Distributed execution lock
//! - [`limiter`] - Fleet-wide 1-QPS classifier admission gate
//! - [`llm`] - Chat-completions client seam and model pricing
//! - [`stages`] - The five stage executors
//! - [`runner`] - The pipeline runner: orchestration, resume, heartbeat
//! - [`scoring`] - Bridging scorer, score cache, classifier client
//! - [`telemetry`] - Tracing subscriber bootstrap

pub mod comment;
pub mod job;
pub mod kv;
pub mod limiter;
pub mod llm;
pub mod lock;
pub mod report;
pub mod runner;
pub mod scoring;
pub mod stages;
pub mod state;
pub mod store;
pub mod telemetry;
pub mod types;

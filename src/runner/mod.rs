//! The Pipeline Runner: admission, resumable state, the stage loop, and
//! post-run publication hand-off.
//!
//! One call to [`PipelineRunner::run`] executes one report's pipeline under
//! the per-report lock:
//!
//! 1. acquire the lock (or short-circuit `AlreadyRunning` with no side
//!    effects);
//! 2. load-or-create the durable [`RunState`], honouring `resume_from_state`;
//! 3. walk the fixed stage sequence, persisting after every transition with
//!    the lock-guarded write; cached outputs of already-completed stages are
//!    re-validated, with a bounded retry budget before the run is declared
//!    corrupt;
//! 4. on success, optionally run the bridging scorer, then extend the lock
//!    so the caller has an exclusive window to publish artifacts.
//!
//! A heartbeat task renews the lock concurrently; losing it aborts the run
//! at the next suspension point without further state writes.

use miette::Diagnostic;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::instrument;

use crate::comment::SpeakerRegistry;
use crate::job::{JobDescriptor, JobError};
use crate::kv::KvStore;
use crate::llm::{ChatClient, LlmError, OpenAiClient};
use crate::lock::{LockError, LockManager, LockSettings, lock_key, new_owner_token};
use crate::report::{ClaimsTree, SortedTree, SubtopicCrux, Taxonomy, TopicSummary};
use crate::scoring::{BridgingScorer, ScoringReport};
use crate::stages::{
    ClusteringStage, CruxesStage, DedupStage, ExtractionStage, StageContext, StageError,
    SummariesStage,
};
use crate::state::{MAX_VALIDATION_FAILURES, RunState, StageAnalytics};
use crate::store::{GuardedWrite, StateStore, StoreError};
use crate::types::{RunStatus, StageName, StageStatus, TokenUsage};

mod heartbeat;
mod progress;

pub use heartbeat::Heartbeat;
pub use progress::{ChannelProgress, ProgressSink, ProgressUpdate};

use heartbeat::wait_lost;

/// Error name recorded in state for external cancellation.
const CANCELLED_ERROR_NAME: &str = "Cancelled";

/// Runner-wide configuration.
#[derive(Clone, Copy, Debug)]
pub struct RunnerConfig {
    pub lock: LockSettings,
    /// Overall wall-clock budget for one run.
    pub run_deadline: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            lock: LockSettings::default(),
            run_deadline: Duration::from_secs(30 * 60),
        }
    }
}

/// The finished report artifacts, in pipeline order.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutputs {
    pub topic_tree: Taxonomy,
    pub claims_tree: ClaimsTree,
    pub sorted_tree: SortedTree,
    pub summaries: Vec<TopicSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cruxes: Option<Vec<SubtopicCrux>>,
}

/// Everything a successful run hands back for publication.
#[derive(Debug)]
pub struct RunOutcome {
    pub outputs: RunOutputs,
    /// The final durable record, exactly as persisted.
    pub state: RunState,
    /// Owner token; the caller releases the lock after publication.
    pub lock_token: String,
    /// Bridging scores, when `options.bridging` requested them and a scorer
    /// is configured.
    pub bridging: Option<ScoringReport>,
}

/// Runner failure taxonomy. Each variant is a distinct kind clients may
/// discriminate.
#[derive(Debug, Error, Diagnostic)]
pub enum RunnerError {
    /// Descriptor failed ingress validation; nothing ran.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Validation(#[from] JobError),

    /// Another worker holds the lock; no side effects occurred.
    #[error("a pipeline run for {report_id} is already in progress")]
    #[diagnostic(
        code(tapestry::runner::already_running),
        help("Wait for the active worker to finish or for its lock to expire.")
    )]
    AlreadyRunning { report_id: String },

    /// Resume was requested on a state that cannot be resumed.
    #[error("cannot resume {report_id}: state is {status}")]
    #[diagnostic(code(tapestry::runner::cannot_resume))]
    CannotResume { report_id: String, status: RunStatus },

    /// A stage executor returned a typed failure; the run is failed.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Stage(#[from] StageError),

    /// Stored state is unusable (unparseable, or a stage's cached output
    /// failed re-validation too many times).
    #[error("corrupted state for {report_id}: {reason}")]
    #[diagnostic(
        code(tapestry::runner::state_corrupt),
        help("The state record is quarantined; a fresh (non-resume) run recreates it.")
    )]
    StateCorrupt { report_id: String, reason: String },

    /// The lock was lost mid-run; the current stage was abandoned and no
    /// further state was written.
    #[error("execution lock for {report_id} was lost")]
    #[diagnostic(code(tapestry::runner::lock_lost))]
    LockLost { report_id: String },

    /// The run was cancelled (externally, or by the run deadline).
    #[error("run {report_id} cancelled: {reason}")]
    #[diagnostic(code(tapestry::runner::cancelled))]
    Cancelled { report_id: String, reason: String },

    /// The LLM client could not be constructed.
    #[error("LLM client initialization failed: {source}")]
    #[diagnostic(code(tapestry::runner::provider))]
    Provider {
        #[source]
        source: LlmError,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Lock(#[from] LockError),
}

/// Why a bounded stage future was abandoned.
enum Abort {
    LockLost,
    Deadline,
}

/// Result of re-validating a completed stage's cached output.
enum CachedOutcome {
    /// Decoded cleanly; the typed output was restored.
    Valid,
    /// Failed validation within the retry budget; re-execute the stage.
    Invalid,
    /// Failed validation with the budget exhausted; the run is corrupt.
    Corrupt(String),
}

/// Typed outputs accumulated across the stage loop.
#[derive(Default)]
struct StageData {
    taxonomy: Option<Taxonomy>,
    claims: Option<ClaimsTree>,
    sorted: Option<SortedTree>,
    summaries: Option<Vec<TopicSummary>>,
    cruxes: Option<Vec<SubtopicCrux>>,
}

/// Race a stage future against lock loss and the run deadline.
async fn bounded<T>(
    fut: impl Future<Output = T>,
    lost: watch::Receiver<bool>,
    deadline: Instant,
) -> Result<T, Abort> {
    tokio::select! {
        _ = wait_lost(lost) => Err(Abort::LockLost),
        _ = tokio::time::sleep_until(deadline) => Err(Abort::Deadline),
        out = fut => Ok(out),
    }
}

/// Orchestrates pipeline runs against a shared key-value store.
pub struct PipelineRunner {
    store: StateStore,
    lock: LockManager,
    config: RunnerConfig,
    chat_override: Option<Arc<dyn ChatClient>>,
    scorer: Option<Arc<BridgingScorer>>,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl PipelineRunner {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, config: RunnerConfig) -> Self {
        Self {
            store: StateStore::new(kv.clone()),
            lock: LockManager::new(kv),
            config,
            chat_override: None,
            scorer: None,
            progress: None,
        }
    }

    /// Inject a chat client instead of building one from the job's API key
    /// (tests, proxies).
    #[must_use]
    pub fn with_chat_client(mut self, client: Arc<dyn ChatClient>) -> Self {
        self.chat_override = Some(client);
        self
    }

    /// Attach the bridging scorer that `options.bridging` gates.
    #[must_use]
    pub fn with_scorer(mut self, scorer: BridgingScorer) -> Self {
        self.scorer = Some(Arc::new(scorer));
        self
    }

    /// Attach a progress observer.
    #[must_use]
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Execute one pipeline run.
    ///
    /// # Errors
    ///
    /// See [`RunnerError`]; `AlreadyRunning` and `Validation` guarantee no
    /// side effects.
    #[instrument(
        skip_all,
        fields(
            report_id = %job.config.report.report_id,
            user_id = %job.config.report.user_id,
            resume = resume_from_state,
        ),
        err
    )]
    pub async fn run(
        &self,
        job: JobDescriptor,
        resume_from_state: bool,
    ) -> Result<RunOutcome, RunnerError> {
        job.validate()?;
        let report_id = job.config.report.report_id.clone();
        let key = lock_key(&report_id);
        let owner = new_owner_token();

        if !self.lock.acquire(&key, &owner, self.config.lock.ttl).await? {
            tracing::info!("lock held elsewhere; refusing run");
            return Err(RunnerError::AlreadyRunning { report_id });
        }

        let heartbeat = Heartbeat::spawn(
            self.lock.clone(),
            key.clone(),
            owner.clone(),
            self.config.lock,
        );

        let result = self
            .run_locked(&job, resume_from_state, &key, &owner, heartbeat.lost())
            .await;

        match result {
            Ok((outputs, state)) => {
                // Score while the heartbeat still renews the lock: the walk
                // is rate-limited and can take a while on large trees.
                let bridging = match (&self.scorer, job.config.options.bridging_enabled()) {
                    (Some(scorer), true) => {
                        let registry = SpeakerRegistry::from_comments(&job.comments());
                        Some(scorer.score_tree(&outputs.sorted_tree, &registry).await)
                    }
                    (None, true) => {
                        tracing::warn!("bridging requested but no scorer is configured");
                        None
                    }
                    _ => None,
                };

                heartbeat.stop();
                // Publication window: the caller releases the lock when done.
                if !self
                    .lock
                    .extend(&key, &owner, self.config.lock.extension)
                    .await?
                {
                    tracing::warn!("publication lock extension failed; lock was already gone");
                }
                Ok(RunOutcome {
                    outputs,
                    state,
                    lock_token: owner,
                    bridging,
                })
            }
            Err(err) => {
                heartbeat.stop();
                if !matches!(err, RunnerError::LockLost { .. }) {
                    // Free the slot so a retry does not wait out the TTL.
                    let _ = self.lock.release(&key, &owner).await;
                }
                Err(err)
            }
        }
    }

    /// Transition a running report to `failed` with a cancellation marker.
    ///
    /// Does not interrupt in-flight I/O; the active worker notices at its
    /// next stage boundary (or when its heartbeat fails). Returns true when
    /// a non-terminal state was marked.
    pub async fn cancel(&self, report_id: &str) -> Result<bool, RunnerError> {
        let updated = self
            .store
            .update(report_id, |state| {
                if state.status.is_terminal() {
                    return;
                }
                let stage = state
                    .current_stage
                    .or_else(|| {
                        StageName::ALL
                            .into_iter()
                            .find(|s| !state.analytics(*s).status.is_settled())
                    })
                    .unwrap_or(StageName::Clustering);
                state.mark_stage_failed(stage, CANCELLED_ERROR_NAME, "cancelled by user");
            })
            .await?;
        Ok(updated.is_some_and(|state| {
            state
                .error
                .as_ref()
                .is_some_and(|e| e.name == CANCELLED_ERROR_NAME)
        }))
    }

    // ── Locked section ─────────────────────────────────────────────────

    async fn run_locked(
        &self,
        job: &JobDescriptor,
        resume: bool,
        lock_key: &str,
        owner: &str,
        lost: watch::Receiver<bool>,
    ) -> Result<(RunOutputs, RunState), RunnerError> {
        let report_id = job.config.report.report_id.as_str();

        let mut state = self.load_or_init_state(job, resume).await?;
        self.mirror_validation_counters(report_id, &mut state)
            .await?;
        state.status = RunStatus::Running;
        self.persist_guarded(&mut state, lock_key, owner).await?;

        let ctx = StageContext {
            client: self.chat_client(job)?,
            model: job.config.llm.model.clone(),
            system_instructions: job.config.instructions.system_instructions.clone(),
            output_language: job.config.instructions.output_language.clone(),
        };
        let comments = job.comments();
        let registry = SpeakerRegistry::from_comments(&comments);
        let cruxes_enabled = job.config.options.cruxes;
        let deadline = Instant::now() + self.config.run_deadline;
        let mut data = StageData::default();

        for stage in StageName::ALL {
            self.check_external_cancel(report_id).await?;
            if *lost.borrow() {
                return Err(RunnerError::LockLost {
                    report_id: report_id.to_string(),
                });
            }

            match state.analytics(stage).status {
                StageStatus::Completed => {
                    match self
                        .restore_cached(&mut state, report_id, stage, &mut data)
                        .await?
                    {
                        CachedOutcome::Valid => {
                            tracing::debug!(%stage, "reusing validated cached output");
                            continue;
                        }
                        CachedOutcome::Invalid => {
                            // Fall through and re-execute the stage.
                            tracing::warn!(%stage, "cached output invalid; re-executing stage");
                        }
                        CachedOutcome::Corrupt(reason) => {
                            tracing::error!(%stage, %reason, "cached output exhausted its retry budget");
                            return Err(self
                                .fail_run(
                                    state,
                                    stage,
                                    "StateCorrupt",
                                    &reason,
                                    lock_key,
                                    owner,
                                    RunnerError::StateCorrupt {
                                        report_id: report_id.to_string(),
                                        reason: reason.clone(),
                                    },
                                )
                                .await);
                        }
                    }
                }
                StageStatus::Skipped => continue,
                StageStatus::Pending | StageStatus::InProgress | StageStatus::Failed => {}
            }

            if stage == StageName::Cruxes && !cruxes_enabled {
                state.mark_stage_skipped(stage);
                self.persist_guarded(&mut state, lock_key, owner).await?;
                continue;
            }

            state.mark_stage_in_progress(stage);
            self.persist_guarded(&mut state, lock_key, owner).await?;
            tracing::info!(%stage, "stage started");

            let started = Instant::now();
            let executed = self
                .execute_stage(stage, job, &ctx, &comments, &registry, &mut data, &lost, deadline)
                .await;

            match executed {
                Ok(Ok((value, usage, cost, dropped_claims))) => {
                    state.mark_stage_completed(stage, usage, cost, started.elapsed(), value);
                    state.analytics_mut(stage).dropped_claims = dropped_claims;
                    self.store.clear_validation_failure(report_id, stage).await?;
                    self.persist_guarded(&mut state, lock_key, owner).await?;
                    tracing::info!(%stage, tokens = usage.total_tokens, "stage completed");
                    self.emit_progress(&state, stage, cruxes_enabled);
                }
                Ok(Err(stage_err)) => {
                    tracing::error!(%stage, error = %stage_err, "stage failed");
                    return Err(self
                        .fail_run(
                            state,
                            stage,
                            "StageFailure",
                            &stage_err.to_string(),
                            lock_key,
                            owner,
                            RunnerError::Stage(stage_err),
                        )
                        .await);
                }
                Err(Abort::LockLost) => {
                    return Err(RunnerError::LockLost {
                        report_id: report_id.to_string(),
                    });
                }
                Err(Abort::Deadline) => {
                    let reason = "run deadline exceeded".to_string();
                    return Err(self
                        .fail_run(
                            state,
                            stage,
                            CANCELLED_ERROR_NAME,
                            &reason,
                            lock_key,
                            owner,
                            RunnerError::Cancelled {
                                report_id: report_id.to_string(),
                                reason: reason.clone(),
                            },
                        )
                        .await);
                }
            }
        }

        state.finalize_completed();
        self.persist_guarded(&mut state, lock_key, owner).await?;

        let outputs = self.collect_outputs(report_id, data)?;
        Ok((outputs, state))
    }

    /// Execute one stage, racing it against lock loss and the deadline.
    /// On success the typed output is stashed in `data` and its JSON form
    /// returned for the state record, together with usage, cost, and the
    /// stage's dropped-claim count (extraction only).
    #[allow(clippy::too_many_arguments)]
    async fn execute_stage(
        &self,
        stage: StageName,
        job: &JobDescriptor,
        ctx: &StageContext,
        comments: &[crate::comment::Comment],
        registry: &SpeakerRegistry,
        data: &mut StageData,
        lost: &watch::Receiver<bool>,
        deadline: Instant,
    ) -> Result<Result<(Value, TokenUsage, f64, Option<u32>), StageError>, Abort> {
        let instructions = &job.config.instructions;

        macro_rules! upstream {
            ($slot:expr) => {
                match self.upstream($slot.as_ref(), stage) {
                    Ok(value) => value,
                    Err(e) => return Ok(Err(e)),
                }
            };
        }

        macro_rules! finish {
            ($stage:expr, $result:expr, $slot:expr) => {{
                match $result {
                    Ok(res) => match serde_json::to_value(&res.data) {
                        Ok(value) => {
                            *$slot = Some(res.data);
                            Ok(Ok((value, res.usage, res.cost, res.dropped_claims)))
                        }
                        Err(e) => Ok(Err(StageError::InvalidOutput {
                            stage: $stage,
                            reason: format!("output failed to serialize: {e}"),
                        })),
                    },
                    Err(e) => Ok(Err(e)),
                }
            }};
        }

        match stage {
            StageName::Clustering => {
                let exec = ClusteringStage::new(&instructions.clustering_instructions);
                let result = bounded(exec.run(ctx, comments), lost.clone(), deadline).await?;
                finish!(stage, result, &mut data.taxonomy)
            }
            StageName::Extraction => {
                let taxonomy = upstream!(data.taxonomy);
                let exec = ExtractionStage::new(&instructions.extraction_instructions);
                let result =
                    bounded(exec.run(ctx, comments, taxonomy), lost.clone(), deadline).await?;
                finish!(stage, result, &mut data.claims)
            }
            StageName::SortAndDeduplicate => {
                let taxonomy = upstream!(data.taxonomy);
                let claims = upstream!(data.claims);
                let exec = DedupStage::new(
                    &instructions.dedup_instructions,
                    job.config.options.sort_strategy,
                );
                let result =
                    bounded(exec.run(ctx, claims, taxonomy), lost.clone(), deadline).await?;
                finish!(stage, result, &mut data.sorted)
            }
            StageName::Summaries => {
                let sorted = upstream!(data.sorted);
                let exec = SummariesStage::new(&instructions.summaries_instructions);
                let result = bounded(exec.run(ctx, sorted), lost.clone(), deadline).await?;
                finish!(stage, result, &mut data.summaries)
            }
            StageName::Cruxes => {
                let sorted = upstream!(data.sorted);
                let crux_instructions = instructions
                    .crux_instructions
                    .clone()
                    .unwrap_or_default();
                let exec = CruxesStage::new(crux_instructions);
                let result =
                    bounded(exec.run(ctx, sorted, registry), lost.clone(), deadline).await?;
                finish!(stage, result, &mut data.cruxes)
            }
        }
    }

    fn upstream<'a, T>(
        &self,
        value: Option<&'a T>,
        stage: StageName,
    ) -> Result<&'a T, StageError> {
        // By construction every earlier stage either executed or restored
        // its cached output; a hole here means the stored record lied.
        value.ok_or_else(|| StageError::InvalidOutput {
            stage,
            reason: "upstream stage output is missing".into(),
        })
    }

    // ── State plumbing ─────────────────────────────────────────────────

    async fn load_or_init_state(
        &self,
        job: &JobDescriptor,
        resume: bool,
    ) -> Result<RunState, RunnerError> {
        let report_id = job.config.report.report_id.as_str();
        let user_id = job.config.report.user_id.as_str();

        let existing = match self.store.get(report_id).await {
            Ok(existing) => existing,
            Err(StoreError::Corrupt(err)) => {
                if resume {
                    return Err(RunnerError::StateCorrupt {
                        report_id: report_id.to_string(),
                        reason: err.to_string(),
                    });
                }
                // Fresh runs quarantine corrupt records by recreating them.
                tracing::warn!(error = %err, "replacing corrupt state with a fresh record");
                None
            }
            Err(err) => return Err(err.into()),
        };

        match existing {
            Some(state) if resume => {
                if matches!(state.status, RunStatus::Completed | RunStatus::Pending) {
                    return Err(RunnerError::CannotResume {
                        report_id: report_id.to_string(),
                        status: state.status,
                    });
                }
                tracing::info!("resuming from persisted state");
                Ok(prepare_resume(state, job.config.options.cruxes))
            }
            _ => Ok(RunState::new(report_id, user_id)),
        }
    }

    async fn mirror_validation_counters(
        &self,
        report_id: &str,
        state: &mut RunState,
    ) -> Result<(), RunnerError> {
        for stage in StageName::ALL {
            let count = self
                .store
                .validation_failures(report_id, stage)
                .await?
                .min(MAX_VALIDATION_FAILURES);
            state.validation_failures.insert(stage, count);
        }
        Ok(())
    }

    /// Decode one completed stage's cached output into `data`.
    ///
    /// On validation failure the durable retry counter is bumped and the
    /// stage is reset for re-execution; once the budget is exhausted the run
    /// is declared corrupt instead.
    async fn restore_cached(
        &self,
        state: &mut RunState,
        report_id: &str,
        stage: StageName,
        data: &mut StageData,
    ) -> Result<CachedOutcome, RunnerError> {
        let Some(value) = state.completed_results.get(&stage).cloned() else {
            return Ok(CachedOutcome::Invalid);
        };

        let decode_err = match stage {
            StageName::Clustering => match serde_json::from_value::<Taxonomy>(value) {
                Ok(decoded) => {
                    data.taxonomy = Some(decoded);
                    return Ok(CachedOutcome::Valid);
                }
                Err(e) => e,
            },
            StageName::Extraction => match serde_json::from_value::<ClaimsTree>(value) {
                Ok(decoded) => {
                    data.claims = Some(decoded);
                    return Ok(CachedOutcome::Valid);
                }
                Err(e) => e,
            },
            StageName::SortAndDeduplicate => match serde_json::from_value::<SortedTree>(value) {
                Ok(decoded) => {
                    data.sorted = Some(decoded);
                    return Ok(CachedOutcome::Valid);
                }
                Err(e) => e,
            },
            StageName::Summaries => match serde_json::from_value::<Vec<TopicSummary>>(value) {
                Ok(decoded) => {
                    data.summaries = Some(decoded);
                    return Ok(CachedOutcome::Valid);
                }
                Err(e) => e,
            },
            StageName::Cruxes => match serde_json::from_value::<Vec<SubtopicCrux>>(value) {
                Ok(decoded) => {
                    data.cruxes = Some(decoded);
                    return Ok(CachedOutcome::Valid);
                }
                Err(e) => e,
            },
        };

        let current = self.store.validation_failures(report_id, stage).await?;
        if current >= MAX_VALIDATION_FAILURES {
            return Ok(CachedOutcome::Corrupt(format!(
                "cached output of {stage} failed validation {current} times (last: {decode_err})"
            )));
        }
        let bumped = self.store.bump_validation_failure(report_id, stage).await?;
        state.validation_failures.insert(stage, bumped);
        // Treat as not-completed so the loop re-executes the stage.
        *state.analytics_mut(stage) = StageAnalytics::default();
        state.completed_results.remove(&stage);
        Ok(CachedOutcome::Invalid)
    }

    async fn persist_guarded(
        &self,
        state: &mut RunState,
        lock_key: &str,
        owner: &str,
    ) -> Result<(), RunnerError> {
        match self
            .store
            .save_with_lock_guard(state, lock_key, owner)
            .await?
        {
            GuardedWrite::Persisted => Ok(()),
            GuardedWrite::LockLost => Err(RunnerError::LockLost {
                report_id: state.report_id.clone(),
            }),
        }
    }

    /// Mark the run failed, persist (lock-guarded), and yield the outward
    /// error. A guard rejection during the final write wins as `LockLost`.
    #[allow(clippy::too_many_arguments)]
    async fn fail_run(
        &self,
        mut state: RunState,
        stage: StageName,
        error_name: &str,
        message: &str,
        lock_key: &str,
        owner: &str,
        error: RunnerError,
    ) -> RunnerError {
        let report_id = state.report_id.clone();
        state.mark_stage_failed(stage, error_name, message);
        match self
            .store
            .save_with_lock_guard(&mut state, lock_key, owner)
            .await
        {
            Ok(GuardedWrite::Persisted) => error,
            Ok(GuardedWrite::LockLost) => RunnerError::LockLost { report_id },
            Err(persist_err) => {
                tracing::error!(error = %persist_err, "failed to persist terminal failure");
                error
            }
        }
    }

    async fn check_external_cancel(&self, report_id: &str) -> Result<(), RunnerError> {
        // We own this record; a read hiccup here must not kill the run.
        let stored = match self.store.get(report_id).await {
            Ok(stored) => stored,
            Err(_) => return Ok(()),
        };
        if let Some(state) = stored
            && state.status == RunStatus::Failed
            && let Some(error) = &state.error
            && error.name == CANCELLED_ERROR_NAME
        {
            tracing::info!("external cancellation observed at stage boundary");
            return Err(RunnerError::Cancelled {
                report_id: report_id.to_string(),
                reason: error.message.clone(),
            });
        }
        Ok(())
    }

    fn chat_client(&self, job: &JobDescriptor) -> Result<Arc<dyn ChatClient>, RunnerError> {
        if let Some(client) = &self.chat_override {
            return Ok(client.clone());
        }
        let client = OpenAiClient::new(job.config.env.openai_api_key.clone())
            .map_err(|source| RunnerError::Provider { source })?;
        Ok(Arc::new(client))
    }

    fn collect_outputs(
        &self,
        report_id: &str,
        data: StageData,
    ) -> Result<RunOutputs, RunnerError> {
        let missing = |what: &str| RunnerError::StateCorrupt {
            report_id: report_id.to_string(),
            reason: format!("finished run is missing its {what} output"),
        };
        Ok(RunOutputs {
            topic_tree: data.taxonomy.ok_or_else(|| missing("taxonomy"))?,
            claims_tree: data.claims.ok_or_else(|| missing("claims"))?,
            sorted_tree: data.sorted.ok_or_else(|| missing("sorted tree"))?,
            summaries: data.summaries.ok_or_else(|| missing("summaries"))?,
            cruxes: data.cruxes,
        })
    }

    fn emit_progress(&self, state: &RunState, stage: StageName, cruxes_enabled: bool) {
        let Some(sink) = &self.progress else { return };
        let counted: Vec<StageName> = StageName::ALL
            .into_iter()
            .filter(|s| cruxes_enabled || *s != StageName::Cruxes)
            .collect();
        let total_stages = counted.len();
        let completed_stages = counted
            .iter()
            .filter(|s| state.analytics(**s).status.is_settled())
            .count();
        let percent_complete = ((completed_stages * 100) / total_stages.max(1)) as u8;
        sink.on_progress(ProgressUpdate {
            current_stage: stage,
            total_stages,
            completed_stages,
            percent_complete,
        });
    }
}

/// Prepare a persisted record for resumption: clear the terminal error and
/// reset any failed or half-done stage so the loop re-executes it.
fn prepare_resume(mut state: RunState, cruxes_enabled: bool) -> RunState {
    state.error = None;
    state.status = RunStatus::Running;
    for stage in StageName::ALL {
        let status = state.analytics(stage).status;
        let reset = match status {
            StageStatus::Failed | StageStatus::InProgress => true,
            // A previously skipped crux stage re-runs when now enabled.
            StageStatus::Skipped => stage == StageName::Cruxes && cruxes_enabled,
            StageStatus::Pending | StageStatus::Completed => false,
        };
        if reset {
            *state.analytics_mut(stage) = StageAnalytics::default();
            state.completed_results.remove(&stage);
        }
    }
    state.recompute_totals();
    state
}

//! The durable per-run state record.
//!
//! [`RunState`] is the single JSON document persisted to the key-value store
//! after every stage transition. It is a public surface: downstream
//! publication reads `stageAnalytics`, `totalTokens`, and `totalCost`
//! bit-for-bit, so every shape here serializes with stable camelCase names
//! and deterministic (`BTreeMap`) key order.
//!
//! The record is mutated only by the lock-holding runner; stage executors
//! receive by-value snapshots and never touch the store.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::types::{RunStatus, StageName, StageStatus, TokenUsage};

/// Schema version of the persisted record.
pub const STATE_VERSION: &str = "1.0";

/// TTL for pending/running/completed state.
pub const STATE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Short TTL for failed state, so outages do not accumulate garbage.
pub const FAILED_STATE_TTL: Duration = Duration::from_secs(60 * 60);

/// Cached-output validation failures tolerated per stage before the run
/// terminates as corrupted.
pub const MAX_VALIDATION_FAILURES: u32 = 3;

// ── Analytics ledger ───────────────────────────────────────────────────

/// Per-stage entry in the analytics ledger.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageAnalytics {
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    /// Claims discarded during output validation (extraction only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dropped_claims: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_name: Option<String>,
}

/// Terminal error recorded on a failed run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    pub message: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageName>,
}

// ── Run state ──────────────────────────────────────────────────────────

/// The durable record for one pipeline run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub version: String,
    pub report_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<StageName>,
    pub stage_analytics: BTreeMap<StageName, StageAnalytics>,
    /// Opaque-but-typed stage outputs, keyed by stage. Present for a stage
    /// iff its analytics status is `completed`.
    pub completed_results: BTreeMap<StageName, Value>,
    pub validation_failures: BTreeMap<StageName, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub total_duration_ms: u64,
}

/// Stored state that cannot be parsed or violates its own invariants.
///
/// Distinguished from plain not-found so the runner can quarantine it.
#[derive(Debug, Error, Diagnostic)]
pub enum StateError {
    #[error("stored state for {report_id} is corrupt: {reason}")]
    #[diagnostic(
        code(tapestry::state::corrupt),
        help("The record will be re-created; persistent corruption suggests schema drift.")
    )]
    Corrupt { report_id: String, reason: String },
}

impl RunState {
    /// Fresh record: every stage pending, zero counters.
    #[must_use]
    pub fn new(report_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        let mut stage_analytics = BTreeMap::new();
        let mut validation_failures = BTreeMap::new();
        for stage in StageName::ALL {
            stage_analytics.insert(stage, StageAnalytics::default());
            validation_failures.insert(stage, 0);
        }
        Self {
            version: STATE_VERSION.to_string(),
            report_id: report_id.into(),
            user_id: user_id.into(),
            created_at: now,
            updated_at: now,
            status: RunStatus::Pending,
            current_stage: None,
            stage_analytics,
            completed_results: BTreeMap::new(),
            validation_failures,
            error: None,
            total_tokens: 0,
            total_cost: 0.0,
            total_duration_ms: 0,
        }
    }

    /// Ledger entry for `stage`, creating a pending one if absent.
    pub fn analytics_mut(&mut self, stage: StageName) -> &mut StageAnalytics {
        self.stage_analytics.entry(stage).or_default()
    }

    /// Ledger entry for `stage` (pending default if never touched).
    #[must_use]
    pub fn analytics(&self, stage: StageName) -> StageAnalytics {
        self.stage_analytics.get(&stage).cloned().unwrap_or_default()
    }

    /// Transition `stage` to in-progress and stamp the start time.
    pub fn mark_stage_in_progress(&mut self, stage: StageName) {
        self.status = RunStatus::Running;
        self.current_stage = Some(stage);
        let entry = self.analytics_mut(stage);
        entry.status = StageStatus::InProgress;
        entry.started_at = Some(Utc::now());
        entry.completed_at = None;
        entry.dropped_claims = None;
        entry.error_message = None;
        entry.error_name = None;
        self.touch();
    }

    /// Record a successful stage: analytics, output, cleared failure counter.
    pub fn mark_stage_completed(
        &mut self,
        stage: StageName,
        usage: TokenUsage,
        cost: f64,
        duration: Duration,
        result: Value,
    ) {
        let completed_at = Utc::now();
        let entry = self.analytics_mut(stage);
        entry.status = StageStatus::Completed;
        entry.completed_at = Some(completed_at);
        entry.duration_ms = Some(duration.as_millis() as u64);
        entry.input_tokens = Some(usage.input_tokens);
        entry.output_tokens = Some(usage.output_tokens);
        entry.total_tokens = Some(usage.total_tokens);
        entry.cost = Some(cost);
        entry.error_message = None;
        entry.error_name = None;
        self.completed_results.insert(stage, result);
        self.validation_failures.insert(stage, 0);
        self.recompute_totals();
        self.touch();
    }

    /// Record a skipped stage (cruxes when disabled).
    pub fn mark_stage_skipped(&mut self, stage: StageName) {
        self.analytics_mut(stage).status = StageStatus::Skipped;
        self.completed_results.remove(&stage);
        self.touch();
    }

    /// Record a failed stage and transition the run to failed.
    pub fn mark_stage_failed(&mut self, stage: StageName, name: &str, message: &str) {
        let failed_at = Utc::now();
        let entry = self.analytics_mut(stage);
        entry.status = StageStatus::Failed;
        entry.completed_at = Some(failed_at);
        if let Some(started) = entry.started_at {
            entry.duration_ms =
                Some((failed_at - started).num_milliseconds().max(0) as u64);
        }
        entry.error_message = Some(message.to_string());
        entry.error_name = Some(name.to_string());
        // A failed stage must not advertise a cached result.
        self.completed_results.remove(&stage);
        self.status = RunStatus::Failed;
        self.error = Some(RunError {
            message: message.to_string(),
            name: name.to_string(),
            stage: Some(stage),
        });
        self.recompute_totals();
        self.touch();
    }

    /// Transition to completed once every stage is settled.
    ///
    /// A no-op (leaving the run in its current status) when some stage is
    /// still outstanding; the state invariant requires all-settled.
    pub fn finalize_completed(&mut self) {
        let all_settled = StageName::ALL
            .iter()
            .all(|stage| self.analytics(*stage).status.is_settled());
        if all_settled && self.error.is_none() {
            self.status = RunStatus::Completed;
            self.current_stage = None;
            self.touch();
        }
    }

    /// Recompute run totals from completed stages only.
    pub fn recompute_totals(&mut self) {
        let mut tokens = 0u64;
        let mut cost = 0.0f64;
        let mut duration = 0u64;
        for analytics in self.stage_analytics.values() {
            if analytics.status == StageStatus::Completed {
                tokens += analytics.total_tokens.unwrap_or(0);
                cost += analytics.cost.unwrap_or(0.0);
                duration += analytics.duration_ms.unwrap_or(0);
            }
        }
        self.total_tokens = tokens;
        self.total_cost = cost;
        self.total_duration_ms = duration;
    }

    /// Refresh the update timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// TTL to persist this record with.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        if self.status == RunStatus::Failed {
            FAILED_STATE_TTL
        } else {
            STATE_TTL
        }
    }

    /// Check the record's own invariants. Run on every load so that drifted
    /// or partially written payloads are quarantined instead of trusted.
    ///
    /// # Errors
    ///
    /// [`StateError::Corrupt`] naming the violated invariant.
    pub fn check_invariants(&self) -> Result<(), StateError> {
        let corrupt = |reason: String| StateError::Corrupt {
            report_id: self.report_id.clone(),
            reason,
        };

        if self.version != STATE_VERSION {
            return Err(corrupt(format!(
                "unsupported schema version {:?}",
                self.version
            )));
        }
        if self.report_id.is_empty() || self.user_id.is_empty() {
            return Err(corrupt("empty reportId or userId".into()));
        }

        for (stage, count) in &self.validation_failures {
            if *count > MAX_VALIDATION_FAILURES {
                return Err(corrupt(format!(
                    "validationFailures[{stage}] = {count} exceeds {MAX_VALIDATION_FAILURES}"
                )));
            }
        }

        for (stage, analytics) in &self.stage_analytics {
            let has_result = self.completed_results.contains_key(stage);
            let completed = analytics.status == StageStatus::Completed;
            if completed != has_result {
                return Err(corrupt(format!(
                    "completedResults[{stage}] presence ({has_result}) disagrees with status {:?}",
                    analytics.status
                )));
            }
        }

        match self.status {
            RunStatus::Completed => {
                if self.error.is_some() {
                    return Err(corrupt("completed run carries an error".into()));
                }
                for stage in StageName::ALL {
                    if !self.analytics(stage).status.is_settled() {
                        return Err(corrupt(format!(
                            "completed run has unsettled stage {stage}"
                        )));
                    }
                }
            }
            RunStatus::Failed => {
                if self.error.is_none() {
                    return Err(corrupt("failed run carries no error".into()));
                }
                let any_failed = self
                    .stage_analytics
                    .values()
                    .any(|a| a.status == StageStatus::Failed);
                if !any_failed {
                    return Err(corrupt("failed run has no failed stage".into()));
                }
            }
            RunStatus::Pending | RunStatus::Running => {}
        }
        Ok(())
    }
}

//! State Store: durable CRUD for [`RunState`] records.
//!
//! Thin, typed layer over [`KvStore`]. Reads parse and invariant-check the
//! stored JSON, so a malformed payload surfaces as [`StoreError::Corrupt`] —
//! distinct from plain not-found. The one non-obvious operation is
//! [`save_with_lock_guard`](StateStore::save_with_lock_guard): an atomic
//! compare-and-set that writes state only while the run's lock key still
//! holds the caller's owner token. Verifying the lock and then writing in two
//! steps would leave a window where the lock expires between the check and
//! the write; the guard closes it.

use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;

use crate::kv::{KvError, KvStore};
use crate::state::{FAILED_STATE_TTL, RunState, StateError};
use crate::types::StageName;

/// Key prefix for run state records.
pub const STATE_KEY_PREFIX: &str = "pipeline_state:";
/// Key prefix for per-stage validation-failure counters.
pub const VALIDATION_KEY_PREFIX: &str = "pipeline_validation_failure:";

/// Result of a lock-guarded state write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuardedWrite {
    /// The lock token matched; the state was written.
    Persisted,
    /// The lock no longer holds the caller's token; nothing was written.
    LockLost,
}

/// Errors from state-store operations.
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Kv(#[from] KvError),

    /// Stored payload failed to parse or violated its invariants.
    #[error(transparent)]
    #[diagnostic(transparent)]
    Corrupt(#[from] StateError),

    #[error("state for {report_id} could not be serialized: {source}")]
    #[diagnostic(code(tapestry::store::encode))]
    Encode {
        report_id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Durable state CRUD, keyed by report id.
#[derive(Clone)]
pub struct StateStore {
    kv: Arc<dyn KvStore>,
}

/// Key for the state record of `report_id`.
#[must_use]
pub fn state_key(report_id: &str) -> String {
    format!("{STATE_KEY_PREFIX}{report_id}")
}

/// Key for the validation-failure counter of one stage.
#[must_use]
pub fn validation_key(report_id: &str, stage: StageName) -> String {
    format!("{VALIDATION_KEY_PREFIX}{report_id}:{stage}")
}

impl StateStore {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Load and validate the state for `report_id`.
    ///
    /// # Errors
    ///
    /// - `Ok(None)` when no record exists (not an error).
    /// - [`StoreError::Corrupt`] when a record exists but cannot be parsed
    ///   or fails its invariants.
    pub async fn get(&self, report_id: &str) -> Result<Option<RunState>, StoreError> {
        let Some(raw) = self.kv.get(&state_key(report_id)).await? else {
            return Ok(None);
        };
        let state: RunState =
            serde_json::from_str(&raw).map_err(|e| StateError::Corrupt {
                report_id: report_id.to_string(),
                reason: format!("unparseable payload: {e}"),
            })?;
        state.check_invariants()?;
        Ok(Some(state))
    }

    /// Persist `state` with a refreshed timestamp. TTL follows the record's
    /// status: 24 h normally, 1 h once failed.
    pub async fn save(&self, state: &mut RunState) -> Result<(), StoreError> {
        state.touch();
        let payload = self.encode(state)?;
        self.kv
            .set(&state_key(&state.report_id), &payload, Some(state.ttl()))
            .await?;
        Ok(())
    }

    /// Idempotent removal of the record (used after publication).
    pub async fn delete(&self, report_id: &str) -> Result<(), StoreError> {
        self.kv.delete(&state_key(report_id)).await?;
        Ok(())
    }

    /// Read-modify-write. Returns `None` when no record exists.
    ///
    /// Not atomic by itself; callers must already hold the run lock.
    pub async fn update<F>(
        &self,
        report_id: &str,
        mutate: F,
    ) -> Result<Option<RunState>, StoreError>
    where
        F: FnOnce(&mut RunState),
    {
        let Some(mut state) = self.get(report_id).await? else {
            return Ok(None);
        };
        mutate(&mut state);
        self.save(&mut state).await?;
        Ok(Some(state))
    }

    /// Atomic compare-and-set: write `state` only if `lock_key` still holds
    /// `lock_value`. On [`GuardedWrite::LockLost`] no bytes were written.
    pub async fn save_with_lock_guard(
        &self,
        state: &mut RunState,
        lock_key: &str,
        lock_value: &str,
    ) -> Result<GuardedWrite, StoreError> {
        state.touch();
        let payload = self.encode(state)?;
        let wrote = self
            .kv
            .set_if_guard_matches(
                &state_key(&state.report_id),
                &payload,
                state.ttl(),
                lock_key,
                lock_value,
            )
            .await?;
        Ok(if wrote {
            GuardedWrite::Persisted
        } else {
            GuardedWrite::LockLost
        })
    }

    /// Increment the durable validation-failure counter for one stage.
    ///
    /// The counter outlives lost state writes (a crashed worker's successor
    /// still sees it), which is what bounds corrupted-state retries.
    pub async fn bump_validation_failure(
        &self,
        report_id: &str,
        stage: StageName,
    ) -> Result<u32, StoreError> {
        let value = self
            .kv
            .incr_with_ttl(&validation_key(report_id, stage), FAILED_STATE_TTL)
            .await?;
        Ok(value.max(0) as u32)
    }

    /// Delete one stage's validation-failure counter (counter is absent when
    /// zero, per the key layout).
    pub async fn clear_validation_failure(
        &self,
        report_id: &str,
        stage: StageName,
    ) -> Result<(), StoreError> {
        self.kv.delete(&validation_key(report_id, stage)).await?;
        Ok(())
    }

    /// Current durable counter value for one stage (0 when absent).
    pub async fn validation_failures(
        &self,
        report_id: &str,
        stage: StageName,
    ) -> Result<u32, StoreError> {
        let value = self
            .kv
            .get(&validation_key(report_id, stage))
            .await?
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        Ok(value)
    }

    fn encode(&self, state: &RunState) -> Result<String, StoreError> {
        serde_json::to_string(state).map_err(|source| StoreError::Encode {
            report_id: state.report_id.clone(),
            source,
        })
    }
}

//! Per-document processing state machine with an append-only audit trail.
//!
//! Every call re-reads the state file. Transitions that do not match the
//! static table are rejected and leave the file untouched; they are reported
//! as [`AppendOutcome::Rejected`], never as errors.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use stepledger_format::{FormatAdapter, KeyCase};
use stepledger_shared::{
    ProcessingState, ProcessingStatus, ProgressFileStructure, Result, StateEntry,
    StateTransition, StepLedgerError, TransitionCondition, TransitionReason, TriggerSource,
};
use stepledger_storage::json_file;
use tracing::{debug, info, instrument, warn};

/// Keys whose values are document data, never re-cased.
const OPAQUE_KEYS: [&str; 2] = ["data", "meta"];

// ---------------------------------------------------------------------------
// Requests and verdicts
// ---------------------------------------------------------------------------

/// Whether a transition is allowed, and why not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionVerdict {
    pub valid: bool,
    pub reason: String,
}

impl TransitionVerdict {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            valid: true,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: reason.into(),
        }
    }
}

/// A requested move to `target`, with the entry to record if it is allowed.
#[derive(Debug, Clone)]
pub struct TransitionRequest {
    pub target: ProcessingState,
    /// Status of the new entry.
    pub status: ProcessingStatus,
    pub data: Map<String, Value>,
    pub meta: Map<String, Value>,
    pub errors: Vec<String>,
    pub reason: TransitionReason,
    pub triggered_by: TriggerSource,
    /// Branch tag; derived from the current entry's data when `None`.
    pub condition: Option<TransitionCondition>,
}

impl TransitionRequest {
    pub fn new(target: ProcessingState) -> Self {
        Self {
            target,
            status: ProcessingStatus::Success,
            data: Map::new(),
            meta: Map::new(),
            errors: Vec::new(),
            reason: TransitionReason::AutomaticProgression,
            triggered_by: TriggerSource::System,
            condition: None,
        }
    }

    pub fn status(mut self, status: ProcessingStatus) -> Self {
        self.status = status;
        self
    }

    pub fn data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    pub fn reason(mut self, reason: TransitionReason) -> Self {
        self.reason = reason;
        self
    }

    pub fn triggered_by(mut self, source: TriggerSource) -> Self {
        self.triggered_by = source;
        self
    }

    pub fn condition(mut self, condition: TransitionCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.errors.push(message.into());
        self
    }
}

/// Result of [`ProcessingStateMachine::append_transition`].
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Applied(StateEntry),
    Rejected(TransitionVerdict),
}

impl AppendOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Handle to one document's state file.
#[derive(Debug, Clone)]
pub struct ProcessingStateMachine {
    path: PathBuf,
    adapter: FormatAdapter,
}

impl ProcessingStateMachine {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            adapter: FormatAdapter::new(KeyCase::Snake).with_opaque(OPAQUE_KEYS),
        }
    }

    pub fn with_key_case(mut self, case: KeyCase) -> Self {
        self.adapter = FormatAdapter::new(case).with_opaque(OPAQUE_KEYS);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create `{current_state: NOT_STARTED, states: []}` if the file is absent.
    pub async fn initialize(&self) -> Result<ProgressFileStructure> {
        let exists = tokio::fs::try_exists(&self.path)
            .await
            .map_err(|e| StepLedgerError::io(&self.path, e))?;
        if exists {
            return self.load().await;
        }
        let fresh = ProgressFileStructure::new();
        json_file::write_json(&self.path, &fresh, &self.adapter).await?;
        info!(path = %self.path.display(), "initialized state file");
        Ok(fresh)
    }

    pub async fn load(&self) -> Result<ProgressFileStructure> {
        json_file::read_json(&self.path, &self.adapter).await
    }

    // -----------------------------------------------------------------------
    // Validation (pure)
    // -----------------------------------------------------------------------

    /// Check a forward move against the transition table. Never fails.
    pub fn validate_transition(
        current: ProcessingState,
        target: ProcessingState,
        status: Option<ProcessingStatus>,
        condition: Option<TransitionCondition>,
    ) -> TransitionVerdict {
        let Some(edge) = StateTransition::find(current, target) else {
            return TransitionVerdict::deny(format!(
                "no transition defined from {current} to {target}"
            ));
        };

        if let Some(required) = edge.required_status {
            if status != Some(required) {
                return TransitionVerdict::deny(format!(
                    "{current} -> {target} requires status {required}, current status is {}",
                    status.map_or("unknown", |s| s.as_str())
                ));
            }
        }

        if let Some(required) = edge.condition {
            if condition != Some(required) {
                return TransitionVerdict::deny(format!(
                    "{current} -> {target} requires condition {required}, got {}",
                    condition.map_or("none", |c| c.as_str())
                ));
            }
        }

        TransitionVerdict::allow(format!("{current} -> {target} is allowed"))
    }

    /// A rollback target must come strictly earlier in the stage order.
    pub fn validate_rollback(current: ProcessingState, target: ProcessingState) -> TransitionVerdict {
        if target.position() < current.position() {
            TransitionVerdict::allow(format!("rollback from {current} to {target} is allowed"))
        } else {
            TransitionVerdict::deny(format!(
                "cannot roll back from {current} to {target}: target is not an earlier state"
            ))
        }
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Validate `request` against the current state and, if allowed, append it.
    #[instrument(skip_all, fields(path = %self.path.display(), to = %request.target))]
    pub async fn append_transition(&self, request: TransitionRequest) -> Result<AppendOutcome> {
        let mut file = self.load().await?;
        let current = file.current_state;
        let current_entry = latest_entry(&file, current);

        let verdict = if request.reason == TransitionReason::ManualRollback {
            Self::validate_rollback(current, request.target)
        } else {
            let status = current_entry.map(|e| e.status);
            let condition = request.condition.or_else(|| {
                current_entry.and_then(|e| TransitionCondition::from_state_data(&e.data))
            });
            Self::validate_transition(current, request.target, status, condition)
        };

        if !verdict.valid {
            warn!(from = %current, to = %request.target, reason = %verdict.reason, "transition rejected");
            return Ok(AppendOutcome::Rejected(verdict));
        }

        let now = Utc::now();
        let entry = StateEntry {
            status: request.status,
            timestamp: now,
            data: request.data,
            state: request.target,
            meta: request.meta,
            errors: request.errors,
            transition_reason: Some(request.reason),
            triggered_by: Some(request.triggered_by),
            previous_state: Some(current),
        };

        file.states.push(entry.clone());
        file.current_state = request.target;
        file.updated_at = now;
        json_file::write_json(&self.path, &file, &self.adapter).await?;

        info!(from = %current, to = %entry.state, status = %entry.status, "state transition recorded");
        Ok(AppendOutcome::Applied(entry))
    }

    /// Append a rollback entry for `target`, restoring the data of its latest
    /// earlier entry.
    pub async fn rollback_to(
        &self,
        target: ProcessingState,
        triggered_by: TriggerSource,
        note: Option<String>,
    ) -> Result<AppendOutcome> {
        let file = self.load().await?;
        let data = latest_entry(&file, target)
            .map(|e| e.data.clone())
            .unwrap_or_default();

        let mut meta = Map::new();
        meta.insert("rollback_target".into(), Value::String(target.to_string()));
        meta.insert(
            "rolled_back_from".into(),
            Value::String(file.current_state.to_string()),
        );
        if let Some(note) = note {
            meta.insert("note".into(), Value::String(note));
        }

        let mut request = TransitionRequest::new(target)
            .data(data)
            .reason(TransitionReason::ManualRollback)
            .triggered_by(triggered_by);
        request.meta = meta;
        self.append_transition(request).await
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Most recent entry for the current state.
    pub async fn current_state_entry(&self) -> Result<Option<StateEntry>> {
        let file = self.load().await?;
        Ok(latest_entry(&file, file.current_state).cloned())
    }

    /// First entry ever recorded for `state`.
    pub async fn state_data(&self, state: ProcessingState) -> Result<Option<StateEntry>> {
        let file = self.load().await?;
        Ok(file.states.into_iter().find(|e| e.state == state))
    }

    /// Most recent entry recorded for `state`.
    pub async fn latest_state_data(&self, state: ProcessingState) -> Result<Option<StateEntry>> {
        let file = self.load().await?;
        Ok(latest_entry(&file, state).cloned())
    }

    pub async fn has_state(&self, state: ProcessingState) -> Result<bool> {
        Ok(self.load().await?.states.iter().any(|e| e.state == state))
    }

    pub async fn history(&self) -> Result<Vec<StateEntry>> {
        Ok(self.load().await?.states)
    }

    /// Audit-trail and pointer problems; empty when the file is consistent.
    pub async fn check_integrity(&self) -> Result<Vec<String>> {
        let problems = self.load().await?.integrity_problems();
        debug!(path = %self.path.display(), problems = problems.len(), "checked integrity");
        Ok(problems)
    }
}

fn latest_entry(file: &ProgressFileStructure, state: ProcessingState) -> Option<&StateEntry> {
    file.states.iter().rev().find(|e| e.state == state)
}

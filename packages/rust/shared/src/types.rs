//! Core ledger types: iterations, step records, and step logs.
//!
//! These are the in-memory (snake_case) shapes. Key casing on disk is applied
//! by the storage layer, not here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 identifying one invocation of the runner (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// StepStatus
// ---------------------------------------------------------------------------

/// Outcome of a single step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Success,
    Failure,
    Partial,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Partial => "PARTIAL",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUCCESS" => Ok(Self::Success),
            "FAILURE" => Ok(Self::Failure),
            "PARTIAL" => Ok(Self::Partial),
            other => Err(format!(
                "invalid step status '{other}': expected SUCCESS, FAILURE or PARTIAL"
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// StepRecord / Iteration
// ---------------------------------------------------------------------------

/// One step's entry inside an [`Iteration`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Zero-based position in the pipeline.
    pub step: usize,
    /// Log file path, relative to the project root.
    pub log_file: String,
    pub status: StepStatus,
    /// Step key. Older writers omitted it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// One run-attempt across the full step list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iteration {
    /// 1-based, strictly increasing within a progress file.
    pub iteration: u32,
    #[serde(alias = "timestamp")]
    pub time_stamp: DateTime<Utc>,
    #[serde(default)]
    pub steps: Vec<StepRecord>,
}

impl Iteration {
    pub fn new(iteration: u32) -> Self {
        Self {
            iteration,
            time_stamp: Utc::now(),
            steps: Vec::new(),
        }
    }

    pub fn record(&self, index: usize) -> Option<&StepRecord> {
        self.steps.iter().find(|r| r.step == index)
    }

    /// Replace the record at `record.step`, or append it.
    pub fn upsert_record(&mut self, record: StepRecord) {
        match self.steps.iter_mut().find(|r| r.step == record.step) {
            Some(existing) => *existing = record,
            None => {
                self.steps.push(record);
                self.steps.sort_by_key(|r| r.step);
            }
        }
    }

    pub fn all_successful(&self) -> bool {
        self.steps.iter().all(|r| r.status.is_success())
    }

    /// Every one of `step_count` steps is recorded and SUCCESS.
    pub fn is_complete(&self, step_count: usize) -> bool {
        self.steps.len() == step_count && self.all_successful()
    }

    /// Stopped short with no failure recorded (the process was killed mid-run).
    pub fn is_interrupted(&self, step_count: usize) -> bool {
        self.steps.len() < step_count && self.all_successful()
    }
}

// ---------------------------------------------------------------------------
// StepLog
// ---------------------------------------------------------------------------

/// Content of `<iteration>.<key>.log.json`. Always the latest attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLog {
    pub message: String,
    /// Output fields the step produced (possibly partial).
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Error detail; `{}` for PARTIAL, absent for SUCCESS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(default)]
    pub key: String,
    #[serde(alias = "timestamp")]
    pub time_stamp: DateTime<Utc>,
}

impl StepLog {
    pub fn success(key: &str, message: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            message: message.into(),
            data,
            error: None,
            key: key.to_string(),
            time_stamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_serializes_uppercase() {
        assert_eq!(serde_json::to_value(StepStatus::Partial).unwrap(), json!("PARTIAL"));
        let s: StepStatus = serde_json::from_value(json!("FAILURE")).unwrap();
        assert_eq!(s, StepStatus::Failure);
        assert!("success".parse::<StepStatus>().is_err());
    }

    #[test]
    fn iteration_accepts_timestamp_alias_and_missing_key() {
        let raw = json!({
            "iteration": 2,
            "timestamp": "2025-03-01T10:00:00Z",
            "steps": [{ "step": 0, "log_file": "p/2.a.log.json", "status": "SUCCESS" }]
        });
        let it: Iteration = serde_json::from_value(raw).unwrap();
        assert_eq!(it.iteration, 2);
        assert_eq!(it.steps[0].key, None);
    }

    #[test]
    fn upsert_replaces_by_index() {
        let mut it = Iteration::new(1);
        let rec = |step, status| StepRecord {
            step,
            log_file: format!("{step}.log"),
            status,
            key: None,
        };
        it.upsert_record(rec(0, StepStatus::Success));
        it.upsert_record(rec(1, StepStatus::Failure));
        assert!(!it.all_successful());
        it.upsert_record(rec(1, StepStatus::Success));
        assert_eq!(it.steps.len(), 2);
        assert!(it.is_complete(2));
        assert!(it.is_interrupted(3));
        assert!(!it.is_interrupted(2));
    }
}

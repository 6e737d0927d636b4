//! Document processing states, the static transition table, and the
//! append-only state file structure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Processing stage of one document. Declaration order is the fixed stage order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingState {
    NotStarted,
    Initialized,
    LocalExtraction,
    LlmExtraction,
    ManualReview,
    PrepareData,
    Chunking,
}

impl ProcessingState {
    pub const ORDER: [ProcessingState; 7] = [
        Self::NotStarted,
        Self::Initialized,
        Self::LocalExtraction,
        Self::LlmExtraction,
        Self::ManualReview,
        Self::PrepareData,
        Self::Chunking,
    ];

    /// Position in [`Self::ORDER`].
    pub fn position(&self) -> usize {
        *self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Initialized => "INITIALIZED",
            Self::LocalExtraction => "LOCAL_EXTRACTION",
            Self::LlmExtraction => "LLM_EXTRACTION",
            Self::ManualReview => "MANUAL_REVIEW",
            Self::PrepareData => "PREPARE_DATA",
            Self::Chunking => "CHUNKING",
        }
    }
}

impl std::fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessingState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase().replace('-', "_");
        Self::ORDER
            .into_iter()
            .find(|state| state.as_str() == wanted)
            .ok_or_else(|| format!("unknown processing state '{s}'"))
    }
}

/// Outcome recorded on a state entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    Success,
    #[serde(alias = "FAILURE")]
    Failed,
    Partial,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Partial => "PARTIAL",
        }
    }
}

impl std::fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SUCCESS" => Ok(Self::Success),
            "FAILED" | "FAILURE" => Ok(Self::Failed),
            "PARTIAL" => Ok(Self::Partial),
            other => Err(format!("unknown processing status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    AutomaticProgression,
    ManualRollback,
    ErrorRecovery,
    ManualAdvancement,
    SystemRetry,
}

impl std::str::FromStr for TransitionReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.trim().to_ascii_lowercase()))
            .map_err(|_| format!("unknown transition reason '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    System,
    User,
    AutomatedProcess,
    ErrorHandler,
}

impl std::str::FromStr for TriggerSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(Value::String(s.trim().to_ascii_lowercase()))
            .map_err(|_| format!("unknown trigger source '{s}'"))
    }
}

/// Branch tag checked by conditional edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionCondition {
    HasTables,
    NoTables,
}

impl TransitionCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HasTables => "has_tables",
            Self::NoTables => "no_tables",
        }
    }

    /// Derive the tag from an entry's `data`: a `has_tables` boolean, or any
    /// page under `pages` flagged `has_tables`.
    pub fn from_state_data(data: &Map<String, Value>) -> Option<Self> {
        let has_tables = match data.get("has_tables").and_then(Value::as_bool) {
            Some(flag) => flag,
            None => {
                let pages = data.get("pages")?;
                let flagged = |page: &Value| page.get("has_tables").and_then(Value::as_bool) == Some(true);
                match pages {
                    Value::Object(map) => map.values().any(flagged),
                    Value::Array(list) => list.iter().any(flagged),
                    _ => return None,
                }
            }
        };
        Some(if has_tables { Self::HasTables } else { Self::NoTables })
    }
}

impl std::fmt::Display for TransitionCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransitionCondition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "has_tables" => Ok(Self::HasTables),
            "no_tables" => Ok(Self::NoTables),
            other => Err(format!("unknown transition condition '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Transition table
// ---------------------------------------------------------------------------

/// One allowed edge of the processing graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ProcessingState,
    pub to: ProcessingState,
    pub required_status: Option<ProcessingStatus>,
    pub condition: Option<TransitionCondition>,
}

const fn edge(
    from: ProcessingState,
    to: ProcessingState,
    required_status: Option<ProcessingStatus>,
    condition: Option<TransitionCondition>,
) -> StateTransition {
    StateTransition {
        from,
        to,
        required_status,
        condition,
    }
}

use ProcessingState as S;
const OK: Option<ProcessingStatus> = Some(ProcessingStatus::Success);

pub const VALID_TRANSITIONS: [StateTransition; 8] = [
    edge(S::NotStarted, S::Initialized, None, None),
    edge(S::Initialized, S::LocalExtraction, None, None),
    edge(S::LocalExtraction, S::LlmExtraction, OK, Some(TransitionCondition::HasTables)),
    edge(S::LocalExtraction, S::ManualReview, OK, Some(TransitionCondition::NoTables)),
    edge(S::LlmExtraction, S::LlmExtraction, None, None),
    edge(S::LlmExtraction, S::ManualReview, OK, None),
    edge(S::ManualReview, S::PrepareData, OK, None),
    edge(S::PrepareData, S::Chunking, OK, None),
];

impl StateTransition {
    /// The table edge from `from` to `to`, if any.
    pub fn find(from: ProcessingState, to: ProcessingState) -> Option<&'static StateTransition> {
        VALID_TRANSITIONS.iter().find(|t| t.from == from && t.to == to)
    }
}

// ---------------------------------------------------------------------------
// State file
// ---------------------------------------------------------------------------

/// One append-only audit-trail row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    pub status: ProcessingStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub state: ProcessingState,
    #[serde(default)]
    pub meta: Map<String, Value>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_reason: Option<TransitionReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<TriggerSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<ProcessingState>,
}

impl StateEntry {
    pub fn rollback_target(&self) -> Option<&str> {
        self.meta.get("rollback_target").and_then(Value::as_str)
    }
}

/// The whole state file of one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressFileStructure {
    pub current_state: ProcessingState,
    #[serde(default)]
    pub states: Vec<StateEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressFileStructure {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            current_state: ProcessingState::NotStarted,
            states: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Audit-trail and pointer problems, empty when consistent.
    pub fn integrity_problems(&self) -> Vec<String> {
        let mut problems = Vec::new();

        for (i, pair) in self.states.windows(2).enumerate() {
            let (prev, entry) = (&pair[0], &pair[1]);
            if entry.previous_state != Some(prev.state) {
                problems.push(format!(
                    "entry {}: previous_state is {}, expected {}",
                    i + 1,
                    entry
                        .previous_state
                        .map_or_else(|| "missing".to_string(), |s| s.to_string()),
                    prev.state
                ));
            }
        }

        if self.states.is_empty() {
            if self.current_state != ProcessingState::NotStarted {
                problems.push(format!(
                    "current_state is {} but the history is empty",
                    self.current_state
                ));
            }
            return problems;
        }

        if let Some(last) = self.states.last() {
            if last.state != self.current_state {
                problems.push(format!(
                    "current_state is {} but the latest entry is {}",
                    self.current_state, last.state
                ));
            }
        }

        let rolled_back = self.states.iter().any(|e| e.rollback_target().is_some());
        if !rolled_back {
            let current = self.current_state.position();
            for entry in &self.states {
                if entry.state.position() > current {
                    problems.push(format!(
                        "future state {} recorded while current state is {}",
                        entry.state, self.current_state
                    ));
                }
            }
        }

        problems
    }
}

impl Default for ProgressFileStructure {
    fn default() -> Self {
        Self::new()
    }
}

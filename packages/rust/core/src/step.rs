//! Pipeline steps and the contract they follow.
//!
//! A step is an async function from the accumulated context to a JSON object
//! carrying a `status` plus output fields. [`StepOutcome`] builds such objects;
//! steps may also return raw [`Value`]s, which are checked at the boundary.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use stepledger_shared::{RunId, StepStatus};

/// Error type step functions may return. Any error counts as FAILURE.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed future returned by a step function.
pub type StepFuture = Pin<Box<dyn Future<Output = Result<Value, BoxError>> + Send>>;

type StepFn = Arc<dyn Fn(StepContext) -> StepFuture + Send + Sync>;

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// A named, keyed unit of pipeline work.
pub struct Step {
    name: String,
    key: String,
    func: StepFn,
    reads: Vec<String>,
    produces: Vec<String>,
    /// Status of the latest attempt in this process.
    pub status: Option<StepStatus>,
    /// Output fields of the latest attempt (or the replayed cache).
    pub output: Option<Map<String, Value>>,
    /// Cause of the latest non-SUCCESS attempt.
    pub error: Option<String>,
}

impl Step {
    pub fn new<F, Fut>(name: impl Into<String>, key: impl Into<String>, func: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            key: key.into(),
            func: Arc::new(move |ctx: StepContext| -> StepFuture { Box::pin(func(ctx)) }),
            reads: Vec::new(),
            produces: Vec::new(),
            status: None,
            output: None,
            error: None,
        }
    }

    /// Context keys that must be present before this step runs.
    pub fn reads<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reads = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Output keys this step may set even when another step already set them.
    pub fn produces<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.produces = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn declared_reads(&self) -> &[String] {
        &self.reads
    }

    pub fn declared_produces(&self) -> &[String] {
        &self.produces
    }

    pub(crate) fn invoke(&self, ctx: StepContext) -> StepFuture {
        (self.func)(ctx)
    }

    pub(crate) fn reset(&mut self) {
        self.status = None;
        self.output = None;
        self.error = None;
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("reads", &self.reads)
            .field("produces", &self.produces)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// StepContext
// ---------------------------------------------------------------------------

/// Snapshot of the run handed to a step function.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: RunId,
    pub iteration: u32,
    pub index: usize,
    pub name: String,
    pub key: String,
    /// Initial context plus every earlier step's outputs.
    pub values: Map<String, Value>,
}

impl StepContext {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn require(&self, key: &str) -> Result<&Value, BoxError> {
        self.values
            .get(key)
            .ok_or_else(|| format!("context key '{key}' is missing").into())
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, BoxError> {
        let value = self.require(key)?;
        serde_json::from_value(value.clone())
            .map_err(|e| format!("context key '{key}' has the wrong shape: {e}").into())
    }
}

// ---------------------------------------------------------------------------
// StepOutcome
// ---------------------------------------------------------------------------

/// What a step function reports back.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub outputs: Map<String, Value>,
}

impl StepOutcome {
    pub fn new(status: StepStatus) -> Self {
        Self {
            status,
            outputs: Map::new(),
        }
    }

    pub fn success() -> Self {
        Self::new(StepStatus::Success)
    }

    pub fn partial() -> Self {
        Self::new(StepStatus::Partial)
    }

    pub fn failure() -> Self {
        Self::new(StepStatus::Failure)
    }

    /// Add an output field.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }

    /// Wrap as the `Ok` value a step function returns.
    pub fn into_result(self) -> Result<Value, BoxError> {
        Ok(self.into())
    }

    /// Check a raw step return value. It must be an object with a valid
    /// `status`; every other field is an output.
    pub fn try_from_value(value: Value) -> Result<Self, String> {
        let Value::Object(mut map) = value else {
            return Err(format!(
                "step returned {}, expected a JSON object",
                json_kind(&value)
            ));
        };
        let status = match map.remove("status") {
            Some(Value::String(s)) => s.parse::<StepStatus>()?,
            Some(other) => {
                return Err(format!("status must be a string, got {}", json_kind(&other)));
            }
            None => return Err("step result has no status".into()),
        };
        Ok(Self {
            status,
            outputs: map,
        })
    }
}

impl From<StepOutcome> for Value {
    fn from(outcome: StepOutcome) -> Self {
        let mut map = Map::with_capacity(outcome.outputs.len() + 1);
        map.insert("status".into(), Value::String(outcome.status.to_string()));
        map.extend(outcome.outputs);
        Value::Object(map)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

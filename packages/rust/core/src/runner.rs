//! Sequential, crash-resumable step runner.
//!
//! Every step's record is durably written before the next step starts, so a
//! re-invocation after a crash or a failure picks up where the ledger says the
//! last run stopped.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde_json::{Map, Value, json};
use stepledger_format::KeyCase;
use stepledger_shared::{
    AppConfig, Iteration, Result, RunId, StepLedgerError, StepLog, StepRecord, StepStatus,
};
use stepledger_storage::ProgressStore;
use tracing::{debug, info, instrument, warn};

use crate::step::{Step, StepContext, StepOutcome};

// ---------------------------------------------------------------------------
// Config / result
// ---------------------------------------------------------------------------

/// Runtime configuration for [`run_pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory holding the progress file and step logs.
    pub progress_dir: PathBuf,
    /// Progress file name inside `progress_dir`.
    pub progress_file: String,
    /// Reuse successful steps of the previous iteration.
    pub resume_from_last_successful: bool,
    /// Casing of the progress and log file envelopes.
    pub key_case: KeyCase,
    /// Markers used to find the project root that log references are relative to.
    pub root_markers: Vec<String>,
}

impl PipelineConfig {
    pub fn new(progress_dir: impl Into<PathBuf>) -> Self {
        Self::from(&AppConfig::default()).with_progress_dir(progress_dir)
    }

    pub fn with_progress_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.progress_dir = dir.into();
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume_from_last_successful = resume;
        self
    }

    /// The store this configuration points at.
    pub fn store(&self) -> ProgressStore {
        ProgressStore::new(&self.progress_dir, &self.progress_file)
            .with_key_case(self.key_case)
            .discover_root(&self.root_markers)
    }
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            progress_dir: PathBuf::from(&config.defaults.progress_dir),
            progress_file: config.defaults.progress_file_name.clone(),
            resume_from_last_successful: config.defaults.resume_from_last_successful,
            key_case: config.storage.key_case,
            root_markers: config.storage.root_markers.clone(),
        }
    }
}

/// Result of a completed pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub run_id: RunId,
    /// Output fields of the last executed or replayed step.
    pub output: Map<String, Value>,
    /// Initial context merged with every step's outputs.
    pub context: Map<String, Value>,
    /// Iteration this run wrote to (or replayed).
    pub iteration: u32,
    /// The previous iteration was complete and nothing ran.
    pub replayed: bool,
    /// Indices of steps whose functions were invoked.
    pub executed: Vec<usize>,
    /// Indices of steps whose cached outputs were reused.
    pub reused: Vec<usize>,
}

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called before a step function is invoked.
    fn step_started(&self, index: usize, name: &str, total: usize);
    /// Called when a step's cached output is carried forward.
    fn step_reused(&self, index: usize, name: &str);
    /// Called after a step's record is persisted.
    fn step_finished(&self, index: usize, name: &str, status: StepStatus);
    /// Called when a complete iteration is replayed without running anything.
    fn replayed(&self, iteration: u32);
    /// Called when the pipeline completes successfully.
    fn done(&self, run: &PipelineRun);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn step_started(&self, _index: usize, _name: &str, _total: usize) {}
    fn step_reused(&self, _index: usize, _name: &str) {}
    fn step_finished(&self, _index: usize, _name: &str, _status: StepStatus) {}
    fn replayed(&self, _iteration: u32) {}
    fn done(&self, _run: &PipelineRun) {}
}

// ---------------------------------------------------------------------------
// Key ownership
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Initial,
    Step(usize),
}

/// Working context plus which step produced each key.
struct Ledger {
    values: Map<String, Value>,
    owners: HashMap<String, Owner>,
}

impl Ledger {
    fn new(initial: Map<String, Value>) -> Self {
        let owners = initial.keys().map(|k| (k.clone(), Owner::Initial)).collect();
        Self {
            values: initial,
            owners,
        }
    }

    /// First output key `step` may not write.
    fn collision(&self, index: usize, step: &Step, outputs: &Map<String, Value>) -> Option<String> {
        outputs.keys().find_map(|key| match self.owners.get(key) {
            None => None,
            Some(Owner::Step(owner)) if *owner == index => None,
            Some(_) if step.declared_produces().iter().any(|p| p == key) => None,
            Some(Owner::Initial) => Some(format!(
                "output key '{key}' collides with the initial context"
            )),
            Some(Owner::Step(owner)) => Some(format!(
                "output key '{key}' was already produced by step {owner}"
            )),
        })
    }

    fn merge(&mut self, index: usize, outputs: &Map<String, Value>) {
        for (key, value) in outputs {
            self.values.insert(key.clone(), value.clone());
            self.owners.insert(key.clone(), Owner::Step(index));
        }
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Run `steps` in order against the ledger described by `config`.
///
/// 1. Replay a complete previous iteration without running anything
/// 2. Otherwise continue an interrupted iteration, or open a new one
/// 3. Carry forward the previous iteration's successful prefix
/// 4. Run the remaining steps, persisting each record before the next step
///
/// Returns `StepExecution` for the first step that does not succeed.
#[instrument(skip_all, fields(steps = steps.len(), progress_dir = %config.progress_dir.display()))]
pub async fn run_pipeline(
    steps: &mut [Step],
    initial: Map<String, Value>,
    config: &PipelineConfig,
    progress: &dyn ProgressReporter,
) -> Result<PipelineRun> {
    validate_pipeline(steps)?;
    for step in steps.iter_mut() {
        step.reset();
    }

    let run_id = RunId::new();
    let total = steps.len();
    let resume = config.resume_from_last_successful;
    let store = config.store();
    store.initialize().await?;

    let mut history = store.load_iterations().await?;
    let last = history.pop();
    let before_last = history.pop();

    // --- Fast path ---
    if resume {
        if let Some(prev) = last.as_ref().filter(|p| p.is_complete(total) && keys_match(p, &*steps)) {
            if let Some(run) = replay(&store, prev, steps, &initial, run_id).await? {
                info!(iteration = prev.iteration, "all steps already succeeded, replaying cached output");
                progress.replayed(prev.iteration);
                progress.done(&run);
                return Ok(run);
            }
        }
    }

    // --- Pick the iteration to write ---
    let (mut iteration, source) = match last {
        Some(prev) if resume && prev.is_interrupted(total) => {
            info!(iteration = prev.iteration, recorded = prev.steps.len(), "continuing interrupted iteration");
            let mut target = prev.clone();
            target.steps.clear();
            // Nothing recorded yet: the crash came before carry-forward, so
            // the prefix still lives in the iteration before it.
            let source = if prev.steps.is_empty() { before_last } else { Some(prev) };
            (target, source)
        }
        Some(prev) => {
            let fresh = store.create_iteration().await?;
            (fresh, resume.then_some(prev))
        }
        None => (store.create_iteration().await?, None),
    };
    info!(%run_id, iteration = iteration.iteration, "starting iteration");

    let mut ledger = Ledger::new(initial);
    let mut output = Map::new();
    let mut reused = Vec::new();
    let mut executed = Vec::new();

    // --- Carry forward ---
    if let Some(source) = source {
        for record in &source.steps {
            let index = record.step;
            let Some(step) = steps.get_mut(index) else { break };
            if !record.status.is_success() {
                break;
            }
            if record.key.as_deref().is_some_and(|k| k != step.key()) {
                debug!(index, recorded = ?record.key, current = step.key(), "step key changed, stopping carry-forward");
                break;
            }
            let path = store.resolve_log_ref(&record.log_file);
            if !log_exists(&path).await {
                warn!(index, log = %path.display(), "step log missing, step will be re-executed");
                break;
            }
            let log = store.read_step_log(&record.log_file).await?;

            ledger.merge(index, &log.data);
            step.status = Some(StepStatus::Success);
            step.output = Some(log.data.clone());
            output = log.data;
            iteration.upsert_record(StepRecord {
                key: Some(step.key().to_string()),
                ..record.clone()
            });
            reused.push(index);
            progress.step_reused(index, step.name());
            info!(index, name = step.name(), "reusing step output");
        }
    }
    store.upsert_iteration(&iteration).await?;

    // --- Execute ---
    for index in 0..total {
        if iteration.record(index).is_some_and(|r| r.status.is_success()) {
            continue;
        }
        let step = &mut steps[index];
        progress.step_started(index, step.name(), total);
        debug!(index, name = step.name(), "running step");

        let attempt = attempt_step(step, index, &ledger, run_id, iteration.iteration).await;
        let attempt = match (attempt.status, ledger.collision(index, step, &attempt.outputs)) {
            (StepStatus::Failure, _) | (_, None) => attempt,
            (_, Some(cause)) => Attempt {
                status: StepStatus::Failure,
                cause: Some(cause),
                ..attempt
            },
        };
        executed.push(index);

        if attempt.status != StepStatus::Failure {
            ledger.merge(index, &attempt.outputs);
        }
        step.status = Some(attempt.status);
        step.output = Some(attempt.outputs.clone());
        step.error = attempt.cause.clone();

        let log = build_log(index, step, &attempt);
        let log_file = store.write_step_log(iteration.iteration, &log).await?;
        iteration.upsert_record(StepRecord {
            step: index,
            log_file,
            status: attempt.status,
            key: Some(step.key().to_string()),
        });
        store.upsert_iteration(&iteration).await?;
        progress.step_finished(index, step.name(), attempt.status);

        if attempt.status != StepStatus::Success {
            let cause = attempt
                .cause
                .unwrap_or_else(|| format!("step returned {}", attempt.status));
            warn!(index, name = step.name(), status = %attempt.status, %cause, "step did not succeed");
            return Err(StepLedgerError::StepExecution {
                index,
                name: step.name().to_string(),
                key: step.key().to_string(),
                status: attempt.status,
                cause,
            });
        }

        info!(index, name = step.name(), "step succeeded");
        output = attempt.outputs;
    }

    let run = PipelineRun {
        run_id,
        output,
        context: ledger.values,
        iteration: iteration.iteration,
        replayed: false,
        executed,
        reused,
    };
    progress.done(&run);
    Ok(run)
}

/// Non-empty, unique keys usable in a file name.
fn validate_pipeline(steps: &[Step]) -> Result<()> {
    if steps.is_empty() {
        return Err(StepLedgerError::validation("pipeline has no steps"));
    }
    let mut seen = HashSet::new();
    for (index, step) in steps.iter().enumerate() {
        let key = step.key();
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(StepLedgerError::validation(format!(
                "step {index} ({}) has invalid key '{key}': use letters, digits, '-', '_' or '.'",
                step.name()
            )));
        }
        if !seen.insert(key) {
            return Err(StepLedgerError::validation(format!(
                "duplicate step key '{key}'"
            )));
        }
    }
    Ok(())
}

fn keys_match(iteration: &Iteration, steps: &[Step]) -> bool {
    iteration
        .steps
        .iter()
        .zip(steps)
        .all(|(record, step)| record.key.as_deref().is_none_or(|k| k == step.key()))
}

/// A stat failure counts as missing, but is logged.
async fn log_exists(path: &Path) -> bool {
    match tokio::fs::try_exists(path).await {
        Ok(found) => found,
        Err(e) => {
            warn!(log = %path.display(), error = %e, "cannot stat step log");
            false
        }
    }
}

/// Rebuild the run from a complete iteration's logs. `None` when a log is gone.
async fn replay(
    store: &ProgressStore,
    prev: &Iteration,
    steps: &mut [Step],
    initial: &Map<String, Value>,
    run_id: RunId,
) -> Result<Option<PipelineRun>> {
    let mut logs = Vec::with_capacity(prev.steps.len());
    for record in &prev.steps {
        let path = store.resolve_log_ref(&record.log_file);
        if !log_exists(&path).await {
            warn!(index = record.step, log = %path.display(), "step log missing, cannot replay");
            return Ok(None);
        }
        logs.push(store.read_step_log(&record.log_file).await?);
    }

    let mut ledger = Ledger::new(initial.clone());
    for ((step, record), log) in steps.iter_mut().zip(&prev.steps).zip(&logs) {
        ledger.merge(record.step, &log.data);
        step.status = Some(record.status);
        step.output = Some(log.data.clone());
    }
    let output = logs.pop().map(|log| log.data).unwrap_or_default();

    Ok(Some(PipelineRun {
        run_id,
        output,
        context: ledger.values,
        iteration: prev.iteration,
        replayed: true,
        executed: Vec::new(),
        reused: (0..prev.steps.len()).collect(),
    }))
}

// ---------------------------------------------------------------------------
// One attempt
// ---------------------------------------------------------------------------

struct Attempt {
    status: StepStatus,
    outputs: Map<String, Value>,
    cause: Option<String>,
}

impl Attempt {
    fn failed(cause: String) -> Self {
        Self {
            status: StepStatus::Failure,
            outputs: Map::new(),
            cause: Some(cause),
        }
    }
}

async fn attempt_step(
    step: &Step,
    index: usize,
    ledger: &Ledger,
    run_id: RunId,
    iteration: u32,
) -> Attempt {
    let missing: Vec<&str> = step
        .declared_reads()
        .iter()
        .filter(|k| !ledger.values.contains_key(k.as_str()))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Attempt::failed(format!("missing declared inputs: {}", missing.join(", ")));
    }

    let ctx = StepContext {
        run_id,
        iteration,
        index,
        name: step.name().to_string(),
        key: step.key().to_string(),
        values: ledger.values.clone(),
    };

    // Own task, so a panic surfaces as a JoinError instead of unwinding the runner.
    let value = match tokio::spawn(step.invoke(ctx)).await {
        Ok(Ok(value)) => value,
        Ok(Err(e)) => return Attempt::failed(e.to_string()),
        Err(join) if join.is_panic() => {
            let payload = join.into_panic();
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            return Attempt::failed(format!("step panicked: {msg}"));
        }
        Err(join) => return Attempt::failed(join.to_string()),
    };

    match StepOutcome::try_from_value(value) {
        Ok(outcome) => {
            let cause = match outcome.status {
                StepStatus::Success => None,
                _ => outcome
                    .outputs
                    .get("error")
                    .map(|e| e.as_str().map_or_else(|| e.to_string(), String::from)),
            };
            Attempt {
                status: outcome.status,
                outputs: outcome.outputs,
                cause,
            }
        }
        Err(violation) => Attempt::failed(format!("contract violation: {violation}")),
    }
}

fn build_log(index: usize, step: &Step, attempt: &Attempt) -> StepLog {
    let (message, error) = match attempt.status {
        StepStatus::Success => (format!("Step {index} ({}) completed.", step.name()), None),
        StepStatus::Partial => (
            format!("Step {index} ({}) partially completed.", step.name()),
            Some(json!({})),
        ),
        StepStatus::Failure => {
            let message = format!("Step {index} ({}) failed.", step.name());
            let detail = attempt.cause.clone().unwrap_or_default();
            let error = json!({ "error": [message.clone(), detail] });
            (message, Some(error))
        }
    };
    StepLog {
        message,
        data: attempt.outputs.clone(),
        error,
        key: step.key().to_string(),
        time_stamp: chrono::Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::BoxError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("sl-runner-{}", uuid::Uuid::now_v7()))
    }

    fn config(dir: &std::path::Path) -> PipelineConfig {
        PipelineConfig {
            progress_dir: dir.join("progress"),
            progress_file: "progress.json".into(),
            resume_from_last_successful: true,
            key_case: KeyCase::Camel,
            root_markers: vec![".stepledger-test-root".into()],
        }
    }

    /// Step that counts its invocations and outputs `{key: n}`.
    fn counting(key: &'static str, calls: &Arc<AtomicUsize>) -> Step {
        let calls = Arc::clone(calls);
        Step::new(key, key, move |_ctx: StepContext| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { StepOutcome::success().with(key, n).into_result() }
        })
    }

    /// Step that fails while `*fail` is non-zero.
    fn flaky(key: &'static str, calls: &Arc<AtomicUsize>, fail: &Arc<AtomicUsize>) -> Step {
        let calls = Arc::clone(calls);
        let fail = Arc::clone(fail);
        Step::new(key, key, move |_ctx: StepContext| {
            calls.fetch_add(1, Ordering::SeqCst);
            let failing = fail.load(Ordering::SeqCst) > 0;
            async move {
                if failing {
                    Err::<Value, BoxError>("boom".into())
                } else {
                    StepOutcome::success().with(key, true).into_result()
                }
            }
        })
    }

    #[tokio::test]
    async fn idempotent_replay() {
        let tmp = temp_dir();
        let cfg = config(&tmp);
        let calls = Arc::new(AtomicUsize::new(0));
        let mut steps = vec![counting("a", &calls), counting("b", &calls)];

        let first = run_pipeline(&mut steps, Map::new(), &cfg, &SilentProgress)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!first.replayed);

        let second = run_pipeline(&mut steps, Map::new(), &cfg, &SilentProgress)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(second.replayed);
        assert_eq!(second.output, first.output);
        assert_eq!(second.context, first.context);
        assert_eq!(second.iteration, 1);
        assert!(second.executed.is_empty());

        let iterations = cfg.store().load_iterations().await.unwrap();
        assert_eq!(iterations.len(), 1);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn resume_reuses_successful_prefix() {
        let tmp = temp_dir();
        let cfg = config(&tmp);
        let a_calls = Arc::new(AtomicUsize::new(0));
        let b_calls = Arc::new(AtomicUsize::new(0));
        let c_calls = Arc::new(AtomicUsize::new(0));
        let fail = Arc::new(AtomicUsize::new(1));

        let mut steps = vec![
            counting("a", &a_calls),
            counting("b", &b_calls),
            flaky("c", &c_calls, &fail),
        ];

        let err = run_pipeline(&mut steps, Map::new(), &cfg, &SilentProgress)
            .await
            .unwrap_err();
        match err {
            StepLedgerError::StepExecution { index, key, status, cause, .. } => {
                assert_eq!(index, 2);
                assert_eq!(key, "c");
                assert_eq!(status, StepStatus::Failure);
                assert_eq!(cause, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }

        fail.store(0, Ordering::SeqCst);
        let run = run_pipeline(&mut steps, Map::new(), &cfg, &SilentProgress)
            .await
            .unwrap();

        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert_eq!(c_calls.load(Ordering::SeqCst), 2);
        assert_eq!(run.iteration, 2);
        assert_eq!(run.reused, vec![0, 1]);
        assert_eq!(run.executed, vec![2]);
        assert_eq!(run.context.get("a"), Some(&json!(1)));

        let iterations = cfg.store().load_iterations().await.unwrap();
        assert_eq!(iterations.len(), 2);
        // Carried records point at the original logs.
        assert_eq!(iterations[1].steps[0], iterations[0].steps[0]);
        assert_eq!(iterations[1].steps[2].status, StepStatus::Success);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn iteration_numbers_have_no_gaps() {
        let tmp = temp_dir();
        let cfg = config(&tmp);
        let calls = Arc::new(AtomicUsize::new(0));
        let fail = Arc::new(AtomicUsize::new(1));
        let mut steps = vec![flaky("only", &calls, &fail)];

        for _ in 0..3 {
            assert!(run_pipeline(&mut steps, Map::new(), &cfg, &SilentProgress).await.is_err());
        }

        let numbers: Vec<u32> = cfg
            .store()
            .load_iterations()
            .await
            .unwrap()
            .iter()
            .map(|i| i.iteration)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn crash_after_first_step_resumes_in_place() {
        let tmp = temp_dir();
        let cfg = config(&tmp);
        let store = cfg.store();
        store.initialize().await.unwrap();

        // Simulate a process killed right after step 0 was persisted.
        let mut it = store.create_iteration().await.unwrap();
        let mut data = Map::new();
        data.insert("a".into(), json!(1));
        let log_file = store
            .write_step_log(it.iteration, &StepLog::success("a", "Step 0 (a) completed.", data))
            .await
            .unwrap();
        it.upsert_record(StepRecord {
            step: 0,
            log_file,
            status: StepStatus::Success,
            key: Some("a".into()),
        });
        store.upsert_iteration(&it).await.unwrap();

        let a_calls = Arc::new(AtomicUsize::new(0));
        let b_calls = Arc::new(AtomicUsize::new(0));
        let mut steps = vec![counting("a", &a_calls), counting("b", &b_calls)];
        let run = run_pipeline(&mut steps, Map::new(), &cfg, &SilentProgress)
            .await
            .unwrap();

        assert_eq!(a_calls.load(Ordering::SeqCst), 0);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert_eq!(run.iteration, 1);

        let iterations = store.load_iterations().await.unwrap();
        assert_eq!(iterations.len(), 1);
        assert_eq!(iterations[0].steps.len(), 2);
        assert!(iterations[0].all_successful());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn crash_before_carry_forward_keeps_prefix() {
        let tmp = temp_dir();
        let cfg = config(&tmp);
        let store = cfg.store();
        store.initialize().await.unwrap();

        let mut first = store.create_iteration().await.unwrap();
        let mut data = Map::new();
        data.insert("a".into(), json!(1));
        let a_log = store
            .write_step_log(1, &StepLog::success("a", "Step 0 (a) completed.", data))
            .await
            .unwrap();
        let mut failed = StepLog::success("b", "Step 1 (b) failed.", Map::new());
        failed.error = Some(json!({ "error": ["Step 1 (b) failed.", "boom"] }));
        let b_log = store.write_step_log(1, &failed).await.unwrap();
        first.upsert_record(StepRecord {
            step: 0,
            log_file: a_log,
            status: StepStatus::Success,
            key: Some("a".into()),
        });
        first.upsert_record(StepRecord {
            step: 1,
            log_file: b_log,
            status: StepStatus::Failure,
            key: Some("b".into()),
        });
        store.upsert_iteration(&first).await.unwrap();

        // Killed right after the next iteration was opened.
        store.create_iteration().await.unwrap();

        let a_calls = Arc::new(AtomicUsize::new(0));
        let b_calls = Arc::new(AtomicUsize::new(0));
        let mut steps = vec![counting("a", &a_calls), counting("b", &b_calls)];
        let run = run_pipeline(&mut steps, Map::new(), &cfg, &SilentProgress)
            .await
            .unwrap();

        assert_eq!(a_calls.load(Ordering::SeqCst), 0);
        assert_eq!(b_calls.load(Ordering::SeqCst), 1);
        assert_eq!(run.reused, vec![0]);
        assert_eq!(run.iteration, 2);
        assert_eq!(run.context.get("a"), Some(&json!(1)));

        let iterations = store.load_iterations().await.unwrap();
        assert_eq!(iterations.len(), 2);
        assert!(iterations[1].is_complete(2));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn dotted_progress_dir_still_replays() {
        let tmp = temp_dir();
        let project = tmp.join("project");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(project.join("Cargo.toml"), "").unwrap();
        let cfg = PipelineConfig {
            progress_dir: project.join("..").join("shared-progress"),
            root_markers: vec!["Cargo.toml".into()],
            ..config(&tmp)
        };

        let calls = Arc::new(AtomicUsize::new(0));
        let mut steps = vec![counting("a", &calls), counting("b", &calls)];
        let first = run_pipeline(&mut steps, Map::new(), &cfg, &SilentProgress)
            .await
            .unwrap();
        let second = run_pipeline(&mut steps, Map::new(), &cfg, &SilentProgress)
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(second.replayed);
        assert_eq!(second.iteration, first.iteration);

        let store = cfg.store();
        let last = store.last_iteration().await.unwrap().unwrap();
        for record in &last.steps {
            assert!(store.resolve_log_ref(&record.log_file).exists());
        }

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn partial_stops_the_run_with_empty_error() {
        let tmp = temp_dir();
        let cfg = config(&tmp);
        let mut steps = vec![Step::new("half", "half", |_ctx: StepContext| async {
            StepOutcome::partial().with("pages", 2).into_result()
        })];

        let err = run_pipeline(&mut steps, Map::new(), &cfg, &SilentProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, StepLedgerError::StepExecution { status: StepStatus::Partial, .. }));
        assert_eq!(steps[0].status, Some(StepStatus::Partial));

        let store = cfg.store();
        let last = store.last_iteration().await.unwrap().unwrap();
        let log = store.read_step_log(&last.steps[0].log_file).await.unwrap();
        assert_eq!(log.error, Some(json!({})));
        assert_eq!(log.data.get("pages"), Some(&json!(2)));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn missing_status_is_a_failure() {
        let tmp = temp_dir();
        let cfg = config(&tmp);
        let mut steps = vec![Step::new("bare", "bare", |_ctx: StepContext| async {
            Ok::<Value, BoxError>(json!({ "pages": 2 }))
        })];

        let err = run_pipeline(&mut steps, Map::new(), &cfg, &SilentProgress)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("contract violation"));

        let store = cfg.store();
        let last = store.last_iteration().await.unwrap().unwrap();
        assert_eq!(last.steps[0].status, StepStatus::Failure);
        let log = store.read_step_log(&last.steps[0].log_file).await.unwrap();
        assert_eq!(log.message, "Step 0 (bare) failed.");
        assert_eq!(log.error.unwrap()["error"][0], "Step 0 (bare) failed.");

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn undeclared_overwrite_is_a_collision() {
        let tmp = temp_dir();
        let cfg = config(&tmp);
        let mut steps = vec![
            Step::new("first", "first", |_ctx: StepContext| async {
                StepOutcome::success().with("shared", 1).into_result()
            }),
            Step::new("second", "second", |_ctx: StepContext| async {
                StepOutcome::success().with("shared", 2).into_result()
            }),
        ];

        let err = run_pipeline(&mut steps, Map::new(), &cfg, &SilentProgress)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already produced by step 0"));

        // Declaring the key makes the overwrite legal.
        let mut steps = vec![
            Step::new("first", "first", |_ctx: StepContext| async {
                StepOutcome::success().with("shared", 1).into_result()
            }),
            Step::new("second", "second", |_ctx: StepContext| async {
                StepOutcome::success().with("shared", 2).into_result()
            })
            .produces(["shared"]),
        ];
        let run = run_pipeline(&mut steps, Map::new(), &cfg, &SilentProgress)
            .await
            .unwrap();
        assert_eq!(run.context.get("shared"), Some(&json!(2)));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn initial_context_keys_are_protected() {
        let tmp = temp_dir();
        let cfg = config(&tmp);
        let mut initial = Map::new();
        initial.insert("url".into(), json!("https://example.com"));
        let mut steps = vec![Step::new("rewrite", "rewrite", |_ctx: StepContext| async {
            StepOutcome::success().with("url", "other").into_result()
        })];

        let err = run_pipeline(&mut steps, initial, &cfg, &SilentProgress)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("initial context"));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn panics_are_caught() {
        let tmp = temp_dir();
        let cfg = config(&tmp);
        let mut steps = vec![Step::new("explode", "explode", |_ctx: StepContext| async {
            if true {
                panic!("kaboom");
            }
            StepOutcome::success().into_result()
        })];

        let err = run_pipeline(&mut steps, Map::new(), &cfg, &SilentProgress)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("kaboom"));
        assert_eq!(
            cfg.store().last_iteration().await.unwrap().unwrap().steps[0].status,
            StepStatus::Failure
        );

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn missing_reads_fail_before_invocation() {
        let tmp = temp_dir();
        let cfg = config(&tmp);
        let calls = Arc::new(AtomicUsize::new(0));
        let mut steps = vec![counting("needs", &calls).reads(["url"])];

        let err = run_pipeline(&mut steps, Map::new(), &cfg, &SilentProgress)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing declared inputs: url"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn resume_disabled_reruns_everything() {
        let tmp = temp_dir();
        let cfg = config(&tmp).with_resume(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let mut steps = vec![counting("a", &calls), counting("b", &calls)];

        run_pipeline(&mut steps, Map::new(), &cfg, &SilentProgress).await.unwrap();
        let run = run_pipeline(&mut steps, Map::new(), &cfg, &SilentProgress).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(run.iteration, 2);
        assert!(run.reused.is_empty());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn changed_key_stops_carry_forward() {
        let tmp = temp_dir();
        let cfg = config(&tmp);
        let calls = Arc::new(AtomicUsize::new(0));
        let fail = Arc::new(AtomicUsize::new(1));
        let mut steps = vec![counting("a", &calls), flaky("b", &calls, &fail)];
        assert!(run_pipeline(&mut steps, Map::new(), &cfg, &SilentProgress).await.is_err());

        fail.store(0, Ordering::SeqCst);
        let renamed = Arc::new(AtomicUsize::new(0));
        let mut steps = vec![counting("a2", &renamed), flaky("b", &calls, &fail)];
        let run = run_pipeline(&mut steps, Map::new(), &cfg, &SilentProgress).await.unwrap();

        assert_eq!(renamed.load(Ordering::SeqCst), 1);
        assert!(run.reused.is_empty());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn invalid_definitions_are_rejected() {
        let tmp = temp_dir();
        let cfg = config(&tmp);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut empty: Vec<Step> = Vec::new();
        assert!(matches!(
            run_pipeline(&mut empty, Map::new(), &cfg, &SilentProgress).await,
            Err(StepLedgerError::Validation { .. })
        ));

        let mut dup = vec![counting("a", &calls), counting("a", &calls)];
        let err = run_pipeline(&mut dup, Map::new(), &cfg, &SilentProgress)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("duplicate step key"));

        let mut bad = vec![counting("a/b", &calls)];
        assert!(run_pipeline(&mut bad, Map::new(), &cfg, &SilentProgress).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let _ = std::fs::remove_dir_all(&tmp);
    }
}

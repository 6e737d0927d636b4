//! Human and JSON summaries of a progress file.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use stepledger_shared::{Iteration, Result, StepStatus};
use stepledger_storage::ProgressStore;

/// Overall state of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationState {
    /// Every recorded step succeeded.
    Succeeded,
    /// A step recorded PARTIAL or FAILURE.
    Stopped,
    /// No steps recorded yet.
    Empty,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepSummary {
    pub step: usize,
    pub key: Option<String>,
    pub status: StepStatus,
    pub log_file: String,
    /// Log message, when the log file is readable.
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationSummary {
    pub iteration: u32,
    pub time_stamp: DateTime<Utc>,
    pub state: IterationState,
    pub recorded_steps: usize,
}

impl From<&Iteration> for IterationSummary {
    fn from(iteration: &Iteration) -> Self {
        let state = if iteration.steps.is_empty() {
            IterationState::Empty
        } else if iteration.all_successful() {
            IterationState::Succeeded
        } else {
            IterationState::Stopped
        };
        Self {
            iteration: iteration.iteration,
            time_stamp: iteration.time_stamp,
            state,
            recorded_steps: iteration.steps.len(),
        }
    }
}

/// Snapshot of a progress file.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub progress_file: String,
    pub iterations: Vec<IterationSummary>,
    /// Step records of the latest iteration.
    pub latest_steps: Vec<StepSummary>,
}

impl StatusReport {
    pub fn latest(&self) -> Option<&IterationSummary> {
        self.iterations.last()
    }
}

/// Read the store and summarise every iteration, with detail for the latest.
pub async fn status_report(store: &ProgressStore) -> Result<StatusReport> {
    let iterations = store.load_iterations().await?;

    let mut latest_steps = Vec::new();
    if let Some(last) = iterations.last() {
        for record in &last.steps {
            let message = store
                .read_step_log(&record.log_file)
                .await
                .ok()
                .map(|log| log.message);
            latest_steps.push(StepSummary {
                step: record.step,
                key: record.key.clone(),
                status: record.status,
                log_file: record.log_file.clone(),
                message,
            });
        }
    }

    Ok(StatusReport {
        progress_file: store.progress_file().display().to_string(),
        iterations: iterations.iter().map(IterationSummary::from).collect(),
        latest_steps,
    })
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Progress file: {}", self.progress_file)?;
        let Some(latest) = self.latest() else {
            return writeln!(f, "No iterations recorded.");
        };

        writeln!(f, "Iterations: {}", self.iterations.len())?;
        writeln!(
            f,
            "Latest: #{} at {} ({:?})",
            latest.iteration,
            latest.time_stamp.to_rfc3339(),
            latest.state
        )?;
        for step in &self.latest_steps {
            let key = step.key.as_deref().unwrap_or("-");
            write!(f, "  [{}] {:<24} {}", step.step, key, step.status)?;
            match &step.message {
                Some(message) => writeln!(f, "  {message}")?,
                None => writeln!(f, "  (log missing: {})", step.log_file)?,
            }
        }
        Ok(())
    }
}

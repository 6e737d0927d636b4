//! Core orchestration for stepledger.
//!
//! The step runner and its contract, the processing-state machine, legacy
//! state-file migration, and the document fetch pipeline built on them.

pub mod document_pipeline;
pub mod fetch;
pub mod migrate;
pub mod report;
pub mod runner;
pub mod state_machine;
pub mod step;

pub use runner::{PipelineConfig, PipelineRun, ProgressReporter, SilentProgress, run_pipeline};
pub use state_machine::{AppendOutcome, ProcessingStateMachine, TransitionRequest, TransitionVerdict};
pub use step::{BoxError, Step, StepContext, StepOutcome};

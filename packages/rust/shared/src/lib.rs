//! Shared types, error model, and configuration for stepledger.
//!
//! This crate is the foundation depended on by all other stepledger crates.
//! It provides:
//! - [`StepLedgerError`], the unified error type
//! - Pipeline ledger types ([`Iteration`], [`StepRecord`], [`StepLog`], [`RunId`])
//! - Processing-state types ([`ProcessingState`], [`StateEntry`], the transition table)
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod state;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, FetchConfig, MigrationConfig, StorageConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from,
};
pub use error::{Result, StepLedgerError};
pub use state::{
    ProcessingState, ProcessingStatus, ProgressFileStructure, StateEntry, StateTransition,
    TransitionCondition, TransitionReason, TriggerSource, VALID_TRANSITIONS,
};
pub use types::{Iteration, RunId, StepLog, StepRecord, StepStatus};

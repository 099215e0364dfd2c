//! Startup recovery of jobs interrupted by a crash or restart.
//!
//! - `policy`: picks a [`StrategyKind`](stepwise_types::recovery::StrategyKind)
//!   from a task's progress and checkpoint availability
//! - `strategy`: the three ways an interrupted job is re-entered
//! - `orchestrator`: the single startup pass that discovers, plans and
//!   executes recoveries in priority-ordered batches

pub mod orchestrator;
pub mod policy;
pub mod strategy;

pub use orchestrator::{RecoveryOrchestrator, RecoveryPhase, RecoveryPlan};
pub use policy::StrategySelector;
pub use strategy::{CheckpointResume, CleanRestart, RecoveryStrategy, StrategySet, ValidateOnly};

use stepwise_types::error::RepositoryError;

use crate::submit::SubmitError;

/// Why a recovery strategy could not re-enter a task.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("resubmission failed: {0}")]
    Submit(#[from] SubmitError),

    #[error("no checkpoint for task {0}")]
    NoCheckpoint(String),

    #[error("latest checkpoint '{name}' for task {task_id} is invalid")]
    InvalidCheckpoint { task_id: String, name: String },

    #[error("task {0} has no job key")]
    MissingJobKey(String),

    #[error("no terminal result for job key {0}")]
    NoTerminalResult(String),
}

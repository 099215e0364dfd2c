//! Recovery pass result types.
//!
//! A startup recovery pass produces one [`RecoveryResult`] per attempted task,
//! wrapped in a [`TaskRecoveryOutcome`], and aggregates them into
//! [`RecoveryResults`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Strategy kind
// ---------------------------------------------------------------------------

/// How an interrupted job is re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Resume from the latest checkpoint.
    CheckpointResume,
    /// Restart, skipping sub-steps whose output is already durable.
    CleanRestart,
    /// Confirm a terminal result exists without running anything.
    ValidateOnly,
}

impl StrategyKind {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::CheckpointResume => "checkpoint_resume",
            StrategyKind::CleanRestart => "clean_restart",
            StrategyKind::ValidateOnly => "validate_only",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Per-attempt result
// ---------------------------------------------------------------------------

/// Result of a single recovery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryResult {
    pub success: bool,
    pub strategy_name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_execution_id: Option<String>,
    /// Checkpoint (or validated result) the recovery started from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<String>,
    #[serde(default)]
    pub estimated_time_saved: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RecoveryResult {
    pub fn succeeded(strategy: StrategyKind, message: impl Into<String>) -> Self {
        Self {
            success: true,
            strategy_name: strategy.name().to_string(),
            message: message.into(),
            new_execution_id: None,
            resumed_from: None,
            estimated_time_saved: Duration::ZERO,
            error: None,
        }
    }

    pub fn failed(
        strategy: StrategyKind,
        message: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            strategy_name: strategy.name().to_string(),
            message: message.into(),
            new_execution_id: None,
            resumed_from: None,
            estimated_time_saved: Duration::ZERO,
            error: Some(error.into()),
        }
    }

    pub fn with_execution_id(mut self, id: impl Into<String>) -> Self {
        self.new_execution_id = Some(id.into());
        self
    }

    pub fn with_resumed_from(mut self, from: impl Into<String>) -> Self {
        self.resumed_from = Some(from.into());
        self
    }

    pub fn with_time_saved(mut self, saved: Duration) -> Self {
        self.estimated_time_saved = saved;
        self
    }
}

// ---------------------------------------------------------------------------
// Per-task outcome and pass aggregate
// ---------------------------------------------------------------------------

/// Disposition of one discovered task within a recovery pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskDisposition {
    /// A strategy ran; see `result.success`.
    Attempted { result: RecoveryResult },
    /// The task was not eligible (or claimed elsewhere) and left untouched.
    Skipped { reason: String },
    /// The orchestrator could not run a strategy (registry fault, panic).
    Errored { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecoveryOutcome {
    pub registry_id: Uuid,
    pub task_id: String,
    pub recovery_priority: i32,
    pub disposition: TaskDisposition,
}

/// Aggregated report of a startup recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryResults {
    pub discovered: usize,
    pub recovered: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_estimated_time_saved: Duration,
    /// Size of each executed batch, in execution order.
    pub batches: Vec<usize>,
    pub outcomes: Vec<TaskRecoveryOutcome>,
    /// Set when the pass stopped before executing anything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted_reason: Option<String>,
}

impl RecoveryResults {
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self {
            aborted_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    /// Fold one task outcome into the counters.
    pub fn record(&mut self, outcome: TaskRecoveryOutcome) {
        match &outcome.disposition {
            TaskDisposition::Attempted { result } if result.success => {
                self.recovered += 1;
                self.total_estimated_time_saved += result.estimated_time_saved;
            }
            TaskDisposition::Attempted { .. } | TaskDisposition::Errored { .. } => {
                self.failed += 1;
            }
            TaskDisposition::Skipped { .. } => self.skipped += 1,
        }
        self.outcomes.push(outcome);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted_reason.is_some()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(disposition: TaskDisposition) -> TaskRecoveryOutcome {
        TaskRecoveryOutcome {
            registry_id: Uuid::now_v7(),
            task_id: "exec".to_string(),
            recovery_priority: 0,
            disposition,
        }
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(StrategyKind::CheckpointResume.name(), "checkpoint_resume");
        assert_eq!(StrategyKind::CleanRestart.to_string(), "clean_restart");
        assert_eq!(
            serde_json::to_value(StrategyKind::ValidateOnly).unwrap(),
            "validate_only"
        );
    }

    #[test]
    fn test_record_counts_each_disposition() {
        let mut results = RecoveryResults::default();
        results.record(outcome(TaskDisposition::Attempted {
            result: RecoveryResult::succeeded(StrategyKind::CleanRestart, "ok")
                .with_time_saved(Duration::from_secs(60)),
        }));
        results.record(outcome(TaskDisposition::Attempted {
            result: RecoveryResult::failed(StrategyKind::CheckpointResume, "no checkpoint", "missing"),
        }));
        results.record(outcome(TaskDisposition::Skipped {
            reason: "already completed".to_string(),
        }));
        results.record(outcome(TaskDisposition::Errored {
            error: "registry down".to_string(),
        }));

        assert_eq!(results.recovered, 1);
        assert_eq!(results.failed, 2);
        assert_eq!(results.skipped, 1);
        assert_eq!(results.total_estimated_time_saved, Duration::from_secs(60));
        assert_eq!(results.outcomes.len(), 4);
    }

    #[test]
    fn test_aborted_results_are_empty() {
        let results = RecoveryResults::aborted("store unreachable");
        assert!(results.is_aborted());
        assert_eq!(results.discovered, 0);
        assert!(results.outcomes.is_empty());
    }
}

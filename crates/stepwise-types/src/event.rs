//! Event types for the Stepwise event bus.
//!
//! `EngineEvent` is the unified event type broadcast during job execution and
//! recovery. All variants are Clone + Send + Sync for use with tokio broadcast
//! channels.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a single step execution, as seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// The step returned a delta without setting `error`.
    Succeeded,
    /// The step returned a delta that set `error` itself.
    ControlledFailure,
    /// The step returned an error, panicked or timed out.
    Failed,
}

/// Events emitted during job execution and startup recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    // -- Job execution --
    /// A job run has started.
    JobStarted {
        job_id: String,
        workflow_name: String,
        entry_step: String,
        is_recovery: bool,
    },

    /// A step has started executing.
    StepStarted {
        job_id: String,
        step_name: String,
        started_at: DateTime<Utc>,
    },

    /// A step has finished (successfully or not).
    StepFinished {
        job_id: String,
        step_name: String,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        duration_ms: u64,
        outcome: StepOutcome,
    },

    /// Job-level progress was reported.
    Progress {
        job_id: String,
        step_name: String,
        percent: u8,
        description: String,
    },

    /// All members of a phase finished and the gate evaluated.
    PhaseCompleted {
        job_id: String,
        phase: String,
        completed_count: usize,
        required_count: usize,
        complete: bool,
    },

    /// A job run reached a terminal step.
    JobFinished {
        job_id: String,
        workflow_name: String,
        terminal_step: String,
        failed: bool,
        duration_ms: u64,
    },

    // -- Recovery --
    /// A startup recovery pass has started.
    RecoveryPassStarted { instance_id: String },

    /// A discovered task was recovered.
    TaskRecovered {
        task_id: String,
        strategy: String,
        new_execution_id: Option<String>,
    },

    /// A recovery strategy failed for a task.
    TaskRecoveryFailed {
        task_id: String,
        strategy: String,
        error: String,
    },

    /// A discovered task was left untouched.
    TaskRecoverySkipped { task_id: String, reason: String },

    /// A startup recovery pass has finished.
    RecoveryPassFinished {
        instance_id: String,
        recovered: usize,
        failed: usize,
        skipped: usize,
    },
}

impl EngineEvent {
    /// Returns the job ID from job-scoped variants, or None for recovery-pass
    /// events.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            EngineEvent::JobStarted { job_id, .. }
            | EngineEvent::StepStarted { job_id, .. }
            | EngineEvent::StepFinished { job_id, .. }
            | EngineEvent::Progress { job_id, .. }
            | EngineEvent::PhaseCompleted { job_id, .. }
            | EngineEvent::JobFinished { job_id, .. } => Some(job_id),

            EngineEvent::TaskRecovered { task_id, .. }
            | EngineEvent::TaskRecoveryFailed { task_id, .. }
            | EngineEvent::TaskRecoverySkipped { task_id, .. } => Some(task_id),

            EngineEvent::RecoveryPassStarted { .. } | EngineEvent::RecoveryPassFinished { .. } => {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_finished_serde_roundtrip() {
        let now = Utc::now();
        let event = EngineEvent::StepFinished {
            job_id: "exec-1".to_string(),
            step_name: "extract_text".to_string(),
            started_at: now,
            finished_at: now,
            duration_ms: 1500,
            outcome: StepOutcome::Succeeded,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"step_finished\""));
        assert!(json.contains("\"outcome\":\"succeeded\""));
        let parsed: EngineEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, EngineEvent::StepFinished { duration_ms: 1500, .. }));
    }

    #[test]
    fn test_progress_serde_roundtrip() {
        let event = EngineEvent::Progress {
            job_id: "exec-1".to_string(),
            step_name: "ocr".to_string(),
            percent: 45,
            description: "page 3 of 8".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"progress\""));
        let parsed: EngineEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, EngineEvent::Progress { percent: 45, .. }));
    }

    #[test]
    fn test_job_id_accessor() {
        let event = EngineEvent::JobFinished {
            job_id: "exec-9".to_string(),
            workflow_name: "analyze".to_string(),
            terminal_step: "finalize".to_string(),
            failed: false,
            duration_ms: 10,
        };
        assert_eq!(event.job_id(), Some("exec-9"));

        let event = EngineEvent::RecoveryPassStarted {
            instance_id: "node-a".to_string(),
        };
        assert_eq!(event.job_id(), None);
    }
}

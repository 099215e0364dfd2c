//! Job domain types: error details, task registry records and checkpoints.
//!
//! These are the records shared between the workflow executor (which writes
//! progress, checkpoints and error details) and the recovery orchestrator
//! (which reads them back after a restart).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error details
// ---------------------------------------------------------------------------

/// Structured description of the first failure in a job.
///
/// Written by the executor when a step fails and stored on the state bag under
/// `error_details`. Later failures never overwrite it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Name of the step that failed.
    pub step_name: String,
    /// Machine-readable failure category (e.g. "timeout", "validation").
    pub error_kind: String,
    /// Human-readable message.
    pub message: String,
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
    /// Optional extra context supplied by the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_cause_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_cause_message: Option<String>,
}

impl ErrorDetails {
    pub fn new(
        step_name: impl Into<String>,
        error_kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            step_name: step_name.into(),
            error_kind: error_kind.into(),
            message: message.into(),
            timestamp: Utc::now(),
            context: None,
            root_cause_kind: None,
            root_cause_message: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Task state
// ---------------------------------------------------------------------------

/// Lifecycle state of a task registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    /// Heartbeat expired; the owning process is presumed dead.
    Stale,
    /// Claimed by a recovery orchestrator.
    Recovering,
    Completed,
    Failed,
}

impl TaskState {
    /// `Completed` and `Failed` are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    /// Only running or stale tasks are picked up by recovery discovery.
    pub fn is_discoverable(&self) -> bool {
        matches!(self, TaskState::Running | TaskState::Stale)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Stale => "stale",
            TaskState::Recovering => "recovering",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskState::Pending),
            "running" => Some(TaskState::Running),
            "stale" => Some(TaskState::Stale),
            "recovering" => Some(TaskState::Recovering),
            "completed" => Some(TaskState::Completed),
            "failed" => Some(TaskState::Failed),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// Immutable snapshot of recoverable progress for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: String,
    /// Milestone name (usually the step that produced it).
    pub name: String,
    pub progress_percent: u8,
    /// Opaque payload the workflow's steps know how to resume from.
    pub recoverable_data: Value,
    #[serde(default)]
    pub db_state: Value,
    #[serde(default)]
    pub file_state: Value,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// A checkpoint is usable for resumption when it is named, its progress
    /// is on the 0-100 scale and it actually carries recoverable data.
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty() && self.progress_percent <= 100 && !self.recoverable_data.is_null()
    }
}

// ---------------------------------------------------------------------------
// Task registry records
// ---------------------------------------------------------------------------

/// New registry entry written when a job starts running.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRegistration {
    pub task_id: String,
    pub task_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub recovery_priority: i32,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

/// Lightweight registry record returned by discovery (arguments not loaded).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverableTaskStub {
    pub registry_id: Uuid,
    /// Execution ID of the interrupted run.
    pub task_id: String,
    /// Workflow (step function) name used to resubmit the job.
    pub task_name: String,
    /// Identifying key of the job's input (content fingerprint).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub current_state: TaskState,
    pub last_heartbeat: DateTime<Utc>,
    pub recovery_priority: i32,
    pub progress_percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
}

/// Fully loaded registry record including the stored job arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverableTask {
    #[serde(flatten)]
    pub stub: RecoverableTaskStub,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl RecoverableTask {
    pub fn registry_id(&self) -> Uuid {
        self.stub.registry_id
    }

    pub fn task_id(&self) -> &str {
        &self.stub.task_id
    }

    pub fn task_name(&self) -> &str {
        &self.stub.task_name
    }

    /// The job key: the stub's own key, falling back to a `job_key` kwarg.
    pub fn job_key(&self) -> Option<&str> {
        self.stub
            .job_key
            .as_deref()
            .or_else(|| self.kwargs.get("job_key").and_then(Value::as_str))
    }
}

/// Answer of the external eligibility validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityVerdict {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl EligibilityVerdict {
    pub fn eligible() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    pub fn ineligible(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stub() -> RecoverableTaskStub {
        RecoverableTaskStub {
            registry_id: Uuid::now_v7(),
            task_id: "exec-1".to_string(),
            task_name: "analyze_document".to_string(),
            job_key: None,
            owner_id: Some("user-7".to_string()),
            current_state: TaskState::Running,
            last_heartbeat: Utc::now(),
            recovery_priority: 5,
            progress_percent: 40,
            current_step: Some("extract_text".to_string()),
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(!TaskState::Recovering.is_terminal());
    }

    #[test]
    fn test_discoverable_states() {
        assert!(TaskState::Running.is_discoverable());
        assert!(TaskState::Stale.is_discoverable());
        assert!(!TaskState::Pending.is_discoverable());
        assert!(!TaskState::Completed.is_discoverable());
    }

    #[test]
    fn test_task_state_str_roundtrip() {
        for state in [
            TaskState::Pending,
            TaskState::Running,
            TaskState::Stale,
            TaskState::Recovering,
            TaskState::Completed,
            TaskState::Failed,
        ] {
            assert_eq!(TaskState::parse(state.as_str()), Some(state));
        }
        assert_eq!(TaskState::parse("exploded"), None);
    }

    #[test]
    fn test_checkpoint_validity() {
        let mut cp = Checkpoint {
            job_id: "exec-1".to_string(),
            name: "text_extracted".to_string(),
            progress_percent: 40,
            recoverable_data: json!({ "pages": 12 }),
            db_state: Value::Null,
            file_state: Value::Null,
            created_at: Utc::now(),
        };
        assert!(cp.is_valid());

        cp.recoverable_data = Value::Null;
        assert!(!cp.is_valid());

        cp.recoverable_data = json!({});
        cp.progress_percent = 120;
        assert!(!cp.is_valid());

        cp.progress_percent = 40;
        cp.name.clear();
        assert!(!cp.is_valid());
    }

    #[test]
    fn test_job_key_falls_back_to_kwargs() {
        let mut kwargs = Map::new();
        kwargs.insert("job_key".to_string(), json!("sha256:abc"));
        let task = RecoverableTask {
            stub: stub(),
            args: vec![],
            kwargs,
        };
        assert_eq!(task.job_key(), Some("sha256:abc"));

        let mut keyed = task.clone();
        keyed.stub.job_key = Some("sha256:own".to_string());
        assert_eq!(keyed.job_key(), Some("sha256:own"));
    }

    #[test]
    fn test_recoverable_task_flattens_stub() {
        let task = RecoverableTask {
            stub: stub(),
            args: vec![json!("doc-1")],
            kwargs: Map::new(),
        };
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["task_name"], "analyze_document");
        assert_eq!(value["current_state"], "running");
        assert_eq!(value["args"][0], "doc-1");
    }

    #[test]
    fn test_error_details_omits_empty_optionals() {
        let details = ErrorDetails::new("B", "timeout", "step timed out");
        let value = serde_json::to_value(&details).unwrap();
        assert_eq!(value["step_name"], "B");
        assert!(value.get("context").is_none());
        assert!(value.get("root_cause_kind").is_none());
    }
}

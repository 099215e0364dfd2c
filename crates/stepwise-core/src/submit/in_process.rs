//! In-process job submission: register, then spawn the executor on tokio.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use futures_util::FutureExt;
use serde_json::{Map, Value};
use stepwise_types::job::TaskRegistration;
use tokio::sync::Notify;
use uuid::Uuid;

use super::{JobSubmitter, SubmitError};
use crate::repository::registry::{CheckpointStore, TaskRegistry};
use crate::workflow::executor::{RunOutcome, WorkflowExecutor};
use crate::workflow::persistence::RegistryPersistence;
use crate::workflow::state::{StateBag, IS_RECOVERY, JOB_KEY, RECOVERY};

/// kwarg carrying the registry priority of a submitted job.
pub const RECOVERY_PRIORITY: &str = "recovery_priority";
/// kwarg carrying the owning user or tenant.
pub const OWNER_ID: &str = "owner_id";

/// Outcomes of finished jobs kept for a later [`InProcessSubmitter::wait`].
const FINISHED_RETENTION: usize = 256;

/// Jobs shared between the submitter and the spawned job tasks.
///
/// A job is in `running` from submission until its task ends, then its
/// outcome moves to the bounded `finished` queue.
#[derive(Default)]
struct JobTable {
    running: DashMap<String, Arc<Notify>>,
    finished: Mutex<VecDeque<(String, Option<RunOutcome>)>>,
}

impl JobTable {
    fn finish(&self, execution_id: &str, outcome: Option<RunOutcome>) {
        {
            let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
            finished.push_back((execution_id.to_string(), outcome));
            while finished.len() > FINISHED_RETENTION {
                finished.pop_front();
            }
        }
        if let Some((_, done)) = self.running.remove(execution_id) {
            done.notify_waiters();
        }
    }

    fn take_finished(&self, execution_id: &str) -> Option<Option<RunOutcome>> {
        let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        let index = finished.iter().position(|(id, _)| id == execution_id)?;
        finished.remove(index).map(|(_, outcome)| outcome)
    }
}

/// Runs submitted jobs as tokio tasks in the current process.
///
/// Every registered executor is wired to [`RegistryPersistence`], so jobs
/// heartbeat, checkpoint and finish their registry entry as they run.
pub struct InProcessSubmitter<R, C>
where
    R: TaskRegistry + Clone + 'static,
    C: CheckpointStore + Clone + 'static,
{
    registry: R,
    checkpoints: C,
    workflows: HashMap<String, WorkflowExecutor>,
    jobs: Arc<JobTable>,
}

impl<R, C> InProcessSubmitter<R, C>
where
    R: TaskRegistry + Clone + 'static,
    C: CheckpointStore + Clone + 'static,
{
    pub fn new(registry: R, checkpoints: C) -> Self {
        Self {
            registry,
            checkpoints,
            workflows: HashMap::new(),
            jobs: Arc::new(JobTable::default()),
        }
    }

    /// Make a workflow submittable under its graph name.
    pub fn register(mut self, executor: WorkflowExecutor) -> Self {
        let name = executor.graph().name().to_string();
        let executor = executor.with_persistence(RegistryPersistence::new(
            self.registry.clone(),
            self.checkpoints.clone(),
        ));
        self.workflows.insert(name, executor);
        self
    }

    pub fn workflow_names(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(String::as_str)
    }

    /// Wait for a submitted execution to finish.
    ///
    /// Returns `None` for unknown or already awaited execution IDs, when the
    /// job could not start or panicked, and when its outcome was already
    /// evicted from the finished queue.
    pub async fn wait(&self, execution_id: &str) -> Option<RunOutcome> {
        let done = self
            .jobs
            .running
            .get(execution_id)
            .map(|entry| Arc::clone(entry.value()));
        if let Some(done) = done {
            let notified = done.notified();
            if self.jobs.running.contains_key(execution_id) {
                notified.await;
            }
        }
        self.jobs.take_finished(execution_id).flatten()
    }

    /// Jobs submitted and not yet finished.
    pub fn running_count(&self) -> usize {
        self.jobs.running.len()
    }
}

impl<R, C> JobSubmitter for InProcessSubmitter<R, C>
where
    R: TaskRegistry + Clone + 'static,
    C: CheckpointStore + Clone + 'static,
{
    async fn submit(
        &self,
        step_fn_name: &str,
        job_key: Option<&str>,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<String, SubmitError> {
        let executor = self
            .workflows
            .get(step_fn_name)
            .ok_or_else(|| SubmitError::UnknownWorkflow(step_fn_name.to_string()))?
            .clone();

        let priority = match kwargs.get(RECOVERY_PRIORITY) {
            None | Some(Value::Null) => 0,
            Some(value) => value
                .as_i64()
                .and_then(|p| i32::try_from(p).ok())
                .ok_or_else(|| {
                    SubmitError::InvalidInput(format!("{RECOVERY_PRIORITY} must be an integer"))
                })?,
        };

        let execution_id = Uuid::now_v7().to_string();
        let registration = TaskRegistration {
            task_id: execution_id.clone(),
            task_name: step_fn_name.to_string(),
            job_key: job_key.map(str::to_string),
            owner_id: kwargs.get(OWNER_ID).and_then(Value::as_str).map(str::to_string),
            recovery_priority: priority,
            args: args.to_vec(),
            kwargs: kwargs.clone(),
        };
        self.registry.register(&registration).await?;

        let initial = initial_state(job_key, args, kwargs);
        let entry = resume_entry(&executor, kwargs).unwrap_or_else(|| executor.graph().entry().to_string());

        tracing::info!(
            execution_id = execution_id.as_str(),
            workflow = step_fn_name,
            entry = entry.as_str(),
            is_recovery = initial.is_recovery(),
            "job submitted"
        );

        self.jobs
            .running
            .insert(execution_id.clone(), Arc::new(Notify::new()));
        let jobs = Arc::clone(&self.jobs);
        let job_id = execution_id.clone();
        tokio::spawn(async move {
            let run = AssertUnwindSafe(executor.run_from(&entry, &job_id, initial));
            let outcome = match run.catch_unwind().await {
                Ok(Ok(outcome)) => Some(outcome),
                Ok(Err(e)) => {
                    tracing::warn!(execution_id = job_id.as_str(), error = %e, "job could not start");
                    None
                }
                Err(_) => {
                    tracing::error!(execution_id = job_id.as_str(), "job task panicked");
                    None
                }
            };
            jobs.finish(&job_id, outcome);
        });
        Ok(execution_id)
    }

    async fn ping(&self) -> Result<(), SubmitError> {
        if self.workflows.is_empty() {
            return Err(SubmitError::Unavailable("no workflows registered".to_string()));
        }
        Ok(())
    }
}

/// Seed state for a job: restored checkpoint data first, then kwargs, args
/// and the job key on top.
fn initial_state(job_key: Option<&str>, args: &[Value], kwargs: &Map<String, Value>) -> StateBag {
    let restored = kwargs
        .get(RECOVERY)
        .and_then(|r| r.get("recoverable_data"))
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    let mut fields = restored;
    for (key, value) in kwargs {
        fields.insert(key.clone(), value.clone());
    }
    if !args.is_empty() {
        fields.insert("args".to_string(), Value::Array(args.to_vec()));
    }
    if let Some(key) = job_key {
        fields.insert(JOB_KEY.to_string(), Value::String(key.to_string()));
    }
    if fields.contains_key(RECOVERY) && !fields.contains_key(IS_RECOVERY) {
        fields.insert(IS_RECOVERY.to_string(), Value::Bool(true));
    }
    StateBag::from_fields(fields)
}

/// Step after the checkpoint's milestone, when resuming from one.
fn resume_entry(executor: &WorkflowExecutor, kwargs: &Map<String, Value>) -> Option<String> {
    let milestone = kwargs
        .get(RECOVERY)?
        .get("checkpoint_name")?
        .as_str()?;
    executor
        .graph()
        .resume_point(milestone)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;
    use stepwise_types::job::TaskState;
    use stepwise_types::progress::ProgressRange;

    use crate::repository::memory::InMemoryTaskRegistry;
    use crate::workflow::graph::{StepOptions, WorkflowBuilder};
    use crate::workflow::state::StateDelta;
    use crate::workflow::step::step_fn;

    fn r(start: u8, end: u8) -> ProgressRange {
        ProgressRange::new(start, end).unwrap()
    }

    fn analyze_document() -> WorkflowExecutor {
        let extract = step_fn(|state: StateBag, _progress| async move {
            let doc = state
                .get("args")
                .and_then(|a| a.get(0))
                .and_then(Value::as_str)
                .unwrap_or("none")
                .to_string();
            Ok(StateDelta::new().set("extracted_text", format!("text of {doc}")))
        });
        let summarize = step_fn(|state: StateBag, _progress| async move {
            let text = state.get_str("extracted_text").unwrap_or_default().to_string();
            Ok(StateDelta::new().set("summary", format!("summary: {text}")))
        });
        let handle_error = step_fn(|_state, _progress| async { Ok(StateDelta::new()) });
        let graph = WorkflowBuilder::new("analyze_document")
            .step_with("extract", extract, StepOptions::new(r(0, 50)).milestone())
            .step("summarize", summarize, r(50, 100))
            .step("handle_error", handle_error, r(0, 100))
            .edge("extract", "summarize")
            .end("summarize")
            .entry("extract")
            .error_handler("handle_error")
            .build()
            .unwrap();
        WorkflowExecutor::new(graph)
    }

    #[tokio::test]
    async fn test_submit_registers_and_runs() {
        let registry = Arc::new(InMemoryTaskRegistry::new());
        let submitter = InProcessSubmitter::new(Arc::clone(&registry), Arc::clone(&registry))
            .register(analyze_document());

        let mut kwargs = Map::new();
        kwargs.insert(RECOVERY_PRIORITY.to_string(), json!(4));
        kwargs.insert(OWNER_ID.to_string(), json!("user-1"));
        let id = submitter
            .submit("analyze_document", Some("sha256:abc"), &[json!("doc-1")], &kwargs)
            .await
            .unwrap();

        let outcome = submitter.wait(&id).await.unwrap();
        assert_eq!(outcome.state.get_str("summary"), Some("summary: text of doc-1"));
        assert_eq!(outcome.state.job_key(), Some("sha256:abc"));

        let stub = registry.stub_of_task(&id).unwrap();
        assert_eq!(stub.recovery_priority, 4);
        assert_eq!(stub.owner_id.as_deref(), Some("user-1"));
        assert_eq!(stub.current_state, TaskState::Completed);
    }

    #[tokio::test]
    async fn test_unknown_workflow_and_bad_priority_rejected() {
        let registry = Arc::new(InMemoryTaskRegistry::new());
        let submitter = InProcessSubmitter::new(Arc::clone(&registry), Arc::clone(&registry))
            .register(analyze_document());

        assert!(matches!(
            submitter.submit("nope", None, &[], &Map::new()).await,
            Err(SubmitError::UnknownWorkflow(_))
        ));

        let mut kwargs = Map::new();
        kwargs.insert(RECOVERY_PRIORITY.to_string(), json!("high"));
        assert!(matches!(
            submitter.submit("analyze_document", None, &[], &kwargs).await,
            Err(SubmitError::InvalidInput(_))
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_resume_skips_to_step_after_milestone() {
        let registry = Arc::new(InMemoryTaskRegistry::new());
        let submitter = InProcessSubmitter::new(Arc::clone(&registry), Arc::clone(&registry))
            .register(analyze_document());

        let mut kwargs = Map::new();
        kwargs.insert(
            RECOVERY.to_string(),
            json!({
                "checkpoint_name": "extract",
                "recoverable_data": { "extracted_text": "restored text" },
            }),
        );
        let id = submitter
            .submit("analyze_document", None, &[], &kwargs)
            .await
            .unwrap();
        let outcome = submitter.wait(&id).await.unwrap();

        assert_eq!(outcome.visited, vec!["summarize"]);
        assert_eq!(outcome.state.get_str("summary"), Some("summary: restored text"));
        assert!(outcome.state.is_recovery());
    }

    #[tokio::test]
    async fn test_finished_jobs_leave_running_table_without_wait() {
        let registry = Arc::new(InMemoryTaskRegistry::new());
        let submitter = InProcessSubmitter::new(Arc::clone(&registry), Arc::clone(&registry))
            .register(analyze_document());

        let mut ids = Vec::new();
        for doc in ["doc-1", "doc-2", "doc-3"] {
            let id = submitter
                .submit("analyze_document", None, &[json!(doc)], &Map::new())
                .await
                .unwrap();
            ids.push(id);
        }
        assert_eq!(submitter.running_count(), 3);

        for _ in 0..100 {
            if submitter.running_count() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(submitter.running_count(), 0);
        assert!(submitter.jobs.running.is_empty());
        for id in &ids {
            assert_eq!(registry.stub_of_task(id).unwrap().current_state, TaskState::Completed);
        }

        // a late wait still sees the outcome, once
        let outcome = submitter.wait(&ids[1]).await.unwrap();
        assert_eq!(outcome.state.get_str("summary"), Some("summary: text of doc-2"));
        assert!(submitter.wait(&ids[1]).await.is_none());
        assert!(submitter.wait("unknown").await.is_none());
    }

    #[tokio::test]
    async fn test_ping_requires_workflows() {
        let registry = Arc::new(InMemoryTaskRegistry::new());
        let empty = InProcessSubmitter::new(Arc::clone(&registry), Arc::clone(&registry));
        assert!(empty.ping().await.is_err());
        let ready = empty.register(analyze_document());
        assert!(ready.ping().await.is_ok());
        assert_eq!(ready.workflow_names().collect::<Vec<_>>(), vec!["analyze_document"]);
    }
}

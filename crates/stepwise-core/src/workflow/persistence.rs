//! Persistence callbacks invoked by the executor after every step.
//!
//! The executor calls [`JobPersistence`] at each step boundary:
//! `record_progress` always, `record_checkpoint` after a milestone step
//! succeeds, and `record_finished` once the run ends. Failures are logged by
//! the executor and never abort the job.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use stepwise_types::error::RepositoryError;
use stepwise_types::job::{Checkpoint, TaskState};

use super::executor::RunOutcome;
use super::state::StateBag;
use crate::repository::registry::{CheckpointStore, TaskRegistry};

type BoxFuture<'a> = Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + 'a>>;

pub trait JobPersistence: Send + Sync {
    /// Progress and heartbeat after a step boundary.
    fn record_progress(
        &self,
        job_id: &str,
        step_name: &str,
        percent: u8,
        state: &StateBag,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Durable snapshot after a milestone step.
    fn record_checkpoint(
        &self,
        job_id: &str,
        step_name: &str,
        percent: u8,
        state: &StateBag,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Final status once the run reached a terminal step.
    fn record_finished(
        &self,
        job_id: &str,
        outcome: &RunOutcome,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;
}

/// Object-safe version of [`JobPersistence`].
pub trait JobPersistenceDyn: Send + Sync {
    fn record_progress_boxed<'a>(
        &'a self,
        job_id: &'a str,
        step_name: &'a str,
        percent: u8,
        state: &'a StateBag,
    ) -> BoxFuture<'a>;

    fn record_checkpoint_boxed<'a>(
        &'a self,
        job_id: &'a str,
        step_name: &'a str,
        percent: u8,
        state: &'a StateBag,
    ) -> BoxFuture<'a>;

    fn record_finished_boxed<'a>(&'a self, job_id: &'a str, outcome: &'a RunOutcome) -> BoxFuture<'a>;
}

impl<T: JobPersistence> JobPersistenceDyn for T {
    fn record_progress_boxed<'a>(
        &'a self,
        job_id: &'a str,
        step_name: &'a str,
        percent: u8,
        state: &'a StateBag,
    ) -> BoxFuture<'a> {
        Box::pin(self.record_progress(job_id, step_name, percent, state))
    }

    fn record_checkpoint_boxed<'a>(
        &'a self,
        job_id: &'a str,
        step_name: &'a str,
        percent: u8,
        state: &'a StateBag,
    ) -> BoxFuture<'a> {
        Box::pin(self.record_checkpoint(job_id, step_name, percent, state))
    }

    fn record_finished_boxed<'a>(&'a self, job_id: &'a str, outcome: &'a RunOutcome) -> BoxFuture<'a> {
        Box::pin(self.record_finished(job_id, outcome))
    }
}

/// Type-erased persistence shared by clones of an executor.
#[derive(Clone)]
pub struct BoxJobPersistence {
    inner: Arc<dyn JobPersistenceDyn>,
}

impl BoxJobPersistence {
    pub fn new<T: JobPersistence + 'static>(persistence: T) -> Self {
        Self {
            inner: Arc::new(persistence),
        }
    }

    pub async fn record_progress(
        &self,
        job_id: &str,
        step_name: &str,
        percent: u8,
        state: &StateBag,
    ) -> Result<(), RepositoryError> {
        self.inner
            .record_progress_boxed(job_id, step_name, percent, state)
            .await
    }

    pub async fn record_checkpoint(
        &self,
        job_id: &str,
        step_name: &str,
        percent: u8,
        state: &StateBag,
    ) -> Result<(), RepositoryError> {
        self.inner
            .record_checkpoint_boxed(job_id, step_name, percent, state)
            .await
    }

    pub async fn record_finished(&self, job_id: &str, outcome: &RunOutcome) -> Result<(), RepositoryError> {
        self.inner.record_finished_boxed(job_id, outcome).await
    }
}

impl std::fmt::Debug for BoxJobPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxJobPersistence").finish_non_exhaustive()
    }
}

/// Persists nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPersistence;

impl JobPersistence for NoopPersistence {
    async fn record_progress(&self, _: &str, _: &str, _: u8, _: &StateBag) -> Result<(), RepositoryError> {
        Ok(())
    }

    async fn record_checkpoint(&self, _: &str, _: &str, _: u8, _: &StateBag) -> Result<(), RepositoryError> {
        Ok(())
    }

    async fn record_finished(&self, _: &str, _: &RunOutcome) -> Result<(), RepositoryError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RegistryPersistence
// ---------------------------------------------------------------------------

/// Writes heartbeats, checkpoints and final status to the task registry.
///
/// Generic over the registry and checkpoint store so it works with the
/// SQLite backend and the in-memory one alike.
pub struct RegistryPersistence<R: TaskRegistry, C: CheckpointStore> {
    registry: R,
    checkpoints: C,
}

impl<R: TaskRegistry, C: CheckpointStore> RegistryPersistence<R, C> {
    pub fn new(registry: R, checkpoints: C) -> Self {
        Self {
            registry,
            checkpoints,
        }
    }
}

impl<R: TaskRegistry, C: CheckpointStore> JobPersistence for RegistryPersistence<R, C> {
    async fn record_progress(
        &self,
        job_id: &str,
        step_name: &str,
        percent: u8,
        _state: &StateBag,
    ) -> Result<(), RepositoryError> {
        self.registry.heartbeat(job_id, percent, Some(step_name)).await
    }

    async fn record_checkpoint(
        &self,
        job_id: &str,
        step_name: &str,
        percent: u8,
        state: &StateBag,
    ) -> Result<(), RepositoryError> {
        let checkpoint = Checkpoint {
            job_id: job_id.to_string(),
            name: step_name.to_string(),
            progress_percent: percent,
            recoverable_data: state.to_json(),
            db_state: json!({ "completed_step": step_name }),
            file_state: Value::Null,
            created_at: Utc::now(),
        };
        self.checkpoints.save_checkpoint(&checkpoint).await?;
        tracing::debug!(job_id, step = step_name, percent, "checkpoint saved");
        Ok(())
    }

    async fn record_finished(&self, job_id: &str, outcome: &RunOutcome) -> Result<(), RepositoryError> {
        let state = if outcome.is_failed() {
            TaskState::Failed
        } else {
            TaskState::Completed
        };
        self.registry.finish(job_id, state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryTaskRegistry;
    use serde_json::Map;
    use stepwise_types::job::TaskRegistration;

    #[tokio::test]
    async fn test_registry_persistence_heartbeats_and_checkpoints() {
        let registry = Arc::new(InMemoryTaskRegistry::new());
        registry
            .register(&TaskRegistration {
                task_id: "exec-1".to_string(),
                task_name: "analyze".to_string(),
                job_key: None,
                owner_id: None,
                recovery_priority: 0,
                args: vec![],
                kwargs: Map::new(),
            })
            .await
            .unwrap();

        let persistence = BoxJobPersistence::new(RegistryPersistence::new(
            Arc::clone(&registry),
            Arc::clone(&registry),
        ));
        let state = StateBag::new().with("extracted_text", "hello");

        persistence
            .record_progress("exec-1", "extract_text", 40, &state)
            .await
            .unwrap();
        persistence
            .record_checkpoint("exec-1", "extract_text", 40, &state)
            .await
            .unwrap();

        let stub = registry.stub_of_task("exec-1").unwrap();
        assert_eq!(stub.progress_percent, 40);
        assert_eq!(stub.current_step.as_deref(), Some("extract_text"));

        let cp = registry.get_latest_checkpoint("exec-1").await.unwrap().unwrap();
        assert!(cp.is_valid());
        assert_eq!(cp.recoverable_data["extracted_text"], "hello");
    }

    #[tokio::test]
    async fn test_heartbeat_for_unknown_task_errors() {
        let registry = Arc::new(InMemoryTaskRegistry::new());
        let persistence = RegistryPersistence::new(Arc::clone(&registry), Arc::clone(&registry));
        let result = persistence
            .record_progress("ghost", "a", 10, &StateBag::new())
            .await;
        assert!(matches!(result, Err(RepositoryError::NotFound)));
    }
}

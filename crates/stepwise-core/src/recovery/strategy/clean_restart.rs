//! Restart an interrupted job from scratch, skipping stages whose output is
//! already durable.

use std::time::Duration;

use serde_json::{json, Value};
use stepwise_types::job::RecoverableTask;
use stepwise_types::recovery::{RecoveryResult, StrategyKind};

use super::{recovery_kwargs, RecoveryStrategy};
use crate::recovery::RecoveryError;
use crate::repository::artifact::ArtifactRepository;
use crate::submit::BoxJobSubmitter;

/// Prefix of the boolean kwargs telling steps to skip a persisted stage.
pub const SKIP_PREFIX: &str = "skip_";

pub struct CleanRestart<A: ArtifactRepository> {
    artifacts: A,
    submitter: BoxJobSubmitter,
    stage_time_estimate: Duration,
}

impl<A: ArtifactRepository> CleanRestart<A> {
    pub fn new(artifacts: A, submitter: BoxJobSubmitter, stage_time_estimate: Duration) -> Self {
        Self {
            artifacts,
            submitter,
            stage_time_estimate,
        }
    }

    /// Persisted stages for the task's job key. Lookup failures degrade to
    /// a full restart.
    async fn persisted_stages(&self, task: &RecoverableTask) -> Vec<String> {
        let Some(job_key) = task.job_key() else {
            return Vec::new();
        };
        match self.artifacts.completed_stages(job_key).await {
            Ok(stages) => stages,
            Err(e) => {
                tracing::warn!(
                    task_id = task.task_id(),
                    job_key,
                    error = %e,
                    "could not load persisted stages, restarting fully"
                );
                Vec::new()
            }
        }
    }
}

impl<A: ArtifactRepository> RecoveryStrategy for CleanRestart<A> {
    fn kind(&self) -> StrategyKind {
        StrategyKind::CleanRestart
    }

    async fn recover(&self, task: &RecoverableTask) -> Result<RecoveryResult, RecoveryError> {
        let stages = self.persisted_stages(task).await;

        let mut kwargs = recovery_kwargs(
            task,
            json!({
                "mode": self.kind().name(),
                "skip_stages": stages,
                "original_task_id": task.task_id(),
            }),
        );
        for stage in &stages {
            kwargs.insert(format!("{SKIP_PREFIX}{stage}"), Value::Bool(true));
        }

        let execution_id = self
            .submitter
            .submit(task.task_name(), task.job_key(), &task.args, &kwargs)
            .await?;

        let skipped = u32::try_from(stages.len()).unwrap_or(u32::MAX);
        let message = if stages.is_empty() {
            "restarted from the beginning".to_string()
        } else {
            format!("restarted skipping {} persisted stage(s)", stages.len())
        };
        tracing::info!(
            task_id = task.task_id(),
            skipped_stages = stages.len(),
            new_execution_id = execution_id.as_str(),
            "clean restart submitted"
        );

        Ok(RecoveryResult::succeeded(self.kind(), message)
            .with_execution_id(execution_id)
            .with_time_saved(self.stage_time_estimate * skipped))
    }
}

//! Resume an interrupted job from its latest checkpoint.

use std::time::Duration;

use serde_json::json;
use stepwise_types::job::RecoverableTask;
use stepwise_types::recovery::{RecoveryResult, StrategyKind};

use super::{recovery_kwargs, RecoveryStrategy};
use crate::recovery::RecoveryError;
use crate::repository::registry::CheckpointStore;
use crate::submit::BoxJobSubmitter;

pub struct CheckpointResume<C: CheckpointStore> {
    checkpoints: C,
    submitter: BoxJobSubmitter,
    estimated_job_duration: Duration,
}

impl<C: CheckpointStore> CheckpointResume<C> {
    pub fn new(checkpoints: C, submitter: BoxJobSubmitter, estimated_job_duration: Duration) -> Self {
        Self {
            checkpoints,
            submitter,
            estimated_job_duration,
        }
    }
}

impl<C: CheckpointStore> RecoveryStrategy for CheckpointResume<C> {
    fn kind(&self) -> StrategyKind {
        StrategyKind::CheckpointResume
    }

    async fn recover(&self, task: &RecoverableTask) -> Result<RecoveryResult, RecoveryError> {
        let checkpoint = self
            .checkpoints
            .get_latest_checkpoint(task.task_id())
            .await?
            .ok_or_else(|| RecoveryError::NoCheckpoint(task.task_id().to_string()))?;
        if !checkpoint.is_valid() {
            return Err(RecoveryError::InvalidCheckpoint {
                task_id: task.task_id().to_string(),
                name: checkpoint.name,
            });
        }

        let kwargs = recovery_kwargs(
            task,
            json!({
                "checkpoint_name": checkpoint.name,
                "progress_percent": checkpoint.progress_percent,
                "recoverable_data": checkpoint.recoverable_data,
                "db_state": checkpoint.db_state,
                "file_state": checkpoint.file_state,
                "original_task_id": task.task_id(),
            }),
        );
        let execution_id = self
            .submitter
            .submit(task.task_name(), task.job_key(), &task.args, &kwargs)
            .await?;

        let saved = self.estimated_job_duration * u32::from(checkpoint.progress_percent.min(100)) / 100;
        tracing::info!(
            task_id = task.task_id(),
            checkpoint = checkpoint.name.as_str(),
            new_execution_id = execution_id.as_str(),
            "resumed from checkpoint"
        );

        Ok(RecoveryResult::succeeded(
            self.kind(),
            format!(
                "resumed from checkpoint '{}' at {}%",
                checkpoint.name, checkpoint.progress_percent
            ),
        )
        .with_execution_id(execution_id)
        .with_resumed_from(checkpoint.name)
        .with_time_saved(saved))
    }
}

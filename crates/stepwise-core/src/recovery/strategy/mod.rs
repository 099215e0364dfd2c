//! Recovery strategies.
//!
//! Each strategy re-enters an interrupted task in its own way and reports a
//! [`RecoveryResult`]. Strategies that rerun work go back through the
//! [`JobSubmitter`](crate::submit::JobSubmitter) port, so a recovered job
//! runs exactly like a freshly submitted one.

pub mod checkpoint_resume;
pub mod clean_restart;
pub mod validate_only;

pub use checkpoint_resume::CheckpointResume;
pub use clean_restart::CleanRestart;
pub use validate_only::ValidateOnly;

use std::future::Future;

use serde_json::{Map, Value};
use stepwise_types::config::RecoveryConfig;
use stepwise_types::job::RecoverableTask;
use stepwise_types::recovery::{RecoveryResult, StrategyKind};

use super::RecoveryError;
use crate::repository::artifact::ArtifactRepository;
use crate::repository::registry::CheckpointStore;
use crate::submit::BoxJobSubmitter;
use crate::workflow::state::{IS_RECOVERY, RECOVERY};

pub trait RecoveryStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Re-enter `task`. An `Err` means the task could not be recovered this
    /// way; the caller turns it into a failed [`RecoveryResult`].
    fn recover(
        &self,
        task: &RecoverableTask,
    ) -> impl Future<Output = Result<RecoveryResult, RecoveryError>> + Send;
}

/// The three strategies, dispatched by [`StrategyKind`].
pub struct StrategySet<C: CheckpointStore, A: ArtifactRepository> {
    checkpoint_resume: CheckpointResume<C>,
    clean_restart: CleanRestart<A>,
    validate_only: ValidateOnly<A>,
}

impl<C, A> StrategySet<C, A>
where
    C: CheckpointStore,
    A: ArtifactRepository + Clone,
{
    pub fn new(checkpoints: C, artifacts: A, submitter: BoxJobSubmitter, config: &RecoveryConfig) -> Self {
        Self {
            checkpoint_resume: CheckpointResume::new(
                checkpoints,
                submitter.clone(),
                config.estimated_job_duration(),
            ),
            clean_restart: CleanRestart::new(artifacts.clone(), submitter, config.stage_time_estimate()),
            validate_only: ValidateOnly::new(artifacts, config.estimated_job_duration()),
        }
    }

    /// Run the strategy for `kind`, folding errors into a failed result.
    pub async fn run(&self, kind: StrategyKind, task: &RecoverableTask) -> RecoveryResult {
        let attempt = match kind {
            StrategyKind::CheckpointResume => self.checkpoint_resume.recover(task).await,
            StrategyKind::CleanRestart => self.clean_restart.recover(task).await,
            StrategyKind::ValidateOnly => self.validate_only.recover(task).await,
        };
        attempt.unwrap_or_else(|e| {
            tracing::warn!(task_id = task.task_id(), strategy = %kind, error = %e, "recovery strategy failed");
            RecoveryResult::failed(kind, format!("{kind} could not recover the task"), e.to_string())
        })
    }
}

/// Original kwargs plus the recovery marker and `_recovery` payload.
pub(crate) fn recovery_kwargs(task: &RecoverableTask, recovery: Value) -> Map<String, Value> {
    let mut kwargs = task.kwargs.clone();
    kwargs.insert(RECOVERY.to_string(), recovery);
    kwargs.insert(IS_RECOVERY.to_string(), Value::Bool(true));
    kwargs
}

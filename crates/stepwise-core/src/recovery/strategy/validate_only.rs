//! Confirm a nearly finished job already produced its result.

use std::time::Duration;

use stepwise_types::job::RecoverableTask;
use stepwise_types::recovery::{RecoveryResult, StrategyKind};

use super::RecoveryStrategy;
use crate::recovery::RecoveryError;
use crate::repository::artifact::ArtifactRepository;

/// Read-only: looks up the terminal result and never runs a step.
pub struct ValidateOnly<A: ArtifactRepository> {
    artifacts: A,
    estimated_job_duration: Duration,
}

impl<A: ArtifactRepository> ValidateOnly<A> {
    pub fn new(artifacts: A, estimated_job_duration: Duration) -> Self {
        Self {
            artifacts,
            estimated_job_duration,
        }
    }
}

impl<A: ArtifactRepository> RecoveryStrategy for ValidateOnly<A> {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ValidateOnly
    }

    async fn recover(&self, task: &RecoverableTask) -> Result<RecoveryResult, RecoveryError> {
        let job_key = task
            .job_key()
            .ok_or_else(|| RecoveryError::MissingJobKey(task.task_id().to_string()))?;
        if self.artifacts.find_terminal_result(job_key).await?.is_none() {
            return Err(RecoveryError::NoTerminalResult(job_key.to_string()));
        }

        tracing::info!(task_id = task.task_id(), job_key, "terminal result validated");
        Ok(
            RecoveryResult::succeeded(self.kind(), "terminal result already persisted")
                .with_resumed_from(job_key)
                .with_time_saved(self.estimated_job_duration),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::recovery::strategy::tests::task;
    use crate::repository::memory::InMemoryArtifactRepository;

    #[tokio::test]
    async fn test_existing_result_validates() {
        let artifacts = Arc::new(InMemoryArtifactRepository::new());
        artifacts
            .record_terminal_result("sha256:abc", &json!({ "summary": "done" }))
            .await
            .unwrap();
        let strategy = ValidateOnly::new(Arc::clone(&artifacts), Duration::from_secs(600));

        let result = strategy.recover(&task("exec-1", Some("sha256:abc"), 97)).await.unwrap();
        assert!(result.success);
        assert!(result.new_execution_id.is_none());
        assert_eq!(result.estimated_time_saved, Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_missing_result_or_key_fails() {
        let strategy = ValidateOnly::new(InMemoryArtifactRepository::new(), Duration::from_secs(600));

        let no_result = strategy.recover(&task("exec-1", Some("sha256:abc"), 97)).await;
        assert!(matches!(no_result, Err(RecoveryError::NoTerminalResult(_))));

        let no_key = strategy.recover(&task("exec-1", None, 97)).await;
        assert!(matches!(no_key, Err(RecoveryError::MissingJobKey(_))));
    }
}

//! Idempotent short-circuit for jobs whose result already exists.
//!
//! Placed right after the entry of a workflow, [`AlreadyProcessedStep`] looks
//! up a terminal result for the job key. Its router sends processed jobs
//! straight to the success terminal and everything else down the normal
//! pipeline. The lookup is read-only, so repeating it is harmless.

use super::progress::StepProgress;
use super::router::Router;
use super::state::{StateBag, StateDelta};
use super::step::{Step, StepFailure};
use crate::repository::artifact::ArtifactRepository;

/// Set to `true` when a terminal result was found.
pub const ALREADY_PROCESSED: &str = "already_processed";
/// The stored terminal result, when found.
pub const RESULT: &str = "result";

pub struct AlreadyProcessedStep<A: ArtifactRepository> {
    artifacts: A,
}

impl<A: ArtifactRepository> AlreadyProcessedStep<A> {
    pub fn new(artifacts: A) -> Self {
        Self { artifacts }
    }

    /// Router pairing: processed jobs go to `done`, others to `process`.
    pub fn router(done: impl Into<String>, process: impl Into<String>) -> Router {
        Router::on_flag(ALREADY_PROCESSED, done, process)
    }
}

impl<A: ArtifactRepository> Step for AlreadyProcessedStep<A> {
    async fn execute(&self, state: &StateBag, _progress: &StepProgress) -> Result<StateDelta, StepFailure> {
        let Some(job_key) = state.job_key() else {
            return Ok(StateDelta::new().set(ALREADY_PROCESSED, false));
        };
        match self.artifacts.find_terminal_result(job_key).await {
            Ok(Some(result)) => {
                tracing::info!(job_key, "terminal result exists, short-circuiting");
                Ok(StateDelta::new()
                    .set(ALREADY_PROCESSED, true)
                    .set(RESULT, result))
            }
            Ok(None) => Ok(StateDelta::new().set(ALREADY_PROCESSED, false)),
            Err(e) => {
                // A failed lookup must not fail the job.
                tracing::warn!(job_key, error = %e, "terminal result lookup failed, processing normally");
                Ok(StateDelta::new().set(ALREADY_PROCESSED, false))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryArtifactRepository;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_found_result_short_circuits() {
        let artifacts = Arc::new(InMemoryArtifactRepository::new());
        artifacts
            .record_terminal_result("sha256:abc", &json!({ "summary": "ok" }))
            .await
            .unwrap();
        let step = AlreadyProcessedStep::new(Arc::clone(&artifacts));
        let state = StateBag::new().with("job_key", "sha256:abc");

        let first = step.execute(&state, &StepProgress::detached()).await.unwrap();
        let second = step.execute(&state, &StepProgress::detached()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.get(ALREADY_PROCESSED), Some(&json!(true)));
        assert_eq!(first.get(RESULT), Some(&json!({ "summary": "ok" })));

        let mut bag = state.clone();
        bag.apply(&first, &Default::default());
        let router = AlreadyProcessedStep::<Arc<InMemoryArtifactRepository>>::router("finalize", "extract");
        assert_eq!(router.resolve(&bag), Ok("finalize"));
    }

    #[tokio::test]
    async fn test_missing_result_or_key_continues() {
        let step = AlreadyProcessedStep::new(InMemoryArtifactRepository::new());
        let keyed = StateBag::new().with("job_key", "sha256:new");
        let delta = step.execute(&keyed, &StepProgress::detached()).await.unwrap();
        assert_eq!(delta.get(ALREADY_PROCESSED), Some(&json!(false)));

        let unkeyed = step.execute(&StateBag::new(), &StepProgress::detached()).await.unwrap();
        assert_eq!(unkeyed.get(ALREADY_PROCESSED), Some(&json!(false)));
    }
}

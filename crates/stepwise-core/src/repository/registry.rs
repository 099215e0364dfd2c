//! Task registry and checkpoint store traits.
//!
//! The task registry is the durable record of every started job. The executor
//! registers and heartbeats entries; after a restart the recovery
//! orchestrator discovers interrupted entries, claims them and records how
//! they were resolved.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use stepwise_types::error::RepositoryError;
use stepwise_types::job::{
    Checkpoint, EligibilityVerdict, RecoverableTask, RecoverableTaskStub, TaskRegistration,
    TaskState,
};
use uuid::Uuid;

/// Claims after which an entry is no longer eligible for recovery.
pub const MAX_RECOVERY_ATTEMPTS: u32 = 3;

pub trait TaskRegistry: Send + Sync {
    /// Cheap connectivity check.
    fn ping(&self) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Create a `Running` entry for a new execution. Returns its registry ID.
    fn register(
        &self,
        registration: &TaskRegistration,
    ) -> impl Future<Output = Result<Uuid, RepositoryError>> + Send;

    /// Entries in `Running` or `Stale` whose heartbeat is older than
    /// `stale_after`. Arguments are not loaded.
    fn discover_recoverable(
        &self,
        stale_after: Duration,
    ) -> impl Future<Output = Result<Vec<RecoverableTaskStub>, RepositoryError>> + Send;

    /// Load an entry including its stored arguments.
    fn get_full_task(
        &self,
        registry_id: Uuid,
    ) -> impl Future<Output = Result<Option<RecoverableTask>, RepositoryError>> + Send;

    /// Move an entry to `state`, recording how it was resolved
    /// (e.g. `superseded_by:<execution id>`).
    fn update_state(
        &self,
        registry_id: Uuid,
        state: TaskState,
        resolution: Option<&str>,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Refresh the heartbeat and progress of a running execution.
    fn heartbeat(
        &self,
        task_id: &str,
        progress_percent: u8,
        current_step: Option<&str>,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Mark a running execution as finished. Entries already in a terminal
    /// state are left untouched.
    fn finish(
        &self,
        task_id: &str,
        state: TaskState,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// Atomically move `Running | Stale -> Recovering`. Returns `false` when
    /// another instance won the claim or the entry is no longer discoverable.
    fn claim_for_recovery(
        &self,
        registry_id: Uuid,
        claimant: &str,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Move a `Recovering` entry held by `claimant` to its final `state`.
    /// Returns `false` when the entry is no longer recovering under that claim.
    fn resolve_claim(
        &self,
        registry_id: Uuid,
        claimant: &str,
        state: TaskState,
        resolution: &str,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Decide whether an entry may be recovered at all.
    fn validate_recovery_eligibility(
        &self,
        registry_id: Uuid,
    ) -> impl Future<Output = Result<EligibilityVerdict, RepositoryError>> + Send;
}

/// Eligibility rules shared by every registry backend.
pub fn eligibility_of(
    state: TaskState,
    task_name: &str,
    recovery_attempts: u32,
    claimed_by: Option<&str>,
) -> EligibilityVerdict {
    if state.is_terminal() {
        return EligibilityVerdict::ineligible(format!("task already {}", state.as_str()));
    }
    if state == TaskState::Recovering {
        return EligibilityVerdict::ineligible(format!(
            "task is being recovered by {}",
            claimed_by.unwrap_or("another instance")
        ));
    }
    if !state.is_discoverable() {
        return EligibilityVerdict::ineligible(format!("task is {}", state.as_str()));
    }
    if task_name.is_empty() {
        return EligibilityVerdict::ineligible("task has no step function name");
    }
    if recovery_attempts >= MAX_RECOVERY_ATTEMPTS {
        return EligibilityVerdict::ineligible(format!(
            "recovery already attempted {recovery_attempts} times"
        ));
    }
    EligibilityVerdict::eligible()
}

pub trait CheckpointStore: Send + Sync {
    fn save_checkpoint(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;

    /// The most recent valid checkpoint of a job (see [`Checkpoint::is_valid`]).
    fn get_latest_checkpoint(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send;
}

impl<T: TaskRegistry> TaskRegistry for Arc<T> {
    fn ping(&self) -> impl Future<Output = Result<(), RepositoryError>> + Send {
        (**self).ping()
    }

    fn register(
        &self,
        registration: &TaskRegistration,
    ) -> impl Future<Output = Result<Uuid, RepositoryError>> + Send {
        (**self).register(registration)
    }

    fn discover_recoverable(
        &self,
        stale_after: Duration,
    ) -> impl Future<Output = Result<Vec<RecoverableTaskStub>, RepositoryError>> + Send {
        (**self).discover_recoverable(stale_after)
    }

    fn get_full_task(
        &self,
        registry_id: Uuid,
    ) -> impl Future<Output = Result<Option<RecoverableTask>, RepositoryError>> + Send {
        (**self).get_full_task(registry_id)
    }

    fn update_state(
        &self,
        registry_id: Uuid,
        state: TaskState,
        resolution: Option<&str>,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send {
        (**self).update_state(registry_id, state, resolution)
    }

    fn heartbeat(
        &self,
        task_id: &str,
        progress_percent: u8,
        current_step: Option<&str>,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send {
        (**self).heartbeat(task_id, progress_percent, current_step)
    }

    fn finish(
        &self,
        task_id: &str,
        state: TaskState,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send {
        (**self).finish(task_id, state)
    }

    fn claim_for_recovery(
        &self,
        registry_id: Uuid,
        claimant: &str,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send {
        (**self).claim_for_recovery(registry_id, claimant)
    }

    fn resolve_claim(
        &self,
        registry_id: Uuid,
        claimant: &str,
        state: TaskState,
        resolution: &str,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send {
        (**self).resolve_claim(registry_id, claimant, state, resolution)
    }

    fn validate_recovery_eligibility(
        &self,
        registry_id: Uuid,
    ) -> impl Future<Output = Result<EligibilityVerdict, RepositoryError>> + Send {
        (**self).validate_recovery_eligibility(registry_id)
    }
}

impl<T: CheckpointStore> CheckpointStore for Arc<T> {
    fn save_checkpoint(
        &self,
        checkpoint: &Checkpoint,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send {
        (**self).save_checkpoint(checkpoint)
    }

    fn get_latest_checkpoint(
        &self,
        job_id: &str,
    ) -> impl Future<Output = Result<Option<Checkpoint>, RepositoryError>> + Send {
        (**self).get_latest_checkpoint(job_id)
    }
}

//! Startup recovery orchestrator.
//!
//! Runs once when the process starts and walks through
//! `HealthCheck -> Discover -> ValidateAndPlan -> Execute -> Done`:
//!
//! 1. Ping the task registry (fatal) and the job submitter (warning only).
//! 2. Discover `Running`/`Stale` entries whose heartbeat expired.
//! 3. Ask the registry whether each one may be recovered and pick a strategy.
//! 4. Execute the plans by descending priority in batches of `batch_size`,
//!    concurrently within a batch, sleeping `batch_delay` between batches.
//!
//! Each task is claimed atomically right before its strategy runs, so two
//! orchestrators sharing a registry never recover the same task twice.
//! Failures and panics are contained per task and never abort the pass.

use std::cmp::Reverse;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::FutureExt;
use futures_util::future::join_all;
use stepwise_types::config::RecoveryConfig;
use stepwise_types::event::EngineEvent;
use stepwise_types::job::{RecoverableTaskStub, TaskState};
use stepwise_types::recovery::{
    RecoveryResults, StrategyKind, TaskDisposition, TaskRecoveryOutcome,
};
use tracing::Instrument;
use uuid::Uuid;

use super::policy::StrategySelector;
use super::strategy::StrategySet;
use crate::event::bus::EventBus;
use crate::repository::artifact::ArtifactRepository;
use crate::repository::registry::{CheckpointStore, TaskRegistry};
use crate::submit::BoxJobSubmitter;

/// Resolution recorded for tasks whose result was validated in place.
pub const VALIDATED_RESULT: &str = "validated_result";
/// Prefix of the resolution recorded for resubmitted tasks.
pub const SUPERSEDED_BY: &str = "superseded_by:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    Idle,
    HealthCheck,
    Discover,
    ValidateAndPlan,
    Execute,
    Done,
}

impl RecoveryPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryPhase::Idle => "idle",
            RecoveryPhase::HealthCheck => "health_check",
            RecoveryPhase::Discover => "discover",
            RecoveryPhase::ValidateAndPlan => "validate_and_plan",
            RecoveryPhase::Execute => "execute",
            RecoveryPhase::Done => "done",
        }
    }
}

/// An eligible task and the strategy chosen for it.
#[derive(Debug, Clone)]
pub struct RecoveryPlan {
    pub stub: RecoverableTaskStub,
    pub strategy: StrategyKind,
    pub has_valid_checkpoint: bool,
}

pub struct RecoveryOrchestrator<R, C, A>
where
    R: TaskRegistry,
    C: CheckpointStore + Clone,
    A: ArtifactRepository + Clone,
{
    registry: R,
    checkpoints: C,
    strategies: StrategySet<C, A>,
    submitter: BoxJobSubmitter,
    selector: StrategySelector,
    config: RecoveryConfig,
    instance_id: String,
    events: EventBus,
    phase: Mutex<RecoveryPhase>,
}

impl<R, C, A> RecoveryOrchestrator<R, C, A>
where
    R: TaskRegistry,
    C: CheckpointStore + Clone,
    A: ArtifactRepository + Clone,
{
    pub fn new(
        registry: R,
        checkpoints: C,
        artifacts: A,
        submitter: BoxJobSubmitter,
        config: RecoveryConfig,
    ) -> Self {
        let strategies = StrategySet::new(checkpoints.clone(), artifacts, submitter.clone(), &config);
        Self {
            registry,
            checkpoints,
            strategies,
            submitter,
            selector: StrategySelector::from_config(&config),
            config,
            instance_id: format!("recovery-{}", Uuid::now_v7()),
            events: EventBus::default(),
            phase: Mutex::new(RecoveryPhase::Idle),
        }
    }

    /// Name recorded as the claimant of every task this instance recovers.
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn phase(&self) -> RecoveryPhase {
        match self.phase.lock() {
            Ok(phase) => *phase,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Run one recovery pass. Never fails: fatal conditions are reported via
    /// [`RecoveryResults::aborted_reason`].
    pub async fn run_startup_recovery(&self) -> RecoveryResults {
        let span = tracing::info_span!("recovery_pass", instance_id = self.instance_id.as_str());
        async {
            self.events.publish(EngineEvent::RecoveryPassStarted {
                instance_id: self.instance_id.clone(),
            });

            let results = self.pass().await;
            self.enter(RecoveryPhase::Done);

            self.events.publish(EngineEvent::RecoveryPassFinished {
                instance_id: self.instance_id.clone(),
                recovered: results.recovered,
                failed: results.failed,
                skipped: results.skipped,
            });
            tracing::info!(
                discovered = results.discovered,
                recovered = results.recovered,
                failed = results.failed,
                skipped = results.skipped,
                batches = results.batches.len(),
                time_saved_secs = results.total_estimated_time_saved.as_secs(),
                aborted = results.aborted_reason.as_deref(),
                "recovery pass finished"
            );
            results
        }
        .instrument(span)
        .await
    }

    async fn pass(&self) -> RecoveryResults {
        self.enter(RecoveryPhase::HealthCheck);
        if let Err(e) = self.registry.ping().await {
            tracing::error!(error = %e, "task registry unreachable, skipping recovery");
            return RecoveryResults::aborted(format!("task registry unreachable: {e}"));
        }
        if let Err(e) = self.submitter.ping().await {
            tracing::warn!(error = %e, "job submitter not ready, resubmissions may fail");
        }

        self.enter(RecoveryPhase::Discover);
        let stubs = match self.registry.discover_recoverable(self.config.stale_after()).await {
            Ok(stubs) => stubs,
            Err(e) => {
                tracing::error!(error = %e, "task discovery failed, skipping recovery");
                return RecoveryResults::aborted(format!("task discovery failed: {e}"));
            }
        };
        let mut results = RecoveryResults {
            discovered: stubs.len(),
            ..RecoveryResults::default()
        };
        if stubs.is_empty() {
            tracing::info!("no interrupted tasks found");
            return results;
        }
        tracing::info!(count = stubs.len(), "discovered interrupted tasks");

        self.enter(RecoveryPhase::ValidateAndPlan);
        let mut plans = Vec::with_capacity(stubs.len());
        for stub in stubs {
            match self.plan(stub).await {
                Ok(plan) => plans.push(plan),
                Err(outcome) => self.record(&mut results, outcome, None),
            }
        }

        self.enter(RecoveryPhase::Execute);
        plans.sort_by_key(|plan| Reverse(plan.stub.recovery_priority));
        for (index, batch) in plans.chunks(self.config.batch_size.max(1)).enumerate() {
            if index > 0 {
                tokio::time::sleep(self.config.batch_delay()).await;
            }
            tracing::info!(batch = index + 1, size = batch.len(), "executing recovery batch");
            results.batches.push(batch.len());

            let outcomes = join_all(batch.iter().map(|plan| self.execute_contained(plan))).await;
            for (plan, outcome) in batch.iter().zip(outcomes) {
                self.record(&mut results, outcome, Some(plan.strategy));
            }
        }
        results
    }

    /// Eligibility check and strategy selection for one task.
    async fn plan(&self, stub: RecoverableTaskStub) -> Result<RecoveryPlan, TaskRecoveryOutcome> {
        let verdict = match self.registry.validate_recovery_eligibility(stub.registry_id).await {
            Ok(verdict) => verdict,
            Err(e) => {
                tracing::warn!(task_id = stub.task_id.as_str(), error = %e, "eligibility check failed");
                return Err(outcome(
                    &stub,
                    TaskDisposition::Errored {
                        error: format!("eligibility check failed: {e}"),
                    },
                ));
            }
        };
        if !verdict.valid {
            let reason = verdict
                .reason
                .unwrap_or_else(|| "not eligible for recovery".to_string());
            tracing::info!(task_id = stub.task_id.as_str(), reason = reason.as_str(), "skipping task");
            return Err(outcome(&stub, TaskDisposition::Skipped { reason }));
        }

        let has_valid_checkpoint = match self.checkpoints.get_latest_checkpoint(&stub.task_id).await {
            Ok(checkpoint) => checkpoint.is_some_and(|cp| cp.is_valid()),
            Err(e) => {
                tracing::warn!(task_id = stub.task_id.as_str(), error = %e, "checkpoint lookup failed");
                false
            }
        };
        let strategy = self.selector.select(stub.progress_percent, has_valid_checkpoint);
        tracing::debug!(
            task_id = stub.task_id.as_str(),
            progress = stub.progress_percent,
            has_valid_checkpoint,
            strategy = %strategy,
            "planned recovery"
        );
        Ok(RecoveryPlan {
            stub,
            strategy,
            has_valid_checkpoint,
        })
    }

    /// Execute one plan with panics contained to the task.
    async fn execute_contained(&self, plan: &RecoveryPlan) -> TaskRecoveryOutcome {
        let claimed = AtomicBool::new(false);
        let span = tracing::info_span!(
            "recover_task",
            task_id = plan.stub.task_id.as_str(),
            strategy = %plan.strategy,
        );
        let attempt = AssertUnwindSafe(self.execute(plan, &claimed))
            .catch_unwind()
            .instrument(span)
            .await;

        let disposition = match attempt {
            Ok(disposition) => disposition,
            Err(_) => {
                tracing::error!(task_id = plan.stub.task_id.as_str(), "recovery attempt panicked");
                if claimed.load(Ordering::SeqCst) {
                    self.mark(plan.stub.registry_id, TaskState::Failed, "recovery_panicked")
                        .await;
                }
                TaskDisposition::Errored {
                    error: "recovery attempt panicked".to_string(),
                }
            }
        };
        outcome(&plan.stub, disposition)
    }

    async fn execute(&self, plan: &RecoveryPlan, claimed: &AtomicBool) -> TaskDisposition {
        let registry_id = plan.stub.registry_id;
        let task = match self.registry.get_full_task(registry_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                return TaskDisposition::Skipped {
                    reason: "task no longer in the registry".to_string(),
                };
            }
            Err(e) => {
                return TaskDisposition::Errored {
                    error: format!("could not load task: {e}"),
                };
            }
        };

        match self.registry.claim_for_recovery(registry_id, &self.instance_id).await {
            Ok(true) => claimed.store(true, Ordering::SeqCst),
            Ok(false) => {
                tracing::info!("task claimed by another instance");
                return TaskDisposition::Skipped {
                    reason: "claimed by another instance".to_string(),
                };
            }
            Err(e) => {
                return TaskDisposition::Errored {
                    error: format!("claim failed: {e}"),
                };
            }
        }

        let mut result = self.strategies.run(plan.strategy, &task).await;
        if !result.success
            && plan.strategy == StrategyKind::ValidateOnly
            && self.config.fallback_on_validate_failure
        {
            let fallback = self.selector.fallback(plan.has_valid_checkpoint);
            tracing::info!(fallback = %fallback, "no terminal result, falling back");
            result = self.strategies.run(fallback, &task).await;
        }

        if result.success {
            let resolution = match &result.new_execution_id {
                Some(id) => format!("{SUPERSEDED_BY}{id}"),
                None => VALIDATED_RESULT.to_string(),
            };
            self.mark(registry_id, TaskState::Completed, &resolution).await;
        } else {
            let reason = result.error.as_deref().unwrap_or(result.message.as_str());
            self.mark(registry_id, TaskState::Failed, &format!("recovery_failed: {reason}"))
                .await;
        }
        TaskDisposition::Attempted { result }
    }

    /// Record the final state, only while this instance still holds the claim.
    async fn mark(&self, registry_id: Uuid, state: TaskState, resolution: &str) {
        match self
            .registry
            .resolve_claim(registry_id, &self.instance_id, state, resolution)
            .await
        {
            Ok(true) => {}
            Ok(false) => tracing::warn!(
                registry_id = %registry_id,
                state = state.as_str(),
                "claim no longer held, resolution not recorded"
            ),
            Err(e) => tracing::warn!(
                registry_id = %registry_id,
                state = state.as_str(),
                error = %e,
                "failed to record recovery resolution"
            ),
        }
    }

    fn record(
        &self,
        results: &mut RecoveryResults,
        outcome: TaskRecoveryOutcome,
        strategy: Option<StrategyKind>,
    ) {
        let task_id = outcome.task_id.clone();
        let event = match &outcome.disposition {
            TaskDisposition::Attempted { result } if result.success => EngineEvent::TaskRecovered {
                task_id,
                strategy: result.strategy_name.clone(),
                new_execution_id: result.new_execution_id.clone(),
            },
            TaskDisposition::Attempted { result } => EngineEvent::TaskRecoveryFailed {
                task_id,
                strategy: result.strategy_name.clone(),
                error: result.error.clone().unwrap_or_else(|| result.message.clone()),
            },
            TaskDisposition::Errored { error } => EngineEvent::TaskRecoveryFailed {
                task_id,
                strategy: strategy.map_or("none", |s| s.name()).to_string(),
                error: error.clone(),
            },
            TaskDisposition::Skipped { reason } => EngineEvent::TaskRecoverySkipped {
                task_id,
                reason: reason.clone(),
            },
        };
        self.events.publish(event);
        results.record(outcome);
    }

    fn enter(&self, phase: RecoveryPhase) {
        match self.phase.lock() {
            Ok(mut current) => *current = phase,
            Err(poisoned) => *poisoned.into_inner() = phase,
        }
        tracing::debug!(phase = phase.as_str(), "recovery phase");
    }
}

fn outcome(stub: &RecoverableTaskStub, disposition: TaskDisposition) -> TaskRecoveryOutcome {
    TaskRecoveryOutcome {
        registry_id: stub.registry_id,
        task_id: stub.task_id.clone(),
        recovery_priority: stub.recovery_priority,
        disposition,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Workflow executor: drives a job from its entry step to a terminal step.
//!
//! The `WorkflowExecutor` walks a validated [`WorkflowGraph`]. Steps run one
//! at a time, each in its own tokio task so panics and timeouts are contained.
//! Phase nodes fan out to their members with a `JoinSet` and join them behind
//! a barrier before the graph moves on.
//!
//! # Execution flow
//!
//! 1. Run the current node (step or phase) on a snapshot of the state bag.
//! 2. Fold the resulting delta into the bag with the workflow's merge schema.
//! 3. Report progress (`range.end` on completion, `range.start` on failure).
//! 4. Persist progress, and a checkpoint when the step is a milestone.
//! 5. If `error` is set, jump to the error handler; otherwise follow the edge.
//! 6. On a terminal step, persist the final status and return a [`RunOutcome`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use stepwise_types::config::ExecutorConfig;
use stepwise_types::event::EngineEvent;
use stepwise_types::job::ErrorDetails;
use tokio::task::JoinSet;
use tracing::Instrument;

use super::graph::{Edge, Node, PhaseSpec, StepNode, WorkflowGraph};
use super::persistence::{BoxJobPersistence, JobPersistence, NoopPersistence};
use super::progress::{BoxProgressNotifier, NoopNotifier, ProgressEmitter, ProgressNotifier, StepProgress};
use super::state::{Applier, StateBag, StateDelta, ERROR, ERROR_DETAILS, PROCESSING_ERRORS};
use super::step::{BoxStep, StepFailure};
use super::trace::StepTracer;
use crate::event::bus::EventBus;

// ---------------------------------------------------------------------------
// Errors and outcome
// ---------------------------------------------------------------------------

/// Errors that prevent a run from starting. Step failures never surface here;
/// they end the run through the error handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    #[error("workflow '{workflow}' has no node '{step}'")]
    UnknownStep { workflow: String, step: String },

    #[error("'{0}' is a phase member and cannot start a run")]
    PhaseMember(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// A terminal step other than the error handler was reached.
    Completed,
    /// The run ended in the error handler.
    Failed,
}

/// Result of a single job run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub job_id: String,
    pub workflow: String,
    pub state: StateBag,
    pub terminal_step: String,
    /// Nodes executed, in order. Phase members are not listed individually.
    pub visited: Vec<String>,
    pub status: RunStatus,
    /// Highest progress percentage delivered.
    pub progress: u8,
    pub duration: Duration,
}

impl RunOutcome {
    pub fn is_failed(&self) -> bool {
        self.status == RunStatus::Failed
    }

    pub fn error_details(&self) -> Option<ErrorDetails> {
        self.state.error_details()
    }
}

// ---------------------------------------------------------------------------
// WorkflowExecutor
// ---------------------------------------------------------------------------

/// Executes jobs against one workflow graph. Cheap to clone.
#[derive(Clone)]
pub struct WorkflowExecutor {
    graph: Arc<WorkflowGraph>,
    notifier: BoxProgressNotifier,
    persistence: BoxJobPersistence,
    tracer: StepTracer,
    events: EventBus,
    default_timeout: Option<Duration>,
}

impl WorkflowExecutor {
    pub fn new(graph: impl Into<Arc<WorkflowGraph>>) -> Self {
        Self {
            graph: graph.into(),
            notifier: BoxProgressNotifier::new(NoopNotifier),
            persistence: BoxJobPersistence::new(NoopPersistence),
            tracer: StepTracer::new(),
            events: EventBus::default(),
            default_timeout: None,
        }
    }

    pub fn with_notifier<N: ProgressNotifier + 'static>(mut self, notifier: N) -> Self {
        self.notifier = BoxProgressNotifier::new(notifier);
        self
    }

    pub fn with_persistence<P: JobPersistence + 'static>(mut self, persistence: P) -> Self {
        self.persistence = BoxJobPersistence::new(persistence);
        self
    }

    pub fn with_tracer(mut self, tracer: StepTracer) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Timeout for steps that do not declare their own.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_config(self, config: &ExecutorConfig) -> Self {
        self.with_default_timeout(config.default_step_timeout())
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    /// Run a job from the graph's entry step.
    pub async fn run(&self, job_id: &str, initial: StateBag) -> Result<RunOutcome, ExecutorError> {
        let entry = self.graph.entry().to_string();
        self.run_from(&entry, job_id, initial).await
    }

    /// Run a job starting at `entry` (used when resuming after a milestone).
    pub async fn run_from(
        &self,
        entry: &str,
        job_id: &str,
        initial: StateBag,
    ) -> Result<RunOutcome, ExecutorError> {
        if !self.graph.contains(entry) {
            return Err(ExecutorError::UnknownStep {
                workflow: self.graph.name().to_string(),
                step: entry.to_string(),
            });
        }
        if self.graph.phase_of(entry).is_some() {
            return Err(ExecutorError::PhaseMember(entry.to_string()));
        }

        let span = tracing::info_span!("job", job_id, workflow = self.graph.name());
        Ok(self.drive(entry, job_id, initial).instrument(span).await)
    }

    async fn drive(&self, entry: &str, job_id: &str, initial: StateBag) -> RunOutcome {
        let clock = Instant::now();
        let handler = self.graph.error_handler().to_string();
        let emitter = Arc::new(ProgressEmitter::new(job_id, self.notifier.clone()));

        self.events.publish(EngineEvent::JobStarted {
            job_id: job_id.to_string(),
            workflow_name: self.graph.name().to_string(),
            entry_step: entry.to_string(),
            is_recovery: initial.is_recovery(),
        });
        tracing::info!(entry, is_recovery = initial.is_recovery(), "job started");

        let mut state = initial;
        let mut visited = Vec::new();
        let mut current = entry.to_string();

        let terminal = loop {
            visited.push(current.clone());
            let in_handler = current == handler;

            match self.graph.node(&current) {
                Some(Node::Step(node)) => {
                    self.execute_step(job_id, &current, node, &mut state, &emitter, in_handler)
                        .await;
                }
                Some(Node::Phase(spec)) => {
                    self.execute_phase(job_id, &current, spec, &mut state, &emitter)
                        .await;
                }
                None => {
                    // Unreachable for a validated graph; end through the handler.
                    state.record_failure(&ErrorDetails::new(
                        &current,
                        "unknown_step",
                        format!("node '{current}' is not part of the workflow"),
                    ));
                    if in_handler {
                        break current;
                    }
                    current = handler.clone();
                    continue;
                }
            }

            if let Err(e) = self
                .persistence
                .record_progress(job_id, &current, emitter.current(), &state)
                .await
            {
                tracing::warn!(step = current.as_str(), error = %e, "failed to record progress");
            }

            if in_handler {
                break current;
            }
            if state.has_error() {
                tracing::debug!(step = current.as_str(), error = state.error().unwrap_or_default(), "routing to error handler");
                current = handler.clone();
                continue;
            }

            match self.graph.edge(&current) {
                Some(Edge::Next(target)) => current = target.clone(),
                Some(Edge::Route(router)) => match router.resolve(&state) {
                    Ok(target) => current = target.to_string(),
                    Err(e) => {
                        tracing::warn!(step = current.as_str(), error = %e, "routing failed");
                        state.record_failure(&ErrorDetails::new(&current, "routing", e.to_string()));
                        current = handler.clone();
                    }
                },
                Some(Edge::End) | None => break current,
            }
        };

        let status = if terminal == handler {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        let outcome = RunOutcome {
            job_id: job_id.to_string(),
            workflow: self.graph.name().to_string(),
            state,
            terminal_step: terminal,
            visited,
            status,
            progress: emitter.current(),
            duration: clock.elapsed(),
        };

        if let Err(e) = self.persistence.record_finished(job_id, &outcome).await {
            tracing::warn!(error = %e, "failed to record job completion");
        }
        self.events.publish(EngineEvent::JobFinished {
            job_id: job_id.to_string(),
            workflow_name: outcome.workflow.clone(),
            terminal_step: outcome.terminal_step.clone(),
            failed: outcome.is_failed(),
            duration_ms: outcome.duration.as_millis() as u64,
        });
        tracing::info!(
            terminal = outcome.terminal_step.as_str(),
            failed = outcome.is_failed(),
            progress = outcome.progress,
            duration_ms = outcome.duration.as_millis() as u64,
            "job finished"
        );
        outcome
    }

    async fn execute_step(
        &self,
        job_id: &str,
        name: &str,
        node: &StepNode,
        state: &mut StateBag,
        emitter: &Arc<ProgressEmitter>,
        in_handler: bool,
    ) {
        let schema = self.graph.schema();
        let range = node.options.range;
        let applier = if in_handler {
            Applier::ErrorHandler
        } else {
            Applier::Step
        };

        match self.run_step(job_id, name, node, state, emitter).await {
            Ok(delta) => {
                let controlled = delta.sets_error();
                state.apply_as(&delta, schema, applier);
                if controlled && !in_handler {
                    let kind = state.error().unwrap_or("error").to_string();
                    state.record_failure(&ErrorDetails::new(
                        name,
                        &kind,
                        format!("step '{name}' reported {kind}"),
                    ));
                }
                if in_handler {
                    return;
                }
                emitter
                    .emit(name, range.end(), &format!("{name} completed"))
                    .await;
                if node.options.milestone && !controlled {
                    if let Err(e) = self
                        .persistence
                        .record_checkpoint(job_id, name, range.end(), state)
                        .await
                    {
                        tracing::warn!(step = name, error = %e, "failed to write checkpoint");
                    }
                }
            }
            Err(failure) => {
                tracing::warn!(step = name, kind = failure.kind.as_str(), message = failure.message.as_str(), "step raised");
                state.record_failure(&failure.into_details(name));
                if !in_handler {
                    emitter
                        .emit(name, range.start(), &format!("{name} failed"))
                        .await;
                }
            }
        }
    }

    async fn execute_phase(
        &self,
        job_id: &str,
        phase: &str,
        spec: &PhaseSpec,
        state: &mut StateBag,
        emitter: &Arc<ProgressEmitter>,
    ) {
        let schema = self.graph.schema();
        let snapshot = state.clone();
        let mut members = JoinSet::new();

        for member in &spec.members {
            let Some(Node::Step(node)) = self.graph.node(member) else {
                continue;
            };
            let this = self.clone();
            let node = node.clone();
            let member = member.clone();
            let snapshot = snapshot.clone();
            let emitter = Arc::clone(emitter);
            let job_id = job_id.to_string();
            members.spawn(async move {
                let result = this.run_step(&job_id, &member, &node, &snapshot, &emitter).await;
                (member, node.options.range, result)
            });
        }
        tracing::debug!(phase, members = spec.members.len(), "phase started");

        let mut completed = 0usize;
        while let Some(joined) = members.join_next().await {
            let (member, range, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    let details = ErrorDetails::new(phase, "panic", e.to_string());
                    state.apply(&processing_error(&details), schema);
                    continue;
                }
            };
            match result {
                Ok(delta) if !delta.sets_error() => {
                    state.apply(&delta, schema);
                    completed += 1;
                    emitter
                        .emit(&member, range.end(), &format!("{member} completed"))
                        .await;
                }
                Ok(mut delta) => {
                    let kind = delta
                        .remove(ERROR)
                        .and_then(|v| v.as_str().map(str::to_string))
                        .unwrap_or_else(|| "error".to_string());
                    delta.remove(ERROR_DETAILS);
                    state.apply(&delta, schema);
                    let details = ErrorDetails::new(
                        &member,
                        &kind,
                        format!("phase member '{member}' reported {kind}"),
                    );
                    state.apply(&processing_error(&details), schema);
                    emitter
                        .emit(&member, range.end(), &format!("{member} completed"))
                        .await;
                }
                Err(failure) => {
                    let details = failure.into_details(&member);
                    tracing::warn!(phase, member = member.as_str(), kind = details.error_kind.as_str(), "phase member failed");
                    state.apply(&processing_error(&details), schema);
                    emitter
                        .emit(&member, range.start(), &format!("{member} failed"))
                        .await;
                }
            }
        }

        // Barrier passed: every member has finished.
        let complete = completed == spec.required_count;
        let gate = StateDelta::new()
            .set(format!("{phase}_complete"), complete)
            .set(format!("{phase}_completed_count"), completed)
            .set(format!("{phase}_completed_at"), Utc::now().to_rfc3339());
        state.apply(&gate, schema);

        self.events.publish(EngineEvent::PhaseCompleted {
            job_id: job_id.to_string(),
            phase: phase.to_string(),
            completed_count: completed,
            required_count: spec.required_count,
            complete,
        });
        tracing::info!(phase, completed, required = spec.required_count, complete, "phase gate evaluated");
    }

    async fn run_step(
        &self,
        job_id: &str,
        name: &str,
        node: &StepNode,
        state: &StateBag,
        emitter: &Arc<ProgressEmitter>,
    ) -> Result<StateDelta, StepFailure> {
        let progress = StepProgress::new(Arc::clone(emitter), name, node.options.range);
        let timeout = node.options.timeout.or(self.default_timeout);
        let execution = guarded(name, node.step.clone(), state.clone(), progress, timeout);
        self.tracer
            .trace(job_id, self.graph.name(), name, execution)
            .await
    }
}

impl std::fmt::Debug for WorkflowExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowExecutor")
            .field("workflow", &self.graph.name())
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

/// Run a step in its own task, converting panics and timeouts into failures.
async fn guarded(
    name: &str,
    step: BoxStep,
    state: StateBag,
    progress: StepProgress,
    timeout: Option<Duration>,
) -> Result<StateDelta, StepFailure> {
    let handle = tokio::spawn(async move { step.execute(&state, &progress).await });
    let abort = handle.abort_handle();

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, handle).await {
            Ok(joined) => joined,
            Err(_) => {
                abort.abort();
                return Err(StepFailure::timeout(format!(
                    "step '{name}' exceeded its {}ms timeout",
                    limit.as_millis()
                )));
            }
        },
        None => handle.await,
    };

    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "step panicked".to_string());
            Err(StepFailure::new("panic", message))
        }
        Err(e) => Err(StepFailure::new("cancelled", e.to_string())),
    }
}

fn processing_error(details: &ErrorDetails) -> StateDelta {
    let entry = serde_json::to_value(details).unwrap_or_else(|_| {
        json!({
            "step_name": details.step_name,
            "error_kind": details.error_kind,
            "message": details.message,
        })
    });
    StateDelta::new().set(PROCESSING_ERRORS, Value::Array(vec![entry]))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

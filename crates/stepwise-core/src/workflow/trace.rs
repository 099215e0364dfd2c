//! Step tracing middleware.
//!
//! [`StepTracer`] wraps every step execution in a `tracing` span and reports
//! start/finish records to the registered [`ObservabilitySink`]s. Steps stay
//! unaware of it.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use stepwise_types::event::{EngineEvent, StepOutcome};
use tracing::Instrument;

use super::state::StateDelta;
use super::step::StepFailure;
use crate::event::bus::EventBus;

/// Finished step execution as reported to sinks.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub job_id: String,
    pub workflow: String,
    pub step_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: StepOutcome,
    pub error_kind: Option<String>,
}

/// Receiver of step execution records (metrics, traces, event fan-out).
///
/// Called inline by the executor; implementations must not block.
pub trait ObservabilitySink: Send + Sync {
    fn step_started(&self, job_id: &str, workflow: &str, step_name: &str, started_at: DateTime<Utc>);

    fn step_finished(&self, record: &StepRecord);
}

/// Publishes `StepStarted` / `StepFinished` on the event bus.
#[derive(Debug, Clone)]
pub struct EventBusSink {
    bus: EventBus,
}

impl EventBusSink {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

impl ObservabilitySink for EventBusSink {
    fn step_started(&self, job_id: &str, _workflow: &str, step_name: &str, started_at: DateTime<Utc>) {
        self.bus.publish(EngineEvent::StepStarted {
            job_id: job_id.to_string(),
            step_name: step_name.to_string(),
            started_at,
        });
    }

    fn step_finished(&self, record: &StepRecord) {
        self.bus.publish(EngineEvent::StepFinished {
            job_id: record.job_id.clone(),
            step_name: record.step_name.clone(),
            started_at: record.started_at,
            finished_at: record.finished_at,
            duration_ms: record.duration_ms,
            outcome: record.outcome,
        });
    }
}

/// Wraps step futures with a span and sink notifications.
#[derive(Clone, Default)]
pub struct StepTracer {
    sinks: Vec<Arc<dyn ObservabilitySink>>,
}

impl StepTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink<S: ObservabilitySink + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    /// Run `execution` inside a `step` span, reporting to every sink.
    pub async fn trace<F>(
        &self,
        job_id: &str,
        workflow: &str,
        step_name: &str,
        execution: F,
    ) -> Result<StateDelta, StepFailure>
    where
        F: Future<Output = Result<StateDelta, StepFailure>>,
    {
        let span = tracing::info_span!(
            "step",
            job_id = job_id,
            workflow = workflow,
            step = step_name,
            outcome = tracing::field::Empty,
        );

        let started_at = Utc::now();
        let clock = Instant::now();
        for sink in &self.sinks {
            sink.step_started(job_id, workflow, step_name, started_at);
        }

        let result = execution.instrument(span.clone()).await;

        let (outcome, error_kind) = classify(&result);
        span.record("outcome", outcome_label(outcome));
        let record = StepRecord {
            job_id: job_id.to_string(),
            workflow: workflow.to_string(),
            step_name: step_name.to_string(),
            started_at,
            finished_at: Utc::now(),
            duration_ms: clock.elapsed().as_millis() as u64,
            outcome,
            error_kind,
        };
        match outcome {
            StepOutcome::Failed => tracing::warn!(
                parent: &span,
                duration_ms = record.duration_ms,
                error_kind = record.error_kind.as_deref().unwrap_or("unknown"),
                "step failed"
            ),
            _ => tracing::debug!(parent: &span, duration_ms = record.duration_ms, "step finished"),
        }
        for sink in &self.sinks {
            sink.step_finished(&record);
        }
        result
    }
}

impl std::fmt::Debug for StepTracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepTracer")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

fn classify(result: &Result<StateDelta, StepFailure>) -> (StepOutcome, Option<String>) {
    match result {
        Ok(delta) if delta.sets_error() => (
            StepOutcome::ControlledFailure,
            delta
                .get(super::state::ERROR)
                .and_then(|v| v.as_str())
                .map(str::to_string),
        ),
        Ok(_) => (StepOutcome::Succeeded, None),
        Err(failure) => (StepOutcome::Failed, Some(failure.kind.clone())),
    }
}

pub fn outcome_label(outcome: StepOutcome) -> &'static str {
    match outcome {
        StepOutcome::Succeeded => "succeeded",
        StepOutcome::ControlledFailure => "controlled_failure",
        StepOutcome::Failed => "failed",
    }
}

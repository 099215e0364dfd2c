//! Step tracer sinks.
//!
//! [`OtelStepSink`] turns every finished step into an OpenTelemetry span
//! carrying the [`step_attrs`](crate::step_attrs) attributes.
//! [`StepStatsSink`] keeps in-memory execution counters per workflow step.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::{Span as _, SpanBuilder, SpanKind, Status, Tracer};
use opentelemetry::KeyValue;
use stepwise_core::workflow::trace::{outcome_label, ObservabilitySink, StepRecord};
use stepwise_types::event::StepOutcome;

use crate::step_attrs::*;

// ---------------------------------------------------------------------------
// OpenTelemetry
// ---------------------------------------------------------------------------

/// Exports one span per finished step.
///
/// Spans are built when the step finishes, using the recorded start and end
/// timestamps, so nothing is held open while the step runs.
pub struct OtelStepSink<T = BoxedTracer> {
    tracer: T,
}

impl OtelStepSink {
    /// Sink backed by the globally registered tracer provider.
    pub fn new() -> Self {
        Self {
            tracer: global::tracer(TRACER_NAME),
        }
    }
}

impl Default for OtelStepSink {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Tracer> OtelStepSink<T> {
    pub fn with_tracer(tracer: T) -> Self {
        Self { tracer }
    }
}

impl<T> ObservabilitySink for OtelStepSink<T>
where
    T: Tracer + Send + Sync,
{
    fn step_started(&self, _: &str, _: &str, _: &str, _: DateTime<Utc>) {}

    fn step_finished(&self, record: &StepRecord) {
        let mut attributes = vec![
            KeyValue::new(STEPWISE_JOB_ID, record.job_id.clone()),
            KeyValue::new(STEPWISE_WORKFLOW_NAME, record.workflow.clone()),
            KeyValue::new(STEPWISE_STEP_NAME, record.step_name.clone()),
            KeyValue::new(STEPWISE_STEP_OUTCOME, outcome_label(record.outcome)),
            KeyValue::new(
                STEPWISE_STEP_DURATION_MS,
                i64::try_from(record.duration_ms).unwrap_or(i64::MAX),
            ),
        ];
        if let Some(kind) = &record.error_kind {
            attributes.push(KeyValue::new(STEPWISE_ERROR_KIND, kind.clone()));
        }

        let mut span = SpanBuilder::from_name(format!("step {}", record.step_name))
            .with_kind(SpanKind::Internal)
            .with_start_time(record.started_at)
            .with_attributes(attributes)
            .start(&self.tracer);

        if record.outcome != StepOutcome::Succeeded {
            let kind = record.error_kind.clone().unwrap_or_else(|| "unknown".to_string());
            span.set_status(Status::error(kind));
        }
        span.end_with_timestamp(record.finished_at.into());
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Aggregated executions of one workflow step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepStats {
    pub executions: u64,
    pub controlled_failures: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
    pub max_duration_ms: u64,
}

impl StepStats {
    pub fn mean_duration_ms(&self) -> Option<u64> {
        self.total_duration_ms.checked_div(self.executions)
    }

    fn add(&mut self, record: &StepRecord) {
        self.executions += 1;
        match record.outcome {
            StepOutcome::Succeeded => {}
            StepOutcome::ControlledFailure => self.controlled_failures += 1,
            StepOutcome::Failed => self.failures += 1,
        }
        self.total_duration_ms = self.total_duration_ms.saturating_add(record.duration_ms);
        self.max_duration_ms = self.max_duration_ms.max(record.duration_ms);
    }
}

/// Counts step executions per `(workflow, step)`.
///
/// Clones share the same counters, so one clone can be registered with the
/// tracer while another is read.
#[derive(Clone, Default)]
pub struct StepStatsSink {
    stats: Arc<DashMap<(String, String), StepStats>>,
    in_flight: Arc<AtomicUsize>,
}

impl StepStatsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, workflow: &str, step_name: &str) -> Option<StepStats> {
        self.stats
            .get(&(workflow.to_string(), step_name.to_string()))
            .map(|entry| *entry)
    }

    /// All counters, sorted by workflow then step name.
    pub fn snapshot(&self) -> Vec<(String, String, StepStats)> {
        let mut all: Vec<_> = self
            .stats
            .iter()
            .map(|entry| {
                let (workflow, step) = entry.key().clone();
                (workflow, step, *entry.value())
            })
            .collect();
        all.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        all
    }

    /// Steps started but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }
}

impl ObservabilitySink for StepStatsSink {
    fn step_started(&self, _: &str, _: &str, _: &str, _: DateTime<Utc>) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    fn step_finished(&self, record: &StepRecord) {
        // Saturate so a finish without a matching start cannot wrap.
        let _ = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
        self.stats
            .entry((record.workflow.clone(), record.step_name.clone()))
            .or_default()
            .add(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider};
    use stepwise_core::workflow::trace::StepTracer;
    use stepwise_core::workflow::{StateDelta, StepFailure};

    fn record(step_name: &str, outcome: StepOutcome, duration_ms: u64) -> StepRecord {
        let finished_at = Utc::now();
        StepRecord {
            job_id: "job-1".to_string(),
            workflow: "summarize_document".to_string(),
            step_name: step_name.to_string(),
            started_at: finished_at - chrono::Duration::milliseconds(duration_ms as i64),
            finished_at,
            duration_ms,
            outcome,
            error_kind: (outcome == StepOutcome::Failed).then(|| "timeout".to_string()),
        }
    }

    #[test]
    fn test_otel_sink_exports_step_span() {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let sink = OtelStepSink::with_tracer(provider.tracer("test"));

        sink.step_finished(&record("summarize", StepOutcome::Succeeded, 40));
        sink.step_finished(&record("load", StepOutcome::Failed, 5));

        let spans = exporter.get_finished_spans().unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].name, "step summarize");
        assert!(spans[0]
            .attributes
            .contains(&KeyValue::new(STEPWISE_STEP_OUTCOME, "succeeded")));
        assert!(spans[0]
            .attributes
            .contains(&KeyValue::new(STEPWISE_STEP_DURATION_MS, 40_i64)));
        assert_eq!(spans[0].status, Status::Unset);

        assert!(spans[1]
            .attributes
            .contains(&KeyValue::new(STEPWISE_ERROR_KIND, "timeout")));
        assert_eq!(spans[1].status, Status::error("timeout"));
    }

    #[test]
    fn test_stats_sink_aggregates_per_step() {
        let sink = StepStatsSink::new();
        sink.step_finished(&record("summarize", StepOutcome::Succeeded, 30));
        sink.step_finished(&record("summarize", StepOutcome::ControlledFailure, 10));
        sink.step_finished(&record("load", StepOutcome::Failed, 5));

        let summarize = sink.get("summarize_document", "summarize").unwrap();
        assert_eq!(summarize.executions, 2);
        assert_eq!(summarize.controlled_failures, 1);
        assert_eq!(summarize.failures, 0);
        assert_eq!(summarize.max_duration_ms, 30);
        assert_eq!(summarize.mean_duration_ms(), Some(20));

        let names: Vec<_> = sink.snapshot().into_iter().map(|(_, step, _)| step).collect();
        assert_eq!(names, vec!["load", "summarize"]);
        assert_eq!(sink.in_flight(), 0);
        assert!(StepStats::default().mean_duration_ms().is_none());
    }

    #[tokio::test]
    async fn test_stats_sink_behind_step_tracer() {
        let stats = StepStatsSink::new();
        let tracer = StepTracer::new().with_sink(stats.clone());

        tracer
            .trace("job-1", "summarize_document", "load", async {
                Ok::<_, StepFailure>(StateDelta::new().set("text", "hello"))
            })
            .await
            .unwrap();
        let failed = tracer
            .trace("job-1", "summarize_document", "summarize", async {
                Err::<StateDelta, _>(StepFailure::new("llm_error", "provider down"))
            })
            .await;
        assert!(failed.is_err());

        assert_eq!(stats.get("summarize_document", "load").unwrap().executions, 1);
        assert_eq!(stats.get("summarize_document", "summarize").unwrap().failures, 1);
        assert_eq!(stats.in_flight(), 0);
    }
}

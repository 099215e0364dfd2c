//! Observability for Stepwise: subscriber setup, step span attributes and
//! the OpenTelemetry and statistics sinks plugged into the step tracer.

pub mod sink;
pub mod step_attrs;
pub mod tracing_setup;

pub use sink::{OtelStepSink, StepStats, StepStatsSink};

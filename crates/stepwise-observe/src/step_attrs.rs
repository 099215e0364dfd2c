//! Attribute names attached to exported step spans.
//!
//! Span naming convention: `"step {step_name}"` (e.g. `"step summarize"`).

/// Execution (job) ID the step ran under.
pub const STEPWISE_JOB_ID: &str = "stepwise.job.id";

/// Name of the workflow graph.
pub const STEPWISE_WORKFLOW_NAME: &str = "stepwise.workflow.name";

/// Name of the executed step.
pub const STEPWISE_STEP_NAME: &str = "stepwise.step.name";

/// `succeeded`, `controlled_failure` or `failed`.
pub const STEPWISE_STEP_OUTCOME: &str = "stepwise.step.outcome";

/// Wall-clock duration of the step in milliseconds.
pub const STEPWISE_STEP_DURATION_MS: &str = "stepwise.step.duration_ms";

/// Error kind reported by a failing step.
pub const STEPWISE_ERROR_KIND: &str = "stepwise.error.kind";

/// Instrumentation scope name used for exported spans.
pub const TRACER_NAME: &str = "stepwise";

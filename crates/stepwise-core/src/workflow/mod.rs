//! Workflow execution engine.
//!
//! Provides the state model, the step and router contracts, graph
//! construction and validation, progress emission, the tracing middleware,
//! persistence callbacks and the executor that ties them together.

pub mod executor;
pub mod graph;
pub mod persistence;
pub mod progress;
pub mod router;
pub mod short_circuit;
pub mod state;
pub mod step;
pub mod trace;

pub use executor::{ExecutorError, RunOutcome, RunStatus, WorkflowExecutor};
pub use graph::{GraphError, StepOptions, WorkflowBuilder, WorkflowGraph};
pub use router::Router;
pub use state::{FieldMerge, StateBag, StateDelta, StateSchema};
pub use step::{step_fn, BoxStep, Step, StepFailure};

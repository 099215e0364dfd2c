//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (stepwise-infra) implements. The core crate never depends on a specific
//! storage technology; `memory` provides dashmap-backed implementations used
//! by tests and single-process deployments.

pub mod artifact;
pub mod memory;
pub mod registry;

pub use artifact::ArtifactRepository;
pub use registry::{CheckpointStore, TaskRegistry};

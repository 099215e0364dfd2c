//! Core business logic for Stepwise.
//!
//! Contains the workflow executor, the recovery orchestrator with its
//! strategies, the event bus, and the repository and submission traits
//! (ports) that the infrastructure layer implements.

pub mod event;
pub mod recovery;
pub mod repository;
pub mod submit;
pub mod workflow;

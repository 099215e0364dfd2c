//! Shared domain types for Stepwise.
//!
//! This crate contains the state model shared by the workflow executor and the
//! recovery orchestrator: progress ranges, error details, checkpoints,
//! recoverable tasks, recovery results, engine events and configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod job;
pub mod progress;
pub mod recovery;

//! Infrastructure layer for Stepwise.
//!
//! Contains implementations of the repository traits defined in `stepwise-core`
//! (SQLite task registry, checkpoint store and artifact repository), the TOML
//! configuration loader, and the [`EngineContext`](context::EngineContext)
//! that wires everything together at process start.

pub mod config;
pub mod context;
pub mod sqlite;

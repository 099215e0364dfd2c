use thiserror::Error;

/// Errors from repository operations (used by trait definitions in stepwise-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors raised when constructing a [`ProgressRange`](crate::progress::ProgressRange).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProgressRangeError {
    #[error("progress range end {0} exceeds 100")]
    EndOutOfBounds(u8),

    #[error("progress range start {start} must be below end {end}")]
    Empty { start: u8, end: u8 },
}

/// Errors raised when validating an [`EngineConfig`](crate::config::EngineConfig).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("recovery.batch_size must be at least 1")]
    ZeroBatchSize,

    #[error(
        "recovery thresholds must satisfy checkpoint ({checkpoint}) < validate_only ({validate_only}) <= 100"
    )]
    InvalidThresholds { checkpoint: u8, validate_only: u8 },
}

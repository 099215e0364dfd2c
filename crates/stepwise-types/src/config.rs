//! Engine configuration types.
//!
//! `EngineConfig` represents the top-level `config.toml` that tunes the
//! executor and the startup recovery pass. Every field has a default, so an
//! empty file (or no file at all) yields a working configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration for the Stepwise engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.recovery.validate()
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Timeout applied to steps that do not declare their own (None = no limit).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_step_timeout_secs: Option<u64>,

    /// Capacity of the broadcast event bus.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: None,
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

impl ExecutorConfig {
    pub fn default_step_timeout(&self) -> Option<Duration> {
        self.default_step_timeout_secs.map(Duration::from_secs)
    }
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

/// Tunables for the startup recovery pass.
///
/// The strategy thresholds are policy, not semantics: deployments with
/// different step-cost profiles are expected to move them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Tasks executed concurrently per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Pause between consecutive batches.
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,

    /// Heartbeat age after which a running task is considered interrupted.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Progress at or above which a task is only validated, never re-run.
    #[serde(default = "default_validate_only_threshold")]
    pub validate_only_threshold: u8,

    /// Minimum progress for resuming from a checkpoint.
    #[serde(default = "default_checkpoint_threshold")]
    pub checkpoint_threshold: u8,

    /// Typical wall-clock duration of a full job, for time-saved estimates.
    #[serde(default = "default_estimated_job_duration_secs")]
    pub estimated_job_duration_secs: u64,

    /// Typical duration of one durable sub-stage skipped by a clean restart.
    #[serde(default = "default_stage_time_estimate_secs")]
    pub stage_time_estimate_secs: u64,

    /// Fall back to another strategy when validate-only finds no result.
    #[serde(default = "default_true")]
    pub fallback_on_validate_failure: bool,
}

fn default_batch_size() -> usize {
    3
}

fn default_batch_delay_ms() -> u64 {
    2_000
}

fn default_stale_after_secs() -> u64 {
    300
}

fn default_validate_only_threshold() -> u8 {
    95
}

fn default_checkpoint_threshold() -> u8 {
    25
}

fn default_estimated_job_duration_secs() -> u64 {
    600
}

fn default_stage_time_estimate_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
            stale_after_secs: default_stale_after_secs(),
            validate_only_threshold: default_validate_only_threshold(),
            checkpoint_threshold: default_checkpoint_threshold(),
            estimated_job_duration_secs: default_estimated_job_duration_secs(),
            stage_time_estimate_secs: default_stage_time_estimate_secs(),
            fallback_on_validate_failure: default_true(),
        }
    }
}

impl RecoveryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.checkpoint_threshold >= self.validate_only_threshold
            || self.validate_only_threshold > 100
        {
            return Err(ConfigError::InvalidThresholds {
                checkpoint: self.checkpoint_threshold,
                validate_only: self.validate_only_threshold,
            });
        }
        Ok(())
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn estimated_job_duration(&self) -> Duration {
        Duration::from_secs(self.estimated_job_duration_secs)
    }

    pub fn stage_time_estimate(&self) -> Duration {
        Duration::from_secs(self.stage_time_estimate_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.recovery.batch_size, 3);
        assert_eq!(config.recovery.validate_only_threshold, 95);
        assert_eq!(config.recovery.checkpoint_threshold, 25);
        assert!(config.recovery.fallback_on_validate_failure);
        assert_eq!(config.executor.event_bus_capacity, 1024);
        assert!(config.executor.default_step_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let toml_str = r#"
[executor]
default_step_timeout_secs = 120

[recovery]
batch_size = 5
batch_delay_ms = 250
validate_only_threshold = 90
checkpoint_threshold = 30
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.executor.default_step_timeout(), Some(Duration::from_secs(120)));
        assert_eq!(config.recovery.batch_size, 5);
        assert_eq!(config.recovery.batch_delay(), Duration::from_millis(250));
        assert_eq!(config.recovery.validate_only_threshold, 90);
        assert_eq!(config.recovery.checkpoint_threshold, 30);
        // untouched fields keep their defaults
        assert_eq!(config.recovery.stale_after_secs, 300);
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut config = RecoveryConfig::default();
        config.batch_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroBatchSize));
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let mut config = RecoveryConfig::default();
        config.checkpoint_threshold = 95;
        config.validate_only_threshold = 25;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidThresholds { .. })
        ));

        config.checkpoint_threshold = 10;
        config.validate_only_threshold = 101;
        assert!(config.validate().is_err());
    }
}

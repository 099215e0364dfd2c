//! Strategy selection for interrupted tasks.

use stepwise_types::config::RecoveryConfig;
use stepwise_types::recovery::StrategyKind;

/// Chooses how a task is recovered from how far it got.
///
/// Rules, first match wins:
/// 1. `progress >= validate_only_threshold` selects `ValidateOnly`
/// 2. a valid checkpoint and `progress >= checkpoint_threshold` selects
///    `CheckpointResume`
/// 3. anything else selects `CleanRestart`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategySelector {
    validate_only_threshold: u8,
    checkpoint_threshold: u8,
}

impl StrategySelector {
    pub fn new(validate_only_threshold: u8, checkpoint_threshold: u8) -> Self {
        Self {
            validate_only_threshold,
            checkpoint_threshold,
        }
    }

    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self::new(config.validate_only_threshold, config.checkpoint_threshold)
    }

    pub fn select(&self, progress_percent: u8, has_valid_checkpoint: bool) -> StrategyKind {
        if progress_percent >= self.validate_only_threshold {
            StrategyKind::ValidateOnly
        } else if has_valid_checkpoint && progress_percent >= self.checkpoint_threshold {
            StrategyKind::CheckpointResume
        } else {
            StrategyKind::CleanRestart
        }
    }

    /// Strategy to try after `ValidateOnly` found no terminal result.
    pub fn fallback(&self, has_valid_checkpoint: bool) -> StrategyKind {
        if has_valid_checkpoint {
            StrategyKind::CheckpointResume
        } else {
            StrategyKind::CleanRestart
        }
    }
}

impl Default for StrategySelector {
    fn default() -> Self {
        Self::from_config(&RecoveryConfig::default())
    }
}

//! Error taxonomy for the controller cycle
//!
//! Every fatal error carries the cycle stage it occurred in, so a failed
//! cycle reports exactly where in the state machine it stopped. Lock-token
//! conflicts get their own variant: they are benign races with another cycle
//! or an operator, not defects, and must read that way in logs.

use crate::config::ConfigError;
use parapet_common::StoreError;
use thiserror::Error;

/// Stages of the cycle state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FetchLimit,
    FetchWindowMetrics,
    DecideAndApplyLimit,
    FetchAddressSet,
    FetchBlockCount,
    SampleAndReconcile,
    EmitMetrics,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::FetchLimit => "fetch_limit",
            Stage::FetchWindowMetrics => "fetch_window_metrics",
            Stage::DecideAndApplyLimit => "decide_and_apply_limit",
            Stage::FetchAddressSet => "fetch_address_set",
            Stage::FetchBlockCount => "fetch_block_count",
            Stage::SampleAndReconcile => "sample_and_reconcile",
            Stage::EmitMetrics => "emit_metrics",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fatal failure of one controller cycle
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("upstream read failed during {stage}: {source}")]
    UpstreamRead { stage: Stage, source: StoreError },

    #[error("write failed during {stage}: {source}")]
    UpstreamWrite { stage: Stage, source: StoreError },

    #[error("concurrent modification of {resource} during {stage}; aborting, next cycle recomputes from fresh state")]
    Conflict { stage: Stage, resource: String },
}

impl CycleError {
    /// Tag a store failure from a read path with its stage
    pub fn read(stage: Stage, source: StoreError) -> Self {
        match source {
            StoreError::Conflict(resource) => CycleError::Conflict { stage, resource },
            other => CycleError::UpstreamRead {
                stage,
                source: other,
            },
        }
    }

    /// Tag a store failure from a write path with its stage
    pub fn write(stage: Stage, source: StoreError) -> Self {
        match source {
            StoreError::Conflict(resource) => CycleError::Conflict { stage, resource },
            other => CycleError::UpstreamWrite {
                stage,
                source: other,
            },
        }
    }

    /// Stage the cycle failed in, if it got past configuration
    pub fn stage(&self) -> Option<Stage> {
        match self {
            CycleError::Config(_) => None,
            CycleError::UpstreamRead { stage, .. }
            | CycleError::UpstreamWrite { stage, .. }
            | CycleError::Conflict { stage, .. } => Some(*stage),
        }
    }

    /// Whether this failure is a benign optimistic-concurrency race
    pub fn is_conflict(&self) -> bool {
        matches!(self, CycleError::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_promoted_from_read_and_write() {
        let err = CycleError::read(
            Stage::FetchAddressSet,
            StoreError::Conflict("address-set/blocked".to_string()),
        );
        assert!(err.is_conflict());
        assert_eq!(err.stage(), Some(Stage::FetchAddressSet));

        let err = CycleError::write(
            Stage::SampleAndReconcile,
            StoreError::Conflict("address-set/blocked".to_string()),
        );
        assert!(err.is_conflict());

        let err = CycleError::write(
            Stage::DecideAndApplyLimit,
            StoreError::Backend("connection reset".to_string()),
        );
        assert!(!err.is_conflict());
        assert_eq!(err.stage(), Some(Stage::DecideAndApplyLimit));
    }

    #[test]
    fn test_error_messages_name_the_stage() {
        let err = CycleError::read(
            Stage::FetchWindowMetrics,
            StoreError::Backend("timeout".to_string()),
        );
        let msg = err.to_string();
        assert!(msg.contains("fetch_window_metrics"));
        assert!(msg.contains("timeout"));
    }
}

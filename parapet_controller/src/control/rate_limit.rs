//! Adaptive rate-limit feedback loop
//!
//! The error signal is the block ratio: blocked requests observed over the
//! window divided by the currently configured limit. The limit moves by
//! bounded multiplicative steps, with a hysteresis band between the two
//! thresholds where nothing changes, and saturates at the configured bounds.

use crate::config::Config;
use crate::stores::{PolicyStore, StoreResult};
use parapet_common::{
    AdjustReason, ControlDecision, LockToken, PolicyRef, ProtectionPolicy, StoreError, Versioned,
};
use std::sync::Arc;

/// Bounds and gains of the feedback loop
#[derive(Debug, Clone)]
pub struct LimitBounds {
    pub min: u64,
    pub max: u64,
    pub increase_threshold: f64,
    pub decrease_threshold: f64,
    pub increase_factor: f64,
    pub decrease_factor: f64,
}

impl Default for LimitBounds {
    fn default() -> Self {
        use parapet_common::constants::*;
        Self {
            min: MIN_RATE_LIMIT,
            max: MAX_RATE_LIMIT,
            increase_threshold: RATE_INCREASE_THRESHOLD,
            decrease_threshold: RATE_DECREASE_THRESHOLD,
            increase_factor: RATE_INCREASE_FACTOR,
            decrease_factor: RATE_DECREASE_FACTOR,
        }
    }
}

impl From<&Config> for LimitBounds {
    fn from(config: &Config) -> Self {
        Self {
            min: config.min_rate_limit,
            max: config.max_rate_limit,
            increase_threshold: config.increase_threshold,
            decrease_threshold: config.decrease_threshold,
            increase_factor: config.increase_factor,
            decrease_factor: config.decrease_factor,
        }
    }
}

/// Compute the next limit from the current limit and the window's blocked
/// count. Pure; first matching rule wins.
pub fn decide(bounds: &LimitBounds, current_limit: u64, window_blocked_count: f64) -> ControlDecision {
    if current_limit == 0 {
        // Upstream guarantees a positive limit; hold rather than divide by zero
        return ControlDecision {
            previous_limit: 0,
            new_limit: 0,
            block_ratio: 0.0,
            reason: AdjustReason::Hold,
        };
    }

    let block_ratio = window_blocked_count / current_limit as f64;

    let (new_limit, reason) = if block_ratio > bounds.increase_threshold && current_limit < bounds.max
    {
        let raised = (current_limit as f64 * bounds.increase_factor).round() as u64;
        (raised.min(bounds.max), AdjustReason::TrafficSurge)
    } else if block_ratio < bounds.decrease_threshold && current_limit > bounds.min {
        let lowered = (current_limit as f64 * bounds.decrease_factor).round() as u64;
        (lowered.max(bounds.min), AdjustReason::TrafficLull)
    } else {
        (current_limit, AdjustReason::Hold)
    };

    ControlDecision {
        previous_limit: current_limit,
        new_limit,
        block_ratio,
        reason,
    }
}

/// Applies rate-limit decisions to the policy store
pub struct RateLimitController {
    policies: Arc<dyn PolicyStore>,
    policy: PolicyRef,
    rule_name: String,
    bounds: LimitBounds,
}

impl RateLimitController {
    pub fn new(
        policies: Arc<dyn PolicyStore>,
        policy: PolicyRef,
        rule_name: String,
        bounds: LimitBounds,
    ) -> Self {
        Self {
            policies,
            policy,
            rule_name,
            bounds,
        }
    }

    pub fn bounds(&self) -> &LimitBounds {
        &self.bounds
    }

    /// Read the policy and extract the managed rule's current limit
    pub async fn fetch_policy(&self) -> StoreResult<(Versioned<ProtectionPolicy>, u64)> {
        let versioned = self.policies.get(&self.policy).await?;
        let limit = versioned
            .value
            .rate_limit(&self.rule_name)
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "rate-based rule '{}' in policy '{}'",
                    self.rule_name, self.policy.name
                ))
            })?;
        Ok((versioned, limit))
    }

    /// Write a changed limit back through the narrowed CAS update.
    ///
    /// The policy is re-fetched here so the write carries a lock token
    /// obtained as close to the write as possible; the decision itself was
    /// computed from the earlier read. A conflict means another actor moved
    /// the policy meanwhile and the decision is stale, so the error
    /// propagates and the cycle aborts with no partial effects.
    pub async fn apply(&self, decision: &ControlDecision) -> StoreResult<()> {
        if !decision.changed() {
            return Ok(());
        }

        let fresh = self.policies.get(&self.policy).await?;
        if fresh.value.rate_limit(&self.rule_name).is_none() {
            return Err(StoreError::NotFound(format!(
                "rate-based rule '{}' in policy '{}'",
                self.rule_name, self.policy.name
            )));
        }

        let token: LockToken = fresh.lock_token;
        self.policies
            .update_rate_limit(&self.policy, &self.rule_name, decision.new_limit, token)
            .await?;

        tracing::info!(
            policy = %self.policy.name,
            rule = %self.rule_name,
            previous = decision.previous_limit,
            new = decision.new_limit,
            ratio = decision.block_ratio,
            "rate limit adjusted"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> LimitBounds {
        LimitBounds::default()
    }

    #[test]
    fn test_surge_raises_limit() {
        // 4500 / 5000 = 0.9 > 0.8 => 5000 * 1.5 = 7500
        let decision = decide(&bounds(), 5000, 4500.0);
        assert_eq!(decision.new_limit, 7500);
        assert_eq!(decision.reason, AdjustReason::TrafficSurge);
        assert!((decision.block_ratio - 0.9).abs() < 1e-9);
        assert!(decision.new_limit >= decision.previous_limit);
    }

    #[test]
    fn test_lull_tightens_limit() {
        // 100 / 2000 = 0.05 < 0.2 => 2000 * 0.8 = 1600
        let decision = decide(&bounds(), 2000, 100.0);
        assert_eq!(decision.new_limit, 1600);
        assert_eq!(decision.reason, AdjustReason::TrafficLull);
        assert!(decision.new_limit <= decision.previous_limit);
    }

    #[test]
    fn test_surge_clamped_at_max() {
        // 9000 * 1.5 = 13500, clamped to 10000
        let decision = decide(&bounds(), 9000, 7650.0);
        assert!(decision.block_ratio > 0.8);
        assert_eq!(decision.new_limit, 10000);
    }

    #[test]
    fn test_lull_clamped_at_min() {
        let decision = decide(&bounds(), 1100, 0.0);
        assert_eq!(decision.new_limit, 1000);
    }

    #[test]
    fn test_hysteresis_band_holds() {
        for blocked in [1000.0, 2500.0, 4000.0] {
            // ratios 0.2, 0.5, 0.8 all inside [0.2, 0.8]
            let decision = decide(&bounds(), 5000, blocked);
            assert_eq!(decision.new_limit, 5000, "blocked={}", blocked);
            assert_eq!(decision.reason, AdjustReason::Hold);
        }
    }

    #[test]
    fn test_hold_is_idempotent() {
        let first = decide(&bounds(), 5000, 2500.0);
        let second = decide(&bounds(), first.new_limit, 2500.0);
        assert_eq!(first.new_limit, second.new_limit);
    }

    #[test]
    fn test_already_at_max_holds_even_under_surge() {
        let decision = decide(&bounds(), 10000, 9500.0);
        assert_eq!(decision.new_limit, 10000);
        assert_eq!(decision.reason, AdjustReason::Hold);
    }

    #[test]
    fn test_already_at_min_holds_even_in_lull() {
        let decision = decide(&bounds(), 1000, 0.0);
        assert_eq!(decision.new_limit, 1000);
        assert_eq!(decision.reason, AdjustReason::Hold);
    }

    #[test]
    fn test_no_data_means_ratio_zero() {
        let decision = decide(&bounds(), 5000, 0.0);
        assert_eq!(decision.block_ratio, 0.0);
        assert_eq!(decision.reason, AdjustReason::TrafficLull);
    }

    #[test]
    fn test_zero_limit_guard_holds() {
        let decision = decide(&bounds(), 0, 500.0);
        assert_eq!(decision.new_limit, 0);
        assert_eq!(decision.reason, AdjustReason::Hold);
    }

    #[test]
    fn test_delta_sign() {
        assert!(decide(&bounds(), 5000, 4500.0).delta() > 0);
        assert!(decide(&bounds(), 2000, 100.0).delta() < 0);
        assert_eq!(decide(&bounds(), 5000, 2500.0).delta(), 0);
    }
}

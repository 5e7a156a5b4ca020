//! Bounded sampling of recent filtering decisions

use crate::stores::{SamplingService, StoreResult};
use parapet_common::{MetricWindow, PolicyRef, SampledRequest};
use std::sync::Arc;

/// Fetches a bounded sample of recent allow/block decisions for the managed
/// rule. One request per cycle, not a stream; the service may return fewer
/// records than asked for, and duplicates are possible. Downstream
/// reconciliation dedups.
pub struct ThreatSampler {
    sampling: Arc<dyn SamplingService>,
    policy: PolicyRef,
    rule_name: String,
    max_items: u32,
}

impl ThreatSampler {
    pub fn new(
        sampling: Arc<dyn SamplingService>,
        policy: PolicyRef,
        rule_name: String,
        max_items: u32,
    ) -> Self {
        Self {
            sampling,
            policy,
            rule_name,
            max_items,
        }
    }

    pub async fn sample(&self, window: &MetricWindow) -> StoreResult<Vec<SampledRequest>> {
        let mut samples = self
            .sampling
            .sample(&self.policy, &self.rule_name, window, self.max_items)
            .await?;

        // The bound is part of the contract; enforce it even if the
        // service over-returns.
        if samples.len() > self.max_items as usize {
            tracing::debug!(
                returned = samples.len(),
                max = self.max_items,
                "sampling service exceeded max_items, truncating"
            );
            samples.truncate(self.max_items as usize);
        }

        tracing::debug!(
            rule = %self.rule_name,
            count = samples.len(),
            "fetched request sample"
        );
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use parapet_common::{RequestAction, Scope, StoreError};

    struct FixedSampler {
        count: usize,
    }

    #[async_trait]
    impl SamplingService for FixedSampler {
        async fn sample(
            &self,
            _policy: &PolicyRef,
            _rule_name: &str,
            _window: &MetricWindow,
            _max_items: u32,
        ) -> Result<Vec<SampledRequest>, StoreError> {
            Ok((0..self.count)
                .map(|i| SampledRequest {
                    source_address: format!("10.0.0.{}", i % 250),
                    action: RequestAction::Block,
                    timestamp: Utc::now(),
                })
                .collect())
        }
    }

    fn sampler(service_count: usize, max_items: u32) -> ThreatSampler {
        ThreatSampler::new(
            Arc::new(FixedSampler {
                count: service_count,
            }),
            PolicyRef {
                id: "p-1".to_string(),
                name: "edge".to_string(),
                scope: Scope::Regional,
            },
            "rate-based-protection".to_string(),
            max_items,
        )
    }

    #[tokio::test]
    async fn test_fewer_than_max_is_fine() {
        let window = MetricWindow::hour_ending_at(Utc::now(), 300);
        let samples = sampler(7, 500).sample(&window).await.unwrap();
        assert_eq!(samples.len(), 7);
    }

    #[tokio::test]
    async fn test_bound_enforced_locally() {
        let window = MetricWindow::hour_ending_at(Utc::now(), 300);
        let samples = sampler(600, 500).sample(&window).await.unwrap();
        assert_eq!(samples.len(), 500);
    }
}

//! One pass of the protection cycle
//!
//! The orchestrator runs a single-pass state machine:
//!
//! ```text
//! FETCH_LIMIT -> FETCH_WINDOW_METRICS -> DECIDE_AND_APPLY_LIMIT
//!   -> FETCH_ADDRESS_SET -> FETCH_BLOCK_COUNT
//!   -> (block count above threshold ? SAMPLE_AND_RECONCILE : SKIP)
//!   -> EMIT_METRICS -> DONE
//! ```
//!
//! Failure in any state through SAMPLE_AND_RECONCILE aborts the cycle with a
//! stage-tagged [`CycleError`]; EMIT_METRICS failures are logged only and do
//! not change the reported outcome. The cycle is stateless: everything it
//! needs is read fresh, and the next scheduled invocation starts over.

use crate::config::Config;
use crate::control::{blocklist, rate_limit, BlocklistManager, RateLimitController, ThreatSampler};
use crate::error::{CycleError, Stage};
use crate::stores::{AddressSetStore, Collaborators};
use crate::telemetry::{MetricsGateway, TelemetryEmitter};
use chrono::{DateTime, Utc};
use parapet_common::{
    constants, CycleSummary, MetricDatum, MetricQuery, MetricUnit, MetricWindow, PolicyRule,
};
use std::collections::BTreeSet;
use std::sync::Arc;

pub struct Orchestrator {
    config: Config,
    address_sets: Arc<dyn AddressSetStore>,
    rate_controller: RateLimitController,
    blocklist: BlocklistManager,
    sampler: ThreatSampler,
    gateway: MetricsGateway,
    emitter: TelemetryEmitter,
}

impl Orchestrator {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let rate_controller = RateLimitController::new(
            collaborators.policies.clone(),
            config.policy.clone(),
            config.rate_rule_name.clone(),
            rate_limit::LimitBounds::from(&config),
        );
        let blocklist = BlocklistManager::new(
            collaborators.address_sets.clone(),
            config.address_set.clone(),
        );
        let sampler = ThreatSampler::new(
            collaborators.sampling.clone(),
            config.policy.clone(),
            config.rate_rule_name.clone(),
            config.sample_max_items,
        );
        let gateway = MetricsGateway::new(collaborators.metrics.clone());
        let emitter =
            TelemetryEmitter::new(collaborators.metrics, config.metric_namespace.clone());

        Self {
            config,
            address_sets: collaborators.address_sets,
            rate_controller,
            blocklist,
            sampler,
            gateway,
            emitter,
        }
    }

    /// Run one cycle over the window ending at `now`
    pub async fn run(&self, now: DateTime<Utc>) -> Result<CycleSummary, CycleError> {
        let cycle_id = uuid::Uuid::new_v4();
        let window = MetricWindow::ending_at(
            now,
            self.config.window_secs,
            constants::METRIC_PERIOD_SECONDS,
        );
        tracing::info!(
            %cycle_id,
            policy = %self.config.policy.name,
            window_secs = self.config.window_secs,
            "starting protection cycle"
        );

        // FETCH_LIMIT
        let (policy, current_limit) = self
            .rate_controller
            .fetch_policy()
            .await
            .map_err(|e| CycleError::read(Stage::FetchLimit, e))?;
        tracing::info!(limit = current_limit, "fetched current rate limit");

        // FETCH_WINDOW_METRICS: blocked requests across the whole policy
        let policy_blocked = self
            .gateway
            .aggregate(&self.policy_blocked_query(), &window)
            .await
            .map_err(|e| CycleError::read(Stage::FetchWindowMetrics, e))?;

        // DECIDE_AND_APPLY_LIMIT
        let decision = rate_limit::decide(
            self.rate_controller.bounds(),
            current_limit,
            policy_blocked,
        );
        tracing::info!(
            ratio = decision.block_ratio,
            reason = ?decision.reason,
            previous = decision.previous_limit,
            new = decision.new_limit,
            "rate-limit decision"
        );
        if decision.changed() {
            self.rate_controller
                .apply(&decision)
                .await
                .map_err(|e| CycleError::write(Stage::DecideAndApplyLimit, e))?;

            // The adjustment metric is emitted only once the write landed;
            // losing the datapoint is tolerated, losing the write is not.
            self.emitter
                .publish(&[MetricDatum {
                    name: constants::METRIC_RATE_LIMIT_ADJUSTMENT.to_string(),
                    dimensions: self.policy_dimensions(),
                    value: decision.delta() as f64,
                    unit: MetricUnit::Count,
                    timestamp: now,
                }])
                .await;
        }

        // FETCH_ADDRESS_SET: pre-read for merging and reporting. The lock
        // token from this read is deliberately discarded; the commit below
        // fetches its own token immediately before writing.
        let pre_read: BTreeSet<String> = self
            .address_sets
            .get(&self.config.address_set)
            .await
            .map_err(|e| CycleError::read(Stage::FetchAddressSet, e))?
            .value
            .addresses;

        // FETCH_BLOCK_COUNT: blocked requests attributed to the managed rule
        let rule_blocked = self
            .gateway
            .aggregate(
                &self.rule_blocked_query(&self.config.rate_rule_name),
                &window,
            )
            .await
            .map_err(|e| CycleError::read(Stage::FetchBlockCount, e))?;
        let block_count = rule_blocked.round() as u64;

        // SAMPLE_AND_RECONCILE, gated on the abuse trigger
        let blocked_address_count = if block_count > self.config.block_count_threshold {
            let samples = self
                .sampler
                .sample(&window)
                .await
                .map_err(|e| CycleError::read(Stage::SampleAndReconcile, e))?;
            let candidates = blocklist::candidates(&samples);
            let merged = blocklist::reconcile(&pre_read, &candidates);
            self.blocklist
                .commit(merged)
                .await
                .map_err(|e| CycleError::write(Stage::SampleAndReconcile, e))?
        } else {
            tracing::info!(
                block_count,
                threshold = self.config.block_count_threshold,
                "block count below threshold, skipping blocklist reconcile"
            );
            pre_read.len() as u64
        };

        // EMIT_METRICS: never fatal
        self.emit_cycle_metrics(
            &policy.value.rules,
            &window,
            block_count,
            blocked_address_count,
            now,
        )
        .await;

        let summary = CycleSummary {
            previous_limit: decision.previous_limit,
            new_limit: decision.new_limit,
            block_ratio: decision.block_ratio,
            block_count,
            blocked_address_count,
            message: "protection cycle completed".to_string(),
        };
        tracing::info!(
            %cycle_id,
            previous = summary.previous_limit,
            new = summary.new_limit,
            block_count = summary.block_count,
            blocked_addresses = summary.blocked_address_count,
            "protection cycle done"
        );
        Ok(summary)
    }

    fn policy_dimensions(&self) -> Vec<(String, String)> {
        vec![(
            constants::DIMENSION_POLICY.to_string(),
            self.config.policy.name.clone(),
        )]
    }

    fn policy_blocked_query(&self) -> MetricQuery {
        MetricQuery::sum(constants::METRIC_BLOCKED_REQUESTS, self.policy_dimensions())
    }

    fn rule_blocked_query(&self, rule_name: &str) -> MetricQuery {
        let mut dimensions = self.policy_dimensions();
        dimensions.push((constants::DIMENSION_RULE.to_string(), rule_name.to_string()));
        MetricQuery::sum(constants::METRIC_BLOCKED_REQUESTS, dimensions)
    }

    /// Best-effort terminal telemetry. Per-rule block counts are fetched
    /// concurrently and joined by partial success: a failed dimension is
    /// skipped, the rest still publish.
    async fn emit_cycle_metrics(
        &self,
        rules: &[PolicyRule],
        window: &MetricWindow,
        block_count: u64,
        blocked_address_count: u64,
        now: DateTime<Utc>,
    ) {
        let window_secs = window.duration_secs().max(1);
        let mut batch = vec![
            MetricDatum {
                name: constants::METRIC_BLOCKED_ADDRESS_COUNT.to_string(),
                dimensions: self.policy_dimensions(),
                value: blocked_address_count as f64,
                unit: MetricUnit::Count,
                timestamp: now,
            },
            MetricDatum {
                name: constants::METRIC_BLOCKED_REQUEST_RATE.to_string(),
                dimensions: self.policy_dimensions(),
                value: block_count as f64 / window_secs as f64,
                unit: MetricUnit::CountPerSecond,
                timestamp: now,
            },
        ];

        // Per-rule enrichment across every rule in the policy
        let queries: Vec<MetricQuery> = rules
            .iter()
            .map(|rule| self.rule_blocked_query(&rule.name))
            .collect();
        let results = self.gateway.aggregate_many(&queries, window).await;
        for (rule, blocked) in rules.iter().zip(results) {
            if let Some(blocked) = blocked {
                batch.push(MetricDatum {
                    name: constants::METRIC_BLOCKED_REQUESTS.to_string(),
                    dimensions: {
                        let mut dims = self.policy_dimensions();
                        dims.push((
                            constants::DIMENSION_RULE.to_string(),
                            rule.name.clone(),
                        ));
                        dims
                    },
                    value: blocked,
                    unit: MetricUnit::Count,
                    timestamp: now,
                });
            }
        }

        let published = self.emitter.publish(&batch).await;
        tracing::debug!(published, total = batch.len(), "cycle telemetry emitted");
    }
}

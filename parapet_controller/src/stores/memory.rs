//! In-memory stores with real compare-and-swap semantics
//!
//! Backs the `--backend memory` smoke mode and the test suite. Lock tokens
//! rotate on every successful write, so stale-token rejection behaves
//! exactly like the live filtering engine.

use super::{
    AddressSetStore, Collaborators, MetricsBackend, PolicyStore, SamplingService, StoreResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parapet_common::{
    AddressSet, AddressSetRef, LockToken, MetricDatum, MetricQuery, MetricWindow, PolicyRef,
    ProtectionPolicy, RuleStatement, SampledRequest, StoreError, Versioned,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One store implementing all four collaborator interfaces
#[derive(Default)]
pub struct MemoryStore {
    policies: DashMap<String, Versioned<ProtectionPolicy>>,
    address_sets: DashMap<String, Versioned<AddressSet>>,
    /// Scripted samples keyed by policy id
    samples: DashMap<String, Vec<SampledRequest>>,
    /// Metric series keyed by name + dimensions
    series: DashMap<String, Vec<(DateTime<Utc>, f64)>>,
    /// Everything published through the backend, for inspection
    published: Mutex<Vec<(String, Vec<MetricDatum>)>>,
}

fn series_key(name: &str, dimensions: &[(String, String)]) -> String {
    let mut key = name.to_string();
    for (k, v) in dimensions {
        key.push('|');
        key.push_str(k);
        key.push('=');
        key.push_str(v);
    }
    key
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundle one shared store as all four collaborators
    pub fn collaborators(self: Arc<Self>) -> Collaborators {
        Collaborators {
            policies: self.clone(),
            address_sets: self.clone(),
            metrics: self.clone(),
            sampling: self,
        }
    }

    pub fn insert_policy(&self, policy: ProtectionPolicy) {
        self.policies.insert(
            policy.id.clone(),
            Versioned {
                value: policy,
                lock_token: LockToken::random(),
            },
        );
    }

    pub fn insert_address_set(&self, set: AddressSet) {
        self.address_sets.insert(
            set.id.clone(),
            Versioned {
                value: set,
                lock_token: LockToken::random(),
            },
        );
    }

    pub fn set_series(
        &self,
        name: &str,
        dimensions: &[(String, String)],
        points: Vec<(DateTime<Utc>, f64)>,
    ) {
        self.series.insert(series_key(name, dimensions), points);
    }

    pub fn push_samples(&self, policy_id: &str, mut new: Vec<SampledRequest>) {
        self.samples
            .entry(policy_id.to_string())
            .or_default()
            .append(&mut new);
    }

    /// Current policy value, for assertions
    pub fn policy(&self, id: &str) -> Option<ProtectionPolicy> {
        self.policies.get(id).map(|v| v.value.clone())
    }

    /// Current address set value, for assertions
    pub fn address_set(&self, id: &str) -> Option<AddressSet> {
        self.address_sets.get(id).map(|v| v.value.clone())
    }

    /// Everything published so far: (namespace, chunk) pairs
    pub async fn published(&self) -> Vec<(String, Vec<MetricDatum>)> {
        self.published.lock().await.clone()
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn get(&self, policy: &PolicyRef) -> StoreResult<Versioned<ProtectionPolicy>> {
        self.policies
            .get(&policy.id)
            .map(|v| v.clone())
            .ok_or_else(|| StoreError::NotFound(format!("policy/{}", policy.name)))
    }

    async fn update_rate_limit(
        &self,
        policy: &PolicyRef,
        rule_name: &str,
        new_limit: u64,
        lock_token: LockToken,
    ) -> StoreResult<()> {
        let mut entry = self
            .policies
            .get_mut(&policy.id)
            .ok_or_else(|| StoreError::NotFound(format!("policy/{}", policy.name)))?;

        if entry.lock_token != lock_token {
            return Err(StoreError::Conflict(format!("policy/{}", policy.name)));
        }

        let rule = entry
            .value
            .rules
            .iter_mut()
            .find(|r| r.name == rule_name)
            .ok_or_else(|| StoreError::NotFound(format!("rule/{}", rule_name)))?;
        match &mut rule.statement {
            RuleStatement::RateBased { limit } => *limit = new_limit,
            RuleStatement::Other => {
                return Err(StoreError::NotFound(format!(
                    "rate-based rule/{}",
                    rule_name
                )))
            }
        }

        entry.lock_token = LockToken::random();
        Ok(())
    }
}

#[async_trait]
impl AddressSetStore for MemoryStore {
    async fn get(&self, set: &AddressSetRef) -> StoreResult<Versioned<AddressSet>> {
        self.address_sets
            .get(&set.id)
            .map(|v| v.clone())
            .ok_or_else(|| StoreError::NotFound(format!("address-set/{}", set.name)))
    }

    async fn update(
        &self,
        set: &AddressSetRef,
        addresses: BTreeSet<String>,
        lock_token: LockToken,
    ) -> StoreResult<()> {
        let mut entry = self
            .address_sets
            .get_mut(&set.id)
            .ok_or_else(|| StoreError::NotFound(format!("address-set/{}", set.name)))?;

        if entry.lock_token != lock_token {
            return Err(StoreError::Conflict(format!("address-set/{}", set.name)));
        }

        entry.value.addresses = addresses;
        entry.lock_token = LockToken::random();
        Ok(())
    }
}

#[async_trait]
impl MetricsBackend for MemoryStore {
    async fn query(
        &self,
        query: &MetricQuery,
        window: &MetricWindow,
    ) -> StoreResult<Vec<(DateTime<Utc>, f64)>> {
        let points = self
            .series
            .get(&series_key(&query.name, &query.dimensions))
            .map(|p| {
                p.iter()
                    .filter(|(ts, _)| *ts >= window.start && *ts <= window.end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(points)
    }

    async fn publish(&self, namespace: &str, batch: &[MetricDatum]) -> StoreResult<()> {
        self.published
            .lock()
            .await
            .push((namespace.to_string(), batch.to_vec()));
        Ok(())
    }
}

#[async_trait]
impl SamplingService for MemoryStore {
    async fn sample(
        &self,
        policy: &PolicyRef,
        _rule_name: &str,
        window: &MetricWindow,
        max_items: u32,
    ) -> StoreResult<Vec<SampledRequest>> {
        let mut samples: Vec<SampledRequest> = self
            .samples
            .get(&policy.id)
            .map(|s| {
                s.iter()
                    .filter(|r| r.timestamp >= window.start && r.timestamp <= window.end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        samples.truncate(max_items as usize);
        Ok(samples)
    }
}

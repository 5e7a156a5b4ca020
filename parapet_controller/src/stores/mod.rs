//! Collaborator interfaces for the external resources the controller mutates
//!
//! The controller never talks to a backend directly; it goes through these
//! traits so a cycle can run unchanged against the live filtering engine,
//! Redis, or the in-memory stores used for local runs and tests.
//!
//! Writes are single atomic compare-and-swap operations: every write
//! presents the lock token from a prior read of the same resource, and a
//! store must reject a stale token with [`StoreError::Conflict`], never
//! accept it.

pub mod http;
pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parapet_common::{
    AddressSet, AddressSetRef, LockToken, MetricDatum, MetricQuery, MetricWindow, PolicyRef,
    ProtectionPolicy, SampledRequest, StoreError, Versioned,
};
use std::collections::BTreeSet;
use std::sync::Arc;

pub type StoreResult<T> = Result<T, StoreError>;

/// Read and CAS-update access to protection policies
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get(&self, policy: &PolicyRef) -> StoreResult<Versioned<ProtectionPolicy>>;

    /// Narrowed update: replace one rate-based rule's limit, leaving the
    /// rest of the rule list untouched. Rejects a stale token with
    /// `Conflict` and an unknown rule with `NotFound`.
    async fn update_rate_limit(
        &self,
        policy: &PolicyRef,
        rule_name: &str,
        new_limit: u64,
        lock_token: LockToken,
    ) -> StoreResult<()>;
}

/// Read and CAS-update access to blocked-address sets
#[async_trait]
pub trait AddressSetStore: Send + Sync {
    async fn get(&self, set: &AddressSetRef) -> StoreResult<Versioned<AddressSet>>;

    async fn update(
        &self,
        set: &AddressSetRef,
        addresses: BTreeSet<String>,
        lock_token: LockToken,
    ) -> StoreResult<()>;
}

/// Aggregate metric reads and telemetry writes
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    /// Datapoints for `query` within `window`. An empty result means no
    /// observed activity, not an error.
    async fn query(
        &self,
        query: &MetricQuery,
        window: &MetricWindow,
    ) -> StoreResult<Vec<(DateTime<Utc>, f64)>>;

    async fn publish(&self, namespace: &str, batch: &[MetricDatum]) -> StoreResult<()>;
}

/// Bounded sampling of recent allow/block decisions.
///
/// A sample is a single bounded request, restartable and idempotent from the
/// caller's point of view. It may return fewer than `max_items` records and
/// gives no dedup guarantee; callers dedup downstream.
#[async_trait]
pub trait SamplingService: Send + Sync {
    async fn sample(
        &self,
        policy: &PolicyRef,
        rule_name: &str,
        window: &MetricWindow,
        max_items: u32,
    ) -> StoreResult<Vec<SampledRequest>>;
}

/// The full set of collaborators a cycle runs against
#[derive(Clone)]
pub struct Collaborators {
    pub policies: Arc<dyn PolicyStore>,
    pub address_sets: Arc<dyn AddressSetStore>,
    pub metrics: Arc<dyn MetricsBackend>,
    pub sampling: Arc<dyn SamplingService>,
}

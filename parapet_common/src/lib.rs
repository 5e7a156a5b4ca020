//! Parapet Common - Shared data model for the traffic-protection controller
//!
//! This crate contains the resource types, metric types and cycle summary
//! used by the controller and by store implementations.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by collaborator stores.
///
/// `Conflict` is deliberately its own variant: a rejected compare-and-swap is
/// a benign race with another cycle or an operator, not a backend defect, and
/// operators need to be able to tell the two apart.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("lock token conflict on {0}: resource was modified concurrently")]
    Conflict(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Opaque version marker returned by every resource read.
///
/// A write must present the token unchanged; a mismatch means the resource
/// changed since the read and the write is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockToken(pub String);

impl LockToken {
    /// Mint a fresh token (used by stores after a successful write)
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A resource value paired with the lock token from the read that produced it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub value: T,
    pub lock_token: LockToken,
}

/// Deployment scope of a policy or address set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Scope {
    Regional,
    Global,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Regional => "REGIONAL",
            Scope::Global => "GLOBAL",
        }
    }
}

impl std::str::FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "REGIONAL" => Ok(Scope::Regional),
            "GLOBAL" => Ok(Scope::Global),
            other => Err(format!("unknown scope: {}", other)),
        }
    }
}

/// Identifies a protection policy in the filtering engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRef {
    pub id: String,
    pub name: String,
    pub scope: Scope,
}

/// Identifies an address set in the filtering engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSetRef {
    pub id: String,
    pub name: String,
    pub scope: Scope,
}

/// The matching statement of a policy rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleStatement {
    /// Blocks a source once it exceeds `limit` requests in the engine's
    /// evaluation window
    RateBased { limit: u64 },
    /// Any other rule kind; the controller never touches these
    Other,
}

/// One rule in a protection policy's ordered rule list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub name: String,
    pub priority: u32,
    pub statement: RuleStatement,
}

/// Protection policy owned by the filtering engine.
///
/// The controller only ever holds a transient read copy per cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionPolicy {
    pub id: String,
    pub name: String,
    pub scope: Scope,
    pub rules: Vec<PolicyRule>,
}

impl ProtectionPolicy {
    /// Current limit of the named rate-based rule, if present
    pub fn rate_limit(&self, rule_name: &str) -> Option<u64> {
        self.rules.iter().find_map(|r| match &r.statement {
            RuleStatement::RateBased { limit } if r.name == rule_name => Some(*limit),
            _ => None,
        })
    }
}

/// Set of blocked source addresses (CIDR strings) enforced by the
/// filtering layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressSet {
    pub id: String,
    pub name: String,
    pub scope: Scope,
    pub addresses: BTreeSet<String>,
}

/// Observation window for metric queries and sampling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Aggregation period of the backing datapoints, in seconds
    pub period_secs: u32,
}

impl MetricWindow {
    /// The hour ending at `end`
    pub fn hour_ending_at(end: DateTime<Utc>, period_secs: u32) -> Self {
        Self {
            start: end - Duration::hours(1),
            end,
            period_secs,
        }
    }

    /// Window of `secs` seconds ending at `end`
    pub fn ending_at(end: DateTime<Utc>, secs: u64, period_secs: u32) -> Self {
        Self {
            start: end - Duration::seconds(secs as i64),
            end,
            period_secs,
        }
    }

    pub fn duration_secs(&self) -> u64 {
        (self.end - self.start).num_seconds().max(0) as u64
    }
}

/// Statistic applied to datapoints within a period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricStat {
    Sum,
    Average,
    Maximum,
}

/// A metric read request against the metrics backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricQuery {
    pub name: String,
    pub dimensions: Vec<(String, String)>,
    pub stat: MetricStat,
}

impl MetricQuery {
    pub fn sum(name: impl Into<String>, dimensions: Vec<(String, String)>) -> Self {
        Self {
            name: name.into(),
            dimensions,
            stat: MetricStat::Sum,
        }
    }
}

/// Unit attached to a published datapoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricUnit {
    Count,
    CountPerSecond,
}

/// One datapoint to publish to the metrics backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDatum {
    pub name: String,
    pub dimensions: Vec<(String, String)>,
    pub value: f64,
    pub unit: MetricUnit,
    pub timestamp: DateTime<Utc>,
}

/// Allow/block verdict recorded for a sampled request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestAction {
    Allow,
    Block,
}

/// One sampled request from the filtering engine.
///
/// Ephemeral: sampled requests are inspected within the cycle and never
/// persisted by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampledRequest {
    pub source_address: String,
    pub action: RequestAction,
    pub timestamp: DateTime<Utc>,
}

/// Why the rate-limit feedback loop moved (or held) the limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustReason {
    /// Block ratio above the increase threshold: raise the limit
    TrafficSurge,
    /// Block ratio below the decrease threshold: tighten the limit
    TrafficLull,
    /// Ratio inside the hysteresis band, or limit already at a bound
    Hold,
}

/// Outcome of one rate-limit decision, emitted as telemetry and logs only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlDecision {
    pub previous_limit: u64,
    pub new_limit: u64,
    pub block_ratio: f64,
    pub reason: AdjustReason,
}

impl ControlDecision {
    /// Whether the decision calls for a policy write
    pub fn changed(&self) -> bool {
        self.new_limit != self.previous_limit
    }

    /// Signed limit delta (negative when tightening)
    pub fn delta(&self) -> i64 {
        self.new_limit as i64 - self.previous_limit as i64
    }
}

/// Terminal output of one controller cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    pub previous_limit: u64,
    pub new_limit: u64,
    pub block_ratio: f64,
    pub block_count: u64,
    pub blocked_address_count: u64,
    pub message: String,
}

impl CycleSummary {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

/// Constants shared by the controller and its stores
pub mod constants {
    /// Lower saturation bound for the adaptive rate limit
    pub const MIN_RATE_LIMIT: u64 = 1000;

    /// Upper saturation bound for the adaptive rate limit
    pub const MAX_RATE_LIMIT: u64 = 10000;

    /// Block ratio above which the limit is raised
    pub const RATE_INCREASE_THRESHOLD: f64 = 0.8;

    /// Block ratio below which the limit is tightened
    pub const RATE_DECREASE_THRESHOLD: f64 = 0.2;

    /// Multiplier applied when raising the limit
    pub const RATE_INCREASE_FACTOR: f64 = 1.5;

    /// Multiplier applied when tightening the limit
    pub const RATE_DECREASE_FACTOR: f64 = 0.8;

    /// Blocked-request count (strictly) above which the blocklist is grown
    pub const BLOCK_COUNT_THRESHOLD: u64 = 100;

    /// Default observation window
    pub const WINDOW_SECONDS: u64 = 3600;

    /// Aggregation period of windowed metric queries, in seconds
    pub const METRIC_PERIOD_SECONDS: u32 = 300;

    /// Upper bound on sampled requests fetched per cycle
    pub const SAMPLE_MAX_ITEMS: u32 = 500;

    /// Maximum datapoints per publish call to the metrics backend
    pub const METRIC_BATCH_MAX: usize = 20;

    /// Default namespace for controller telemetry
    pub const METRIC_NAMESPACE: &str = "parapet/controller";

    /// Blocked requests observed by the filtering engine
    pub const METRIC_BLOCKED_REQUESTS: &str = "blocked_requests";

    /// Signed limit delta emitted after a successful policy write
    pub const METRIC_RATE_LIMIT_ADJUSTMENT: &str = "rate_limit_adjustment";

    /// Size of the blocklist after reconciliation
    pub const METRIC_BLOCKED_ADDRESS_COUNT: &str = "blocked_address_count";

    /// Blocked requests per second over the window
    pub const METRIC_BLOCKED_REQUEST_RATE: &str = "blocked_request_rate";

    /// Dimension naming the policy a datapoint belongs to
    pub const DIMENSION_POLICY: &str = "policy";

    /// Dimension naming the rule a datapoint belongs to
    pub const DIMENSION_RULE: &str = "rule";
}

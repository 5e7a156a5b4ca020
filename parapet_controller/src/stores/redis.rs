//! Redis-backed metrics backend
//!
//! Datapoints land in per-period counter buckets
//! (`metric:{namespace}:{name}:{dims}:{bucket}`) via INCRBYFLOAT; a windowed
//! query reads the buckets covering the window and returns one point per
//! non-empty bucket. Buckets expire after 24 hours, which comfortably covers
//! the one-hour observation window.

use super::{MetricsBackend, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use fred::clients::Client;
use fred::interfaces::*;
use fred::types::config::Config as RedisConfig;
use parapet_common::{MetricDatum, MetricQuery, MetricStat, MetricWindow, StoreError};

/// Bucket retention in seconds
const RETENTION_SECS: i64 = 24 * 3600;

/// Initialize Redis client
pub async fn init_client(redis_url: &str) -> anyhow::Result<Client> {
    let config = RedisConfig::from_url(redis_url)?;
    let client = Client::new(config, None, None, None);
    client.init().await?;
    Ok(client)
}

pub struct RedisMetrics {
    client: Client,
    namespace: String,
}

impl RedisMetrics {
    pub fn new(client: Client, namespace: String) -> Self {
        Self { client, namespace }
    }

    /// Ping Redis to check the connection
    pub async fn ping(&self) -> anyhow::Result<()> {
        self.client.ping::<()>(None).await?;
        Ok(())
    }

    fn bucket_key(
        namespace: &str,
        name: &str,
        dimensions: &[(String, String)],
        bucket_start: i64,
    ) -> String {
        let mut key = format!("metric:{}:{}", namespace, name);
        for (k, v) in dimensions {
            key.push(':');
            key.push_str(k);
            key.push('=');
            key.push_str(v);
        }
        key.push(':');
        key.push_str(&bucket_start.to_string());
        key
    }
}

fn backend_err(e: fred::error::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl MetricsBackend for RedisMetrics {
    async fn query(
        &self,
        query: &MetricQuery,
        window: &MetricWindow,
    ) -> StoreResult<Vec<(DateTime<Utc>, f64)>> {
        if query.stat != MetricStat::Sum {
            return Err(StoreError::Backend(format!(
                "redis metrics backend only supports sum, got {:?}",
                query.stat
            )));
        }

        let period = window.period_secs.max(1) as i64;
        let first_bucket = window.start.timestamp() / period * period;
        let last_bucket = window.end.timestamp() / period * period;

        let mut points = Vec::new();
        let mut bucket = first_bucket;
        while bucket <= last_bucket {
            let key = Self::bucket_key(&self.namespace, &query.name, &query.dimensions, bucket);
            let value: Option<f64> = self.client.get(&key).await.map_err(backend_err)?;
            if let Some(value) = value {
                // Missing buckets are simply absent datapoints
                let ts = Utc
                    .timestamp_opt(bucket, 0)
                    .single()
                    .unwrap_or(window.start);
                points.push((ts, value));
            }
            bucket += period;
        }
        Ok(points)
    }

    async fn publish(&self, namespace: &str, batch: &[MetricDatum]) -> StoreResult<()> {
        for datum in batch {
            let period = parapet_common::constants::METRIC_PERIOD_SECONDS as i64;
            let bucket = datum.timestamp.timestamp() / period * period;
            let key = Self::bucket_key(namespace, &datum.name, &datum.dimensions, bucket);

            let _: f64 = self
                .client
                .incr_by_float(&key, datum.value)
                .await
                .map_err(backend_err)?;
            let _: () = self
                .client
                .expire(&key, RETENTION_SECS, None)
                .await
                .map_err(backend_err)?;
        }
        Ok(())
    }
}

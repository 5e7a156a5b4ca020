//! Metric reads and telemetry writes
//!
//! Reads are strict about absence: a window with no datapoints aggregates to
//! zero, never an error. Writes are best-effort: batches are split to the
//! backend's per-call cap and a failed chunk never fails the cycle.

use crate::stores::MetricsBackend;
use crate::stores::StoreResult;
use futures_util::future::join_all;
use parapet_common::{constants, MetricDatum, MetricQuery, MetricWindow};
use std::sync::Arc;

/// Read-side wrapper over the metrics backend
#[derive(Clone)]
pub struct MetricsGateway {
    backend: Arc<dyn MetricsBackend>,
}

impl MetricsGateway {
    pub fn new(backend: Arc<dyn MetricsBackend>) -> Self {
        Self { backend }
    }

    /// Aggregate the datapoints for one query over the window.
    ///
    /// No datapoints means no observed activity: returns 0.0.
    pub async fn aggregate(&self, query: &MetricQuery, window: &MetricWindow) -> StoreResult<f64> {
        let points = self.backend.query(query, window).await?;
        Ok(points.iter().map(|(_, value)| value).sum())
    }

    /// Aggregate several independent queries concurrently, joined by partial
    /// success: each slot carries a value only if its own query succeeded.
    /// n-of-m success is a valid outcome, not a failure.
    pub async fn aggregate_many(
        &self,
        queries: &[MetricQuery],
        window: &MetricWindow,
    ) -> Vec<Option<f64>> {
        let futures = queries.iter().map(|query| self.aggregate(query, window));
        join_all(futures)
            .await
            .into_iter()
            .zip(queries)
            .map(|(result, query)| match result {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(metric = %query.name, error = %e, "metric query failed, skipping dimension");
                    None
                }
            })
            .collect()
    }
}

/// Write-side wrapper over the metrics backend
#[derive(Clone)]
pub struct TelemetryEmitter {
    backend: Arc<dyn MetricsBackend>,
    namespace: String,
}

impl TelemetryEmitter {
    pub fn new(backend: Arc<dyn MetricsBackend>, namespace: String) -> Self {
        Self { backend, namespace }
    }

    /// Publish a batch of datapoints, split into chunks of at most
    /// [`constants::METRIC_BATCH_MAX`] per backend call.
    ///
    /// Telemetry loss is tolerated: a failed chunk is logged and the
    /// remaining chunks are still attempted. Returns the number of
    /// datapoints actually published.
    pub async fn publish(&self, batch: &[MetricDatum]) -> usize {
        let mut published = 0;
        for chunk in batch.chunks(constants::METRIC_BATCH_MAX) {
            match self.backend.publish(&self.namespace, chunk).await {
                Ok(()) => published += chunk.len(),
                Err(e) => {
                    tracing::warn!(
                        namespace = %self.namespace,
                        dropped = chunk.len(),
                        error = %e,
                        "telemetry chunk failed, continuing"
                    );
                }
            }
        }
        published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use parapet_common::{MetricStat, MetricUnit, StoreError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Backend fake: scripted per-query results, optional failure on a
    /// given publish call, records publish chunk sizes.
    struct FakeBackend {
        series: Vec<(String, Vec<(DateTime<Utc>, f64)>)>,
        failing_queries: Vec<String>,
        fail_publish_call: Option<usize>,
        publish_calls: AtomicUsize,
        published_chunks: Mutex<Vec<usize>>,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self {
                series: Vec::new(),
                failing_queries: Vec::new(),
                fail_publish_call: None,
                publish_calls: AtomicUsize::new(0),
                published_chunks: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MetricsBackend for FakeBackend {
        async fn query(
            &self,
            query: &MetricQuery,
            _window: &MetricWindow,
        ) -> Result<Vec<(DateTime<Utc>, f64)>, StoreError> {
            if self.failing_queries.contains(&query.name) {
                return Err(StoreError::Backend("query failed".to_string()));
            }
            Ok(self
                .series
                .iter()
                .find(|(name, _)| *name == query.name)
                .map(|(_, points)| points.clone())
                .unwrap_or_default())
        }

        async fn publish(
            &self,
            _namespace: &str,
            batch: &[MetricDatum],
        ) -> Result<(), StoreError> {
            let call = self.publish_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_publish_call == Some(call) {
                return Err(StoreError::Backend("publish failed".to_string()));
            }
            self.published_chunks.lock().unwrap().push(batch.len());
            Ok(())
        }
    }

    fn datum(name: &str) -> MetricDatum {
        MetricDatum {
            name: name.to_string(),
            dimensions: vec![],
            value: 1.0,
            unit: MetricUnit::Count,
            timestamp: Utc::now(),
        }
    }

    fn window() -> MetricWindow {
        MetricWindow::hour_ending_at(Utc::now(), 300)
    }

    #[tokio::test]
    async fn test_aggregate_sums_points() {
        let mut backend = FakeBackend::new();
        let now = Utc::now();
        backend.series.push((
            "blocked_requests".to_string(),
            vec![(now, 1000.0), (now, 2000.0), (now, 1500.0)],
        ));
        let gateway = MetricsGateway::new(Arc::new(backend));

        let query = MetricQuery::sum("blocked_requests", vec![]);
        assert_eq!(gateway.aggregate(&query, &window()).await.unwrap(), 4500.0);
    }

    #[tokio::test]
    async fn test_aggregate_empty_window_is_zero() {
        let gateway = MetricsGateway::new(Arc::new(FakeBackend::new()));
        let query = MetricQuery {
            name: "blocked_requests".to_string(),
            dimensions: vec![],
            stat: MetricStat::Sum,
        };
        assert_eq!(gateway.aggregate(&query, &window()).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_aggregate_many_partial_success() {
        let mut backend = FakeBackend::new();
        let now = Utc::now();
        backend
            .series
            .push(("good".to_string(), vec![(now, 5.0)]));
        backend.failing_queries.push("bad".to_string());
        let gateway = MetricsGateway::new(Arc::new(backend));

        let queries = vec![
            MetricQuery::sum("good", vec![]),
            MetricQuery::sum("bad", vec![]),
            MetricQuery::sum("absent", vec![]),
        ];
        let results = gateway.aggregate_many(&queries, &window()).await;
        assert_eq!(results, vec![Some(5.0), None, Some(0.0)]);
    }

    #[tokio::test]
    async fn test_publish_chunks_at_cap() {
        let backend = Arc::new(FakeBackend::new());
        let emitter = TelemetryEmitter::new(backend.clone(), "test".to_string());

        let batch: Vec<MetricDatum> = (0..45).map(|i| datum(&format!("m{}", i))).collect();
        let published = emitter.publish(&batch).await;

        assert_eq!(published, 45);
        assert_eq!(
            *backend.published_chunks.lock().unwrap(),
            vec![20, 20, 5]
        );
    }

    #[tokio::test]
    async fn test_failed_chunk_does_not_stop_the_rest() {
        let backend = Arc::new(FakeBackend {
            fail_publish_call: Some(1),
            ..FakeBackend::new()
        });
        let emitter = TelemetryEmitter::new(backend.clone(), "test".to_string());

        let batch: Vec<MetricDatum> = (0..45).map(|i| datum(&format!("m{}", i))).collect();
        let published = emitter.publish(&batch).await;

        // Middle chunk of 20 dropped, first and last still land
        assert_eq!(published, 25);
        assert_eq!(*backend.published_chunks.lock().unwrap(), vec![20, 5]);
    }
}

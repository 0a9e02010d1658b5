//! Convoy Metrics
//!
//! The observability pipeline of the control plane:
//! - Concurrent collector over container stats and HTTP health probes
//! - Append-only time-series store with TTL, range queries, aggregation
//! - Threshold alert engine with a bounded history ring
//! - Pull-scrape HTTP endpoint serving a text exposition format
//!
//! Writers (the collector) and readers (alerts, exporter) share samples
//! through the store, which serializes all mutations.

#![allow(dead_code)]

pub mod alerts;
pub mod analysis;
pub mod collector;
pub mod exporter;
pub mod store;

pub use alerts::{Alert, AlertEngine, HistoryEntry, OverallStatus, Severity, Threshold};
pub use analysis::{Anomaly, HealthGrade, HealthScore, TrendDirection, TrendReport};
pub use collector::{
    CollectorConfig, FakeProber, HealthProber, HttpProber, MetricsCollector, MetricsSnapshot,
    MetricsSource, ServiceMetrics, ServiceProbe, SnapshotMeta, SystemAverages,
};
pub use exporter::{ExporterConfig, ScrapeServer, ServerError};
pub use store::{
    AggregateFn, AggregatedPoint, CleanupReport, Keyspace, KeyspaceInfo, MemoryKeyspace,
    MetricSample, Query, QueryResult, StorageError, StoreStats, TimeSeriesStore,
};

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// The assembled observability pipeline: one collector feeding the store
/// and the alert engine on a fixed cadence.
pub struct MetricsPipeline {
    /// Snapshot collector
    pub collector: Arc<MetricsCollector>,
    /// Sample store
    pub store: Arc<TimeSeriesStore>,
    /// Threshold engine
    pub alerts: Arc<AlertEngine>,
    interval: Duration,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MetricsPipeline {
    /// Pipeline over an assembled collector and store
    pub fn new(
        collector: Arc<MetricsCollector>,
        store: Arc<TimeSeriesStore>,
        alerts: Arc<AlertEngine>,
    ) -> Self {
        Self {
            collector,
            store,
            alerts,
            interval: Duration::from_secs(30),
            task: Mutex::new(None),
        }
    }

    /// Override the collection cadence
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One pass: collect, persist, evaluate. Returns the active alerts.
    pub async fn tick(&self) -> Vec<Alert> {
        let snapshot = self.collector.collect(true).await;
        if let Err(e) = self.collector.persist(&self.store, &snapshot) {
            tracing::warn!(error = %e, "snapshot persist failed");
        }
        self.alerts.evaluate(&snapshot)
    }

    /// Run ticks in the background until [`MetricsPipeline::stop`]
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let collector = self.collector.clone();
        let store = self.store.clone();
        let alerts = self.alerts.clone();
        let interval = self.interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let snapshot = collector.collect(true).await;
                if let Err(e) = collector.persist(&store, &snapshot) {
                    tracing::warn!(error = %e, "snapshot persist failed");
                }
                alerts.evaluate(&snapshot);
            }
        }));
    }

    /// Stop the background loop; a no-op when not running
    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for MetricsPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

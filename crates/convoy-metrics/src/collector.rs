//! Metrics collector
//!
//! One snapshot per collection pass: container stats from the
//! orchestrator merged with HTTP health probes, collected in parallel
//! with per-service timeouts and bounded retries. A TTL cache answers
//! repeat calls until it expires or the caller bypasses it.

use crate::analysis;
use crate::store::{MetricSample, TimeSeriesStore};
use async_trait::async_trait;
use convoy_compose::{ContainerStats, Orchestrator};
use convoy_core::{Clock, ServiceRegistry, SystemClock};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinSet;

/// Collector tuning
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Per-service collection deadline
    pub service_timeout: Duration,
    /// Attempts per service before recording a failure
    pub retries: u32,
    /// Snapshot cache lifetime
    pub cache_ttl: Duration,
    /// Also scrape each service's own `/metrics`
    pub scrape_custom_metrics: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            service_timeout: Duration::from_secs(10),
            retries: 2,
            cache_ttl: Duration::from_secs(30),
            scrape_custom_metrics: false,
        }
    }
}

/// Collection failure after exhausting retries
#[derive(Debug, Clone, Error, Serialize)]
#[error("collection failed after {retry_count} attempts: {cause}")]
pub struct CollectionError {
    pub retry_count: u32,
    pub cause: String,
}

/// Outcome of probing a service's `/health`
#[derive(Debug, Clone, Serialize)]
pub struct ServiceProbe {
    /// Milliseconds to first byte; absent when not responding
    pub response_time_ms: Option<f64>,
    /// `"ok"` or `"not_responding"`
    pub status: String,
    pub http_status: Option<u16>,
}

impl ServiceProbe {
    /// Probe that did not get a 200 in time
    pub fn not_responding() -> Self {
        Self {
            response_time_ms: None,
            status: "not_responding".into(),
            http_status: None,
        }
    }

    /// Whether the service answered
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// Everything collected for one service in one pass
#[derive(Debug, Clone, Serialize)]
pub struct ServiceMetrics {
    pub service: String,
    /// Container stats; absent when the engine had nothing
    pub stats: Option<ContainerStats>,
    pub probe: ServiceProbe,
    /// Counters and gauges scraped from the service's own `/metrics`
    pub custom: HashMap<String, f64>,
    /// Stats collection failure, when retries were exhausted
    pub error: Option<CollectionError>,
}

/// Snapshot bookkeeping
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotMeta {
    /// Unix seconds
    pub collected_at: i64,
    pub duration_ms: u64,
    pub services_total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub from_cache: bool,
}

/// System-wide averages over one snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemAverages {
    pub avg_cpu_percent: f64,
    pub avg_memory_percent: f64,
    pub avg_response_time_ms: f64,
}

/// One collection pass over every application service
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub services: BTreeMap<String, ServiceMetrics>,
    pub system: SystemAverages,
    pub meta: SnapshotMeta,
}

impl MetricsSnapshot {
    /// Samples for the time-series store, one per service and metric
    pub fn to_samples(&self) -> Vec<MetricSample> {
        let ts = self.meta.collected_at;
        let mut samples = Vec::new();
        for (name, metrics) in &self.services {
            if let Some(stats) = &metrics.stats {
                samples.push(MetricSample::new(name, "cpu_percent", stats.cpu_percent, ts));
                samples.push(MetricSample::new(name, "memory_percent", stats.memory_percent, ts));
                samples.push(MetricSample::new(
                    name,
                    "memory_used_bytes",
                    stats.memory_used_bytes as f64,
                    ts,
                ));
            }
            if let Some(rt) = metrics.probe.response_time_ms {
                samples.push(MetricSample::new(name, "response_time_ms", rt, ts));
            }
        }
        samples
    }
}

/// Read side of the collector, consumed by alerts and the exporter
pub trait MetricsSource: Send + Sync {
    /// Most recent snapshot, if any pass has completed
    fn latest(&self) -> Option<Arc<MetricsSnapshot>>;
}

/// HTTP probing contract; tests use [`FakeProber`]
#[async_trait]
pub trait HealthProber: Send + Sync {
    /// Probe `/health` on the service's port
    async fn probe(&self, service: &str, port: u16) -> ServiceProbe;

    /// Scrape the service's own `/metrics` into name/value pairs
    async fn scrape(&self, service: &str, port: u16) -> HashMap<String, f64>;
}

/// Probes services over HTTP
pub struct HttpProber {
    client: reqwest::Client,
    host: String,
}

impl HttpProber {
    /// Prober against a host (usually `localhost`) with 5 s timeouts
    pub fn new(host: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(5))
            .build()
            .expect("reqwest client");
        Self { client, host: host.into() }
    }
}

#[async_trait]
impl HealthProber for HttpProber {
    async fn probe(&self, _service: &str, port: u16) -> ServiceProbe {
        let url = format!("http://{}:{port}/health", self.host);
        let started = Instant::now();
        match self.client.get(&url).send().await {
            Ok(response) => {
                let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                let code = response.status().as_u16();
                if response.status().is_success() {
                    ServiceProbe {
                        response_time_ms: Some(elapsed),
                        status: "ok".into(),
                        http_status: Some(code),
                    }
                } else {
                    ServiceProbe {
                        response_time_ms: None,
                        status: "not_responding".into(),
                        http_status: Some(code),
                    }
                }
            }
            Err(_) => ServiceProbe::not_responding(),
        }
    }

    async fn scrape(&self, _service: &str, port: u16) -> HashMap<String, f64> {
        let url = format!("http://{}:{port}/metrics", self.host);
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(body) => parse_exposition(&body),
                Err(_) => HashMap::new(),
            },
            _ => HashMap::new(),
        }
    }
}

/// Parse `name{labels} value` exposition lines into name/value pairs
pub fn parse_exposition(body: &str) -> HashMap<String, f64> {
    let mut values = HashMap::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((name_part, rest)) = line.split_once(' ') else {
            continue;
        };
        let name = name_part.split('{').next().unwrap_or(name_part);
        if let Ok(value) = rest.split_whitespace().next().unwrap_or("").parse::<f64>() {
            values.insert(name.to_string(), value);
        }
    }
    values
}

/// Scriptable prober for tests
#[derive(Default)]
pub struct FakeProber {
    probes: RwLock<HashMap<String, ServiceProbe>>,
    scrapes: RwLock<HashMap<String, HashMap<String, f64>>>,
}

impl FakeProber {
    /// Prober where every service answers in 5 ms
    pub fn all_ok() -> Self {
        Self::default()
    }

    /// Set the probe result for one service
    pub fn set_probe(&self, service: &str, probe: ServiceProbe) {
        self.probes.write().insert(service.into(), probe);
    }

    /// Mark a service as down
    pub fn set_down(&self, service: &str) {
        self.set_probe(service, ServiceProbe::not_responding());
    }

    /// Set the `/metrics` scrape for one service
    pub fn set_scrape(&self, service: &str, values: HashMap<String, f64>) {
        self.scrapes.write().insert(service.into(), values);
    }
}

#[async_trait]
impl HealthProber for FakeProber {
    async fn probe(&self, service: &str, _port: u16) -> ServiceProbe {
        self.probes.read().get(service).cloned().unwrap_or(ServiceProbe {
            response_time_ms: Some(5.0),
            status: "ok".into(),
            http_status: Some(200),
        })
    }

    async fn scrape(&self, service: &str, _port: u16) -> HashMap<String, f64> {
        self.scrapes.read().get(service).cloned().unwrap_or_default()
    }
}

/// Collects one snapshot at a time across all application services
pub struct MetricsCollector {
    orchestrator: Arc<dyn Orchestrator>,
    prober: Arc<dyn HealthProber>,
    clock: Arc<dyn Clock>,
    config: CollectorConfig,
    cache: moka::future::Cache<u8, Arc<MetricsSnapshot>>,
    latest: RwLock<Option<Arc<MetricsSnapshot>>>,
}

impl MetricsCollector {
    /// Collector with default tuning
    pub fn new(orchestrator: Arc<dyn Orchestrator>, prober: Arc<dyn HealthProber>) -> Self {
        Self::with_config(orchestrator, prober, CollectorConfig::default())
    }

    /// Collector with explicit tuning
    pub fn with_config(
        orchestrator: Arc<dyn Orchestrator>,
        prober: Arc<dyn HealthProber>,
        config: CollectorConfig,
    ) -> Self {
        let cache = moka::future::Cache::builder()
            .max_capacity(1)
            .time_to_live(config.cache_ttl)
            .build();
        Self {
            orchestrator,
            prober,
            clock: Arc::new(SystemClock),
            config,
            cache,
            latest: RwLock::new(None),
        }
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Collect a snapshot, answering from the TTL cache unless bypassed
    pub async fn collect(&self, bypass_cache: bool) -> Arc<MetricsSnapshot> {
        if !bypass_cache {
            if let Some(cached) = self.cache.get(&0).await {
                let mut snapshot = (*cached).clone();
                snapshot.meta.from_cache = true;
                return Arc::new(snapshot);
            }
        }

        let snapshot = Arc::new(self.collect_fresh().await);
        self.cache.insert(0, snapshot.clone()).await;
        *self.latest.write() = Some(snapshot.clone());
        snapshot
    }

    async fn collect_fresh(&self) -> MetricsSnapshot {
        let started = Instant::now();
        let registry = ServiceRegistry::new();
        let mut tasks: JoinSet<(String, ServiceMetrics)> = JoinSet::new();

        for service in registry.application_services() {
            let name = service.name.clone();
            let port = service.port;
            let orchestrator = self.orchestrator.clone();
            let prober = self.prober.clone();
            let config = self.config.clone();
            tasks.spawn(async move {
                let work = collect_service(orchestrator, prober, &name, port, &config);
                let metrics = match tokio::time::timeout(config.service_timeout, work).await {
                    Ok(metrics) => metrics,
                    Err(_) => ServiceMetrics {
                        service: name.clone(),
                        stats: None,
                        probe: ServiceProbe::not_responding(),
                        custom: HashMap::new(),
                        error: Some(CollectionError {
                            retry_count: config.retries,
                            cause: format!("timed out after {:?}", config.service_timeout),
                        }),
                    },
                };
                (name, metrics)
            });
        }

        let mut services = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, metrics)) => {
                    services.insert(name, metrics);
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "collection task panicked");
                }
            }
        }

        self.aggregate(services, started.elapsed())
    }

    /// Merge per-service results into one snapshot with system averages
    pub fn aggregate(
        &self,
        services: BTreeMap<String, ServiceMetrics>,
        duration: Duration,
    ) -> MetricsSnapshot {
        let healthy = services.values().filter(|m| m.probe.is_ok()).count();
        let unhealthy = services.len() - healthy;

        let mut cpu = Vec::new();
        let mut memory = Vec::new();
        let mut response = Vec::new();
        for metrics in services.values() {
            if let Some(stats) = &metrics.stats {
                cpu.push(stats.cpu_percent);
                memory.push(stats.memory_percent);
            }
            if let Some(rt) = metrics.probe.response_time_ms {
                response.push(rt);
            }
        }
        let avg = |values: &[f64]| {
            if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            }
        };

        MetricsSnapshot {
            system: SystemAverages {
                avg_cpu_percent: avg(&cpu),
                avg_memory_percent: avg(&memory),
                avg_response_time_ms: avg(&response),
            },
            meta: SnapshotMeta {
                collected_at: self.clock.now_unix(),
                duration_ms: duration.as_millis() as u64,
                services_total: services.len(),
                healthy,
                unhealthy,
                from_cache: false,
            },
            services,
        }
    }

    /// Persist a snapshot's samples as one atomic batch
    pub fn persist(
        &self,
        store: &TimeSeriesStore,
        snapshot: &MetricsSnapshot,
    ) -> Result<(), crate::store::StorageError> {
        store.store_batch(&snapshot.to_samples())
    }

    /// Anomalies for one service metric over stored history
    pub fn anomalies(
        &self,
        store: &TimeSeriesStore,
        service: &str,
        metric: &str,
        window_secs: i64,
    ) -> Result<Vec<analysis::Anomaly>, crate::store::StorageError> {
        let samples = self.window(store, service, metric, window_secs)?;
        Ok(analysis::detect_anomalies(&samples))
    }

    /// Trend over one service metric's stored history
    pub fn trend(
        &self,
        store: &TimeSeriesStore,
        service: &str,
        metric: &str,
        window_secs: i64,
    ) -> Result<analysis::TrendReport, crate::store::StorageError> {
        let samples = self.window(store, service, metric, window_secs)?;
        Ok(analysis::analyze_trend(&samples))
    }

    fn window(
        &self,
        store: &TimeSeriesStore,
        service: &str,
        metric: &str,
        window_secs: i64,
    ) -> Result<Vec<MetricSample>, crate::store::StorageError> {
        let now = self.clock.now_unix();
        let result = store.query(&crate::store::Query {
            service: service.into(),
            metric: metric.into(),
            start: now - window_secs,
            end: now,
            aggregation: None,
            resolution: None,
        })?;
        match result {
            crate::store::QueryResult::Raw { samples, .. } => Ok(samples),
            _ => Ok(Vec::new()),
        }
    }

    /// Health score per service from the latest snapshot
    pub fn health_scores(&self) -> BTreeMap<String, analysis::HealthScore> {
        let Some(snapshot) = self.latest() else {
            return BTreeMap::new();
        };
        snapshot
            .services
            .iter()
            .map(|(name, metrics)| {
                let (cpu, memory) = metrics
                    .stats
                    .as_ref()
                    .map(|s| (s.cpu_percent, s.memory_percent))
                    .unwrap_or((0.0, 0.0));
                let response = metrics.probe.response_time_ms.unwrap_or(0.0);
                let error_rate = error_rate_percent(metrics);
                (name.clone(), analysis::health_score(cpu, memory, response, error_rate))
            })
            .collect()
    }

    /// Observed error rate percent per service from the latest snapshot
    pub fn error_rates(&self) -> BTreeMap<String, f64> {
        let Some(snapshot) = self.latest() else {
            return BTreeMap::new();
        };
        snapshot
            .services
            .iter()
            .map(|(name, metrics)| (name.clone(), error_rate_percent(metrics)))
            .collect()
    }
}

/// Error rate for one service: its own reported counter when scraped,
/// otherwise a dead health probe counts as a total error rate
fn error_rate_percent(metrics: &ServiceMetrics) -> f64 {
    metrics
        .custom
        .get("error_rate_percent")
        .copied()
        .unwrap_or_else(|| if metrics.probe.is_ok() { 0.0 } else { 100.0 })
}

impl MetricsSource for MetricsCollector {
    fn latest(&self) -> Option<Arc<MetricsSnapshot>> {
        self.latest.read().clone()
    }
}

async fn collect_service(
    orchestrator: Arc<dyn Orchestrator>,
    prober: Arc<dyn HealthProber>,
    service: &str,
    port: u16,
    config: &CollectorConfig,
) -> ServiceMetrics {
    // container stats with bounded immediate retries
    let mut attempts = 0;
    let mut stats = None;
    let mut error = None;
    loop {
        attempts += 1;
        match orchestrator.stats(Some(service)).await {
            Ok(mut all) => {
                stats = all.remove(service);
                error = None;
                break;
            }
            Err(e) if attempts <= config.retries => {
                tracing::debug!(%service, attempt = attempts, error = %e, "stats fetch retrying");
            }
            Err(e) => {
                let failure = CollectionError {
                    retry_count: attempts - 1,
                    cause: e.to_string(),
                };
                tracing::warn!(%service, error = %failure, "stats collection failed");
                error = Some(failure);
                break;
            }
        }
    }

    let probe = prober.probe(service, port).await;
    let custom = if config.scrape_custom_metrics {
        prober.scrape(service, port).await
    } else {
        HashMap::new()
    };

    ServiceMetrics {
        service: service.into(),
        stats,
        probe,
        custom,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_compose::FakeOrchestrator;
    use convoy_core::ManualClock;

    fn stats(cpu: f64, mem: f64) -> ContainerStats {
        ContainerStats {
            cpu_percent: cpu,
            memory_percent: mem,
            memory_used_bytes: 1024 * 1024,
            ..Default::default()
        }
    }

    fn collector_with(
        orchestrator: Arc<FakeOrchestrator>,
        prober: Arc<FakeProber>,
    ) -> MetricsCollector {
        MetricsCollector::new(orchestrator, prober)
            .with_clock(Arc::new(ManualClock::at_epoch()))
    }

    #[tokio::test]
    async fn test_collect_merges_stats_and_probes() {
        let orchestrator = Arc::new(FakeOrchestrator::new());
        orchestrator.set_stats("gateway", stats(40.0, 60.0));
        orchestrator.set_stats("personas", stats(20.0, 40.0));
        let prober = Arc::new(FakeProber::all_ok());
        prober.set_down("tokens");

        let collector = collector_with(orchestrator, prober);
        let snapshot = collector.collect(true).await;

        assert_eq!(snapshot.meta.services_total, 6);
        assert_eq!(snapshot.meta.healthy, 5);
        assert_eq!(snapshot.meta.unhealthy, 1);
        assert!(!snapshot.meta.from_cache);
        assert!((snapshot.system.avg_cpu_percent - 30.0).abs() < 1e-9);
        assert_eq!(snapshot.services["tokens"].probe.status, "not_responding");
    }

    #[tokio::test]
    async fn test_cache_answers_until_bypassed() {
        let orchestrator = Arc::new(FakeOrchestrator::new());
        let prober = Arc::new(FakeProber::all_ok());
        let collector = collector_with(orchestrator, prober.clone());

        let first = collector.collect(false).await;
        assert!(!first.meta.from_cache);

        let second = collector.collect(false).await;
        assert!(second.meta.from_cache);

        prober.set_down("gateway");
        let third = collector.collect(true).await;
        assert!(!third.meta.from_cache);
        assert_eq!(third.meta.unhealthy, 1);
    }

    #[tokio::test]
    async fn test_latest_snapshot_published() {
        let collector = collector_with(
            Arc::new(FakeOrchestrator::new()),
            Arc::new(FakeProber::all_ok()),
        );
        assert!(collector.latest().is_none());
        collector.collect(true).await;
        assert!(collector.latest().is_some());
    }

    #[tokio::test]
    async fn test_snapshot_samples_persist_to_store() {
        let orchestrator = Arc::new(FakeOrchestrator::new());
        orchestrator.set_stats("gateway", stats(40.0, 60.0));
        let collector = collector_with(orchestrator, Arc::new(FakeProber::all_ok()));

        let snapshot = collector.collect(true).await;
        let store = TimeSeriesStore::new(Arc::new(crate::store::MemoryKeyspace::new()));
        collector.persist(&store, &snapshot).unwrap();

        let stats = store.stats().unwrap();
        assert!(stats.total_keys > 0);
    }

    #[tokio::test]
    async fn test_health_scores_from_latest() {
        let orchestrator = Arc::new(FakeOrchestrator::new());
        orchestrator.set_stats("gateway", stats(90.0, 90.0));
        let prober = Arc::new(FakeProber::all_ok());
        prober.set_down("tokens");
        let collector = collector_with(orchestrator, prober);
        collector.collect(true).await;

        let scores = collector.health_scores();
        assert_eq!(scores.len(), 6);
        assert_eq!(scores["gateway"].grade, crate::analysis::HealthGrade::Warning);
        // a dead probe counts as a total error rate
        assert_eq!(scores["tokens"].error_rate_score, 0.0);
    }

    #[tokio::test]
    async fn test_error_rates_from_latest() {
        let prober = Arc::new(FakeProber::all_ok());
        prober.set_down("tokens");
        let collector = collector_with(Arc::new(FakeOrchestrator::new()), prober);
        collector.collect(true).await;

        let rates = collector.error_rates();
        assert_eq!(rates["tokens"], 100.0);
        assert_eq!(rates["gateway"], 0.0);
    }

    #[tokio::test]
    async fn test_trend_over_stored_history() {
        let collector = collector_with(
            Arc::new(FakeOrchestrator::new()),
            Arc::new(FakeProber::all_ok()),
        );
        let store = TimeSeriesStore::new(Arc::new(crate::store::MemoryKeyspace::new()));
        for (i, value) in [10.0, 20.0, 30.0].iter().enumerate() {
            store
                .store(&MetricSample::new("gateway", "cpu_percent", *value, i as i64 * 60 - 300))
                .unwrap();
        }
        let trend = collector.trend(&store, "gateway", "cpu_percent", 600).unwrap();
        assert_eq!(trend.direction, crate::analysis::TrendDirection::Increasing);
    }

    #[test]
    fn test_parse_exposition() {
        let body = concat!(
            "# HELP requests_total Total requests\n",
            "# TYPE requests_total counter\n",
            "requests_total{service=\"gw\"} 42\n",
            "memory_bytes 1048576\n",
            "garbage line\n",
        );
        let values = parse_exposition(body);
        assert_eq!(values["requests_total"], 42.0);
        assert_eq!(values["memory_bytes"], 1_048_576.0);
        assert_eq!(values.len(), 2);
    }
}

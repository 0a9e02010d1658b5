//! Time-series store
//!
//! Append-only per-(service, metric) series over a key-value keyspace.
//! Keys follow `metrics:{service}:{metric}:{ts}`; an index key per series
//! holds the ordered set of timestamps. Mutations are serialized; readers
//! run concurrently.

use convoy_core::{Clock, SystemClock};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Default retention for stored samples
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
/// Raw queries are truncated beyond this many samples
pub const MAX_RAW_SAMPLES: usize = 5000;

/// One immutable measurement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub service: String,
    pub metric: String,
    pub value: f64,
    /// Unix seconds, caller-supplied
    pub timestamp: i64,
}

impl MetricSample {
    /// Convenience constructor
    pub fn new(service: &str, metric: &str, value: f64, timestamp: i64) -> Self {
        Self {
            service: service.into(),
            metric: metric.into(),
            value,
            timestamp,
        }
    }
}

/// Storage subsystem error
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// Backend unreachable
    #[error("storage connection error: {0}")]
    Connection(String),
    /// Backend refused the operation
    #[error("storage error: {0}")]
    Backend(String),
    /// Value could not be encoded or decoded
    #[error("storage serialization error: {0}")]
    Serialization(String),
}

/// Aggregate keyspace health
#[derive(Debug, Clone, Serialize)]
pub struct KeyspaceInfo {
    pub memory_used_bytes: u64,
    pub total_keys: u64,
    pub client_count: u32,
    /// Read hit rate in [0, 1]
    pub hit_rate: f64,
}

/// Key-value contract the store is written against.
///
/// A server-backed keyspace can be bound here later; the shipped
/// implementation is in-memory.
pub trait Keyspace: Send + Sync {
    /// Write one value with an optional TTL
    fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StorageError>;

    /// Read one value; expired keys read as absent
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Delete keys, returning how many existed
    fn delete(&self, keys: &[String]) -> Result<u64, StorageError>;

    /// All keys with the given prefix, including expired keys that are
    /// awaiting cleanup
    fn scan(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Remaining TTL; `None` for keys without expiry
    fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>, StorageError>;

    /// Atomic batch write: all entries land or none do
    fn set_batch(
        &self,
        entries: Vec<(String, String, Option<Duration>)>,
    ) -> Result<(), StorageError>;

    /// Backend health and usage
    fn info(&self) -> Result<KeyspaceInfo, StorageError>;
}

struct Entry {
    value: String,
    /// Unix seconds; `None` means no expiry
    expires_at: Option<i64>,
}

/// In-memory keyspace. The write lock serializes every mutation;
/// readers share the read lock.
pub struct MemoryKeyspace {
    entries: RwLock<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    hits: std::sync::atomic::AtomicU64,
    misses: std::sync::atomic::AtomicU64,
}

impl MemoryKeyspace {
    /// Keyspace on the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Keyspace on an injected clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
            hits: Default::default(),
            misses: Default::default(),
        }
    }

    fn live(&self, entry: &Entry) -> bool {
        entry
            .expires_at
            .map(|at| at > self.clock.now_unix())
            .unwrap_or(true)
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<i64> {
        ttl.map(|ttl| self.clock.now_unix() + ttl.as_secs() as i64)
    }
}

impl Default for MemoryKeyspace {
    fn default() -> Self {
        Self::new()
    }
}

impl Keyspace for MemoryKeyspace {
    fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StorageError> {
        if key.is_empty() {
            return Err(StorageError::Backend("empty key".into()));
        }
        let expires_at = self.expiry(ttl);
        self.entries
            .write()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        use std::sync::atomic::Ordering;
        let entries = self.entries.read();
        match entries.get(key) {
            Some(entry) if self.live(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry.value.clone()))
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    fn delete(&self, keys: &[String]) -> Result<u64, StorageError> {
        let mut entries = self.entries.write();
        let mut removed = 0;
        for key in keys {
            if entries.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn scan(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let entries = self.entries.read();
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn ttl_remaining(&self, key: &str) -> Result<Option<Duration>, StorageError> {
        let entries = self.entries.read();
        Ok(entries.get(key).and_then(|e| {
            e.expires_at.map(|at| {
                let remaining = at - self.clock.now_unix();
                Duration::from_secs(remaining.max(0) as u64)
            })
        }))
    }

    fn set_batch(
        &self,
        entries: Vec<(String, String, Option<Duration>)>,
    ) -> Result<(), StorageError> {
        // validate everything before touching the map
        if let Some((key, _, _)) = entries.iter().find(|(k, _, _)| k.is_empty()) {
            return Err(StorageError::Backend(format!("empty key in batch: {key:?}")));
        }
        let mut map = self.entries.write();
        for (key, value, ttl) in entries {
            let expires_at = self.expiry(ttl);
            map.insert(key, Entry { value, expires_at });
        }
        Ok(())
    }

    fn info(&self) -> Result<KeyspaceInfo, StorageError> {
        use std::sync::atomic::Ordering;
        let entries = self.entries.read();
        let memory: usize = entries
            .iter()
            .map(|(k, e)| k.len() + e.value.len() + std::mem::size_of::<Entry>())
            .sum();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        Ok(KeyspaceInfo {
            memory_used_bytes: memory as u64,
            total_keys: entries.len() as u64,
            client_count: 1,
            hit_rate: if lookups == 0 { 1.0 } else { hits as f64 / lookups as f64 },
        })
    }
}

/// Aggregation functions for range queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFn {
    Avg,
    Min,
    Max,
    Sum,
}

impl AggregateFn {
    fn apply(&self, values: &[f64]) -> f64 {
        match self {
            Self::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Self::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Self::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Self::Sum => values.iter().sum(),
        }
    }
}

/// Range query over one series
#[derive(Debug, Clone)]
pub struct Query {
    pub service: String,
    pub metric: String,
    /// Inclusive start, unix seconds
    pub start: i64,
    /// Inclusive end, unix seconds
    pub end: i64,
    pub aggregation: Option<AggregateFn>,
    /// Bucket width in seconds; required with aggregation
    pub resolution: Option<i64>,
}

/// One aggregated bucket
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedPoint {
    /// Bucket start: floor(ts / resolution) * resolution
    pub bucket_ts: i64,
    pub value: f64,
    pub sample_count: usize,
}

/// Query outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum QueryResult {
    /// Raw samples; `truncated` when the safety limit was hit
    Raw {
        samples: Vec<MetricSample>,
        truncated: bool,
    },
    /// Aggregated buckets in ascending bucket order
    Aggregated(Vec<AggregatedPoint>),
}

/// TTL cleanup outcome
#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub scanned: u64,
    pub expired: u64,
    pub deleted: u64,
    pub duration_ms: u64,
}

/// Store usage as reported by the backend
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub memory_used_bytes: u64,
    pub total_keys: u64,
    pub client_count: u32,
    pub hit_rate: f64,
}

/// Append-only time-series store over a [`Keyspace`]
pub struct TimeSeriesStore {
    keyspace: Arc<dyn Keyspace>,
    ttl: Duration,
    /// Serializes store/store_batch/cleanup; readers bypass it
    write_lock: Mutex<()>,
}

impl TimeSeriesStore {
    /// Store with the default 30-day retention
    pub fn new(keyspace: Arc<dyn Keyspace>) -> Self {
        Self::with_ttl(keyspace, DEFAULT_TTL)
    }

    /// Store with an explicit retention
    pub fn with_ttl(keyspace: Arc<dyn Keyspace>, ttl: Duration) -> Self {
        Self {
            keyspace,
            ttl,
            write_lock: Mutex::new(()),
        }
    }

    fn sample_key(sample: &MetricSample) -> String {
        format!(
            "metrics:{}:{}:{}",
            sample.service, sample.metric, sample.timestamp
        )
    }

    fn index_key(service: &str, metric: &str) -> String {
        format!("metrics:index:{service}:{metric}")
    }

    fn encode(sample: &MetricSample) -> Result<String, StorageError> {
        if !sample.value.is_finite() {
            return Err(StorageError::Serialization(format!(
                "non-finite value for {}:{}",
                sample.service, sample.metric
            )));
        }
        serde_json::to_string(sample).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    fn read_index(&self, service: &str, metric: &str) -> Result<Vec<i64>, StorageError> {
        match self.keyspace.get(&Self::index_key(service, metric))? {
            Some(raw) => {
                serde_json::from_str(&raw).map_err(|e| StorageError::Serialization(e.to_string()))
            }
            None => Ok(Vec::new()),
        }
    }

    fn write_index(&self, service: &str, metric: &str, index: &[i64]) -> Result<(), StorageError> {
        let raw = serde_json::to_string(index)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.keyspace.set(&Self::index_key(service, metric), raw, None)
    }

    /// Store one sample
    pub fn store(&self, sample: &MetricSample) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock();
        let encoded = Self::encode(sample)?;
        self.keyspace
            .set(&Self::sample_key(sample), encoded, Some(self.ttl))?;

        let mut index = self.read_index(&sample.service, &sample.metric)?;
        if let Err(pos) = index.binary_search(&sample.timestamp) {
            index.insert(pos, sample.timestamp);
        }
        self.write_index(&sample.service, &sample.metric, &index)
    }

    /// Store a batch atomically: every sample lands or none do
    pub fn store_batch(&self, samples: &[MetricSample]) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock();

        // encode everything first so a bad sample aborts before any write
        let mut entries = Vec::with_capacity(samples.len());
        for sample in samples {
            entries.push((Self::sample_key(sample), Self::encode(sample)?, Some(self.ttl)));
        }

        // merge index updates per series
        let mut indices: HashMap<(String, String), Vec<i64>> = HashMap::new();
        for sample in samples {
            let key = (sample.service.clone(), sample.metric.clone());
            if !indices.contains_key(&key) {
                let existing = self.read_index(&sample.service, &sample.metric)?;
                indices.insert(key.clone(), existing);
            }
            let index = indices.get_mut(&key).unwrap();
            if let Err(pos) = index.binary_search(&sample.timestamp) {
                index.insert(pos, sample.timestamp);
            }
        }
        for ((service, metric), index) in &indices {
            let raw = serde_json::to_string(index)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            entries.push((Self::index_key(service, metric), raw, None));
        }

        self.keyspace.set_batch(entries)
    }

    /// Range query, raw or aggregated
    pub fn query(&self, query: &Query) -> Result<QueryResult, StorageError> {
        let index = self.read_index(&query.service, &query.metric)?;
        let in_range: Vec<i64> = index
            .into_iter()
            .filter(|ts| *ts >= query.start && *ts <= query.end)
            .collect();

        let mut samples = Vec::new();
        for ts in &in_range {
            let key = format!("metrics:{}:{}:{ts}", query.service, query.metric);
            if let Some(raw) = self.keyspace.get(&key)? {
                let sample: MetricSample = serde_json::from_str(&raw)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                samples.push(sample);
            }
        }

        match (query.aggregation, query.resolution) {
            (Some(agg), Some(resolution)) if resolution > 0 => {
                let mut buckets: Vec<(i64, Vec<f64>)> = Vec::new();
                for sample in &samples {
                    let bucket = sample.timestamp.div_euclid(resolution) * resolution;
                    match buckets.binary_search_by_key(&bucket, |(b, _)| *b) {
                        Ok(pos) => buckets[pos].1.push(sample.value),
                        Err(pos) => buckets.insert(pos, (bucket, vec![sample.value])),
                    }
                }
                let points = buckets
                    .into_iter()
                    .map(|(bucket_ts, values)| AggregatedPoint {
                        bucket_ts,
                        value: agg.apply(&values),
                        sample_count: values.len(),
                    })
                    .collect();
                Ok(QueryResult::Aggregated(points))
            }
            _ => {
                let truncated = samples.len() > MAX_RAW_SAMPLES;
                if truncated {
                    samples.truncate(MAX_RAW_SAMPLES);
                }
                Ok(QueryResult::Raw { samples, truncated })
            }
        }
    }

    /// Scan for expired keys and remove them. Idempotent: a second pass
    /// finds nothing further to delete.
    pub fn cleanup(&self) -> Result<CleanupReport, StorageError> {
        let _guard = self.write_lock.lock();
        let started = Instant::now();

        let keys = self.keyspace.scan("metrics:")?;
        let scanned = keys.len() as u64;
        let mut expired_keys = Vec::new();
        for key in &keys {
            if let Some(remaining) = self.keyspace.ttl_remaining(key)? {
                if remaining.is_zero() {
                    expired_keys.push(key.clone());
                }
            }
        }
        let deleted = self.keyspace.delete(&expired_keys)?;

        // drop dangling timestamps from series indices
        for key in self.keyspace.scan("metrics:index:")? {
            let parts: Vec<&str> = key.splitn(4, ':').collect();
            if parts.len() != 4 {
                continue;
            }
            let (service, metric) = (parts[2], parts[3]);
            let index = self.read_index(service, metric)?;
            let live: Vec<i64> = index
                .iter()
                .copied()
                .filter(|ts| {
                    let sample_key = format!("metrics:{service}:{metric}:{ts}");
                    matches!(self.keyspace.get(&sample_key), Ok(Some(_)))
                })
                .collect();
            if live.len() != index.len() {
                self.write_index(service, metric, &live)?;
            }
        }

        Ok(CleanupReport {
            scanned,
            expired: expired_keys.len() as u64,
            deleted,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Backend usage and health
    pub fn stats(&self) -> Result<StoreStats, StorageError> {
        let info = self.keyspace.info()?;
        Ok(StoreStats {
            memory_used_bytes: info.memory_used_bytes,
            total_keys: info.total_keys,
            client_count: info.client_count,
            hit_rate: info.hit_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::ManualClock;
    use proptest::prelude::*;

    fn store_on_manual_clock() -> (TimeSeriesStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_epoch());
        let keyspace = Arc::new(MemoryKeyspace::with_clock(clock.clone()));
        (TimeSeriesStore::new(keyspace), clock)
    }

    #[test]
    fn test_store_and_query_raw() {
        let (store, _) = store_on_manual_clock();
        for (ts, value) in [(10, 1.0), (20, 2.0), (30, 3.0)] {
            store.store(&MetricSample::new("gateway", "cpu_percent", value, ts)).unwrap();
        }

        let result = store
            .query(&Query {
                service: "gateway".into(),
                metric: "cpu_percent".into(),
                start: 15,
                end: 30,
                aggregation: None,
                resolution: None,
            })
            .unwrap();
        match result {
            QueryResult::Raw { samples, truncated } => {
                assert!(!truncated);
                assert_eq!(samples.len(), 2);
                assert_eq!(samples[0].timestamp, 20);
                assert_eq!(samples[1].value, 3.0);
            }
            other => panic!("expected raw result, got {other:?}"),
        }
    }

    #[test]
    fn test_aggregation_buckets() {
        let (store, _) = store_on_manual_clock();
        let values = [10.0, 20.0, 30.0, 40.0, 50.0];
        for (i, value) in values.iter().enumerate() {
            store
                .store(&MetricSample::new("gw", "cpu_percent", *value, i as i64 * 60))
                .unwrap();
        }

        let result = store
            .query(&Query {
                service: "gw".into(),
                metric: "cpu_percent".into(),
                start: 0,
                end: 240,
                aggregation: Some(AggregateFn::Avg),
                resolution: Some(120),
            })
            .unwrap();
        match result {
            QueryResult::Aggregated(points) => {
                assert_eq!(
                    points,
                    vec![
                        AggregatedPoint { bucket_ts: 0, value: 15.0, sample_count: 2 },
                        AggregatedPoint { bucket_ts: 120, value: 35.0, sample_count: 2 },
                        AggregatedPoint { bucket_ts: 240, value: 50.0, sample_count: 1 },
                    ]
                );
            }
            other => panic!("expected aggregated result, got {other:?}"),
        }
    }

    #[test]
    fn test_aggregation_bucket_count_bound() {
        let (store, _) = store_on_manual_clock();
        for ts in 0..100 {
            store
                .store(&MetricSample::new("gw", "rt_ms", ts as f64, ts * 7))
                .unwrap();
        }
        let (start, end, resolution) = (0, 693, 50);
        let result = store
            .query(&Query {
                service: "gw".into(),
                metric: "rt_ms".into(),
                start,
                end,
                aggregation: Some(AggregateFn::Avg),
                resolution: Some(resolution),
            })
            .unwrap();
        if let QueryResult::Aggregated(points) = result {
            let bound = ((end - start) as f64 / resolution as f64).ceil() as usize;
            assert!(points.len() <= bound);
        } else {
            panic!("expected aggregated result");
        }
    }

    #[test]
    fn test_min_max_sum() {
        let (store, _) = store_on_manual_clock();
        for (ts, value) in [(0, 5.0), (10, 1.0), (20, 9.0)] {
            store.store(&MetricSample::new("s", "m", value, ts)).unwrap();
        }
        let query = |agg| Query {
            service: "s".into(),
            metric: "m".into(),
            start: 0,
            end: 100,
            aggregation: Some(agg),
            resolution: Some(1000),
        };
        let value_of = |result: QueryResult| match result {
            QueryResult::Aggregated(points) => points[0].value,
            _ => panic!("expected aggregated result"),
        };
        assert_eq!(value_of(store.query(&query(AggregateFn::Min)).unwrap()), 1.0);
        assert_eq!(value_of(store.query(&query(AggregateFn::Max)).unwrap()), 9.0);
        assert_eq!(value_of(store.query(&query(AggregateFn::Sum)).unwrap()), 15.0);
    }

    #[test]
    fn test_batch_failure_stores_nothing() {
        let (store, _) = store_on_manual_clock();
        let samples = vec![
            MetricSample::new("gw", "cpu_percent", 1.0, 0),
            MetricSample::new("gw", "cpu_percent", f64::NAN, 60),
            MetricSample::new("gw", "cpu_percent", 3.0, 120),
        ];
        assert!(store.store_batch(&samples).is_err());

        let result = store
            .query(&Query {
                service: "gw".into(),
                metric: "cpu_percent".into(),
                start: 0,
                end: 200,
                aggregation: None,
                resolution: None,
            })
            .unwrap();
        match result {
            QueryResult::Raw { samples, .. } => assert!(samples.is_empty()),
            other => panic!("expected raw result, got {other:?}"),
        }
    }

    #[test]
    fn test_batch_store_lands_all() {
        let (store, _) = store_on_manual_clock();
        let samples: Vec<MetricSample> = (0..10)
            .map(|i| MetricSample::new("gw", "mem_percent", i as f64, i * 30))
            .collect();
        store.store_batch(&samples).unwrap();

        let result = store
            .query(&Query {
                service: "gw".into(),
                metric: "mem_percent".into(),
                start: 0,
                end: 300,
                aggregation: None,
                resolution: None,
            })
            .unwrap();
        match result {
            QueryResult::Raw { samples, .. } => assert_eq!(samples.len(), 10),
            other => panic!("expected raw result, got {other:?}"),
        }
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let clock = Arc::new(ManualClock::at_epoch());
        let keyspace = Arc::new(MemoryKeyspace::with_clock(clock.clone()));
        let store = TimeSeriesStore::with_ttl(keyspace, Duration::from_secs(100));

        store.store(&MetricSample::new("gw", "cpu_percent", 1.0, 0)).unwrap();
        store.store(&MetricSample::new("gw", "cpu_percent", 2.0, 50)).unwrap();
        clock.advance_secs(101);

        let first = store.cleanup().unwrap();
        assert_eq!(first.deleted, 2);
        let second = store.cleanup().unwrap();
        assert_eq!(second.deleted, 0);
        assert_eq!(second.expired, 0);
    }

    #[test]
    fn test_stats_reports_keys() {
        let (store, _) = store_on_manual_clock();
        store.store(&MetricSample::new("gw", "cpu_percent", 1.0, 0)).unwrap();
        let stats = store.stats().unwrap();
        // sample key plus index key
        assert_eq!(stats.total_keys, 2);
        assert!(stats.memory_used_bytes > 0);
    }

    proptest! {
        /// Every avg bucket equals the arithmetic mean of the samples whose
        /// floor falls in it, and the bucket count stays within the window.
        #[test]
        fn prop_avg_buckets_are_arithmetic_means(
            values in prop::collection::vec(0.0f64..1000.0, 1..40),
            resolution in 1i64..120,
        ) {
            let (store, _) = store_on_manual_clock();
            let samples: Vec<MetricSample> = values
                .iter()
                .enumerate()
                .map(|(i, v)| MetricSample::new("svc", "m", *v, i as i64 * 30))
                .collect();
            store.store_batch(&samples).unwrap();

            let end = (samples.len() as i64 - 1) * 30;
            let result = store
                .query(&Query {
                    service: "svc".into(),
                    metric: "m".into(),
                    start: 0,
                    end,
                    aggregation: Some(AggregateFn::Avg),
                    resolution: Some(resolution),
                })
                .unwrap();
            let points = match result {
                QueryResult::Aggregated(points) => points,
                other => panic!("expected aggregated result, got {other:?}"),
            };

            prop_assert!(points.len() <= (end / resolution + 1) as usize);
            for point in &points {
                let bucket: Vec<f64> = samples
                    .iter()
                    .filter(|s| s.timestamp.div_euclid(resolution) * resolution == point.bucket_ts)
                    .map(|s| s.value)
                    .collect();
                prop_assert_eq!(point.sample_count, bucket.len());
                let mean = bucket.iter().sum::<f64>() / bucket.len() as f64;
                prop_assert!((point.value - mean).abs() < 1e-9);
            }
        }
    }
}

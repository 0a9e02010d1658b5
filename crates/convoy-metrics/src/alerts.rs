//! Alert engine
//!
//! Stateless threshold evaluation over the latest snapshot: the active
//! alert set is replaced on every pass, and a bounded history ring keeps
//! the last check outcomes.

use crate::collector::MetricsSnapshot;
use convoy_core::{Clock, SystemClock};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Default bound for the history ring
pub const DEFAULT_HISTORY: usize = 100;

/// Warning and critical levels for one metric
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Threshold {
    pub warning: f64,
    pub critical: f64,
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// One active alert
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub service: String,
    pub metric: String,
    pub value: f64,
    /// The threshold that was crossed
    pub threshold: f64,
    pub severity: Severity,
    pub message: String,
    /// Unix seconds
    pub timestamp: i64,
}

/// Rollup of one evaluation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Warning,
    Critical,
}

/// One entry in the history ring
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub timestamp: i64,
    pub status: OverallStatus,
    pub alert_count: usize,
}

/// Evaluates thresholds over snapshots
pub struct AlertEngine {
    thresholds: RwLock<HashMap<String, Threshold>>,
    active: RwLock<Vec<Alert>>,
    history: RwLock<VecDeque<HistoryEntry>>,
    history_capacity: usize,
    clock: Arc<dyn Clock>,
}

impl AlertEngine {
    /// Engine with the default thresholds and history bound
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY)
    }

    /// Engine with an explicit history bound
    pub fn with_capacity(history_capacity: usize) -> Self {
        let mut thresholds = HashMap::new();
        thresholds.insert("cpu_percent".into(), Threshold { warning: 80.0, critical: 95.0 });
        thresholds.insert("memory_percent".into(), Threshold { warning: 85.0, critical: 98.0 });
        thresholds.insert(
            "response_time_ms".into(),
            Threshold { warning: 2000.0, critical: 10000.0 },
        );
        Self {
            thresholds: RwLock::new(thresholds),
            active: RwLock::new(Vec::new()),
            history: RwLock::new(VecDeque::new()),
            history_capacity,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set or replace a threshold
    pub fn set_threshold(&self, metric: &str, threshold: Threshold) {
        self.thresholds.write().insert(metric.into(), threshold);
    }

    /// Configured threshold for a metric
    pub fn threshold(&self, metric: &str) -> Option<Threshold> {
        self.thresholds.read().get(metric).copied()
    }

    /// Evaluate a snapshot. The active set is replaced wholesale; an
    /// alert is active iff its metric's latest value crosses a threshold.
    pub fn evaluate(&self, snapshot: &MetricsSnapshot) -> Vec<Alert> {
        let thresholds = self.thresholds.read().clone();
        let now = self.clock.now_unix();
        let mut alerts = Vec::new();

        for (service, metrics) in &snapshot.services {
            let mut observed: Vec<(&str, f64)> = Vec::new();
            if let Some(stats) = &metrics.stats {
                observed.push(("cpu_percent", stats.cpu_percent));
                observed.push(("memory_percent", stats.memory_percent));
            }
            if let Some(rt) = metrics.probe.response_time_ms {
                observed.push(("response_time_ms", rt));
            }

            for (metric, value) in observed {
                let Some(threshold) = thresholds.get(metric) else {
                    continue;
                };
                let crossed = if value >= threshold.critical {
                    Some((Severity::Critical, threshold.critical))
                } else if value >= threshold.warning {
                    Some((Severity::Warning, threshold.warning))
                } else {
                    None
                };
                if let Some((severity, limit)) = crossed {
                    alerts.push(Alert {
                        service: service.clone(),
                        metric: metric.into(),
                        value,
                        threshold: limit,
                        severity,
                        message: alert_message(service, metric, severity, limit),
                        timestamp: now,
                    });
                }
            }
        }

        let status = if alerts.iter().any(|a| a.severity == Severity::Critical) {
            OverallStatus::Critical
        } else if !alerts.is_empty() {
            OverallStatus::Warning
        } else {
            OverallStatus::Healthy
        };
        {
            let mut history = self.history.write();
            history.push_back(HistoryEntry {
                timestamp: now,
                status,
                alert_count: alerts.len(),
            });
            while history.len() > self.history_capacity {
                history.pop_front();
            }
        }

        for alert in &alerts {
            match alert.severity {
                Severity::Critical => tracing::error!(%alert.message, "critical alert"),
                Severity::Warning => tracing::warn!(%alert.message, "warning alert"),
            }
        }

        *self.active.write() = alerts.clone();
        alerts
    }

    /// Currently active alerts (as of the last evaluation)
    pub fn active(&self) -> Vec<Alert> {
        self.active.read().clone()
    }

    /// History ring, oldest first
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.history.read().iter().cloned().collect()
    }
}

impl Default for AlertEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn metric_display(metric: &str) -> (&'static str, &'static str) {
    match metric {
        "cpu_percent" => ("CPU usage", "%"),
        "memory_percent" => ("memory usage", "%"),
        "response_time_ms" => ("response time", "ms"),
        _ => ("metric", ""),
    }
}

fn alert_message(service: &str, metric: &str, severity: Severity, threshold: f64) -> String {
    let (display, unit) = metric_display(metric);
    format!("{service} {display} exceeds {severity} threshold of {threshold}{unit}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::{ServiceMetrics, ServiceProbe};
    use convoy_compose::ContainerStats;
    use convoy_core::ManualClock;
    use std::collections::BTreeMap;

    fn snapshot_with(entries: &[(&str, f64, f64, Option<f64>)]) -> MetricsSnapshot {
        let mut services = BTreeMap::new();
        for (name, cpu, memory, rt) in entries {
            services.insert(
                name.to_string(),
                ServiceMetrics {
                    service: name.to_string(),
                    stats: Some(ContainerStats {
                        cpu_percent: *cpu,
                        memory_percent: *memory,
                        ..Default::default()
                    }),
                    probe: ServiceProbe {
                        response_time_ms: *rt,
                        status: "ok".into(),
                        http_status: Some(200),
                    },
                    custom: Default::default(),
                    error: None,
                },
            );
        }
        MetricsSnapshot {
            services,
            system: Default::default(),
            meta: crate::collector::SnapshotMeta {
                collected_at: 0,
                duration_ms: 1,
                services_total: entries.len(),
                healthy: entries.len(),
                unhealthy: 0,
                from_cache: false,
            },
        }
    }

    fn engine() -> AlertEngine {
        AlertEngine::new().with_clock(Arc::new(ManualClock::at_epoch()))
    }

    #[test]
    fn test_critical_and_warning_levels() {
        let engine = engine();
        let snapshot = snapshot_with(&[
            ("gateway", 96.0, 50.0, Some(100.0)),
            ("personas", 85.0, 50.0, Some(100.0)),
            ("tokens", 10.0, 10.0, Some(50.0)),
        ]);
        let alerts = engine.evaluate(&snapshot);

        let gateway = alerts.iter().find(|a| a.service == "gateway").unwrap();
        assert_eq!(gateway.severity, Severity::Critical);
        assert_eq!(
            gateway.message,
            "gateway CPU usage exceeds critical threshold of 95%"
        );

        let personas = alerts.iter().find(|a| a.service == "personas").unwrap();
        assert_eq!(personas.severity, Severity::Warning);
        assert!(!alerts.iter().any(|a| a.service == "tokens"));
    }

    #[test]
    fn test_severity_bounds_invariant() {
        let engine = engine();
        let snapshot = snapshot_with(&[
            ("a", 99.0, 90.0, Some(3000.0)),
            ("b", 82.0, 99.0, Some(12000.0)),
        ]);
        for alert in engine.evaluate(&snapshot) {
            let threshold = engine.threshold(&alert.metric).unwrap();
            match alert.severity {
                Severity::Critical => assert!(alert.value >= threshold.critical),
                Severity::Warning => {
                    assert!(alert.value >= threshold.warning && alert.value < threshold.critical)
                }
            }
        }
    }

    #[test]
    fn test_active_set_replaced_each_pass() {
        let engine = engine();
        engine.evaluate(&snapshot_with(&[("gateway", 96.0, 50.0, None)]));
        assert_eq!(engine.active().len(), 1);

        engine.evaluate(&snapshot_with(&[("gateway", 10.0, 50.0, None)]));
        assert!(engine.active().is_empty());
    }

    #[test]
    fn test_history_ring_is_bounded() {
        let engine = AlertEngine::with_capacity(5).with_clock(Arc::new(ManualClock::at_epoch()));
        let quiet = snapshot_with(&[("gateway", 10.0, 10.0, None)]);
        for _ in 0..10 {
            engine.evaluate(&quiet);
        }
        let history = engine.history();
        assert_eq!(history.len(), 5);
        assert!(history.iter().all(|h| h.status == OverallStatus::Healthy));
    }

    #[test]
    fn test_history_status_rollup() {
        let engine = engine();
        engine.evaluate(&snapshot_with(&[("a", 85.0, 10.0, None)]));
        engine.evaluate(&snapshot_with(&[("a", 99.0, 10.0, None)]));
        let history = engine.history();
        assert_eq!(history[0].status, OverallStatus::Warning);
        assert_eq!(history[1].status, OverallStatus::Critical);
    }

    #[test]
    fn test_custom_threshold() {
        let engine = engine();
        engine.set_threshold("cpu_percent", Threshold { warning: 10.0, critical: 20.0 });
        let alerts = engine.evaluate(&snapshot_with(&[("gateway", 15.0, 5.0, None)]));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Warning);
    }
}

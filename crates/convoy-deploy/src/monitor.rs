//! Production monitor
//!
//! Aggregates readiness, service health, security posture, and backup
//! health into one view, emits real-time alerts while running, and
//! watches rollouts. Owns the background health and security loops.

use crate::audit::{audit_config, AuditReport, AuditSeverity};
use crate::bluegreen::BlueGreenDeployer;
use crate::validator::{DeployRequest, DeploymentValidator, ValidationOutcome};
use chrono::{DateTime, Utc};
use convoy_backup::RecoveryManager;
use convoy_compose::{HealthState, Orchestrator, ServiceState};
use convoy_core::{ConfigStore, ServiceRegistry};
use convoy_metrics::{AlertEngine, MetricsCollector, MetricsSource, Severity};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Services whose failure takes the whole platform down
const CRITICAL_SERVICES: &[&str] = &["gateway", "relational-db", "cache", "vector-db"];

/// Monitor lifecycle error
#[derive(Debug, Error)]
#[error("production monitor error: {0}")]
pub struct ProductionMonitorError(pub String);

/// Fixed alert thresholds the monitor configures on start
#[derive(Debug, Clone, Copy)]
struct MonitorThresholds {
    /// Down services before a critical service-down alert
    service_down: u32,
    /// Warning error-rate fraction
    error_rate: f64,
    /// Critical resource utilization fraction
    resource: f64,
    /// Security findings before a critical breach alert
    security_breach: u32,
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self {
            service_down: 1,
            error_rate: 0.05,
            resource: 0.90,
            security_breach: 1,
        }
    }
}

/// Combined platform health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentHealth {
    Healthy,
    /// Critical services healthy, something non-critical is not
    Degraded,
    Unhealthy,
}

/// One real-time alert
#[derive(Debug, Clone, Serialize)]
pub struct MonitorAlert {
    pub alert_type: String,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Result of watching one rollout
#[derive(Debug, Clone, Serialize)]
pub struct RolloutWatch {
    pub deployment_id: String,
    /// `"healthy"` or `"unhealthy"`
    pub overall_health: String,
    pub services: BTreeMap<String, bool>,
    pub checked_at: DateTime<Utc>,
}

/// Platform-version validation rollup
#[derive(Debug, Clone, Serialize)]
pub struct VersionValidation {
    pub version: String,
    pub allowed: bool,
    pub services: BTreeMap<String, ValidationOutcome>,
    pub resource_available: bool,
    pub external_dependencies_available: bool,
}

/// Drives production: readiness, alerts, rollout watching
pub struct ProductionMonitor {
    orchestrator: Arc<dyn Orchestrator>,
    collector: Arc<MetricsCollector>,
    alerts: Arc<AlertEngine>,
    recovery: Arc<RecoveryManager>,
    validator: Arc<DeploymentValidator>,
    deployer: Arc<BlueGreenDeployer>,
    config: Arc<ConfigStore>,
    registry: ServiceRegistry,
    thresholds: MonitorThresholds,
    running: AtomicBool,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    latest_audit: Arc<RwLock<Option<AuditReport>>>,
    health_interval: Duration,
    security_interval: Duration,
}

impl ProductionMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        collector: Arc<MetricsCollector>,
        alerts: Arc<AlertEngine>,
        recovery: Arc<RecoveryManager>,
        validator: Arc<DeploymentValidator>,
        deployer: Arc<BlueGreenDeployer>,
        config: Arc<ConfigStore>,
    ) -> Self {
        Self {
            orchestrator,
            collector,
            alerts,
            recovery,
            validator,
            deployer,
            config,
            registry: ServiceRegistry::new(),
            thresholds: MonitorThresholds::default(),
            running: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            latest_audit: Arc::new(RwLock::new(None)),
            health_interval: Duration::from_secs(30),
            security_interval: Duration::from_secs(300),
        }
    }

    /// Whether the monitor loops are running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start monitoring. Starting while already running is an error;
    /// stop first.
    pub async fn start(&self) -> Result<(), ProductionMonitorError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ProductionMonitorError(
                "monitoring is already running".into(),
            ));
        }
        tracing::info!("starting production monitoring");

        // first pass synchronously so consumers have data right away
        self.collector.collect(true).await;
        *self.latest_audit.write() = audit_config(&self.config.current()).ok();

        let collector = self.collector.clone();
        let alerts = self.alerts.clone();
        let health_interval = self.health_interval;
        let health_loop = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(health_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let snapshot = collector.collect(true).await;
                alerts.evaluate(&snapshot);
            }
        });

        let config = self.config.clone();
        let latest_audit = self.latest_audit.clone();
        let security_interval = self.security_interval;
        let security_loop = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(security_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match audit_config(&config.current()) {
                    Ok(report) => *latest_audit.write() = Some(report),
                    Err(e) => tracing::error!(error = %e, "security audit failed"),
                }
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.push(health_loop);
        tasks.push(security_loop);
        Ok(())
    }

    /// Stop monitoring; a no-op when not running
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("stopping production monitoring");
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Combined readiness + health + security + backup rollup
    pub async fn deployment_health_status(&self) -> DeploymentHealth {
        let status = match self.orchestrator.status().await {
            Ok(status) => status,
            Err(_) => return DeploymentHealth::Unhealthy,
        };

        let healthy = |name: &str| {
            status
                .get(name)
                .map(|s| s.state == ServiceState::Running && s.health != HealthState::Unhealthy)
                .unwrap_or(false)
        };

        if !CRITICAL_SERVICES.iter().all(|s| healthy(s)) {
            return DeploymentHealth::Unhealthy;
        }

        let non_critical_down = self
            .registry
            .services()
            .iter()
            .filter(|s| !CRITICAL_SERVICES.contains(&s.name.as_str()))
            .any(|s| !healthy(&s.name));
        let security_ok = self
            .latest_audit
            .read()
            .as_ref()
            .map(|a| a.passed)
            .unwrap_or(true);
        let backup_ok = self.recovery.system_healthy().await;

        if non_critical_down || !security_ok || !backup_ok {
            DeploymentHealth::Degraded
        } else {
            DeploymentHealth::Healthy
        }
    }

    /// Real-time alerts; only available while running
    pub async fn real_time_alerts(&self) -> Result<Vec<MonitorAlert>, ProductionMonitorError> {
        if !self.is_running() {
            return Err(ProductionMonitorError("monitoring is not running".into()));
        }
        let now = Utc::now();
        let mut alerts = Vec::new();

        // service health
        if let Ok(status) = self.orchestrator.status().await {
            for service in self.registry.services() {
                let down = status
                    .get(&service.name)
                    .map(|s| s.state != ServiceState::Running)
                    .unwrap_or(true);
                if down {
                    let critical = CRITICAL_SERVICES.contains(&service.name.as_str());
                    alerts.push(MonitorAlert {
                        alert_type: "service_health".into(),
                        severity: if critical { Severity::Critical } else { Severity::Warning },
                        message: format!("{} is down", service.name),
                        timestamp: now,
                    });
                }
            }
        }

        // security findings are always critical
        if let Some(report) = self.latest_audit.read().as_ref() {
            let breaches: Vec<&crate::audit::AuditFinding> = report
                .findings
                .iter()
                .filter(|f| f.severity >= AuditSeverity::High)
                .collect();
            if breaches.len() >= self.thresholds.security_breach as usize {
                for finding in breaches {
                    alerts.push(MonitorAlert {
                        alert_type: "security".into(),
                        severity: Severity::Critical,
                        message: format!("{}: {}", finding.subject, finding.message),
                        timestamp: now,
                    });
                }
            }
        }

        // error rate against the configured threshold
        for (service, percent) in self.collector.error_rates() {
            if percent / 100.0 > self.thresholds.error_rate {
                alerts.push(MonitorAlert {
                    alert_type: "error_rate".into(),
                    severity: Severity::Warning,
                    message: format!(
                        "{service} error rate {percent:.1}% exceeds {:.0}% threshold",
                        self.thresholds.error_rate * 100.0
                    ),
                    timestamp: now,
                });
            }
        }

        // resource utilization against the configured threshold
        if let Some(snapshot) = self.collector.latest() {
            for (service, metrics) in &snapshot.services {
                if let Some(stats) = &metrics.stats {
                    let cpu = stats.cpu_percent / 100.0;
                    let memory = stats.memory_percent / 100.0;
                    if cpu >= self.thresholds.resource || memory >= self.thresholds.resource {
                        alerts.push(MonitorAlert {
                            alert_type: "resource".into(),
                            severity: Severity::Critical,
                            message: format!(
                                "{service} resource utilization critical (cpu {:.0}%, memory {:.0}%)",
                                stats.cpu_percent, stats.memory_percent
                            ),
                            timestamp: now,
                        });
                    }
                }
            }
        }

        Ok(alerts)
    }

    /// Validate a platform version across every application service, then
    /// check resource headroom and external dependencies
    pub async fn validate_deployment(&self, version: &str) -> VersionValidation {
        let mut services = BTreeMap::new();
        for service in self.registry.application_services() {
            let image = format!("ghcr.io/convoy-platform/{}:{version}", service.name);
            let outcome = self.validator.validate(&DeployRequest::new(&service.name, &image)).await;
            services.insert(service.name.clone(), outcome);
        }

        // resource headroom across the host
        let resource_available = match self.orchestrator.stats(None).await {
            Ok(stats) => {
                let total_cpu: f64 = stats.values().map(|s| s.cpu_percent).sum();
                total_cpu / 100.0 < self.thresholds.resource * 8.0
            }
            Err(_) => false,
        };

        // external dependencies: every backing store running
        let external_dependencies_available = match self.orchestrator.status().await {
            Ok(status) => self.registry.backing_stores().iter().all(|store| {
                status
                    .get(&store.name)
                    .map(|s| s.state == ServiceState::Running)
                    .unwrap_or(false)
            }),
            Err(_) => false,
        };

        let allowed = services.values().all(|v| v.valid)
            && resource_available
            && external_dependencies_available;
        VersionValidation {
            version: version.into(),
            allowed,
            services,
            resource_available,
            external_dependencies_available,
        }
    }

    /// Poll service health across the platform for one rollout
    pub async fn monitor_deployment(&self, deployment_id: &str) -> RolloutWatch {
        let status = self.orchestrator.status().await.unwrap_or_default();
        let mut services = BTreeMap::new();
        for service in self.registry.application_services() {
            let healthy = status
                .get(&service.name)
                .map(|s| s.state == ServiceState::Running && s.health != HealthState::Unhealthy)
                .unwrap_or(false);
            services.insert(service.name.clone(), healthy);
        }
        let overall = if services.values().all(|h| *h) { "healthy" } else { "unhealthy" };
        RolloutWatch {
            deployment_id: deployment_id.into(),
            overall_health: overall.into(),
            services,
            checked_at: Utc::now(),
        }
    }

    /// The deployer behind `prod deploy` / `prod rollback`
    pub fn deployer(&self) -> Arc<BlueGreenDeployer> {
        self.deployer.clone()
    }
}

impl Drop for ProductionMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

//! Blue/green deployer
//!
//! Brings up the green environment beside blue, gates it on health,
//! shifts traffic in steps while watching the error rate, and rolls back
//! automatically on failure. Traffic on the two environments always sums
//! to 100, and a healthy version never loses traffic before its successor
//! is healthy. Rollouts for a given service are serialized; distinct
//! services may roll out concurrently.

use crate::loadbalancer::LoadBalancer;
use crate::validator::{DeployRequest, DeploymentValidator, ValidationOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use convoy_compose::Orchestrator;
use convoy_core::{Clock, SystemClock};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Rollback reason when the green environment never became healthy
pub const REASON_HEALTH: &str = "Green environment health check failed";
/// Rollback reason when the error rate spiked during the shift
pub const REASON_ERROR_RATE: &str = "High error rate during traffic switch";
/// Rollback reason when the operator cancelled the rollout
pub const REASON_CANCELLED: &str = "Deployment cancelled";

/// Environment lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvStatus {
    Absent,
    Starting,
    Healthy,
    Unhealthy,
    Retired,
}

/// One side of a blue/green pair
#[derive(Debug, Clone, Serialize)]
pub struct EnvState {
    pub id: Option<String>,
    pub image: Option<String>,
    pub version: Option<String>,
    pub status: EnvStatus,
    pub traffic_percent: u8,
}

impl EnvState {
    fn absent() -> Self {
        Self {
            id: None,
            image: None,
            version: None,
            status: EnvStatus::Absent,
            traffic_percent: 0,
        }
    }
}

/// Blue/green pair for one service
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentState {
    pub blue: EnvState,
    pub green: EnvState,
}

impl DeploymentState {
    fn shift_to_green(&mut self, percent: u8) {
        self.green.traffic_percent = percent;
        self.blue.traffic_percent = 100 - percent;
    }

    fn all_to_blue(&mut self) {
        self.blue.traffic_percent = 100;
        self.green.traffic_percent = 0;
    }
}

/// Rollout tuning; the defaults match the platform's standard policy
#[derive(Debug, Clone)]
pub struct DeployPolicy {
    /// Traffic percentages walked in order
    pub traffic_steps: Vec<u8>,
    /// Observation window after each step
    pub monitor_window: Duration,
    /// Error-rate fraction above which the rollout aborts
    pub error_rate_threshold: f64,
    /// Health gate deadline for the green environment
    pub health_timeout: Duration,
}

impl Default for DeployPolicy {
    fn default() -> Self {
        Self {
            traffic_steps: vec![10, 25, 50, 75, 100],
            monitor_window: Duration::from_secs(30),
            error_rate_threshold: 0.10,
            health_timeout: Duration::from_secs(300),
        }
    }
}

/// Error rate observed on one traffic step
#[derive(Debug, Clone, Serialize)]
pub struct TrafficStep {
    pub percent: u8,
    pub error_rate: f64,
}

/// Terminal outcome of one rollout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployOutcome {
    Succeeded,
    RolledBack,
    Failed,
}

/// What one deploy call returns
#[derive(Debug, Clone, Serialize)]
pub struct DeployResult {
    pub success: bool,
    pub service: String,
    pub image: String,
    pub version: String,
    pub reason: Option<String>,
    pub rollback_performed: bool,
    pub manual_intervention_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationOutcome>,
    pub steps: Vec<TrafficStep>,
    pub duration_ms: u64,
}

/// Immutable history entry published after each rollout
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct DeployRecord {
    pub id: String,
    pub service: String,
    pub image: String,
    pub version: String,
    /// Container id the rollout created
    pub service_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: DeployOutcome,
    pub reason: Option<String>,
}

/// Point-in-time view for `prod status`
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentStatus {
    /// `"blue"` or `"green"`: green iff it serves more than half
    pub current_environment: String,
    pub blue_status: EnvStatus,
    pub blue_traffic_percent: u8,
    pub green_status: EnvStatus,
    pub green_traffic_percent: u8,
}

/// Observed error rate on a target, consulted between traffic steps
#[async_trait]
pub trait ErrorRateProbe: Send + Sync {
    /// Error fraction in [0, 1] for the target over the last window
    async fn error_rate(&self, service: &str, target_id: &str) -> f64;
}

/// Fixed sequence of error rates; repeats the last value when exhausted
#[derive(Default)]
pub struct FixedErrorRate {
    rates: Mutex<Vec<f64>>,
}

impl FixedErrorRate {
    /// Always-zero probe
    pub fn zero() -> Self {
        Self::default()
    }

    /// Probe returning the rates in order
    pub fn sequence(rates: &[f64]) -> Self {
        Self {
            rates: Mutex::new(rates.to_vec()),
        }
    }
}

#[async_trait]
impl ErrorRateProbe for FixedErrorRate {
    async fn error_rate(&self, _service: &str, _target_id: &str) -> f64 {
        let mut rates = self.rates.lock();
        if rates.len() > 1 {
            rates.remove(0)
        } else {
            rates.first().copied().unwrap_or(0.0)
        }
    }
}

/// Blue/green rollout engine
pub struct BlueGreenDeployer {
    orchestrator: Arc<dyn Orchestrator>,
    balancer: Arc<dyn LoadBalancer>,
    validator: Arc<DeploymentValidator>,
    error_probe: Arc<dyn ErrorRateProbe>,
    policy: DeployPolicy,
    clock: Arc<dyn Clock>,
    states: RwLock<HashMap<String, DeploymentState>>,
    history: RwLock<Vec<DeployRecord>>,
    history_file: Option<std::path::PathBuf>,
    rollout_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    cancel_flags: RwLock<HashMap<String, Arc<AtomicBool>>>,
}

impl BlueGreenDeployer {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        balancer: Arc<dyn LoadBalancer>,
        validator: Arc<DeploymentValidator>,
        error_probe: Arc<dyn ErrorRateProbe>,
    ) -> Self {
        Self {
            orchestrator,
            balancer,
            validator,
            error_probe,
            policy: DeployPolicy::default(),
            clock: Arc::new(SystemClock),
            states: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
            history_file: None,
            rollout_locks: Mutex::new(HashMap::new()),
            cancel_flags: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the rollout policy
    pub fn with_policy(mut self, policy: DeployPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Persist rollout history to a JSON file, loading any existing
    /// records so manual rollback works across invocations
    pub fn with_history_file(mut self, path: impl Into<std::path::PathBuf>) -> Self {
        let path = path.into();
        if let Ok(raw) = std::fs::read_to_string(&path) {
            match serde_json::from_str::<Vec<DeployRecord>>(&raw) {
                Ok(records) => *self.history.write() = records,
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "unreadable history file"),
            }
        }
        self.history_file = Some(path);
        self
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn rollout_lock(&self, service: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.rollout_locks
            .lock()
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn cancel_flag(&self, service: &str) -> Arc<AtomicBool> {
        self.cancel_flags
            .write()
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    /// Request cancellation of an in-flight rollout; it unwinds through
    /// the automatic rollback path, not an abrupt abort
    pub fn cancel(&self, service: &str) {
        self.cancel_flag(service).store(true, Ordering::SeqCst);
    }

    fn ensure_state(&self, service: &str) {
        let mut states = self.states.write();
        states.entry(service.to_string()).or_insert_with(|| DeploymentState {
            blue: EnvState {
                id: Some(format!("convoy-{service}")),
                image: None,
                version: None,
                status: EnvStatus::Healthy,
                traffic_percent: 100,
            },
            green: EnvState::absent(),
        });
    }

    fn update_state(&self, service: &str, update: impl FnOnce(&mut DeploymentState)) {
        let mut states = self.states.write();
        if let Some(state) = states.get_mut(service) {
            update(state);
            debug_assert_eq!(
                state.blue.traffic_percent as u32 + state.green.traffic_percent as u32,
                100
            );
        }
    }

    /// Current blue/green view for a service
    pub fn status(&self, service: &str) -> DeploymentStatus {
        self.ensure_state(service);
        let states = self.states.read();
        let state = &states[service];
        let current = if state.green.traffic_percent > 50 { "green" } else { "blue" };
        DeploymentStatus {
            current_environment: current.into(),
            blue_status: state.blue.status,
            blue_traffic_percent: state.blue.traffic_percent,
            green_status: state.green.status,
            green_traffic_percent: state.green.traffic_percent,
        }
    }

    /// Published rollout history, oldest first
    pub fn history(&self) -> Vec<DeployRecord> {
        self.history.read().clone()
    }

    /// Deploy with gradual traffic shifting
    pub async fn deploy(&self, service: &str, image: &str) -> DeployResult {
        self.deploy_inner(service, image, false).await
    }

    /// Deploy with a single atomic 0 -> 100 switch after the health gate
    pub async fn deploy_instant(&self, service: &str, image: &str) -> DeployResult {
        self.deploy_inner(service, image, true).await
    }

    async fn deploy_inner(&self, service: &str, image: &str, instant: bool) -> DeployResult {
        let lock = self.rollout_lock(service);
        let _rollout = lock.lock().await;
        let cancel = self.cancel_flag(service);
        cancel.store(false, Ordering::SeqCst);

        let started = Instant::now();
        let started_at = self.clock.now();
        let version = image.rsplit(':').next().unwrap_or("latest").to_string();
        let mut result = DeployResult {
            success: false,
            service: service.into(),
            image: image.into(),
            version: version.clone(),
            reason: None,
            rollback_performed: false,
            manual_intervention_required: false,
            validation: None,
            steps: Vec::new(),
            duration_ms: 0,
        };

        // preflight: failures return with no side effects
        let request = DeployRequest::new(service, image);
        let validation = self.validator.validate(&request).await;
        if !validation.valid {
            tracing::warn!(%service, errors = ?validation.errors(), "deployment validation failed");
            result.reason = Some("validation failed".into());
            result.validation = Some(validation);
            result.duration_ms = started.elapsed().as_millis() as u64;
            return result;
        }
        result.validation = Some(validation);

        self.ensure_state(service);
        tracing::info!(%service, %image, "starting blue/green rollout");

        // bring up green
        let green_id = match self.orchestrator.create_service(service, image, Some("green")).await {
            Ok(id) => id,
            Err(e) => {
                result.reason = Some(format!("green environment creation failed: {e}"));
                result.duration_ms = started.elapsed().as_millis() as u64;
                return result;
            }
        };
        self.update_state(service, |state| {
            state.green = EnvState {
                id: Some(green_id.clone()),
                image: Some(image.to_string()),
                version: Some(version.clone()),
                status: EnvStatus::Starting,
                traffic_percent: 0,
            };
            state.blue.traffic_percent = 100;
        });

        // health gate
        let healthy = self
            .orchestrator
            .wait_for_health(&green_id, self.policy.health_timeout)
            .await
            .unwrap_or(false);
        if !healthy {
            self.update_state(service, |state| state.green.status = EnvStatus::Unhealthy);
            return self
                .finish_with_rollback(result, service, &green_id, REASON_HEALTH, started, started_at)
                .await;
        }
        self.update_state(service, |state| state.green.status = EnvStatus::Healthy);

        // sanity-check green's resource usage before shifting traffic
        if let Ok(stats) = self.orchestrator.stats(Some(service)).await {
            if let Some(s) = stats.get(service) {
                if s.memory_percent > 98.0 {
                    return self
                        .finish_with_rollback(
                            result,
                            service,
                            &green_id,
                            "green environment out of memory",
                            started,
                            started_at,
                        )
                        .await;
                }
            }
        }

        // traffic shift
        let steps: Vec<u8> = if instant { vec![100] } else { self.policy.traffic_steps.clone() };
        for percent in steps {
            if cancel.load(Ordering::SeqCst) {
                return self
                    .finish_with_rollback(result, service, &green_id, REASON_CANCELLED, started, started_at)
                    .await;
            }

            let shifted = if instant {
                self.balancer
                    .switch_instant(service, &self.blue_id(service), &green_id)
                    .await
                    .map(|_| ())
            } else {
                self.balancer.set_percentage(service, &green_id, percent).await
            };
            if let Err(e) = shifted {
                tracing::error!(%service, error = %e, "traffic shift failed");
                return self
                    .finish_with_rollback(
                        result,
                        service,
                        &green_id,
                        &format!("traffic shift failed: {e}"),
                        started,
                        started_at,
                    )
                    .await;
            }
            self.update_state(service, |state| state.shift_to_green(percent));

            if !self.policy.monitor_window.is_zero() {
                tokio::time::sleep(self.policy.monitor_window).await;
            }
            let rate = self.error_probe.error_rate(service, &green_id).await;
            result.steps.push(TrafficStep { percent, error_rate: rate });
            tracing::info!(%service, percent, error_rate = rate, "traffic step observed");

            if rate > self.policy.error_rate_threshold {
                return self
                    .finish_with_rollback(result, service, &green_id, REASON_ERROR_RATE, started, started_at)
                    .await;
            }
        }

        // success: retire blue, promote green into the blue slot
        self.update_state(service, |state| {
            state.blue.status = EnvStatus::Retired;
            let mut promoted = state.green.clone();
            promoted.traffic_percent = 100;
            state.blue = promoted;
            state.green = EnvState::absent();
        });
        self.record(service, image, &version, &green_id, started_at, DeployOutcome::Succeeded, None);

        result.success = true;
        result.duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(%service, %image, "rollout succeeded");
        result
    }

    fn blue_id(&self, service: &str) -> String {
        self.states
            .read()
            .get(service)
            .and_then(|s| s.blue.id.clone())
            .unwrap_or_else(|| format!("convoy-{service}"))
    }

    async fn finish_with_rollback(
        &self,
        mut result: DeployResult,
        service: &str,
        green_id: &str,
        reason: &str,
        started: Instant,
        started_at: DateTime<Utc>,
    ) -> DeployResult {
        tracing::warn!(%service, %reason, "rolling back");
        match self.rollback_auto(service, green_id).await {
            Ok(()) => {
                result.rollback_performed = true;
            }
            Err(e) => {
                tracing::error!(%service, error = %e, "rollback failed; manual intervention required");
                result.manual_intervention_required = true;
            }
        }
        result.reason = Some(reason.to_string());
        result.duration_ms = started.elapsed().as_millis() as u64;
        self.record(
            service,
            &result.image.clone(),
            &result.version.clone(),
            green_id,
            started_at,
            if result.rollback_performed { DeployOutcome::RolledBack } else { DeployOutcome::Failed },
            Some(reason.to_string()),
        );
        result
    }

    /// Automatic rollback: traffic back to blue, green removed
    async fn rollback_auto(
        &self,
        service: &str,
        green_id: &str,
    ) -> Result<(), crate::loadbalancer::LbError> {
        let blue_id = self.blue_id(service);
        self.balancer.revert(service, &blue_id).await?;
        self.update_state(service, |state| {
            state.all_to_blue();
            state.blue.status = EnvStatus::Healthy;
        });
        if let Err(e) = self.orchestrator.remove_service(green_id).await {
            tracing::warn!(%green_id, error = %e, "green removal failed");
        }
        self.update_state(service, |state| state.green = EnvState::absent());
        Ok(())
    }

    /// Manual rollback to a version from the deployment history
    pub async fn rollback_to_version(&self, service: &str, version: &str) -> DeployResult {
        let lock = self.rollout_lock(service);
        let _rollout = lock.lock().await;
        let started = Instant::now();

        let mut result = DeployResult {
            success: false,
            service: service.into(),
            image: String::new(),
            version: version.into(),
            reason: None,
            rollback_performed: false,
            manual_intervention_required: false,
            validation: None,
            steps: Vec::new(),
            duration_ms: 0,
        };

        let record = self
            .history
            .read()
            .iter()
            .rev()
            .find(|r| r.service == service && r.version == version && r.outcome == DeployOutcome::Succeeded)
            .cloned();
        let Some(record) = record else {
            result.reason = Some(format!("version {version} not found in deployment history"));
            result.duration_ms = started.elapsed().as_millis() as u64;
            return result;
        };
        result.image = record.image.clone();

        if let Err(e) = self.orchestrator.restart_service(&record.service_id).await {
            result.reason = Some(format!("failed to restart {}: {e}", record.service_id));
            result.duration_ms = started.elapsed().as_millis() as u64;
            return result;
        }
        let current = self.blue_id(service);
        match self.balancer.switch(service, &current, &record.service_id).await {
            Ok(_) => {
                self.ensure_state(service);
                self.update_state(service, |state| {
                    state.blue = EnvState {
                        id: Some(record.service_id.clone()),
                        image: Some(record.image.clone()),
                        version: Some(record.version.clone()),
                        status: EnvStatus::Healthy,
                        traffic_percent: 100,
                    };
                    state.green = EnvState::absent();
                });
                result.success = true;
                result.rollback_performed = true;
                tracing::info!(%service, %version, "manual rollback complete");
            }
            Err(e) => {
                result.reason = Some(format!("traffic switch failed: {e}"));
                result.manual_intervention_required = true;
            }
        }
        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        service: &str,
        image: &str,
        version: &str,
        service_id: &str,
        started_at: DateTime<Utc>,
        outcome: DeployOutcome,
        reason: Option<String>,
    ) {
        let mut history = self.history.write();
        history.push(DeployRecord {
            id: uuid::Uuid::new_v4().to_string(),
            service: service.into(),
            image: image.into(),
            version: version.into(),
            service_id: service_id.into(),
            started_at,
            finished_at: self.clock.now(),
            outcome,
            reason,
        });
        if let Some(path) = &self.history_file {
            match serde_json::to_string_pretty(&*history) {
                Ok(json) => {
                    if let Err(e) = std::fs::write(path, json) {
                        tracing::warn!(path = %path.display(), error = %e, "history write failed");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "history encode failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadbalancer::MemoryBalancer;
    use crate::validator::DeploymentValidator;
    use convoy_compose::FakeOrchestrator;
    use convoy_core::{ManualClock, ScriptedRunner};
    use convoy_metrics::FakeProber;
    use proptest::prelude::*;

    struct Fixture {
        orchestrator: Arc<FakeOrchestrator>,
        balancer: Arc<MemoryBalancer>,
        deployer: BlueGreenDeployer,
    }

    const IMAGE_V2: &str = "ghcr.io/convoy-platform/gateway:2.0";

    fn fixture(policy: DeployPolicy, rates: &[f64]) -> Fixture {
        let orchestrator = Arc::new(FakeOrchestrator::new());
        for dep in ["relational-db", "cache", "vector-db", "personas", "workflows", "projects", "context", "tokens", "gateway"] {
            orchestrator.set_running(dep);
        }
        orchestrator.add_image(IMAGE_V2, 100_000_000);
        orchestrator.add_image("ghcr.io/convoy-platform/gateway:1.0", 90_000_000);
        orchestrator.set_previous("gateway", "1.9", "ghcr.io/convoy-platform/gateway:1.9", true);

        let balancer = Arc::new(MemoryBalancer::new());
        let validator = Arc::new(DeploymentValidator::new(
            orchestrator.clone(),
            Arc::new(FakeProber::all_ok()),
            Arc::new(ScriptedRunner::new().on_fail("trivy", 127, "not found")),
        ));
        let deployer = BlueGreenDeployer::new(
            orchestrator.clone(),
            balancer.clone(),
            validator,
            Arc::new(FixedErrorRate::sequence(rates)),
        )
        .with_policy(policy)
        .with_clock(Arc::new(ManualClock::at_epoch()));

        Fixture { orchestrator, balancer, deployer }
    }

    fn fast_policy(steps: &[u8]) -> DeployPolicy {
        DeployPolicy {
            traffic_steps: steps.to_vec(),
            monitor_window: Duration::ZERO,
            error_rate_threshold: 0.10,
            health_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_successful_rollout() {
        let fx = fixture(fast_policy(&[10, 25, 50, 75, 100]), &[0.0]);
        let result = fx.deployer.deploy("gateway", IMAGE_V2).await;

        assert!(result.success, "reason: {:?}", result.reason);
        assert_eq!(result.steps.len(), 5);
        assert!(!result.rollback_performed);

        let status = fx.deployer.status("gateway");
        assert_eq!(status.blue_traffic_percent, 100);
        assert_eq!(status.green_status, EnvStatus::Absent);

        let history = fx.deployer.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, DeployOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_validation_failure_has_no_side_effects() {
        let fx = fixture(fast_policy(&[100]), &[0.0]);
        let result = fx.deployer.deploy("gateway", "ghcr.io/convoy-platform/gateway").await;

        assert!(!result.success);
        assert_eq!(result.reason.as_deref(), Some("validation failed"));
        assert!(!result.validation.unwrap().valid);
        assert!(fx.orchestrator.created().is_empty());
        assert!(fx.deployer.history().is_empty());
    }

    #[tokio::test]
    async fn test_green_health_failure_rolls_back() {
        let fx = fixture(fast_policy(&[10, 25, 50, 75, 100]), &[0.0]);
        fx.orchestrator.set_default_healthy(false);

        let result = fx.deployer.deploy("gateway", IMAGE_V2).await;
        assert!(!result.success);
        assert_eq!(result.reason.as_deref(), Some(REASON_HEALTH));
        assert!(result.rollback_performed);

        let status = fx.deployer.status("gateway");
        assert_eq!(status.blue_traffic_percent, 100);
        assert_eq!(status.green_traffic_percent, 0);
        // green container was removed
        let created = fx.orchestrator.created();
        assert_eq!(fx.orchestrator.removed(), vec![created[0].id.clone()]);
    }

    #[tokio::test]
    async fn test_error_rate_spike_rolls_back_mid_shift() {
        let fx = fixture(fast_policy(&[10, 25, 50]), &[0.0, 0.0, 0.18]);
        let result = fx.deployer.deploy("gateway", IMAGE_V2).await;

        assert!(!result.success);
        assert_eq!(result.reason.as_deref(), Some(REASON_ERROR_RATE));
        assert!(result.rollback_performed);
        assert_eq!(result.steps.len(), 3);
        assert!((result.steps[2].error_rate - 0.18).abs() < 1e-9);

        let status = fx.deployer.status("gateway");
        assert_eq!(status.blue_traffic_percent, 100);
    }

    #[tokio::test]
    async fn test_instant_switch() {
        let fx = fixture(fast_policy(&[10, 25]), &[0.0]);
        let result = fx.deployer.deploy_instant("gateway", IMAGE_V2).await;
        assert!(result.success);
        // one atomic step, not the gradual sequence
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].percent, 100);
    }

    #[tokio::test]
    async fn test_lb_failure_during_rollback_requires_manual_intervention() {
        let fx = fixture(fast_policy(&[10]), &[0.5]);
        // first LB call is the shift to 10%, second is the rollback revert
        fx.balancer.fail_after(1);

        let result = fx.deployer.deploy("gateway", IMAGE_V2).await;
        assert!(!result.success);
        assert!(!result.rollback_performed);
        assert!(result.manual_intervention_required);
    }

    #[tokio::test]
    async fn test_manual_rollback_to_recorded_version() {
        let fx = fixture(fast_policy(&[100]), &[0.0]);
        let v1 = "ghcr.io/convoy-platform/gateway:1.0";
        assert!(fx.deployer.deploy("gateway", v1).await.success);
        assert!(fx.deployer.deploy("gateway", IMAGE_V2).await.success);

        let result = fx.deployer.rollback_to_version("gateway", "1.0").await;
        assert!(result.success, "reason: {:?}", result.reason);
        assert!(result.rollback_performed);

        // the v1 container was restarted and now takes all traffic
        let v1_id = fx
            .deployer
            .history()
            .iter()
            .find(|r| r.version == "1.0")
            .unwrap()
            .service_id
            .clone();
        assert_eq!(fx.orchestrator.restarted(), vec![v1_id.clone()]);
        let split = fx.balancer.distribution("gateway").await.unwrap();
        assert_eq!(split[&v1_id], 100);
    }

    #[tokio::test]
    async fn test_manual_rollback_unknown_version() {
        let fx = fixture(fast_policy(&[100]), &[0.0]);
        let result = fx.deployer.rollback_to_version("gateway", "0.1").await;
        assert!(!result.success);
        assert!(result.reason.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_cancel_unwinds_through_rollback() {
        let mut policy = fast_policy(&[10, 25, 50]);
        policy.monitor_window = Duration::from_millis(50);
        let fx = fixture(policy, &[0.0]);

        let flag = fx.deployer.cancel_flag("gateway");
        let deploy = fx.deployer.deploy("gateway", IMAGE_V2);
        tokio::pin!(deploy);
        // flip the flag while the first monitor window is open
        let result = loop {
            tokio::select! {
                result = &mut deploy => break result,
                _ = tokio::time::sleep(Duration::from_millis(5)) => {
                    if !fx.orchestrator.created().is_empty() {
                        flag.store(true, Ordering::SeqCst);
                    }
                }
            }
        };

        assert!(!result.success);
        assert_eq!(result.reason.as_deref(), Some(REASON_CANCELLED));
        assert!(result.rollback_performed);
        assert_eq!(fx.deployer.status("gateway").blue_traffic_percent, 100);
    }

    #[tokio::test]
    async fn test_distinct_services_roll_out_concurrently() {
        let orchestrator = Arc::new(FakeOrchestrator::new());
        for dep in [
            "relational-db", "cache", "vector-db", "gateway", "personas", "workflows",
            "projects", "context", "tokens",
        ] {
            orchestrator.set_running(dep);
        }
        for service in ["personas", "tokens"] {
            orchestrator.add_image(&format!("ghcr.io/convoy-platform/{service}:2.0"), 1_000);
            orchestrator.set_previous(
                service,
                "1.9",
                &format!("ghcr.io/convoy-platform/{service}:1.9"),
                true,
            );
        }
        let validator = Arc::new(DeploymentValidator::new(
            orchestrator.clone(),
            Arc::new(FakeProber::all_ok()),
            Arc::new(ScriptedRunner::new().on_fail("trivy", 127, "not found")),
        ));
        let deployer = Arc::new(
            BlueGreenDeployer::new(
                orchestrator.clone(),
                Arc::new(MemoryBalancer::new()),
                validator,
                Arc::new(FixedErrorRate::zero()),
            )
            .with_policy(fast_policy(&[50, 100]))
            .with_clock(Arc::new(ManualClock::at_epoch())),
        );

        let a = {
            let deployer = deployer.clone();
            tokio::spawn(async move {
                deployer.deploy("personas", "ghcr.io/convoy-platform/personas:2.0").await
            })
        };
        let b = {
            let deployer = deployer.clone();
            tokio::spawn(async move {
                deployer.deploy("tokens", "ghcr.io/convoy-platform/tokens:2.0").await
            })
        };
        assert!(a.await.unwrap().success);
        assert!(b.await.unwrap().success);
        assert_eq!(deployer.history().len(), 2);
    }

    #[tokio::test]
    async fn test_history_survives_a_new_deployer() {
        let file = std::env::temp_dir().join("convoy-deploy-history-test.json");
        let _ = std::fs::remove_file(&file);

        let fx = fixture(fast_policy(&[100]), &[0.0]);
        let deployer = BlueGreenDeployer::new(
            fx.orchestrator.clone(),
            fx.balancer.clone(),
            Arc::new(DeploymentValidator::new(
                fx.orchestrator.clone(),
                Arc::new(FakeProber::all_ok()),
                Arc::new(ScriptedRunner::new().on_fail("trivy", 127, "not found")),
            )),
            Arc::new(FixedErrorRate::zero()),
        )
        .with_policy(fast_policy(&[100]))
        .with_history_file(&file);
        assert!(deployer.deploy("gateway", IMAGE_V2).await.success);

        // a fresh deployer over the same file sees the record
        let reloaded = BlueGreenDeployer::new(
            fx.orchestrator.clone(),
            fx.balancer.clone(),
            Arc::new(DeploymentValidator::new(
                fx.orchestrator.clone(),
                Arc::new(FakeProber::all_ok()),
                Arc::new(ScriptedRunner::new()),
            )),
            Arc::new(FixedErrorRate::zero()),
        )
        .with_history_file(&file);
        let history = reloaded.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].version, "2.0");
        let result = reloaded.rollback_to_version("gateway", "2.0").await;
        assert!(result.success, "reason: {:?}", result.reason);
    }

    proptest! {
        /// Traffic on the pair sums to 100 after any shift sequence.
        #[test]
        fn prop_traffic_sums_to_hundred(percents in prop::collection::vec(0u8..=100, 1..20)) {
            let mut state = DeploymentState {
                blue: EnvState {
                    id: Some("blue".into()),
                    image: None,
                    version: None,
                    status: EnvStatus::Healthy,
                    traffic_percent: 100,
                },
                green: EnvState::absent(),
            };
            for percent in percents {
                state.shift_to_green(percent);
                prop_assert_eq!(
                    state.blue.traffic_percent as u32 + state.green.traffic_percent as u32,
                    100
                );
            }
            state.all_to_blue();
            prop_assert_eq!(state.blue.traffic_percent, 100);
        }
    }
}

//! In-memory orchestrator for tests
//!
//! Components accept the [`Orchestrator`] contract, so tests configure this
//! fake instead of monkey-patching internals.

use crate::orchestrator::{
    ContainerStats, HealthState, ImageProbe, Orchestrator, OrchestratorError, PreviousDeployment,
    ServiceState, ServiceStatus,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Scriptable in-memory orchestrator
#[derive(Default)]
pub struct FakeOrchestrator {
    statuses: RwLock<HashMap<String, ServiceStatus>>,
    stats: RwLock<HashMap<String, ContainerStats>>,
    images: RwLock<HashMap<String, ImageProbe>>,
    health_by_id: RwLock<HashMap<String, bool>>,
    default_healthy: RwLock<bool>,
    previous: RwLock<HashMap<String, PreviousDeployment>>,
    created: RwLock<Vec<CreatedService>>,
    removed: RwLock<Vec<String>>,
    restarted: RwLock<Vec<String>>,
    started: RwLock<Vec<Vec<String>>>,
    stopped: RwLock<Vec<Vec<String>>>,
    next_id: AtomicU64,
}

/// Record of a create_service call
#[derive(Debug, Clone)]
pub struct CreatedService {
    pub name: String,
    pub image: String,
    pub suffix: Option<String>,
    pub id: String,
}

impl FakeOrchestrator {
    /// Fake where everything is healthy by default
    pub fn new() -> Self {
        let fake = Self::default();
        *fake.default_healthy.write() = true;
        fake
    }

    /// Set a service's observed status
    pub fn set_status(&self, service: &str, state: ServiceState, health: HealthState) {
        self.statuses.write().insert(
            service.into(),
            ServiceStatus { state, health, port: None },
        );
    }

    /// Mark a service running and healthy
    pub fn set_running(&self, service: &str) {
        self.set_status(service, ServiceState::Running, HealthState::Healthy);
    }

    /// Set a service's container stats
    pub fn set_stats(&self, service: &str, stats: ContainerStats) {
        self.stats.write().insert(service.into(), stats);
    }

    /// Register an image as present
    pub fn add_image(&self, image: &str, size_bytes: u64) {
        self.images.write().insert(
            image.into(),
            ImageProbe { exists: true, registry: "docker.io".into(), size_bytes },
        );
    }

    /// Health outcome for every container not configured individually
    pub fn set_default_healthy(&self, healthy: bool) {
        *self.default_healthy.write() = healthy;
    }

    /// Health outcome for one container id
    pub fn set_health(&self, id: &str, healthy: bool) {
        self.health_by_id.write().insert(id.into(), healthy);
    }

    /// Record a previous deployment for a service
    pub fn set_previous(&self, service: &str, version: &str, image: &str, backup_available: bool) {
        self.previous.write().insert(
            service.into(),
            PreviousDeployment {
                version: version.into(),
                image: image.into(),
                backup_available,
            },
        );
    }

    /// Every create_service call so far
    pub fn created(&self) -> Vec<CreatedService> {
        self.created.read().clone()
    }

    /// Every removed container id so far
    pub fn removed(&self) -> Vec<String> {
        self.removed.read().clone()
    }

    /// Every restarted container id so far
    pub fn restarted(&self) -> Vec<String> {
        self.restarted.read().clone()
    }

    /// Every start batch so far
    pub fn started(&self) -> Vec<Vec<String>> {
        self.started.read().clone()
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn status(&self) -> Result<HashMap<String, ServiceStatus>, OrchestratorError> {
        Ok(self.statuses.read().clone())
    }

    async fn start(&self, services: &[String]) -> Result<(), OrchestratorError> {
        self.started.write().push(services.to_vec());
        for service in services {
            self.set_running(service);
        }
        Ok(())
    }

    async fn stop(&self, services: &[String]) -> Result<(), OrchestratorError> {
        self.stopped.write().push(services.to_vec());
        for service in services {
            self.set_status(service, ServiceState::NotRunning, HealthState::Unknown);
        }
        Ok(())
    }

    async fn restart(&self, services: &[String]) -> Result<(), OrchestratorError> {
        for service in services {
            self.set_running(service);
        }
        Ok(())
    }

    async fn stats(
        &self,
        service: Option<&str>,
    ) -> Result<HashMap<String, ContainerStats>, OrchestratorError> {
        let all = self.stats.read().clone();
        Ok(match service {
            Some(name) => all.into_iter().filter(|(k, _)| k == name).collect(),
            None => all,
        })
    }

    async fn image_probe(&self, image: &str) -> Result<ImageProbe, OrchestratorError> {
        Ok(self.images.read().get(image).cloned().unwrap_or(ImageProbe {
            exists: false,
            registry: "docker.io".into(),
            size_bytes: 0,
        }))
    }

    async fn create_service(
        &self,
        name: &str,
        image: &str,
        suffix: Option<&str>,
    ) -> Result<String, OrchestratorError> {
        let ordinal = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = match suffix {
            Some(suffix) => format!("{name}-{suffix}-{ordinal}"),
            None => format!("{name}-{ordinal}"),
        };
        self.created.write().push(CreatedService {
            name: name.into(),
            image: image.into(),
            suffix: suffix.map(String::from),
            id: id.clone(),
        });
        Ok(id)
    }

    async fn remove_service(&self, id: &str) -> Result<(), OrchestratorError> {
        self.removed.write().push(id.into());
        Ok(())
    }

    async fn wait_for_health(
        &self,
        id: &str,
        _timeout: Duration,
    ) -> Result<bool, OrchestratorError> {
        Ok(self
            .health_by_id
            .read()
            .get(id)
            .copied()
            .unwrap_or(*self.default_healthy.read()))
    }

    async fn previous_deployment(
        &self,
        service: &str,
    ) -> Result<Option<PreviousDeployment>, OrchestratorError> {
        Ok(self.previous.read().get(service).cloned())
    }

    async fn restart_service(&self, id: &str) -> Result<(), OrchestratorError> {
        self.restarted.write().push(id.into());
        Ok(())
    }
}

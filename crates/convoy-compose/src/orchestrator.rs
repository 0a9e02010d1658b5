//! Orchestrator contract
//!
//! The capability set the rest of the control plane consumes. The compose
//! implementation lives in [`crate::compose`]; tests use
//! [`crate::testing::FakeOrchestrator`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Container run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    /// Container is up
    Running,
    /// Container exists but is stopped, or does not exist
    NotRunning,
    /// State could not be determined
    Unknown,
}

/// Container health as reported by its health check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Health check passing
    Healthy,
    /// Health check failing
    Unhealthy,
    /// No health check configured or not yet evaluated
    Unknown,
}

/// One service's observed status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub health: HealthState,
    /// Listening port when known
    pub port: Option<u16>,
}

/// Resource usage for one container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_percent: f64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
    pub process_count: u32,
}

/// Result of probing an image reference
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageProbe {
    pub exists: bool,
    /// Registry host the reference resolves against
    pub registry: String,
    pub size_bytes: u64,
}

/// What the orchestrator knows about the deployment before the current one
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviousDeployment {
    pub version: String,
    pub image: String,
    pub backup_available: bool,
}

/// Orchestrator operation error
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Underlying engine command failed
    #[error("engine error: {0}")]
    Engine(#[from] convoy_core::runner::CommandError),
    /// Engine produced output we could not interpret
    #[error("unparseable engine output: {0}")]
    Parse(String),
    /// Service or container not found
    #[error("service not found: {0}")]
    NotFound(String),
    /// Dependency resolution failed
    #[error(transparent)]
    Core(#[from] convoy_core::CoreError),
}

/// Capability contract over the compose engine
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Observed status of every known service
    async fn status(&self) -> Result<HashMap<String, ServiceStatus>, OrchestratorError>;

    /// Start services, resolving dependencies first
    async fn start(&self, services: &[String]) -> Result<(), OrchestratorError>;

    /// Stop services, best effort
    async fn stop(&self, services: &[String]) -> Result<(), OrchestratorError>;

    /// Restart services, best effort
    async fn restart(&self, services: &[String]) -> Result<(), OrchestratorError>;

    /// Resource usage; all running containers when `service` is `None`
    async fn stats(
        &self,
        service: Option<&str>,
    ) -> Result<HashMap<String, ContainerStats>, OrchestratorError>;

    /// Probe an image reference without pulling it
    async fn image_probe(&self, image: &str) -> Result<ImageProbe, OrchestratorError>;

    /// Create a standalone service container; returns its id
    async fn create_service(
        &self,
        name: &str,
        image: &str,
        suffix: Option<&str>,
    ) -> Result<String, OrchestratorError>;

    /// Remove a container created with [`Orchestrator::create_service`]
    async fn remove_service(&self, id: &str) -> Result<(), OrchestratorError>;

    /// Block until the container reports healthy or the timeout elapses;
    /// returns whether it became healthy
    async fn wait_for_health(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<bool, OrchestratorError>;

    /// The deployment running before the current one, when known
    async fn previous_deployment(
        &self,
        service: &str,
    ) -> Result<Option<PreviousDeployment>, OrchestratorError>;

    /// Restart a specific container by id
    async fn restart_service(&self, id: &str) -> Result<(), OrchestratorError>;
}

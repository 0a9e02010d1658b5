//! Convoy Compose
//!
//! Thin contract over the compose engine plus the source repository
//! coordinator. Everything here issues commands to external collaborators
//! (`docker compose`, `docker`, `git`) through the core command-runner
//! seam; nothing re-implements the container runtime or git.

#![allow(dead_code)]

pub mod compose;
pub mod orchestrator;
pub mod repos;
pub mod testing;

pub use compose::ComposeOrchestrator;
pub use orchestrator::{
    ContainerStats, HealthState, ImageProbe, Orchestrator, OrchestratorError, PreviousDeployment,
    ServiceState, ServiceStatus,
};
pub use repos::{RepoError, RepoStatus, RepositoryCoordinator, UpdateOutcome};
pub use testing::FakeOrchestrator;

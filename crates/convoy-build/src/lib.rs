//! Convoy Build
//!
//! Turns the service registry into a build plan and executes it:
//! dependency DAG solving, cycle detection with full path reporting,
//! sequential or bounded-parallel execution, and cascade skipping of
//! dependents when a build fails.

#![allow(dead_code)]

pub mod coordinator;
pub mod graph;
pub mod status;

pub use coordinator::{BuildCoordinator, BuildOptions, BuildOutcome, BuildReport};
pub use graph::DependencyGraph;
pub use status::{ImageReport, ImageStatus};

use thiserror::Error;

/// Build subsystem error
#[derive(Debug, Error)]
pub enum BuildError {
    /// The dependency graph has a cycle; fatal for the current request
    #[error("circular dependency detected: {}", .path.join(" -> "))]
    CircularDependency {
        /// Full node sequence, first node repeated at the end
        path: Vec<String>,
    },
    /// Requested service is not in the graph
    #[error("unknown service: {0}")]
    UnknownService(String),
    /// Underlying engine command failed
    #[error("engine error: {0}")]
    Engine(#[from] convoy_core::runner::CommandError),
    /// Repository lookup failed
    #[error(transparent)]
    Repo(#[from] convoy_compose::RepoError),
}

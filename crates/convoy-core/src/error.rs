//! Error types shared across the platform

use thiserror::Error;

/// Core error type
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad input that the caller can correct
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Required production variable absent; fatal at startup
    #[error("missing required configuration: {}", .vars.join(", "))]
    ConfigurationMissing {
        /// Every missing variable, not just the first
        vars: Vec<String>,
    },

    /// Service name not present in the registry
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// External command failed or timed out
    #[error("command error: {0}")]
    Command(#[from] crate::runner::CommandError),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Validation failure carrying every issue found in one pass
#[derive(Debug, Error)]
#[error("validation failed: {}", .issues.join("; "))]
pub struct ValidationError {
    /// Human-readable issues, one per failed check
    pub issues: Vec<String>,
}

impl ValidationError {
    /// Single-issue validation failure
    pub fn new(issue: impl Into<String>) -> Self {
        Self { issues: vec![issue.into()] }
    }

    /// Validation failure from a collected issue list
    pub fn from_issues(issues: Vec<String>) -> Self {
        Self { issues }
    }
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

//! Error rendering and exit codes
//!
//! Every failure becomes a single-line summary plus optional detail,
//! never a stack dump. JSON output carries stable suggestions per kind.

use crate::output::OutputFormat;
use colored::Colorize;
use serde_json::json;

/// A CLI-surfaced error with its taxonomy category
#[derive(Debug)]
pub struct CliError {
    /// Category tag, e.g. `validation`, `deployment`
    pub category: &'static str,
    pub message: String,
    /// Optional second line of detail
    pub context: Option<String>,
    pub exit_code: i32,
}

impl CliError {
    pub fn new(category: &'static str, message: impl Into<String>) -> Self {
        let exit_code = match category {
            "validation" => 2,
            "configuration" => 3,
            "circular-dependency" | "build" => 4,
            "collection" => 5,
            "storage" => 6,
            "backup" | "backup-corrupted" => 7,
            "deployment" | "deployment-validation" => 8,
            "security-audit" => 9,
            "server-startup" => 10,
            _ => 1,
        };
        Self {
            category,
            message: message.into(),
            context: None,
            exit_code,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Stable suggestions per error kind
fn suggestions(category: &str) -> Vec<&'static str> {
    match category {
        "validation" => vec!["check the command arguments", "run `convoy config validate`"],
        "configuration" => vec![
            "set the missing environment variables",
            "production requires DATABASE_URL, REDIS_URL, and JWT_SECRET",
        ],
        "circular-dependency" => vec!["review the service dependency declarations"],
        "build" => vec!["run `convoy repos status`", "retry with `convoy build <service>`"],
        "collection" => vec!["check that the services are running", "retry with --no-cache"],
        "storage" => vec!["check the metrics store backend", "run `convoy monitor collect`"],
        "backup" | "backup-corrupted" => vec![
            "run `convoy backup list` to inspect available backups",
            "a corrupted backup cannot be restored; pick an older one",
        ],
        "deployment" | "deployment-validation" => vec![
            "run `convoy prod validate <version>`",
            "use --force to override validation (not recommended)",
        ],
        "security-audit" => vec!["run `convoy prod audit` for the full report"],
        "server-startup" => vec!["the port is already in use; pick another with --port"],
        _ => vec!["re-run with RUST_LOG=debug for detail"],
    }
}

/// Print the error in the requested format
pub fn render(error: &CliError, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let body = json!({
                "status": "error",
                "error": error.message,
                "context": error.context,
                "suggestions": suggestions(error.category),
            });
            eprintln!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
        }
        _ => {
            eprintln!(
                "{} {}",
                format!("error[{}]:", error.category).red().bold(),
                error.message
            );
            if let Some(context) = &error.context {
                eprintln!("  {context}");
            }
        }
    }
}

impl From<convoy_core::CoreError> for CliError {
    fn from(e: convoy_core::CoreError) -> Self {
        use convoy_core::CoreError;
        match &e {
            CoreError::ConfigurationMissing { .. } => Self::new("configuration", e.to_string()),
            CoreError::Validation(_) | CoreError::UnknownService(_) => {
                Self::new("validation", e.to_string())
            }
            _ => Self::new("internal", e.to_string()),
        }
    }
}

impl From<convoy_build::BuildError> for CliError {
    fn from(e: convoy_build::BuildError) -> Self {
        match &e {
            convoy_build::BuildError::CircularDependency { .. } => {
                Self::new("circular-dependency", e.to_string())
            }
            convoy_build::BuildError::UnknownService(_) => Self::new("validation", e.to_string()),
            _ => Self::new("build", e.to_string()),
        }
    }
}

impl From<convoy_compose::RepoError> for CliError {
    fn from(e: convoy_compose::RepoError) -> Self {
        Self::new("build", e.to_string())
    }
}

impl From<convoy_compose::OrchestratorError> for CliError {
    fn from(e: convoy_compose::OrchestratorError) -> Self {
        Self::new("collection", e.to_string())
    }
}

impl From<convoy_metrics::StorageError> for CliError {
    fn from(e: convoy_metrics::StorageError) -> Self {
        Self::new("storage", e.to_string())
    }
}

impl From<convoy_metrics::ServerError> for CliError {
    fn from(e: convoy_metrics::ServerError) -> Self {
        Self::new("server-startup", e.to_string())
    }
}

impl From<convoy_backup::BackupError> for CliError {
    fn from(e: convoy_backup::BackupError) -> Self {
        match &e {
            convoy_backup::BackupError::Corrupted { .. } => {
                Self::new("backup-corrupted", e.to_string())
            }
            _ => Self::new("backup", e.to_string()),
        }
    }
}

impl From<convoy_deploy::AuditError> for CliError {
    fn from(e: convoy_deploy::AuditError) -> Self {
        Self::new("security-audit", e.to_string())
    }
}

impl From<convoy_deploy::ProductionMonitorError> for CliError {
    fn from(e: convoy_deploy::ProductionMonitorError) -> Self {
        Self::new("deployment", e.to_string())
    }
}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        Self::new("internal", e.to_string())
    }
}

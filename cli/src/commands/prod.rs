//! Production commands

use crate::errors::CliError;
use crate::output::OutputFormat;
use crate::platform::Platform;
use crate::{DeployArgs, ProdCommands, RollbackArgs, Strategy};
use colored::Colorize;
use convoy_backup::BackupType;
use convoy_compose::Orchestrator;
use convoy_deploy::{audit_config, AuditSeverity, DeployResult};
use serde::Serialize;
use serde_json::json;
use tabled::Tabled;

pub async fn handle(
    action: ProdCommands,
    platform: &Platform,
    format: OutputFormat,
) -> Result<(), CliError> {
    match action {
        ProdCommands::Deploy(args) => deploy(args, platform, format).await,
        ProdCommands::Rollback(args) => rollback(args, platform, format).await,
        ProdCommands::Status { service } => status(platform, format, service).await,
        ProdCommands::Audit { comprehensive, output } => {
            audit(platform, format, comprehensive, output).await
        }
        ProdCommands::Validate { version } => validate(platform, format, &version).await,
        ProdCommands::Monitor => monitor(platform, format).await,
    }
}

fn image_for(service: &str, version: &str) -> String {
    format!("ghcr.io/convoy-platform/{service}:{version}")
}

async fn deploy(args: DeployArgs, platform: &Platform, format: OutputFormat) -> Result<(), CliError> {
    let monitor = platform.production_monitor();
    let run_validation = args.validate || !args.no_validate;
    let run_backup = args.backup || !args.no_backup;

    if run_validation {
        let validation = monitor.validate_deployment(&args.version).await;
        if !validation.allowed && !args.force {
            let failing: Vec<String> = validation
                .services
                .iter()
                .filter(|(_, v)| !v.valid)
                .flat_map(|(_, v)| v.errors())
                .collect();
            return Err(CliError::new(
                "deployment-validation",
                format!("version {} failed preflight validation", args.version),
            )
            .with_context(failing.join("\n  ")));
        }
        if !validation.allowed {
            tracing::warn!("validation failed; continuing because --force was given");
        }
    }

    if run_backup {
        let record = platform.backup_manager().create(BackupType::Full).await?;
        if format.is_table() {
            println!("pre-deploy backup: {}", record.backup_id);
        }
    }

    let services: Vec<String> = match &args.service {
        Some(service) => vec![service.clone()],
        None => {
            // whole-platform deploy walks the dependency order
            platform
                .build_coordinator()
                .graph()
                .build_order(None)?
        }
    };

    let deployer = monitor.deployer();
    let mut results: Vec<DeployResult> = Vec::new();
    let mut failed = false;
    for service in &services {
        let image = image_for(service, &args.version);
        let result = match args.strategy {
            Strategy::BlueGreen => deployer.deploy(service, &image).await,
            Strategy::Rolling => deployer.deploy_instant(service, &image).await,
        };
        if format.is_table() {
            let tag = if result.success {
                "deployed".green().bold()
            } else {
                "failed".red().bold()
            };
            println!(
                "{tag} {service} -> {} {}",
                args.version,
                result.reason.as_deref().unwrap_or_default()
            );
        }
        failed |= !result.success;
        results.push(result);
        if failed {
            // a failed service stops the rollout; dependents keep the old version
            break;
        }
    }

    if !format.is_table() {
        format.print(&results);
    }

    if failed {
        let last = results.last().unwrap();
        Err(CliError::new(
            "deployment",
            format!(
                "deployment of {} stopped at {}: {}",
                args.version,
                last.service,
                last.reason.as_deref().unwrap_or("unknown")
            ),
        )
        .with_context(if last.manual_intervention_required {
            "manual intervention required: traffic state could not be restored automatically"
        } else if last.rollback_performed {
            "automatic rollback restored the previous version"
        } else {
            "no changes were applied"
        }))
    } else {
        Ok(())
    }
}

async fn rollback(args: RollbackArgs, platform: &Platform, format: OutputFormat) -> Result<(), CliError> {
    let deployer = platform.deployer();
    let version = match args.to_version.or(args.version) {
        Some(version) => version,
        None => {
            // no version given: the one before the current deployment
            platform
                .orchestrator
                .previous_deployment(&args.service)
                .await?
                .map(|p| p.version)
                .ok_or_else(|| {
                    CliError::new("deployment", "no previous deployment found to roll back to")
                })?
        }
    };

    let result = deployer.rollback_to_version(&args.service, &version).await;
    if format.is_table() {
        if result.success {
            println!("{} {} -> {version}", "rolled back".green().bold(), args.service);
        }
    } else {
        format.print(&result);
    }

    if result.success {
        Ok(())
    } else {
        let mut error = CliError::new(
            "deployment",
            result.reason.clone().unwrap_or_else(|| "rollback failed".into()),
        );
        if result.manual_intervention_required {
            error = error.with_context("manual intervention required");
        }
        Err(error)
    }
}

async fn status(platform: &Platform, format: OutputFormat, service: Option<String>) -> Result<(), CliError> {
    let deployer = platform.deployer();
    let services: Vec<String> = match service {
        Some(service) => vec![service],
        None => platform
            .registry
            .application_services()
            .iter()
            .map(|s| s.name.clone())
            .collect(),
    };

    #[derive(Serialize, Tabled)]
    struct StatusRow {
        service: String,
        current: String,
        blue: String,
        green: String,
    }
    let rows: Vec<StatusRow> = services
        .iter()
        .map(|name| {
            let s = deployer.status(name);
            StatusRow {
                service: name.clone(),
                current: s.current_environment.clone(),
                blue: format!("{:?} ({}%)", s.blue_status, s.blue_traffic_percent),
                green: format!("{:?} ({}%)", s.green_status, s.green_traffic_percent),
            }
        })
        .collect();
    format.print_rows(&rows);
    Ok(())
}

async fn audit(
    platform: &Platform,
    format: OutputFormat,
    comprehensive: bool,
    output: Option<String>,
) -> Result<(), CliError> {
    let config = platform.config_snapshot();
    let mut report = audit_config(&config)?;

    if comprehensive {
        // also sweep every service's derived environment for inline secrets
        for service in platform.registry.application_services() {
            let Ok(env) = config.service_env(&service.name) else {
                continue;
            };
            for key in env.keys() {
                if key.contains("PASSWORD") {
                    report.findings.push(convoy_deploy::AuditFinding {
                        severity: AuditSeverity::Medium,
                        subject: format!("{}/{key}", service.name),
                        message: "password-bearing variable in derived environment".into(),
                    });
                }
            }
        }
    }

    if let Some(path) = output {
        std::fs::write(&path, serde_json::to_string_pretty(&report).unwrap_or_default())?;
        if format.is_table() {
            println!("report written to {path}");
        }
    }

    if format.is_table() {
        let verdict = if report.passed {
            format!("{} score {}", "passed".green().bold(), report.score)
        } else {
            format!("{} score {}", "failed".red().bold(), report.score)
        };
        println!("security audit: {verdict}");
        for finding in &report.findings {
            println!("  [{:?}] {}: {}", finding.severity, finding.subject, finding.message);
        }
    } else {
        format.print(&report);
    }

    if report.passed {
        Ok(())
    } else {
        Err(CliError::new("security-audit", "audit found high-severity issues"))
    }
}

async fn validate(platform: &Platform, format: OutputFormat, version: &str) -> Result<(), CliError> {
    let monitor = platform.production_monitor();
    let validation = monitor.validate_deployment(version).await;

    if format.is_table() {
        for (service, outcome) in &validation.services {
            let tag = if outcome.valid { "ok".green() } else { "failed".red() };
            println!("{service}: {tag}");
            for error in outcome.errors() {
                println!("    {error}");
            }
        }
        println!(
            "resources available: {}, external dependencies: {}",
            validation.resource_available, validation.external_dependencies_available
        );
    } else {
        format.print(&validation);
    }

    if validation.allowed {
        Ok(())
    } else {
        Err(CliError::new(
            "deployment-validation",
            format!("version {version} is not deployable"),
        ))
    }
}

async fn monitor(platform: &Platform, format: OutputFormat) -> Result<(), CliError> {
    let monitor = platform.production_monitor();
    monitor.start().await?;

    let health = monitor.deployment_health_status().await;
    let alerts = monitor.real_time_alerts().await?;
    monitor.stop();

    if format.is_table() {
        println!("deployment health: {health:?}");
        if alerts.is_empty() {
            println!("{} no active alerts", "ok:".green().bold());
        }
        for alert in &alerts {
            println!("  [{}] {}", alert.alert_type, alert.message);
        }
    } else {
        format.print(&json!({"health": health, "alerts": alerts}));
    }
    Ok(())
}

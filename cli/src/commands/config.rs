//! Config commands

use crate::errors::CliError;
use crate::output::OutputFormat;
use crate::platform::Platform;
use crate::ConfigCommands;
use colored::Colorize;
use serde_json::json;

pub async fn handle(
    action: ConfigCommands,
    platform: &Platform,
    format: OutputFormat,
) -> Result<(), CliError> {
    match action {
        ConfigCommands::Show => show(platform, format),
        ConfigCommands::Validate => validate(platform, format),
    }
}

fn show(platform: &Platform, format: OutputFormat) -> Result<(), CliError> {
    let config = platform.config_snapshot();
    // secrets never reach stdout
    let redacted = json!({
        "environment": config.environment.to_string(),
        "database_url": redact_url(&config.database_url),
        "cache_url": redact_url(&config.cache_url),
        "qdrant_url": config.qdrant_url,
        "jwt_secret": mask(&config.jwt_secret),
        "openai_api_key": config.openai_api_key.as_deref().map(mask),
        "anthropic_api_key": config.anthropic_api_key.as_deref().map(mask),
        "port": config.port,
        "force_ssl": config.force_ssl,
        "debug": config.debug,
        "cors_allow_all": config.cors_allow_all,
        "repositories": config.repository_urls,
    });
    format.print(&redacted);
    Ok(())
}

fn mask(secret: &str) -> String {
    if secret.len() <= 4 {
        "****".into()
    } else {
        format!("{}****", &secret[..4])
    }
}

fn redact_url(url: &str) -> String {
    // strip userinfo credentials
    match (url.split_once("://"), url.rsplit_once('@')) {
        (Some((scheme, _)), Some((_, host))) => format!("{scheme}://****@{host}"),
        _ => url.to_string(),
    }
}

fn validate(platform: &Platform, format: OutputFormat) -> Result<(), CliError> {
    let config = platform.config_snapshot();
    let mut issues: Vec<String> = Vec::new();

    if let Err(e) = config.validate() {
        issues.extend(e.issues);
    }

    // registry sanity: unique ports, dependencies that exist
    let mut seen_ports = std::collections::HashMap::new();
    for service in platform.registry.services() {
        if let Some(other) = seen_ports.insert(service.port, service.name.clone()) {
            issues.push(format!(
                "port {} is claimed by both {other} and {}",
                service.port, service.name
            ));
        }
        for dependency in &service.dependencies {
            if !platform.registry.contains(dependency) {
                issues.push(format!(
                    "{} depends on unknown service {dependency}",
                    service.name
                ));
            }
        }
    }

    if issues.is_empty() {
        if format.is_table() {
            println!("{} configuration valid for {}", "ok:".green().bold(), config.environment);
        } else {
            format.print(&json!({"status": "ok", "environment": config.environment.to_string()}));
        }
        Ok(())
    } else {
        Err(CliError::new("validation", format!("{} issue(s) found", issues.len()))
            .with_context(issues.join("\n  ")))
    }
}

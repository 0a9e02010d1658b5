//! Monitor commands

use crate::errors::CliError;
use crate::output::OutputFormat;
use crate::platform::Platform;
use crate::{MonitorCommands, ServeAction};
use colored::Colorize;
use convoy_metrics::{
    AlertEngine, ExporterConfig, MetricsPipeline, MetricsSource, ScrapeServer, Severity,
};
use serde::Serialize;
use tabled::Tabled;

#[derive(Serialize, Tabled)]
struct ServiceRow {
    service: String,
    status: String,
    cpu_percent: String,
    memory_percent: String,
    response_ms: String,
}

pub async fn handle(
    action: MonitorCommands,
    platform: &Platform,
    format: OutputFormat,
) -> Result<(), CliError> {
    match action {
        MonitorCommands::Collect { no_cache } => collect(platform, format, no_cache).await,
        MonitorCommands::Alerts => alerts(platform, format).await,
        MonitorCommands::Health => health(platform, format).await,
        MonitorCommands::Serve { port, action } => serve(platform, format, port, action).await,
    }
}

async fn health(platform: &Platform, format: OutputFormat) -> Result<(), CliError> {
    let collector = platform.collector();
    collector.collect(true).await;
    let scores = collector.health_scores();

    if format.is_table() {
        #[derive(Serialize, Tabled)]
        struct HealthRow {
            service: String,
            score: String,
            grade: String,
        }
        let rows: Vec<HealthRow> = scores
            .iter()
            .map(|(service, score)| HealthRow {
                service: service.clone(),
                score: format!("{:.0}", score.overall),
                grade: format!("{:?}", score.grade).to_lowercase(),
            })
            .collect();
        format.print_rows(&rows);
        for (service, score) in &scores {
            for recommendation in &score.recommendations {
                println!("  {service}: {recommendation}");
            }
        }
    } else {
        format.print(&scores);
    }
    Ok(())
}

async fn collect(platform: &Platform, format: OutputFormat, no_cache: bool) -> Result<(), CliError> {
    let collector = platform.collector();
    let snapshot = collector.collect(no_cache).await;

    // keep the samples queryable for the rest of this invocation
    let store = platform.timeseries_store();
    collector.persist(&store, &snapshot)?;

    if format.is_table() {
        let rows: Vec<ServiceRow> = snapshot
            .services
            .values()
            .map(|m| ServiceRow {
                service: m.service.clone(),
                status: m.probe.status.clone(),
                cpu_percent: m
                    .stats
                    .as_ref()
                    .map(|s| format!("{:.1}", s.cpu_percent))
                    .unwrap_or_else(|| "-".into()),
                memory_percent: m
                    .stats
                    .as_ref()
                    .map(|s| format!("{:.1}", s.memory_percent))
                    .unwrap_or_else(|| "-".into()),
                response_ms: m
                    .probe
                    .response_time_ms
                    .map(|ms| format!("{ms:.0}"))
                    .unwrap_or_else(|| "-".into()),
            })
            .collect();
        format.print_rows(&rows);
        println!(
            "{} healthy, {} unhealthy, collected in {} ms{}",
            snapshot.meta.healthy,
            snapshot.meta.unhealthy,
            snapshot.meta.duration_ms,
            if snapshot.meta.from_cache { " (cached)" } else { "" }
        );
    } else {
        format.print(snapshot.as_ref());
    }
    Ok(())
}

async fn alerts(platform: &Platform, format: OutputFormat) -> Result<(), CliError> {
    let collector = platform.collector();
    let snapshot = collector.collect(true).await;
    let engine = AlertEngine::new();
    let alerts = engine.evaluate(&snapshot);

    if format.is_table() {
        if alerts.is_empty() {
            println!("{} no active alerts", "ok:".green().bold());
        } else {
            for alert in &alerts {
                let tag = match alert.severity {
                    Severity::Critical => "critical".red().bold(),
                    Severity::Warning => "warning".yellow().bold(),
                };
                println!("{tag} {}", alert.message);
            }
        }
    } else {
        format.print(&alerts);
    }
    Ok(())
}

async fn serve(
    platform: &Platform,
    format: OutputFormat,
    port: u16,
    action: ServeAction,
) -> Result<(), CliError> {
    match action {
        ServeAction::Start => {
            let collector = platform.collector();
            let store = platform.timeseries_store();

            // background collection keeps the served snapshot fresh
            let pipeline = std::sync::Arc::new(MetricsPipeline::new(
                collector.clone(),
                store.clone(),
                std::sync::Arc::new(AlertEngine::new()),
            ));
            pipeline.start();

            let server = ScrapeServer::new(
                collector as std::sync::Arc<dyn MetricsSource>,
                Some(store),
                ExporterConfig {
                    port,
                    environment: platform.environment.to_string(),
                    ..Default::default()
                },
            );
            println!("serving metrics on 0.0.0.0:{port}");
            server.serve().await?;
            Ok(())
        }
        ServeAction::Status => {
            let url = format!("http://localhost:{port}/health");
            let response = reqwest::get(&url)
                .await
                .map_err(|e| CliError::new("collection", format!("scrape endpoint unreachable: {e}")))?;
            let body: serde_json::Value = response
                .json()
                .await
                .map_err(|e| CliError::new("collection", e.to_string()))?;
            format.print(&body);
            Ok(())
        }
        ServeAction::Stop => Err(CliError::new(
            "validation",
            "the scrape endpoint runs in the foreground; stop it with Ctrl-C",
        )),
    }
}

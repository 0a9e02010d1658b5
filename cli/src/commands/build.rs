//! Build commands

use crate::errors::CliError;
use crate::output::OutputFormat;
use crate::platform::Platform;
use crate::BuildArgs;
use colored::Colorize;
use convoy_build::{status::image_report, BuildOptions, BuildOutcome};
use convoy_core::SystemClock;
use serde::Serialize;
use tabled::Tabled;

#[derive(Serialize, Tabled)]
struct BuildRow {
    service: String,
    status: String,
    detail: String,
}

#[derive(Serialize, Tabled)]
struct ImageRow {
    service: String,
    present: bool,
    size_mb: u64,
    age_hours: String,
}

pub async fn handle(
    args: BuildArgs,
    platform: &Platform,
    format: OutputFormat,
) -> Result<(), CliError> {
    if args.status {
        return status(platform, format).await;
    }

    let services = if args.all || args.services.is_empty() {
        None
    } else {
        Some(args.services.clone())
    };
    let coordinator = platform.build_coordinator();
    let report = coordinator
        .build(BuildOptions {
            services,
            parallel: args.parallel,
            workers: args.workers,
            ..Default::default()
        })
        .await?;

    let rows: Vec<BuildRow> = report
        .order
        .iter()
        .map(|service| {
            let (status, detail) = match &report.outcomes[service] {
                BuildOutcome::Success { duration_ms } => {
                    ("built".to_string(), format!("{duration_ms} ms"))
                }
                BuildOutcome::Failed { reason } => ("failed".to_string(), reason.clone()),
                BuildOutcome::Skipped { reason } => ("skipped".to_string(), reason.clone()),
            };
            BuildRow { service: service.clone(), status, detail }
        })
        .collect();
    format.print_rows(&rows);

    if report.all_succeeded() {
        if format.is_table() {
            println!(
                "{} {} service(s) in {} ms",
                "built".green().bold(),
                report.order.len(),
                report.duration_ms
            );
        }
        Ok(())
    } else {
        let failed = report
            .outcomes
            .values()
            .filter(|o| !o.is_success())
            .count();
        Err(CliError::new("build", format!("{failed} service(s) did not build")))
    }
}

async fn status(platform: &Platform, format: OutputFormat) -> Result<(), CliError> {
    let report = image_report(platform.runner.as_ref(), &SystemClock, "convoy").await?;
    let rows: Vec<ImageRow> = report
        .images
        .iter()
        .map(|image| ImageRow {
            service: image.service.clone(),
            present: image.present,
            size_mb: image.size_bytes / 1_000_000,
            age_hours: image
                .age_hours
                .map(|h| format!("{h:.1}"))
                .unwrap_or_else(|| "-".into()),
        })
        .collect();
    format.print_rows(&rows);
    Ok(())
}

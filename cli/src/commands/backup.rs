//! Backup commands

use crate::errors::CliError;
use crate::output::OutputFormat;
use crate::platform::Platform;
use crate::BackupCommands;
use chrono::{DateTime, NaiveDate, Utc};
use colored::Colorize;
use convoy_backup::{BackupStatus, BackupType};
use serde::Serialize;
use tabled::Tabled;

#[derive(Serialize, Tabled)]
struct BackupRow {
    id: String,
    #[tabled(rename = "type")]
    backup_type: String,
    status: String,
    created_at: String,
    size_mb: u64,
    components: usize,
}

pub async fn handle(
    action: BackupCommands,
    platform: &Platform,
    format: OutputFormat,
) -> Result<(), CliError> {
    let manager = platform.backup_manager();
    match action {
        BackupCommands::Create { incremental } => {
            let backup_type = if incremental { BackupType::Incremental } else { BackupType::Full };
            let record = manager.create(backup_type).await?;

            if format.is_table() {
                let tag = match record.status {
                    BackupStatus::Completed => "completed".green().bold(),
                    BackupStatus::Partial => "partial".yellow().bold(),
                    BackupStatus::Failed => "failed".red().bold(),
                };
                println!(
                    "{tag} {} ({} components, {} bytes, {} ms)",
                    record.backup_id,
                    record.components.len(),
                    record.size,
                    record.duration
                );
                for (name, component) in &record.components {
                    if let Some(error) = &component.error {
                        println!("  {name}: {error}");
                    }
                }
            } else {
                format.print(&record);
            }

            match record.status {
                BackupStatus::Failed => {
                    Err(CliError::new("backup", "every backup component failed"))
                }
                _ => Ok(()),
            }
        }
        BackupCommands::List { from, to } => {
            let records = manager.list(parse_date(from.as_deref())?, parse_date(to.as_deref())?)?;
            let rows: Vec<BackupRow> = records
                .iter()
                .map(|r| BackupRow {
                    id: r.backup_id.clone(),
                    backup_type: format!("{:?}", r.backup_type).to_lowercase(),
                    status: format!("{:?}", r.status).to_lowercase(),
                    created_at: r.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    size_mb: r.size / 1_000_000,
                    components: r.components.len(),
                })
                .collect();
            format.print_rows(&rows);
            Ok(())
        }
        BackupCommands::Prune { retention_days } => {
            let report = manager.prune(retention_days)?;
            if format.is_table() {
                println!(
                    "examined {}, deleted {}, freed {} bytes",
                    report.examined,
                    report.deleted.len(),
                    report.freed_bytes
                );
            } else {
                format.print(&report);
            }
            Ok(())
        }
    }
}

fn parse_date(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, CliError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| CliError::new("validation", format!("invalid date: {raw} (expected YYYY-MM-DD)")))?;
    Ok(Some(DateTime::from_naive_utc_and_offset(
        date.and_hms_opt(0, 0, 0).unwrap(),
        Utc,
    )))
}

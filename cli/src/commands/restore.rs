//! Restore command

use crate::errors::CliError;
use crate::output::OutputFormat;
use crate::platform::Platform;
use crate::RestoreArgs;
use colored::Colorize;
use convoy_backup::BackupStatus;

pub async fn handle(
    args: RestoreArgs,
    platform: &Platform,
    format: OutputFormat,
) -> Result<(), CliError> {
    let recovery = platform.recovery_manager();

    if args.validate_only {
        let record = recovery.validate(&args.backup_id)?;
        if format.is_table() {
            println!(
                "{} backup {} is intact ({} components)",
                "ok:".green().bold(),
                record.backup_id,
                record.components.len()
            );
        } else {
            format.print(&record);
        }
        return Ok(());
    }

    let only = if args.components.is_empty() {
        None
    } else {
        Some(args.components.as_slice())
    };
    let report = recovery.restore(&args.backup_id, only).await?;

    if format.is_table() {
        let tag = match report.status {
            BackupStatus::Completed => "restored".green().bold(),
            BackupStatus::Partial => "partial".yellow().bold(),
            BackupStatus::Failed => "failed".red().bold(),
        };
        println!(
            "{tag} {} (recovery point {})",
            report.backup_id, report.recovery_point.id
        );
        for (name, component) in &report.components {
            match &component.error {
                Some(error) => println!("  {name}: {error}"),
                None => println!("  {name}: ok ({} ms)", component.duration),
            }
        }
    } else {
        format.print(&report);
    }

    match report.status {
        BackupStatus::Failed => Err(CliError::new("backup", "restore failed for every component")
            .with_context(format!("undo with the recovery point {}", report.recovery_point.id))),
        _ => Ok(()),
    }
}

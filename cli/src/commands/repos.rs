//! Repository commands

use crate::errors::CliError;
use crate::output::OutputFormat;
use crate::platform::Platform;
use crate::RepoCommands;
use colored::Colorize;
use convoy_compose::UpdateOutcome;
use serde::Serialize;
use tabled::Tabled;

#[derive(Serialize, Tabled)]
struct RepoRow {
    repository: String,
    present: bool,
    branch: String,
    dirty: bool,
    last_commit: String,
}

pub async fn handle(
    action: RepoCommands,
    platform: &Platform,
    format: OutputFormat,
) -> Result<(), CliError> {
    match action {
        RepoCommands::Status => status(platform, format).await,
        RepoCommands::Clone => clone(platform, format).await,
        RepoCommands::Update { service } => update(platform, format, service).await,
    }
}

async fn status(platform: &Platform, format: OutputFormat) -> Result<(), CliError> {
    let statuses = platform.repos.status_all().await?;
    let rows: Vec<RepoRow> = statuses
        .iter()
        .map(|s| RepoRow {
            repository: s.name.clone(),
            present: s.is_git,
            branch: s.branch.clone().unwrap_or_else(|| "-".into()),
            dirty: s.dirty,
            last_commit: s
                .last_commit
                .as_ref()
                .map(|c| format!("{} {}", &c.hash[..c.hash.len().min(8)], c.message))
                .unwrap_or_else(|| "-".into()),
        })
        .collect();
    format.print_rows(&rows);
    Ok(())
}

async fn clone(platform: &Platform, format: OutputFormat) -> Result<(), CliError> {
    let cloned = platform.repos.ensure_all().await?;
    if format.is_table() {
        if cloned.is_empty() {
            println!("all repositories already present");
        } else {
            println!("{} cloned {}", "ok:".green().bold(), cloned.join(", "));
        }
    } else {
        format.print(&serde_json::json!({"cloned": cloned}));
    }
    Ok(())
}

async fn update(
    platform: &Platform,
    format: OutputFormat,
    service: Option<String>,
) -> Result<(), CliError> {
    let subset = service.map(|s| vec![s]);
    let outcomes = platform.repos.update_all(subset.as_deref()).await?;

    #[derive(Serialize, Tabled)]
    struct UpdateRow {
        repository: String,
        outcome: String,
    }
    let mut rows: Vec<UpdateRow> = outcomes
        .iter()
        .map(|(name, outcome)| UpdateRow {
            repository: name.clone(),
            outcome: match outcome {
                UpdateOutcome::Updated => "updated".into(),
                UpdateOutcome::Failed(reason) => format!("failed: {reason}"),
            },
        })
        .collect();
    rows.sort_by(|a, b| a.repository.cmp(&b.repository));
    format.print_rows(&rows);

    let failed = outcomes
        .values()
        .filter(|o| matches!(o, UpdateOutcome::Failed(_)))
        .count();
    if failed > 0 {
        Err(CliError::new("build", format!("{failed} repositories failed to update")))
    } else {
        Ok(())
    }
}

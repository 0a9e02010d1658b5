//! Convoy CLI
//!
//! Single command surface for the Convoy control plane.
//!
//! # Usage
//!
//! ```bash
//! convoy config validate
//! convoy build --all --parallel
//! convoy repos status
//! convoy monitor collect --format json
//! convoy backup create --incremental
//! convoy restore backup-20260801-120000-ab12cd34 --component databases
//! convoy prod deploy 2.4.0 --strategy blue_green
//! convoy prod rollback --to-version 2.3.1
//! ```

use clap::{Args, Parser, Subcommand};

mod commands;
mod errors;
mod output;
mod platform;
mod profile;

use output::OutputFormat;

#[derive(Parser)]
#[command(name = "convoy")]
#[command(version)]
#[command(about = "Control plane for the Convoy container platform", long_about = None)]
struct Cli {
    /// Compose definition file
    #[arg(long, env = "CONVOY_COMPOSE_FILE", global = true)]
    compose_file: Option<String>,

    /// Directory holding the service source repositories
    #[arg(long, env = "CONVOY_REPOS_DIR", global = true)]
    repos_dir: Option<String>,

    /// Backup root directory
    #[arg(long, env = "CONVOY_BACKUP_DIR", global = true)]
    backup_dir: Option<String>,

    /// Output format
    #[arg(long, short, global = true, default_value = "table")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect and validate configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// Build service images in dependency order
    Build(BuildArgs),
    /// Manage service source repositories
    Repos {
        #[command(subcommand)]
        action: RepoCommands,
    },
    /// Collect metrics, evaluate alerts, serve the scrape endpoint
    Monitor {
        #[command(subcommand)]
        action: MonitorCommands,
    },
    /// Create and manage backups
    Backup {
        #[command(subcommand)]
        action: BackupCommands,
    },
    /// Restore from a backup
    Restore(RestoreArgs),
    /// Production operations
    Prod {
        #[command(subcommand)]
        action: ProdCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the active configuration (secrets redacted)
    Show,
    /// Validate configuration, registry ports, and dependencies
    Validate,
}

#[derive(Args)]
struct BuildArgs {
    /// Services to build; everything when omitted
    services: Vec<String>,
    /// Build all services
    #[arg(long)]
    all: bool,
    /// Fan out across a worker pool
    #[arg(long)]
    parallel: bool,
    /// Worker pool size for --parallel
    #[arg(long, default_value_t = 4)]
    workers: usize,
    /// Report image status instead of building
    #[arg(long)]
    status: bool,
}

#[derive(Subcommand)]
enum RepoCommands {
    /// Show each repository's branch, cleanliness, and latest commit
    Status,
    /// Clone repositories that are missing
    Clone,
    /// Pull the latest changes
    Update {
        /// Only this service's repository
        #[arg(long)]
        service: Option<String>,
    },
}

#[derive(Subcommand)]
enum MonitorCommands {
    /// Collect one metrics snapshot
    Collect {
        /// Skip the snapshot cache
        #[arg(long)]
        no_cache: bool,
    },
    /// Evaluate alert thresholds against a fresh snapshot
    Alerts,
    /// Health scores and recommendations per service
    Health,
    /// Run or query the scrape endpoint
    Serve {
        /// Listen port
        #[arg(long, default_value_t = 9090)]
        port: u16,
        /// start runs the server; status queries a running one
        #[arg(long, default_value = "start")]
        action: ServeAction,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum ServeAction {
    Start,
    Stop,
    Status,
}

#[derive(Subcommand)]
enum BackupCommands {
    /// Create a backup of every component
    Create {
        /// Incremental on top of the latest completed full backup
        #[arg(long)]
        incremental: bool,
    },
    /// List backups, newest first
    List {
        /// Inclusive start date (YYYY-MM-DD)
        #[arg(long)]
        from: Option<String>,
        /// Inclusive end date (YYYY-MM-DD)
        #[arg(long)]
        to: Option<String>,
    },
    /// Delete backups past the retention horizon
    Prune {
        #[arg(long, default_value_t = 30)]
        retention_days: u32,
    },
}

#[derive(Args)]
struct RestoreArgs {
    /// Backup id to restore from
    backup_id: String,
    /// Restore only these components (repeatable)
    #[arg(long = "component")]
    components: Vec<String>,
    /// Check integrity without restoring
    #[arg(long)]
    validate_only: bool,
}

#[derive(Subcommand)]
enum ProdCommands {
    /// Deploy a platform version with zero downtime
    Deploy(DeployArgs),
    /// Roll back to a previous version
    Rollback(RollbackArgs),
    /// Blue/green status per service
    Status {
        /// Only this service
        #[arg(long)]
        service: Option<String>,
    },
    /// Security audit of the active configuration
    Audit {
        /// Also audit every service's derived environment
        #[arg(long)]
        comprehensive: bool,
        /// Write the JSON report here
        #[arg(long)]
        output: Option<String>,
    },
    /// Preflight a version without deploying
    Validate {
        version: String,
    },
    /// Aggregate health, readiness, and real-time alerts
    Monitor,
}

#[derive(Args)]
struct DeployArgs {
    /// Version tag to deploy
    version: String,
    /// Rollout strategy
    #[arg(long, default_value = "blue_green")]
    strategy: Strategy,
    /// Back up before deploying (default; disable with --no-backup)
    #[arg(long, overrides_with = "no_backup")]
    backup: bool,
    #[arg(long, hide = true)]
    no_backup: bool,
    /// Validate before deploying (default; disable with --no-validate)
    #[arg(long, overrides_with = "no_validate")]
    validate: bool,
    #[arg(long, hide = true)]
    no_validate: bool,
    /// Deploy even when validation fails
    #[arg(long)]
    force: bool,
    /// Only this service
    #[arg(long)]
    service: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Strategy {
    #[value(name = "blue_green")]
    BlueGreen,
    Rolling,
}

#[derive(Args)]
struct RollbackArgs {
    /// Version to roll back to
    version: Option<String>,
    /// Alternative spelling of the target version
    #[arg(long)]
    to_version: Option<String>,
    /// Only this service
    #[arg(long, default_value = "gateway")]
    service: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    let profile = profile::Profile::load();
    let paths = platform::Paths {
        compose_file: cli.compose_file.unwrap_or(profile.compose_file),
        repos_dir: cli.repos_dir.unwrap_or(profile.repos_dir),
        backup_dir: cli.backup_dir.unwrap_or(profile.backup_dir),
    };
    let format = cli.format;

    let result = run(cli.command, paths, format).await;
    if let Err(error) = result {
        errors::render(&error, format);
        std::process::exit(error.exit_code);
    }
}

fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(
    command: Commands,
    paths: platform::Paths,
    format: OutputFormat,
) -> Result<(), errors::CliError> {
    let platform = platform::Platform::init(paths)?;
    match command {
        Commands::Config { action } => commands::config::handle(action, &platform, format).await,
        Commands::Build(args) => commands::build::handle(args, &platform, format).await,
        Commands::Repos { action } => commands::repos::handle(action, &platform, format).await,
        Commands::Monitor { action } => commands::monitor::handle(action, &platform, format).await,
        Commands::Backup { action } => commands::backup::handle(action, &platform, format).await,
        Commands::Restore(args) => commands::restore::handle(args, &platform, format).await,
        Commands::Prod { action } => commands::prod::handle(action, &platform, format).await,
    }
}

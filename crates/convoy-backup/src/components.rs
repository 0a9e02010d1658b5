//! Backup components
//!
//! One implementation per stateful piece of the platform. Each capture
//! produces files under its component directory whose checksums uniquely
//! identify the captured state; restore consumes those files to reproduce
//! it. The dump tools themselves are external collaborators reached
//! through the command-runner seam.

use async_trait::async_trait;
use convoy_core::{CommandRunner, CommandSpec, PlatformConfig, ServiceRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const DUMP_TIMEOUT: Duration = Duration::from_secs(600);

/// Component capture/restore error
#[derive(Debug, Error)]
pub enum ComponentError {
    /// Dump or load tool failed
    #[error("command failed: {0}")]
    Command(#[from] convoy_core::runner::CommandError),
    /// Filesystem failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Component cannot run as configured
    #[error("component misconfigured: {0}")]
    Misconfigured(String),
}

/// One stateful piece that can be captured and reproduced
#[async_trait]
pub trait BackupComponent: Send + Sync {
    /// Stable component name; used as the subdirectory name
    fn name(&self) -> &str;

    /// Capture current state into `dest` (an existing, empty directory)
    async fn capture(&self, dest: &Path) -> Result<(), ComponentError>;

    /// Reproduce state from a directory previously written by `capture`
    async fn restore(&self, src: &Path) -> Result<(), ComponentError>;

    /// Rough size estimate in bytes, for pre-flight reporting
    async fn estimate_size(&self) -> u64 {
        0
    }
}

/// Relational databases: one logical dump per service database
pub struct DatabaseComponent {
    runner: Arc<dyn CommandRunner>,
    config: Arc<PlatformConfig>,
}

impl DatabaseComponent {
    pub fn new(runner: Arc<dyn CommandRunner>, config: Arc<PlatformConfig>) -> Self {
        Self { runner, config }
    }
}

#[async_trait]
impl BackupComponent for DatabaseComponent {
    fn name(&self) -> &str {
        "databases"
    }

    async fn capture(&self, dest: &Path) -> Result<(), ComponentError> {
        let registry = ServiceRegistry::new();
        for service in registry.application_services() {
            let url = self
                .config
                .database_url(&service.name)
                .map_err(|e| ComponentError::Misconfigured(e.to_string()))?;
            let file = dest.join(format!("{}.sql", service.name));
            self.runner
                .run_checked(
                    CommandSpec::new("pg_dump")
                        .args(["--dbname", &url, "--file"])
                        .args([file.to_string_lossy().to_string()])
                        .args(["--format", "plain", "--no-owner"])
                        .timeout(DUMP_TIMEOUT),
                )
                .await?;
        }
        Ok(())
    }

    async fn restore(&self, src: &Path) -> Result<(), ComponentError> {
        let registry = ServiceRegistry::new();
        for service in registry.application_services() {
            let url = self
                .config
                .database_url(&service.name)
                .map_err(|e| ComponentError::Misconfigured(e.to_string()))?;
            let file = src.join(format!("{}.sql", service.name));
            if !file.exists() {
                continue;
            }
            self.runner
                .run_checked(
                    CommandSpec::new("psql")
                        .args(["--dbname", &url, "--file"])
                        .args([file.to_string_lossy().to_string()])
                        .args(["--single-transaction"])
                        .timeout(DUMP_TIMEOUT),
                )
                .await?;
        }
        Ok(())
    }
}

/// Key-value cache: point-in-time snapshot file
pub struct CacheComponent {
    runner: Arc<dyn CommandRunner>,
    config: Arc<PlatformConfig>,
}

impl CacheComponent {
    pub fn new(runner: Arc<dyn CommandRunner>, config: Arc<PlatformConfig>) -> Self {
        Self { runner, config }
    }
}

#[async_trait]
impl BackupComponent for CacheComponent {
    fn name(&self) -> &str {
        "cache"
    }

    async fn capture(&self, dest: &Path) -> Result<(), ComponentError> {
        let file = dest.join("cache.rdb");
        self.runner
            .run_checked(
                CommandSpec::new("redis-cli")
                    .args(["-u", &self.config.cache_url, "--rdb"])
                    .args([file.to_string_lossy().to_string()])
                    .timeout(DUMP_TIMEOUT),
            )
            .await?;
        Ok(())
    }

    async fn restore(&self, src: &Path) -> Result<(), ComponentError> {
        let file = src.join("cache.rdb");
        if !file.exists() {
            return Err(ComponentError::Misconfigured("cache.rdb missing".into()));
        }
        // the cache loads its dump at startup; place the file and restart
        self.runner
            .run_checked(
                CommandSpec::new("docker")
                    .args(["cp"])
                    .args([file.to_string_lossy().to_string()])
                    .args(["convoy-cache:/data/dump.rdb"])
                    .timeout(DUMP_TIMEOUT),
            )
            .await?;
        self.runner
            .run_checked(CommandSpec::new("docker").args(["restart", "convoy-cache"]))
            .await?;
        Ok(())
    }
}

/// Archive of a directory tree, the shape shared by the vector store,
/// repositories, and configuration components
async fn archive_dir(
    runner: &dyn CommandRunner,
    source_dir: &Path,
    archive: &Path,
) -> Result<(), ComponentError> {
    if !source_dir.is_dir() {
        return Err(ComponentError::Misconfigured(format!(
            "source directory missing: {}",
            source_dir.display()
        )));
    }
    runner
        .run_checked(
            CommandSpec::new("tar")
                .args(["-czf"])
                .args([archive.to_string_lossy().to_string()])
                .args(["-C", &source_dir.to_string_lossy()])
                .args(["."])
                .timeout(DUMP_TIMEOUT),
        )
        .await?;
    Ok(())
}

async fn unarchive_dir(
    runner: &dyn CommandRunner,
    archive: &Path,
    target_dir: &Path,
) -> Result<(), ComponentError> {
    std::fs::create_dir_all(target_dir)?;
    runner
        .run_checked(
            CommandSpec::new("tar")
                .args(["-xzf"])
                .args([archive.to_string_lossy().to_string()])
                .args(["-C", &target_dir.to_string_lossy()])
                .timeout(DUMP_TIMEOUT),
        )
        .await?;
    Ok(())
}

/// Vector store: archive of collection storage
pub struct VectorStoreComponent {
    runner: Arc<dyn CommandRunner>,
    data_dir: PathBuf,
}

impl VectorStoreComponent {
    pub fn new(runner: Arc<dyn CommandRunner>, data_dir: impl Into<PathBuf>) -> Self {
        Self { runner, data_dir: data_dir.into() }
    }
}

#[async_trait]
impl BackupComponent for VectorStoreComponent {
    fn name(&self) -> &str {
        "vector-store"
    }

    async fn capture(&self, dest: &Path) -> Result<(), ComponentError> {
        archive_dir(self.runner.as_ref(), &self.data_dir, &dest.join("collections.tar.gz")).await
    }

    async fn restore(&self, src: &Path) -> Result<(), ComponentError> {
        unarchive_dir(self.runner.as_ref(), &src.join("collections.tar.gz"), &self.data_dir).await
    }

    async fn estimate_size(&self) -> u64 {
        dir_size(&self.data_dir)
    }
}

/// Source repositories: one archive per working tree
pub struct RepositoriesComponent {
    runner: Arc<dyn CommandRunner>,
    repos_dir: PathBuf,
}

impl RepositoriesComponent {
    pub fn new(runner: Arc<dyn CommandRunner>, repos_dir: impl Into<PathBuf>) -> Self {
        Self { runner, repos_dir: repos_dir.into() }
    }
}

#[async_trait]
impl BackupComponent for RepositoriesComponent {
    fn name(&self) -> &str {
        "repositories"
    }

    async fn capture(&self, dest: &Path) -> Result<(), ComponentError> {
        if !self.repos_dir.is_dir() {
            return Err(ComponentError::Misconfigured(format!(
                "repositories directory missing: {}",
                self.repos_dir.display()
            )));
        }
        for entry in std::fs::read_dir(&self.repos_dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            archive_dir(
                self.runner.as_ref(),
                &entry.path(),
                &dest.join(format!("{name}.tar.gz")),
            )
            .await?;
        }
        Ok(())
    }

    async fn restore(&self, src: &Path) -> Result<(), ComponentError> {
        for entry in std::fs::read_dir(src)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(repo) = file_name.strip_suffix(".tar.gz") else {
                continue;
            };
            unarchive_dir(self.runner.as_ref(), &entry.path(), &self.repos_dir.join(repo)).await?;
        }
        Ok(())
    }

    async fn estimate_size(&self) -> u64 {
        dir_size(&self.repos_dir)
    }
}

/// Active environment's configuration files
pub struct ConfigComponent {
    runner: Arc<dyn CommandRunner>,
    config_dir: PathBuf,
}

impl ConfigComponent {
    pub fn new(runner: Arc<dyn CommandRunner>, config_dir: impl Into<PathBuf>) -> Self {
        Self { runner, config_dir: config_dir.into() }
    }
}

#[async_trait]
impl BackupComponent for ConfigComponent {
    fn name(&self) -> &str {
        "config"
    }

    async fn capture(&self, dest: &Path) -> Result<(), ComponentError> {
        archive_dir(self.runner.as_ref(), &self.config_dir, &dest.join("config.tar.gz")).await
    }

    async fn restore(&self, src: &Path) -> Result<(), ComponentError> {
        unarchive_dir(self.runner.as_ref(), &src.join("config.tar.gz"), &self.config_dir).await
    }

    async fn estimate_size(&self) -> u64 {
        dir_size(&self.config_dir)
    }
}

fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                dir_size(&path)
            } else {
                entry.metadata().map(|m| m.len()).unwrap_or(0)
            }
        })
        .sum()
}

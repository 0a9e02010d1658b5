//! Platform wiring
//!
//! Builds the component graph once per invocation: configuration,
//! orchestrator, repositories, and the factories for the heavier
//! subsystems the individual commands assemble on demand.

use crate::errors::CliError;
use convoy_backup::{
    BackupComponent, BackupManager, CacheComponent, ConfigComponent, DatabaseComponent,
    RecoveryManager, RepositoriesComponent, VectorStoreComponent,
};
use convoy_build::BuildCoordinator;
use convoy_compose::{ComposeOrchestrator, RepositoryCoordinator};
use convoy_core::{
    ConfigStore, Environment, PlatformConfig, ProcessEnvSecrets, ProcessRunner, ServiceRegistry,
};
use convoy_deploy::{
    BlueGreenDeployer, DeploymentValidator, FixedErrorRate, ProductionMonitor,
    UpstreamFileBalancer,
};
use convoy_metrics::{
    AlertEngine, HttpProber, MemoryKeyspace, MetricsCollector, TimeSeriesStore,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Filesystem locations resolved from flags, env, and the profile
pub struct Paths {
    pub compose_file: String,
    pub repos_dir: String,
    pub backup_dir: String,
}

/// The wired component graph for one CLI invocation
pub struct Platform {
    pub environment: Environment,
    pub registry: ServiceRegistry,
    pub config: Arc<ConfigStore>,
    pub runner: Arc<ProcessRunner>,
    pub orchestrator: Arc<ComposeOrchestrator>,
    pub repos: Arc<RepositoryCoordinator>,
    pub compose_file: PathBuf,
    pub repos_dir: PathBuf,
    pub backup_dir: PathBuf,
}

impl Platform {
    /// Wire the platform for the environment selected by `RACK_ENV`
    pub fn init(paths: Paths) -> Result<Self, CliError> {
        let secrets = ProcessEnvSecrets;
        let environment = Environment::from_secrets(&secrets);
        let config = Arc::new(ConfigStore::load(environment, &secrets)?);

        let runner = Arc::new(ProcessRunner);
        let orchestrator = Arc::new(ComposeOrchestrator::new(
            runner.clone(),
            &paths.compose_file,
        ));
        let repos = Arc::new(RepositoryCoordinator::new(
            runner.clone(),
            &paths.repos_dir,
            config.current().repository_urls.clone(),
        ));

        Ok(Self {
            environment,
            registry: ServiceRegistry::new(),
            config,
            runner,
            orchestrator,
            repos,
            compose_file: paths.compose_file.into(),
            repos_dir: paths.repos_dir.into(),
            backup_dir: paths.backup_dir.into(),
        })
    }

    /// Current configuration snapshot
    pub fn config_snapshot(&self) -> Arc<PlatformConfig> {
        self.config.current()
    }

    /// Build coordinator over this platform's repositories
    pub fn build_coordinator(&self) -> BuildCoordinator {
        BuildCoordinator::new(self.runner.clone(), self.repos.clone(), &self.compose_file)
    }

    /// Metrics collector probing localhost
    pub fn collector(&self) -> Arc<MetricsCollector> {
        Arc::new(MetricsCollector::new(
            self.orchestrator.clone(),
            Arc::new(HttpProber::new("localhost")),
        ))
    }

    /// In-process time-series store
    pub fn timeseries_store(&self) -> Arc<TimeSeriesStore> {
        Arc::new(TimeSeriesStore::new(Arc::new(MemoryKeyspace::new())))
    }

    /// Backup manager over every platform component
    pub fn backup_manager(&self) -> Arc<BackupManager> {
        let config = self.config_snapshot();
        let components: Vec<Arc<dyn BackupComponent>> = vec![
            Arc::new(DatabaseComponent::new(self.runner.clone(), config.clone())),
            Arc::new(CacheComponent::new(self.runner.clone(), config.clone())),
            Arc::new(VectorStoreComponent::new(
                self.runner.clone(),
                self.backup_dir.join("..").join("qdrant-storage"),
            )),
            Arc::new(RepositoriesComponent::new(
                self.runner.clone(),
                &self.repos_dir,
            )),
            Arc::new(ConfigComponent::new(self.runner.clone(), "config")),
        ];
        Arc::new(BackupManager::new(&self.backup_dir, components))
    }

    /// Recovery manager over the same backup root and components
    pub fn recovery_manager(&self) -> Arc<RecoveryManager> {
        Arc::new(RecoveryManager::new(self.backup_manager()))
    }

    /// Deployment validator over this platform's seams
    pub fn validator(&self) -> Arc<DeploymentValidator> {
        Arc::new(DeploymentValidator::new(
            self.orchestrator.clone(),
            Arc::new(HttpProber::new("localhost")),
            self.runner.clone(),
        ))
    }

    /// Blue/green deployer with the standard policy. Traffic splits are
    /// published to an upstream map file beside the compose definition.
    pub fn deployer(&self) -> Arc<BlueGreenDeployer> {
        let map_file = self
            .compose_file
            .parent()
            .map(|p| p.join("upstreams.json"))
            .unwrap_or_else(|| "upstreams.json".into());
        let history_file = self
            .compose_file
            .parent()
            .map(|p| p.join("deploy-history.json"))
            .unwrap_or_else(|| "deploy-history.json".into());
        Arc::new(
            BlueGreenDeployer::new(
                self.orchestrator.clone(),
                Arc::new(UpstreamFileBalancer::new(self.runner.clone(), map_file, Vec::new())),
                self.validator(),
                Arc::new(FixedErrorRate::zero()),
            )
            .with_history_file(history_file),
        )
    }

    /// Production monitor over the full stack
    pub fn production_monitor(&self) -> ProductionMonitor {
        ProductionMonitor::new(
            self.orchestrator.clone(),
            self.collector(),
            Arc::new(AlertEngine::new()),
            self.recovery_manager(),
            self.validator(),
            self.deployer(),
            self.config.clone(),
        )
    }
}

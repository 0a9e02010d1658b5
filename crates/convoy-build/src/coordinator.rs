//! Build execution
//!
//! Walks the topological order sequentially or fans out across a bounded
//! worker pool. A failed build never stops siblings; dependents of a
//! failed or skipped service are cascade-skipped.

use crate::graph::DependencyGraph;
use crate::BuildError;
use convoy_core::{CommandRunner, CommandSpec, ServiceRegistry};
use convoy_compose::{RepoError, RepositoryCoordinator};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Terminal status of one service's build
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum BuildOutcome {
    /// Image built
    Success {
        duration_ms: u64,
    },
    /// Build command failed
    Failed {
        reason: String,
    },
    /// Not attempted
    Skipped {
        reason: String,
    },
}

impl BuildOutcome {
    /// Whether the service's image was produced
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Options for one build request
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Requested services; the whole graph when `None`. The set is closed
    /// under dependencies before ordering.
    pub services: Option<Vec<String>>,
    /// Fan out across workers instead of walking the order
    pub parallel: bool,
    /// Worker pool bound for parallel mode
    pub workers: usize,
    /// Per-service build deadline
    pub build_timeout: Duration,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            services: None,
            parallel: false,
            workers: 4,
            build_timeout: Duration::from_secs(600),
        }
    }
}

/// Result of one build request
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    /// Order the coordinator used
    pub order: Vec<String>,
    /// Terminal outcome per service
    pub outcomes: BTreeMap<String, BuildOutcome>,
    pub duration_ms: u64,
}

impl BuildReport {
    /// Whether every service built
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.values().all(BuildOutcome::is_success)
    }
}

/// Coordinates builds over the service dependency graph
pub struct BuildCoordinator {
    runner: Arc<dyn CommandRunner>,
    repos: Arc<RepositoryCoordinator>,
    graph: DependencyGraph,
    compose_file: PathBuf,
    project: String,
    cancel: Arc<AtomicBool>,
}

impl BuildCoordinator {
    /// Coordinator over the platform registry's graph
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        repos: Arc<RepositoryCoordinator>,
        compose_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            repos,
            graph: DependencyGraph::from_registry(&ServiceRegistry::new()),
            compose_file: compose_file.into(),
            project: "convoy".into(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Replace the graph (used to analyze injected dependency sets)
    pub fn with_graph(mut self, graph: DependencyGraph) -> Self {
        self.graph = graph;
        self
    }

    /// Signal that build workers should stop between services. An
    /// in-progress external build is never interrupted.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// The dependency graph in use
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Execute a build request. The order is solved first; a circular
    /// dependency aborts before any external command runs.
    pub async fn build(&self, options: BuildOptions) -> Result<BuildReport, BuildError> {
        let order = self.graph.build_order(options.services.as_deref())?;
        tracing::info!(?order, parallel = options.parallel, "build plan solved");
        let started = Instant::now();

        let outcomes = if options.parallel {
            self.build_parallel(&order, &options).await?
        } else {
            self.build_sequential(&order, &options).await?
        };

        Ok(BuildReport {
            order,
            outcomes,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn build_sequential(
        &self,
        order: &[String],
        options: &BuildOptions,
    ) -> Result<BTreeMap<String, BuildOutcome>, BuildError> {
        let mut outcomes = BTreeMap::new();
        for service in order {
            if self.cancel.load(Ordering::SeqCst) {
                outcomes.insert(service.clone(), skipped("cancelled"));
                continue;
            }
            if let Some(outcome) = self.pre_check(service, order, &outcomes).await {
                outcomes.insert(service.clone(), outcome);
                continue;
            }
            let outcome = build_one(
                self.runner.clone(),
                self.compose_file.clone(),
                self.project.clone(),
                service.clone(),
                options.build_timeout,
            )
            .await;
            outcomes.insert(service.clone(), outcome);
        }
        Ok(outcomes)
    }

    async fn build_parallel(
        &self,
        order: &[String],
        options: &BuildOptions,
    ) -> Result<BTreeMap<String, BuildOutcome>, BuildError> {
        let mut outcomes: BTreeMap<String, BuildOutcome> = BTreeMap::new();
        let mut scheduled: HashSet<String> = HashSet::new();
        let mut in_flight: JoinSet<(String, BuildOutcome)> = JoinSet::new();
        let semaphore = Arc::new(Semaphore::new(options.workers.max(1)));

        loop {
            // schedule every service whose dependencies have reached a
            // terminal status; cascade decisions never need a worker
            let mut progressed = true;
            while progressed {
                progressed = false;
                for service in order {
                    if scheduled.contains(service) {
                        continue;
                    }
                    let deps = self.graph.dependencies(service)?;
                    if !deps.iter().all(|d| outcomes.contains_key(d)) {
                        continue;
                    }
                    scheduled.insert(service.clone());

                    if self.cancel.load(Ordering::SeqCst) {
                        outcomes.insert(service.clone(), skipped("cancelled"));
                        progressed = true;
                        continue;
                    }
                    if let Some(outcome) = self.pre_check(service, order, &outcomes).await {
                        outcomes.insert(service.clone(), outcome);
                        progressed = true;
                        continue;
                    }

                    let runner = self.runner.clone();
                    let file = self.compose_file.clone();
                    let project = self.project.clone();
                    let name = service.clone();
                    let permit_pool = semaphore.clone();
                    let timeout = options.build_timeout;
                    in_flight.spawn(async move {
                        let _permit = permit_pool.acquire_owned().await.expect("pool closed");
                        let outcome = build_one(runner, file, project, name.clone(), timeout).await;
                        (name, outcome)
                    });
                }
            }

            if outcomes.len() == order.len() {
                break;
            }
            match in_flight.join_next().await {
                Some(Ok((name, outcome))) => {
                    outcomes.insert(name, outcome);
                }
                Some(Err(join_err)) => {
                    tracing::error!(error = %join_err, "build worker panicked");
                }
                None => break,
            }
        }
        Ok(outcomes)
    }

    /// Cascade and repository checks shared by both modes
    async fn pre_check(
        &self,
        service: &str,
        order: &[String],
        outcomes: &BTreeMap<String, BuildOutcome>,
    ) -> Option<BuildOutcome> {
        let deps = self.graph.dependencies(service).ok()?;
        let blocked = deps
            .iter()
            .filter(|d| order.contains(d))
            .any(|d| !outcomes.get(d).map(BuildOutcome::is_success).unwrap_or(false));
        if blocked {
            return Some(skipped("dependency failed"));
        }
        match self.repos.status(service).await {
            Ok(status) if status.is_git => None,
            Ok(_) => Some(skipped("repository not found")),
            Err(RepoError::Unknown(_)) => Some(skipped("repository not found")),
            Err(e) => Some(BuildOutcome::Failed { reason: e.to_string() }),
        }
    }
}

fn skipped(reason: &str) -> BuildOutcome {
    BuildOutcome::Skipped { reason: reason.into() }
}

async fn build_one(
    runner: Arc<dyn CommandRunner>,
    compose_file: PathBuf,
    project: String,
    service: String,
    timeout: Duration,
) -> BuildOutcome {
    let started = Instant::now();
    tracing::info!(%service, "building image");
    let spec = CommandSpec::new("docker")
        .args(["compose", "-f"])
        .args([compose_file.to_string_lossy().to_string()])
        .args(["-p", &project, "build", &service])
        .timeout(timeout);
    match runner.run(spec).await {
        Ok(output) if output.success() => BuildOutcome::Success {
            duration_ms: started.elapsed().as_millis() as u64,
        },
        Ok(output) => {
            let reason = output.stderr.lines().last().unwrap_or("build failed").to_string();
            tracing::warn!(%service, %reason, "build failed");
            BuildOutcome::Failed { reason }
        }
        Err(e) => {
            tracing::warn!(%service, error = %e, "build errored");
            BuildOutcome::Failed { reason: e.to_string() }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::ScriptedRunner;
    use std::collections::HashMap;

    fn repo_urls() -> HashMap<String, String> {
        ServiceRegistry::new()
            .application_services()
            .iter()
            .map(|s| (s.name.clone(), format!("https://example.com/{}.git", s.name)))
            .collect()
    }

    fn base_with_repos(tag: &str, names: &[&str]) -> PathBuf {
        let base = std::env::temp_dir().join(format!("convoy-build-{tag}"));
        let _ = std::fs::remove_dir_all(&base);
        for name in names {
            std::fs::create_dir_all(base.join(name).join(".git")).unwrap();
        }
        base
    }

    const ALL: &[&str] = &["gateway", "personas", "workflows", "projects", "context", "tokens"];

    fn coordinator(runner: ScriptedRunner, base: &PathBuf) -> BuildCoordinator {
        let runner = Arc::new(runner);
        let repos = Arc::new(RepositoryCoordinator::new(runner.clone(), base, repo_urls()));
        BuildCoordinator::new(runner, repos, "compose.yml")
    }

    #[tokio::test]
    async fn test_cold_start_builds_all_six() {
        let base = base_with_repos("cold", ALL);
        let coord = coordinator(ScriptedRunner::new(), &base);

        let report = coord.build(BuildOptions::default()).await.unwrap();
        assert_eq!(report.outcomes.len(), 6);
        assert!(report.all_succeeded());
        assert!(coord.graph().dependencies(&report.order[0]).unwrap().is_empty());
        assert_eq!(report.order.last().unwrap(), "gateway");
    }

    #[tokio::test]
    async fn test_cycle_invokes_no_external_build() {
        let base = base_with_repos("cycle", ALL);
        let runner = ScriptedRunner::new();
        let repos = Arc::new(RepositoryCoordinator::new(
            Arc::new(ScriptedRunner::new()),
            &base,
            repo_urls(),
        ));
        let runner = Arc::new(runner);
        let coord = BuildCoordinator::new(runner.clone(), repos, "compose.yml")
            .with_graph(DependencyGraph::from_edges(&[("A", &["B"]), ("B", &["A"])]));

        let err = coord
            .build(BuildOptions {
                services: Some(vec!["A".into()]),
                ..Default::default()
            })
            .await
            .unwrap_err();
        match err {
            BuildError::CircularDependency { path } => assert_eq!(path, vec!["A", "B", "A"]),
            other => panic!("expected CircularDependency, got {other:?}"),
        }
        assert!(runner.invocations().is_empty());
    }

    #[tokio::test]
    async fn test_failure_cascades_to_dependents() {
        let base = base_with_repos("cascade", ALL);
        let runner =
            ScriptedRunner::new().on_fail("docker compose -f compose.yml -p convoy build context", 1, "compile error");
        let coord = coordinator(runner, &base);

        let report = coord.build(BuildOptions::default()).await.unwrap();
        assert!(matches!(report.outcomes["context"], BuildOutcome::Failed { .. }));
        assert_eq!(
            report.outcomes["workflows"],
            BuildOutcome::Skipped { reason: "dependency failed".into() }
        );
        assert_eq!(
            report.outcomes["projects"],
            BuildOutcome::Skipped { reason: "dependency failed".into() }
        );
        assert_eq!(
            report.outcomes["gateway"],
            BuildOutcome::Skipped { reason: "dependency failed".into() }
        );
        // unrelated leaves still build
        assert!(report.outcomes["personas"].is_success());
        assert!(report.outcomes["tokens"].is_success());
    }

    #[tokio::test]
    async fn test_missing_repository_is_skipped() {
        let base = base_with_repos("norepo", &["gateway", "personas", "workflows", "projects", "context"]);
        let coord = coordinator(ScriptedRunner::new(), &base);

        let report = coord.build(BuildOptions::default()).await.unwrap();
        assert_eq!(
            report.outcomes["tokens"],
            BuildOutcome::Skipped { reason: "repository not found".into() }
        );
        assert!(report.outcomes["personas"].is_success());
    }

    #[tokio::test]
    async fn test_parallel_mode_matches_sequential_outcomes() {
        let base = base_with_repos("parallel", ALL);
        let runner =
            ScriptedRunner::new().on_fail("docker compose -f compose.yml -p convoy build personas", 1, "boom");
        let coord = coordinator(runner, &base);

        let report = coord
            .build(BuildOptions { parallel: true, workers: 3, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(report.outcomes.len(), 6);
        assert!(matches!(report.outcomes["personas"], BuildOutcome::Failed { .. }));
        assert_eq!(
            report.outcomes["workflows"],
            BuildOutcome::Skipped { reason: "dependency failed".into() }
        );
        assert!(report.outcomes["context"].is_success());
        assert!(report.outcomes["tokens"].is_success());
    }

    #[tokio::test]
    async fn test_cancel_skips_remaining_services() {
        let base = base_with_repos("cancel", ALL);
        let coord = coordinator(ScriptedRunner::new(), &base);
        coord.cancel();

        let report = coord.build(BuildOptions::default()).await.unwrap();
        assert!(report
            .outcomes
            .values()
            .all(|o| matches!(o, BuildOutcome::Skipped { reason } if reason == "cancelled")));
    }
}

//! Compose-engine implementation of the orchestrator contract
//!
//! Shells out to `docker compose` / `docker` through the command-runner
//! seam. A missing compose definition file makes every operation a no-op
//! with empty results, which keeps the core testable without a live
//! container host.

use crate::orchestrator::{
    ContainerStats, HealthState, ImageProbe, Orchestrator, OrchestratorError, PreviousDeployment,
    ServiceState, ServiceStatus,
};
use async_trait::async_trait;
use convoy_core::{CommandRunner, CommandSpec, ServiceRegistry};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default per-command deadline
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
/// Poll interval while waiting for a container to become healthy
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Orchestrator backed by the compose engine
pub struct ComposeOrchestrator {
    runner: Arc<dyn CommandRunner>,
    registry: ServiceRegistry,
    compose_file: PathBuf,
    project: String,
}

impl ComposeOrchestrator {
    /// New adapter over a compose definition file
    pub fn new(runner: Arc<dyn CommandRunner>, compose_file: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            registry: ServiceRegistry::new(),
            compose_file: compose_file.into(),
            project: "convoy".into(),
        }
    }

    /// Override the compose project name
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    fn compose_defined(&self) -> bool {
        self.compose_file.exists()
    }

    fn compose(&self, args: &[&str]) -> CommandSpec {
        CommandSpec::new("docker")
            .args(["compose", "-f"])
            .args([self.compose_file.to_string_lossy().to_string()])
            .args(["-p", &self.project])
            .args(args.iter().copied())
            .timeout(COMMAND_TIMEOUT)
    }

    fn docker(&self, args: &[&str]) -> CommandSpec {
        CommandSpec::new("docker")
            .args(args.iter().copied())
            .timeout(COMMAND_TIMEOUT)
    }
}

#[async_trait]
impl Orchestrator for ComposeOrchestrator {
    async fn status(&self) -> Result<HashMap<String, ServiceStatus>, OrchestratorError> {
        if !self.compose_defined() {
            return Ok(HashMap::new());
        }
        let output = self
            .runner
            .run(self.compose(&["ps", "--all", "--format", "json"]))
            .await?;

        let mut statuses: HashMap<String, ServiceStatus> = HashMap::new();
        // one JSON object per line
        for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
            let row: serde_json::Value = serde_json::from_str(line)
                .map_err(|e| OrchestratorError::Parse(format!("{e}: {line}")))?;
            let Some(service) = row.get("Service").and_then(|v| v.as_str()) else {
                continue;
            };
            let state = match row.get("State").and_then(|v| v.as_str()) {
                Some("running") => ServiceState::Running,
                Some("exited") | Some("created") | Some("paused") | Some("dead") => {
                    ServiceState::NotRunning
                }
                _ => ServiceState::Unknown,
            };
            let health = match row.get("Health").and_then(|v| v.as_str()) {
                Some("healthy") => HealthState::Healthy,
                Some("unhealthy") => HealthState::Unhealthy,
                _ => HealthState::Unknown,
            };
            let port = self.registry.get(service).map(|s| s.port);
            statuses.insert(service.to_string(), ServiceStatus { state, health, port });
        }

        // services the engine has never seen are not running
        for service in self.registry.services() {
            statuses.entry(service.name.clone()).or_insert(ServiceStatus {
                state: ServiceState::NotRunning,
                health: HealthState::Unknown,
                port: Some(service.port),
            });
        }
        Ok(statuses)
    }

    async fn start(&self, services: &[String]) -> Result<(), OrchestratorError> {
        if !self.compose_defined() {
            return Ok(());
        }
        let names: Vec<&str> = services.iter().map(String::as_str).collect();
        let ordered = self.registry.resolve(&names)?;
        tracing::info!(services = ?ordered, "starting services");

        let mut args = vec!["up", "-d"];
        args.extend(ordered.iter().map(String::as_str));
        self.runner.run_checked(self.compose(&args)).await?;
        Ok(())
    }

    async fn stop(&self, services: &[String]) -> Result<(), OrchestratorError> {
        if !self.compose_defined() {
            return Ok(());
        }
        tracing::info!(?services, "stopping services");
        let mut args = vec!["stop"];
        args.extend(services.iter().map(String::as_str));
        self.runner.run_checked(self.compose(&args)).await?;
        Ok(())
    }

    async fn restart(&self, services: &[String]) -> Result<(), OrchestratorError> {
        if !self.compose_defined() {
            return Ok(());
        }
        tracing::info!(?services, "restarting services");
        let mut args = vec!["restart"];
        args.extend(services.iter().map(String::as_str));
        self.runner.run_checked(self.compose(&args)).await?;
        Ok(())
    }

    async fn stats(
        &self,
        service: Option<&str>,
    ) -> Result<HashMap<String, ContainerStats>, OrchestratorError> {
        if !self.compose_defined() {
            return Ok(HashMap::new());
        }
        let output = self
            .runner
            .run(self.docker(&["stats", "--no-stream", "--format", "json"]))
            .await?;

        let mut all = HashMap::new();
        for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
            let row: serde_json::Value = serde_json::from_str(line)
                .map_err(|e| OrchestratorError::Parse(format!("{e}: {line}")))?;
            let Some(name) = row.get("Name").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(svc) = self.service_for_container(name) else {
                continue;
            };
            if let Some(filter) = service {
                if svc != filter {
                    continue;
                }
            }
            all.insert(svc, parse_stats_row(&row)?);
        }
        Ok(all)
    }

    async fn image_probe(&self, image: &str) -> Result<ImageProbe, OrchestratorError> {
        let output = self
            .runner
            .run(self.docker(&["image", "inspect", image, "--format", "{{json .Size}}"]))
            .await?;
        let registry = registry_of(image);
        if !output.success() {
            return Ok(ImageProbe { exists: false, registry, size_bytes: 0 });
        }
        let size_bytes = output.stdout.trim().parse().unwrap_or(0);
        Ok(ImageProbe { exists: true, registry, size_bytes })
    }

    async fn create_service(
        &self,
        name: &str,
        image: &str,
        suffix: Option<&str>,
    ) -> Result<String, OrchestratorError> {
        let container = match suffix {
            Some(suffix) => format!("{}-{name}-{suffix}", self.project),
            None => format!("{}-{name}", self.project),
        };
        let version = image.rsplit(':').next().unwrap_or("latest").to_string();
        tracing::info!(%container, %image, "creating service container");

        let output = self
            .runner
            .run_checked(self.docker(&[
                "run",
                "-d",
                "--name",
                &container,
                "--label",
                &format!("convoy.service={name}"),
                "--label",
                &format!("convoy.version={version}"),
                image,
            ]))
            .await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn remove_service(&self, id: &str) -> Result<(), OrchestratorError> {
        tracing::info!(%id, "removing service container");
        self.runner
            .run_checked(self.docker(&["rm", "-f", id]))
            .await?;
        Ok(())
    }

    async fn wait_for_health(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<bool, OrchestratorError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let output = self
                .runner
                .run(self.docker(&[
                    "inspect",
                    "--format",
                    "{{.State.Health.Status}}|{{.State.Running}}",
                    id,
                ]))
                .await?;
            if output.success() {
                let text = output.stdout.trim();
                let (health, running) = text.split_once('|').unwrap_or((text, "false"));
                match health {
                    "healthy" => return Ok(true),
                    "unhealthy" => return Ok(false),
                    // no health check configured: running is the best signal
                    "<no value>" | "" if running == "true" => return Ok(true),
                    _ => {}
                }
            }
            if tokio::time::Instant::now() + HEALTH_POLL_INTERVAL > deadline {
                return Ok(false);
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }

    async fn previous_deployment(
        &self,
        service: &str,
    ) -> Result<Option<PreviousDeployment>, OrchestratorError> {
        // most recently exited container for this service carries the labels
        // of the rollout that preceded the current one
        let output = self
            .runner
            .run(self.docker(&[
                "ps",
                "-a",
                "--filter",
                &format!("label=convoy.service={service}"),
                "--filter",
                "status=exited",
                "--format",
                "{{.Label \"convoy.version\"}}|{{.Image}}",
                "--latest",
            ]))
            .await?;
        let line = output.stdout.lines().next().unwrap_or("").trim();
        if !output.success() || line.is_empty() {
            return Ok(None);
        }
        let (version, image) = line
            .split_once('|')
            .ok_or_else(|| OrchestratorError::Parse(line.to_string()))?;
        let probe = self.image_probe(image).await?;
        Ok(Some(PreviousDeployment {
            version: version.to_string(),
            image: image.to_string(),
            backup_available: probe.exists,
        }))
    }

    async fn restart_service(&self, id: &str) -> Result<(), OrchestratorError> {
        self.runner
            .run_checked(self.docker(&["restart", id]))
            .await?;
        Ok(())
    }
}

impl ComposeOrchestrator {
    /// Map a container name like `convoy-gateway-1` back to its service
    fn service_for_container(&self, container: &str) -> Option<String> {
        let rest = container.strip_prefix(&format!("{}-", self.project))?;
        // strip the replica ordinal or environment suffix
        let candidate = rest.rsplit_once('-').map(|(head, _)| head).unwrap_or(rest);
        if self.registry.contains(candidate) {
            Some(candidate.to_string())
        } else if self.registry.contains(rest) {
            Some(rest.to_string())
        } else {
            None
        }
    }
}

fn parse_stats_row(row: &serde_json::Value) -> Result<ContainerStats, OrchestratorError> {
    let text = |key: &str| row.get(key).and_then(|v| v.as_str()).unwrap_or_default();
    let (net_rx, net_tx) = parse_io_pair(text("NetIO"));
    let (block_read, block_write) = parse_io_pair(text("BlockIO"));
    let memory_used = text("MemUsage")
        .split('/')
        .next()
        .map(|s| parse_size(s.trim()))
        .unwrap_or(0);

    Ok(ContainerStats {
        cpu_percent: parse_percent(text("CPUPerc")),
        memory_used_bytes: memory_used,
        memory_percent: parse_percent(text("MemPerc")),
        net_rx_bytes: net_rx,
        net_tx_bytes: net_tx,
        block_read_bytes: block_read,
        block_write_bytes: block_write,
        process_count: text("PIDs").trim().parse().unwrap_or(0),
    })
}

fn parse_percent(s: &str) -> f64 {
    s.trim().trim_end_matches('%').parse().unwrap_or(0.0)
}

fn parse_io_pair(s: &str) -> (u64, u64) {
    let mut parts = s.split('/');
    let first = parts.next().map(|p| parse_size(p.trim())).unwrap_or(0);
    let second = parts.next().map(|p| parse_size(p.trim())).unwrap_or(0);
    (first, second)
}

/// Parse the engine's human-readable sizes: `0B`, `1.08kB`, `21.5MiB`, `1.9GiB`
fn parse_size(s: &str) -> u64 {
    let s = s.trim();
    let split = s
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(s.len());
    let value: f64 = s[..split].parse().unwrap_or(0.0);
    let multiplier = match s[split..].trim() {
        "B" | "" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0f64.powi(4),
        _ => 1.0,
    };
    (value * multiplier) as u64
}

fn registry_of(image: &str) -> String {
    let first = image.split('/').next().unwrap_or("");
    if first.contains('.') || first.contains(':') {
        first.to_string()
    } else {
        "docker.io".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::ScriptedRunner;

    fn orchestrator(runner: ScriptedRunner, file: &str) -> ComposeOrchestrator {
        ComposeOrchestrator::new(Arc::new(runner), file)
    }

    #[tokio::test]
    async fn test_missing_compose_file_is_noop() {
        let orch = orchestrator(ScriptedRunner::new(), "/nonexistent/compose.yml");
        assert!(orch.status().await.unwrap().is_empty());
        assert!(orch.stats(None).await.unwrap().is_empty());
        orch.start(&["gateway".into()]).await.unwrap();
        orch.stop(&["gateway".into()]).await.unwrap();
    }

    #[tokio::test]
    async fn test_status_parses_compose_ps() {
        let dir = std::env::temp_dir().join("convoy-compose-test-status");
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("compose.yml");
        std::fs::write(&file, "services: {}\n").unwrap();

        let ps = concat!(
            "{\"Service\":\"gateway\",\"State\":\"running\",\"Health\":\"healthy\"}\n",
            "{\"Service\":\"personas\",\"State\":\"exited\",\"Health\":\"\"}\n",
        );
        let runner = ScriptedRunner::new().on("docker compose", ps);
        let orch = orchestrator(runner, file.to_str().unwrap());

        let status = orch.status().await.unwrap();
        let gateway = &status["gateway"];
        assert_eq!(gateway.state, ServiceState::Running);
        assert_eq!(gateway.health, HealthState::Healthy);
        assert_eq!(gateway.port, Some(3000));
        assert_eq!(status["personas"].state, ServiceState::NotRunning);
        // never-seen services default to not running
        assert_eq!(status["tokens"].state, ServiceState::NotRunning);
    }

    #[tokio::test]
    async fn test_stats_parsing() {
        let dir = std::env::temp_dir().join("convoy-compose-test-stats");
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("compose.yml");
        std::fs::write(&file, "services: {}\n").unwrap();

        let stats = "{\"Name\":\"convoy-gateway-1\",\"CPUPerc\":\"12.5%\",\"MemPerc\":\"3.2%\",\"MemUsage\":\"64MiB / 2GiB\",\"NetIO\":\"1.5kB / 2kB\",\"BlockIO\":\"0B / 4.1MB\",\"PIDs\":\"14\"}\n";
        let runner = ScriptedRunner::new().on("docker stats", stats);
        let orch = orchestrator(runner, file.to_str().unwrap());

        let all = orch.stats(None).await.unwrap();
        let gw = &all["gateway"];
        assert!((gw.cpu_percent - 12.5).abs() < f64::EPSILON);
        assert_eq!(gw.memory_used_bytes, 64 * 1024 * 1024);
        assert_eq!(gw.net_rx_bytes, 1500);
        assert_eq!(gw.block_write_bytes, 4_100_000);
        assert_eq!(gw.process_count, 14);
    }

    #[tokio::test]
    async fn test_image_probe_missing_image() {
        let runner = ScriptedRunner::new().on_fail("docker image inspect", 1, "No such image");
        let orch = orchestrator(runner, "/nonexistent/compose.yml");
        let probe = orch.image_probe("ghcr.io/convoy/gateway:9.9").await.unwrap();
        assert!(!probe.exists);
        assert_eq!(probe.registry, "ghcr.io");
    }

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("0B"), 0);
        assert_eq!(parse_size("1.08kB"), 1080);
        assert_eq!(parse_size("2MiB"), 2 * 1024 * 1024);
        assert_eq!(parse_size("1.5GB"), 1_500_000_000);
    }

    #[test]
    fn test_registry_of() {
        assert_eq!(registry_of("ghcr.io/convoy/gateway:1.0"), "ghcr.io");
        assert_eq!(registry_of("convoy/gateway:1.0"), "docker.io");
        assert_eq!(registry_of("localhost:5000/gateway"), "localhost:5000");
    }
}

//! Load-balancer adapter
//!
//! Traffic-split contract consumed by the blue/green deployer. The shipped
//! implementation maintains an upstream map file and fires a reload
//! command; tests use the in-memory balancer.

use async_trait::async_trait;
use convoy_core::{CommandRunner, CommandSpec};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Load-balancer operation error
#[derive(Debug, Clone, Error)]
pub enum LbError {
    /// Target unknown to the balancer
    #[error("unknown target: {0}")]
    UnknownTarget(String),
    /// Balancer backend failed
    #[error("load balancer error: {0}")]
    Backend(String),
}

/// Result of a traffic switch
#[derive(Debug, Clone, Serialize)]
pub struct SwitchOutcome {
    /// Milliseconds the switch took
    pub switch_time_ms: u64,
}

/// Traffic-split contract
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// Target currently receiving the majority of traffic
    async fn current_target(&self, service: &str) -> Result<Option<String>, LbError>;

    /// Route `percent` of the service's traffic to `target`; the
    /// remainder stays on the other target. The split always sums to 100.
    async fn set_percentage(&self, service: &str, target: &str, percent: u8)
        -> Result<(), LbError>;

    /// Move all traffic from one target to another
    async fn switch(&self, service: &str, from: &str, to: &str) -> Result<SwitchOutcome, LbError>;

    /// Single atomic 0 -> 100 switch
    async fn switch_instant(
        &self,
        service: &str,
        from: &str,
        to: &str,
    ) -> Result<SwitchOutcome, LbError>;

    /// Point all traffic back at `to`
    async fn revert(&self, service: &str, to: &str) -> Result<(), LbError>;

    /// Current split: target id -> percent
    async fn distribution(&self, service: &str) -> Result<HashMap<String, u8>, LbError>;
}

/// In-memory balancer. Also the test double: failures can be injected to
/// exercise the manual-intervention path.
#[derive(Default)]
pub struct MemoryBalancer {
    splits: RwLock<HashMap<String, HashMap<String, u8>>>,
    fail_next: AtomicBool,
    fail_after: std::sync::atomic::AtomicI64,
}

impl MemoryBalancer {
    pub fn new() -> Self {
        let balancer = Self::default();
        balancer.fail_after.store(-1, Ordering::SeqCst);
        balancer
    }

    /// Make the next operation fail
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Make the operation `n` calls from now fail (0 = the next one)
    pub fn fail_after(&self, n: i64) {
        self.fail_after.store(n, Ordering::SeqCst);
    }

    fn check_injected_failure(&self) -> Result<(), LbError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(LbError::Backend("injected failure".into()));
        }
        let remaining = self.fail_after.load(Ordering::SeqCst);
        if remaining >= 0 {
            self.fail_after.store(remaining - 1, Ordering::SeqCst);
            if remaining == 0 {
                return Err(LbError::Backend("injected failure".into()));
            }
        }
        Ok(())
    }

    fn apply_split(&self, service: &str, target: &str, percent: u8) {
        let mut splits = self.splits.write();
        let split = splits.entry(service.to_string()).or_default();
        let others: Vec<String> = split.keys().filter(|t| *t != target).cloned().collect();
        split.insert(target.to_string(), percent);
        // the remainder goes to the other side; a lone target owns it all
        match others.len() {
            0 => {
                split.insert(target.to_string(), 100);
            }
            _ => {
                let remainder = 100 - percent;
                for (i, other) in others.iter().enumerate() {
                    split.insert(other.clone(), if i == 0 { remainder } else { 0 });
                }
            }
        }
    }
}

#[async_trait]
impl LoadBalancer for MemoryBalancer {
    async fn current_target(&self, service: &str) -> Result<Option<String>, LbError> {
        let splits = self.splits.read();
        Ok(splits.get(service).and_then(|split| {
            split
                .iter()
                .max_by_key(|(_, percent)| **percent)
                .map(|(target, _)| target.clone())
        }))
    }

    async fn set_percentage(
        &self,
        service: &str,
        target: &str,
        percent: u8,
    ) -> Result<(), LbError> {
        self.check_injected_failure()?;
        self.apply_split(service, target, percent.min(100));
        Ok(())
    }

    async fn switch(&self, service: &str, _from: &str, to: &str) -> Result<SwitchOutcome, LbError> {
        self.check_injected_failure()?;
        let started = Instant::now();
        self.apply_split(service, to, 100);
        Ok(SwitchOutcome { switch_time_ms: started.elapsed().as_millis() as u64 })
    }

    async fn switch_instant(
        &self,
        service: &str,
        from: &str,
        to: &str,
    ) -> Result<SwitchOutcome, LbError> {
        self.switch(service, from, to).await
    }

    async fn revert(&self, service: &str, to: &str) -> Result<(), LbError> {
        self.check_injected_failure()?;
        self.apply_split(service, to, 100);
        Ok(())
    }

    async fn distribution(&self, service: &str) -> Result<HashMap<String, u8>, LbError> {
        Ok(self.splits.read().get(service).cloned().unwrap_or_default())
    }
}

/// Balancer that persists the split as a JSON upstream map and fires a
/// reload command after every change
pub struct UpstreamFileBalancer {
    inner: MemoryBalancer,
    runner: Arc<dyn CommandRunner>,
    map_file: PathBuf,
    reload_command: Vec<String>,
}

impl UpstreamFileBalancer {
    /// Balancer writing `map_file` and running `reload_command` on change
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        map_file: impl Into<PathBuf>,
        reload_command: Vec<String>,
    ) -> Self {
        Self {
            inner: MemoryBalancer::new(),
            runner,
            map_file: map_file.into(),
            reload_command,
        }
    }

    async fn publish(&self) -> Result<(), LbError> {
        let splits = self.inner.splits.read().clone();
        let json = serde_json::to_string_pretty(&splits)
            .map_err(|e| LbError::Backend(e.to_string()))?;
        std::fs::write(&self.map_file, json).map_err(|e| LbError::Backend(e.to_string()))?;

        if let Some((program, args)) = self.reload_command.split_first() {
            self.runner
                .run_checked(CommandSpec::new(program).args(args.iter().cloned()))
                .await
                .map_err(|e| LbError::Backend(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl LoadBalancer for UpstreamFileBalancer {
    async fn current_target(&self, service: &str) -> Result<Option<String>, LbError> {
        self.inner.current_target(service).await
    }

    async fn set_percentage(
        &self,
        service: &str,
        target: &str,
        percent: u8,
    ) -> Result<(), LbError> {
        self.inner.set_percentage(service, target, percent).await?;
        self.publish().await
    }

    async fn switch(&self, service: &str, from: &str, to: &str) -> Result<SwitchOutcome, LbError> {
        let outcome = self.inner.switch(service, from, to).await?;
        self.publish().await?;
        Ok(outcome)
    }

    async fn switch_instant(
        &self,
        service: &str,
        from: &str,
        to: &str,
    ) -> Result<SwitchOutcome, LbError> {
        let outcome = self.inner.switch_instant(service, from, to).await?;
        self.publish().await?;
        Ok(outcome)
    }

    async fn revert(&self, service: &str, to: &str) -> Result<(), LbError> {
        self.inner.revert(service, to).await?;
        self.publish().await
    }

    async fn distribution(&self, service: &str) -> Result<HashMap<String, u8>, LbError> {
        self.inner.distribution(service).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_split_always_sums_to_hundred() {
        let balancer = MemoryBalancer::new();
        balancer.set_percentage("gateway", "blue-1", 100).await.unwrap();
        balancer.set_percentage("gateway", "green-1", 25).await.unwrap();

        let split = balancer.distribution("gateway").await.unwrap();
        assert_eq!(split["green-1"], 25);
        assert_eq!(split["blue-1"], 75);
        assert_eq!(split.values().map(|p| *p as u32).sum::<u32>(), 100);
    }

    #[tokio::test]
    async fn test_switch_moves_everything() {
        let balancer = MemoryBalancer::new();
        balancer.set_percentage("gateway", "blue-1", 100).await.unwrap();
        balancer.switch("gateway", "blue-1", "green-1").await.unwrap();

        let split = balancer.distribution("gateway").await.unwrap();
        assert_eq!(split["green-1"], 100);
        assert_eq!(split["blue-1"], 0);
        assert_eq!(
            balancer.current_target("gateway").await.unwrap().as_deref(),
            Some("green-1")
        );
    }

    #[tokio::test]
    async fn test_injected_failure_fires_once() {
        let balancer = MemoryBalancer::new();
        balancer.fail_next();
        assert!(balancer.set_percentage("gateway", "blue-1", 50).await.is_err());
        assert!(balancer.set_percentage("gateway", "blue-1", 50).await.is_ok());
    }

    #[tokio::test]
    async fn test_upstream_file_published_on_change() {
        let file = std::env::temp_dir().join("convoy-upstreams-test.json");
        let _ = std::fs::remove_file(&file);
        let balancer = UpstreamFileBalancer::new(
            Arc::new(convoy_core::ScriptedRunner::new()),
            &file,
            vec!["nginx".into(), "-s".into(), "reload".into()],
        );

        balancer.set_percentage("gateway", "green-1", 25).await.unwrap();
        let raw = std::fs::read_to_string(&file).unwrap();
        let parsed: HashMap<String, HashMap<String, u8>> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed["gateway"]["green-1"], 25);
    }
}

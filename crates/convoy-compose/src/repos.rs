//! Source repository coordinator
//!
//! Discovers, clones, and updates the working trees behind each
//! application service. Git itself is an external collaborator reached
//! through the command-runner seam.

use convoy_core::{CommandRunner, CommandSpec};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const GIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Latest commit of a working tree
#[derive(Debug, Clone, Serialize)]
pub struct CommitInfo {
    pub hash: String,
    pub message: String,
    pub author: String,
    pub date: String,
}

/// Observed state of one repository
#[derive(Debug, Clone, Serialize)]
pub struct RepoStatus {
    pub name: String,
    pub path: PathBuf,
    pub exists: bool,
    /// Directory is a git working tree
    pub is_git: bool,
    pub branch: Option<String>,
    pub dirty: bool,
    pub last_commit: Option<CommitInfo>,
}

/// Per-repo outcome of an update pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "reason")]
pub enum UpdateOutcome {
    Updated,
    Failed(String),
}

/// Repository operation error
#[derive(Debug, Error)]
pub enum RepoError {
    /// One or more repositories could not be cloned; lists every failure
    #[error("failed to resolve repositories: {}", .failures.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>().join(", "))]
    CloneFailed {
        /// (repository, reason) for each unresolved name
        failures: Vec<(String, String)>,
    },
    /// Repository name is not configured
    #[error("unknown repository: {0}")]
    Unknown(String),
    /// Underlying git command failed
    #[error("git error: {0}")]
    Git(#[from] convoy_core::runner::CommandError),
}

/// Coordinates the source trees for every configured repository
pub struct RepositoryCoordinator {
    runner: Arc<dyn CommandRunner>,
    base_dir: PathBuf,
    urls: HashMap<String, String>,
}

impl RepositoryCoordinator {
    /// New coordinator; `urls` maps repository name to clone URL
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        base_dir: impl Into<PathBuf>,
        urls: HashMap<String, String>,
    ) -> Self {
        Self {
            runner,
            base_dir: base_dir.into(),
            urls,
        }
    }

    /// Configured repository names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.urls.keys().cloned().collect();
        names.sort();
        names
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.base_dir.join(name)
    }

    fn git(&self, path: &Path, args: &[&str]) -> CommandSpec {
        CommandSpec::new("git")
            .args(["-C", &path.to_string_lossy()])
            .args(args.iter().copied())
            .timeout(GIT_TIMEOUT)
    }

    /// Observed status of one repository
    pub async fn status(&self, name: &str) -> Result<RepoStatus, RepoError> {
        if !self.urls.contains_key(name) {
            return Err(RepoError::Unknown(name.into()));
        }
        let path = self.path_of(name);
        let exists = path.is_dir();
        let is_git = path.join(".git").exists();

        let mut status = RepoStatus {
            name: name.into(),
            path: path.clone(),
            exists,
            is_git,
            branch: None,
            dirty: false,
            last_commit: None,
        };
        if !is_git {
            return Ok(status);
        }

        let branch = self
            .runner
            .run(self.git(&path, &["rev-parse", "--abbrev-ref", "HEAD"]))
            .await?;
        if branch.success() {
            status.branch = Some(branch.stdout.trim().to_string());
        }

        let porcelain = self
            .runner
            .run(self.git(&path, &["status", "--porcelain"]))
            .await?;
        status.dirty = porcelain.success() && !porcelain.stdout.trim().is_empty();

        let log = self
            .runner
            .run(self.git(&path, &["log", "-1", "--format=%H%x1f%s%x1f%an%x1f%cI"]))
            .await?;
        if log.success() {
            let fields: Vec<&str> = log.stdout.trim().split('\u{1f}').collect();
            if fields.len() == 4 {
                status.last_commit = Some(CommitInfo {
                    hash: fields[0].into(),
                    message: fields[1].into(),
                    author: fields[2].into(),
                    date: fields[3].into(),
                });
            }
        }
        Ok(status)
    }

    /// Status of every configured repository
    pub async fn status_all(&self) -> Result<Vec<RepoStatus>, RepoError> {
        let mut all = Vec::new();
        for name in self.names() {
            all.push(self.status(&name).await?);
        }
        Ok(all)
    }

    /// Clone every missing repository. Failures accumulate; a single error
    /// lists each unresolved name with its reason.
    pub async fn ensure_all(&self) -> Result<Vec<String>, RepoError> {
        let mut cloned = Vec::new();
        let mut failures = Vec::new();

        for name in self.names() {
            let path = self.path_of(&name);
            if path.join(".git").exists() {
                continue;
            }
            let url = &self.urls[&name];
            tracing::info!(repo = %name, %url, "cloning repository");
            let spec = CommandSpec::new("git")
                .args(["clone", url, &path.to_string_lossy()])
                .timeout(GIT_TIMEOUT);
            match self.runner.run(spec).await {
                Ok(output) if output.success() => cloned.push(name),
                Ok(output) => failures.push((name, output.stderr.trim().to_string())),
                Err(e) => failures.push((name, e.to_string())),
            }
        }

        if failures.is_empty() {
            Ok(cloned)
        } else {
            Err(RepoError::CloneFailed { failures })
        }
    }

    /// Pull the given repositories (all when `subset` is `None`);
    /// per-repo outcomes never abort the pass.
    pub async fn update_all(
        &self,
        subset: Option<&[String]>,
    ) -> Result<HashMap<String, UpdateOutcome>, RepoError> {
        let names: Vec<String> = match subset {
            Some(subset) => {
                for name in subset {
                    if !self.urls.contains_key(name) {
                        return Err(RepoError::Unknown(name.clone()));
                    }
                }
                subset.to_vec()
            }
            None => self.names(),
        };

        let mut outcomes = HashMap::new();
        for name in names {
            let path = self.path_of(&name);
            if !path.join(".git").exists() {
                outcomes.insert(name, UpdateOutcome::Failed("repository not found".into()));
                continue;
            }
            let outcome = match self.runner.run(self.git(&path, &["pull", "--ff-only"])).await {
                Ok(output) if output.success() => UpdateOutcome::Updated,
                Ok(output) => UpdateOutcome::Failed(output.stderr.trim().to_string()),
                Err(e) => UpdateOutcome::Failed(e.to_string()),
            };
            if let UpdateOutcome::Failed(reason) = &outcome {
                tracing::warn!(repo = %name, %reason, "repository update failed");
            }
            outcomes.insert(name, outcome);
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::ScriptedRunner;

    fn urls(names: &[&str]) -> HashMap<String, String> {
        names
            .iter()
            .map(|n| (n.to_string(), format!("https://example.com/{n}.git")))
            .collect()
    }

    fn temp_base(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("convoy-repos-{tag}"));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_status_of_missing_repo() {
        let base = temp_base("missing");
        let coord = RepositoryCoordinator::new(Arc::new(ScriptedRunner::new()), &base, urls(&["gateway"]));
        let status = coord.status("gateway").await.unwrap();
        assert!(!status.exists);
        assert!(!status.is_git);
        assert!(status.branch.is_none());
    }

    #[tokio::test]
    async fn test_status_reads_git_metadata() {
        let base = temp_base("meta");
        std::fs::create_dir_all(base.join("gateway/.git")).unwrap();

        let runner = ScriptedRunner::new();
        let runner = runner.on(
            &format!("git -C {} rev-parse", base.join("gateway").display()),
            "main\n",
        );
        let runner = runner.on(
            &format!("git -C {} status", base.join("gateway").display()),
            " M src/app.rb\n",
        );
        let runner = runner.on(
            &format!("git -C {} log", base.join("gateway").display()),
            "abc123\u{1f}Fix routing\u{1f}Dev One\u{1f}2026-07-01T10:00:00Z\n",
        );

        let coord = RepositoryCoordinator::new(Arc::new(runner), &base, urls(&["gateway"]));
        let status = coord.status("gateway").await.unwrap();
        assert!(status.is_git);
        assert_eq!(status.branch.as_deref(), Some("main"));
        assert!(status.dirty);
        let commit = status.last_commit.unwrap();
        assert_eq!(commit.hash, "abc123");
        assert_eq!(commit.author, "Dev One");
    }

    #[tokio::test]
    async fn test_ensure_all_accumulates_failures() {
        let base = temp_base("ensure");
        let runner = ScriptedRunner::new()
            .on_fail("git clone https://example.com/personas.git", 128, "repository not found")
            .on_fail("git clone https://example.com/tokens.git", 128, "permission denied");

        let coord =
            RepositoryCoordinator::new(Arc::new(runner), &base, urls(&["gateway", "personas", "tokens"]));
        let err = coord.ensure_all().await.unwrap_err();
        match err {
            RepoError::CloneFailed { failures } => {
                let names: Vec<&str> = failures.iter().map(|(n, _)| n.as_str()).collect();
                assert_eq!(names, vec!["personas", "tokens"]);
            }
            other => panic!("expected CloneFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_update_all_reports_per_repo_outcomes() {
        let base = temp_base("update");
        std::fs::create_dir_all(base.join("gateway/.git")).unwrap();
        std::fs::create_dir_all(base.join("personas/.git")).unwrap();

        let runner = ScriptedRunner::new().on_fail(
            &format!("git -C {} pull", base.join("personas").display()),
            1,
            "merge conflict",
        );
        let coord = RepositoryCoordinator::new(
            Arc::new(runner),
            &base,
            urls(&["gateway", "personas", "workflows"]),
        );

        let outcomes = coord.update_all(None).await.unwrap();
        assert_eq!(outcomes["gateway"], UpdateOutcome::Updated);
        assert_eq!(
            outcomes["personas"],
            UpdateOutcome::Failed("merge conflict".into())
        );
        assert_eq!(
            outcomes["workflows"],
            UpdateOutcome::Failed("repository not found".into())
        );
    }
}

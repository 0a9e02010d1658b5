//! Backup manager
//!
//! One backup = one directory under the backup root: a subdirectory per
//! component plus `metadata.json`. Component failures are contained; the
//! overall status reflects the mix. Every captured file is checksummed.

use crate::components::BackupComponent;
use crate::BackupError;
use chrono::{DateTime, Utc};
use convoy_core::{Clock, SystemClock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Metadata document name; its presence is the backup's existence
pub const METADATA_FILE: &str = "metadata.json";

/// Full or incremental
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Incremental,
}

/// Per-component capture outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Completed,
    Failed,
}

/// Overall backup status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    /// Every component succeeded
    Completed,
    /// Some components succeeded
    Partial,
    /// Every component failed
    Failed,
}

/// Checksum of one captured file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChecksum {
    /// Path relative to the component directory
    pub path: String,
    pub sha256: String,
}

/// One component's result inside a backup record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentResult {
    pub status: ComponentStatus,
    /// Bytes captured
    pub size: u64,
    /// Milliseconds spent capturing
    pub duration: u64,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub files: Vec<FileChecksum>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The metadata document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRecord {
    pub backup_id: String,
    #[serde(rename = "type")]
    pub backup_type: BackupType,
    pub status: BackupStatus,
    pub components: BTreeMap<String, ComponentResult>,
    pub created_at: DateTime<Utc>,
    /// Total bytes across components
    pub size: u64,
    /// Milliseconds for the whole backup
    pub duration: u64,
    /// Base backup id for incrementals
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_backup: Option<String>,
}

/// Result of a retention pruning pass
#[derive(Debug, Clone, Serialize)]
pub struct PruneReport {
    pub examined: usize,
    pub deleted: Vec<String>,
    pub freed_bytes: u64,
}

/// Creates, lists, and prunes backups
pub struct BackupManager {
    root: PathBuf,
    components: Vec<Arc<dyn BackupComponent>>,
    clock: Arc<dyn Clock>,
}

impl BackupManager {
    /// Manager writing under `root`
    pub fn new(root: impl Into<PathBuf>, components: Vec<Arc<dyn BackupComponent>>) -> Self {
        Self {
            root: root.into(),
            components,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Backup root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Configured component names
    pub fn component_names(&self) -> Vec<&str> {
        self.components.iter().map(|c| c.name()).collect()
    }

    pub(crate) fn components(&self) -> &[Arc<dyn BackupComponent>] {
        &self.components
    }

    pub(crate) fn dir_of(&self, backup_id: &str) -> PathBuf {
        self.root.join(backup_id)
    }

    /// Estimated total size of a backup before creating one
    pub async fn estimate_size(&self) -> u64 {
        let mut total = 0;
        for component in &self.components {
            total += component.estimate_size().await;
        }
        total
    }

    /// Create a backup. Component failures never abort the others.
    pub async fn create(&self, backup_type: BackupType) -> Result<BackupRecord, BackupError> {
        self.create_with_id_prefix(backup_type, "backup").await
    }

    pub(crate) async fn create_with_id_prefix(
        &self,
        backup_type: BackupType,
        prefix: &str,
    ) -> Result<BackupRecord, BackupError> {
        let base_backup = match backup_type {
            BackupType::Incremental => Some(self.latest_completed_full()?.ok_or_else(|| {
                BackupError::InvalidRequest(
                    "no completed full backup to base an incremental on".into(),
                )
            })?),
            BackupType::Full => None,
        };

        let created_at = self.clock.now();
        let backup_id = format!(
            "{prefix}-{}-{}",
            created_at.format("%Y%m%d-%H%M%S"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let backup_dir = self.dir_of(&backup_id);
        std::fs::create_dir_all(&backup_dir)?;

        let estimated = self.estimate_size().await;
        tracing::info!(%backup_id, ?backup_type, estimated_bytes = estimated, "starting backup");
        let started = Instant::now();

        let mut components = BTreeMap::new();
        for component in &self.components {
            let name = component.name().to_string();
            let component_dir = backup_dir.join(&name);
            std::fs::create_dir_all(&component_dir)?;
            let component_started = Instant::now();

            let result = match component.capture(&component_dir).await {
                Ok(()) => {
                    let files = checksum_dir(&component_dir)?;
                    let size = files_size(&component_dir, &files);
                    ComponentResult {
                        status: ComponentStatus::Completed,
                        size,
                        duration: component_started.elapsed().as_millis() as u64,
                        backup_type,
                        files,
                        error: None,
                    }
                }
                Err(e) => {
                    tracing::warn!(component = %name, error = %e, "component capture failed");
                    ComponentResult {
                        status: ComponentStatus::Failed,
                        size: 0,
                        duration: component_started.elapsed().as_millis() as u64,
                        backup_type,
                        files: Vec::new(),
                        error: Some(e.to_string()),
                    }
                }
            };
            components.insert(name, result);
        }

        let completed = components
            .values()
            .filter(|c| c.status == ComponentStatus::Completed)
            .count();
        let status = if completed == components.len() {
            BackupStatus::Completed
        } else if completed == 0 {
            BackupStatus::Failed
        } else {
            BackupStatus::Partial
        };

        let record = BackupRecord {
            backup_id: backup_id.clone(),
            backup_type,
            status,
            size: components.values().map(|c| c.size).sum(),
            duration: started.elapsed().as_millis() as u64,
            components,
            created_at,
            base_backup,
        };
        self.write_metadata(&record)?;
        tracing::info!(%backup_id, status = ?record.status, size = record.size, "backup finished");
        Ok(record)
    }

    fn write_metadata(&self, record: &BackupRecord) -> Result<(), BackupError> {
        let path = self.dir_of(&record.backup_id).join(METADATA_FILE);
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| BackupError::Metadata(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Read one backup record; the metadata document is the existence test
    pub fn get(&self, backup_id: &str) -> Result<BackupRecord, BackupError> {
        let path = self.dir_of(backup_id).join(METADATA_FILE);
        if !path.exists() {
            return Err(BackupError::NotFound(backup_id.into()));
        }
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| BackupError::Metadata(e.to_string()))
    }

    /// List backups, newest first, filtered by inclusive creation range
    pub fn list(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<BackupRecord>, BackupError> {
        let mut records = Vec::new();
        if !self.root.is_dir() {
            return Ok(records);
        }
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.path().join(METADATA_FILE).exists() {
                continue;
            }
            let id = entry.file_name().to_string_lossy().to_string();
            match self.get(&id) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(backup = %id, error = %e, "unreadable backup metadata"),
            }
        }
        records.retain(|r| {
            from.map(|from| r.created_at >= from).unwrap_or(true)
                && to.map(|to| r.created_at <= to).unwrap_or(true)
        });
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Most recent completed full backup id, if any
    pub fn latest_completed_full(&self) -> Result<Option<String>, BackupError> {
        Ok(self
            .list(None, None)?
            .into_iter()
            .find(|r| r.backup_type == BackupType::Full && r.status == BackupStatus::Completed)
            .map(|r| r.backup_id))
    }

    /// Delete backups older than the retention horizon. The most recent
    /// completed full backup is never deleted.
    pub fn prune(&self, retention_days: u32) -> Result<PruneReport, BackupError> {
        let horizon = self.clock.now() - chrono::Duration::days(retention_days as i64);
        let keep = self.latest_completed_full()?;
        let records = self.list(None, None)?;

        let mut deleted = Vec::new();
        let mut freed = 0;
        for record in &records {
            if record.created_at >= horizon {
                continue;
            }
            if Some(&record.backup_id) == keep.as_ref() {
                continue;
            }
            freed += record.size;
            std::fs::remove_dir_all(self.dir_of(&record.backup_id))?;
            tracing::info!(backup = %record.backup_id, "pruned backup");
            deleted.push(record.backup_id.clone());
        }
        Ok(PruneReport {
            examined: records.len(),
            deleted,
            freed_bytes: freed,
        })
    }
}

/// Checksums of every file under `dir`, paths relative, sorted
pub(crate) fn checksum_dir(dir: &Path) -> Result<Vec<FileChecksum>, BackupError> {
    let mut files = Vec::new();
    walk(dir, dir, &mut files)?;
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<FileChecksum>) -> Result<(), BackupError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk(root, &path, out)?;
        } else {
            let bytes = std::fs::read(&path)?;
            let digest = Sha256::digest(&bytes);
            let relative = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .to_string();
            out.push(FileChecksum {
                path: relative,
                sha256: hex::encode(digest),
            });
        }
    }
    Ok(())
}

fn files_size(dir: &Path, files: &[FileChecksum]) -> u64 {
    files
        .iter()
        .map(|f| {
            std::fs::metadata(dir.join(&f.path))
                .map(|m| m.len())
                .unwrap_or(0)
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeComponent;
    use convoy_core::ManualClock;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!("convoy-backup-{tag}"));
        let _ = std::fs::remove_dir_all(&root);
        root
    }

    fn manager(root: &Path, components: Vec<Arc<dyn BackupComponent>>) -> BackupManager {
        BackupManager::new(root, components).with_clock(Arc::new(ManualClock::at_epoch()))
    }

    #[tokio::test]
    async fn test_full_backup_completed() {
        let root = temp_root("full");
        let manager = manager(
            &root,
            vec![
                Arc::new(FakeComponent::new("databases", b"db-state")),
                Arc::new(FakeComponent::new("cache", b"cache-state")),
            ],
        );

        let record = manager.create(BackupType::Full).await.unwrap();
        assert_eq!(record.status, BackupStatus::Completed);
        assert_eq!(record.components.len(), 2);
        // completed backup => every component completed
        assert!(record
            .components
            .values()
            .all(|c| c.status == ComponentStatus::Completed));
        assert!(record.size > 0);
        assert!(root.join(&record.backup_id).join(METADATA_FILE).exists());
        assert_eq!(record.components["databases"].files.len(), 1);
    }

    #[tokio::test]
    async fn test_one_failure_is_partial() {
        let root = temp_root("partial");
        let failing = Arc::new(FakeComponent::new("cache", b"x"));
        failing.fail_capture();
        let manager = manager(
            &root,
            vec![Arc::new(FakeComponent::new("databases", b"db")), failing],
        );

        let record = manager.create(BackupType::Full).await.unwrap();
        assert_eq!(record.status, BackupStatus::Partial);
        assert_eq!(record.components["cache"].status, ComponentStatus::Failed);
        assert!(record.components["cache"].error.is_some());
        // the failure did not stop the other component
        assert_eq!(record.components["databases"].status, ComponentStatus::Completed);
    }

    #[tokio::test]
    async fn test_all_failures_is_failed() {
        let root = temp_root("failed");
        let a = Arc::new(FakeComponent::new("databases", b"x"));
        let b = Arc::new(FakeComponent::new("cache", b"y"));
        a.fail_capture();
        b.fail_capture();
        let manager = manager(&root, vec![a, b]);

        let record = manager.create(BackupType::Full).await.unwrap();
        assert_eq!(record.status, BackupStatus::Failed);
    }

    #[tokio::test]
    async fn test_incremental_records_base() {
        let root = temp_root("incremental");
        let manager = manager(&root, vec![Arc::new(FakeComponent::new("databases", b"v1"))]);

        let full = manager.create(BackupType::Full).await.unwrap();
        let incremental = manager.create(BackupType::Incremental).await.unwrap();
        assert_eq!(incremental.base_backup.as_deref(), Some(full.backup_id.as_str()));
        assert_eq!(
            incremental.components["databases"].backup_type,
            BackupType::Incremental
        );
    }

    #[tokio::test]
    async fn test_incremental_without_full_is_rejected() {
        let root = temp_root("nobase");
        let manager = manager(&root, vec![Arc::new(FakeComponent::new("databases", b"v1"))]);
        let err = manager.create(BackupType::Incremental).await.unwrap_err();
        assert!(matches!(err, BackupError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_list_sorts_and_filters() {
        let root = temp_root("list");
        let clock = Arc::new(ManualClock::at_epoch());
        let manager = BackupManager::new(
            &root,
            vec![Arc::new(FakeComponent::new("databases", b"x")) as Arc<dyn BackupComponent>],
        )
        .with_clock(clock.clone());

        let first = manager.create(BackupType::Full).await.unwrap();
        clock.advance_secs(86_400);
        let second = manager.create(BackupType::Full).await.unwrap();

        let all = manager.list(None, None).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].backup_id, second.backup_id);

        let day_two = manager
            .list(Some(first.created_at + chrono::Duration::hours(1)), None)
            .unwrap();
        assert_eq!(day_two.len(), 1);
        assert_eq!(day_two[0].backup_id, second.backup_id);
    }

    #[tokio::test]
    async fn test_prune_keeps_latest_full() {
        let root = temp_root("prune");
        let clock = Arc::new(ManualClock::at_epoch());
        let manager = BackupManager::new(
            &root,
            vec![Arc::new(FakeComponent::new("databases", b"x")) as Arc<dyn BackupComponent>],
        )
        .with_clock(clock.clone());

        let old = manager.create(BackupType::Full).await.unwrap();
        clock.advance_secs(40 * 86_400);

        let report = manager.prune(30).unwrap();
        // the only completed full survives even past the horizon
        assert!(report.deleted.is_empty());
        assert!(manager.get(&old.backup_id).is_ok());

        let fresh = manager.create(BackupType::Full).await.unwrap();
        let report = manager.prune(30).unwrap();
        assert_eq!(report.deleted, vec![old.backup_id.clone()]);
        assert!(manager.get(&fresh.backup_id).is_ok());
    }
}

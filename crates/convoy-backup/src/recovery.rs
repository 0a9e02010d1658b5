//! Recovery manager
//!
//! Restore gate: integrity validation first, then a recovery point
//! capturing the pre-restore state, then per-component restore with the
//! same containment and rollup semantics as backup.

use crate::backup::{checksum_dir, BackupManager, BackupRecord, BackupStatus, ComponentStatus};
use crate::BackupError;
use chrono::{DateTime, Utc};
use convoy_core::{Clock, SystemClock};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

/// Pre-restore snapshot used to undo a failed partial restore
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryPoint {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

/// One component's restore outcome
#[derive(Debug, Clone, Serialize)]
pub struct ComponentRestore {
    pub status: ComponentStatus,
    /// Milliseconds spent restoring
    pub duration: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of one restore request
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub backup_id: String,
    pub recovery_point: RecoveryPoint,
    pub components: BTreeMap<String, ComponentRestore>,
    pub status: BackupStatus,
    pub duration: u64,
}

/// Validates and restores backups
pub struct RecoveryManager {
    manager: Arc<BackupManager>,
    clock: Arc<dyn Clock>,
}

impl RecoveryManager {
    /// Recovery over an existing backup manager (same root, same components)
    pub fn new(manager: Arc<BackupManager>) -> Self {
        Self {
            manager,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Verify a backup end to end: directory presence, metadata
    /// structure, and every component file checksum. Returns the record
    /// when intact; refuses with every failure enumerated otherwise.
    pub fn validate(&self, backup_id: &str) -> Result<BackupRecord, BackupError> {
        let record = self.manager.get(backup_id)?;
        let backup_dir = self.manager.dir_of(backup_id);
        let mut failures = Vec::new();

        if record.backup_id != backup_id {
            failures.push(format!(
                "metadata backup_id mismatch: {} != {backup_id}",
                record.backup_id
            ));
        }
        if record.components.is_empty() {
            failures.push("metadata lists no components".into());
        }

        for (name, result) in &record.components {
            if result.status != ComponentStatus::Completed {
                continue;
            }
            let component_dir = backup_dir.join(name);
            if !component_dir.is_dir() {
                failures.push(format!("component directory missing: {name}"));
                continue;
            }
            let actual = checksum_dir(&component_dir)?;
            for expected in &result.files {
                match actual.iter().find(|f| f.path == expected.path) {
                    None => failures.push(format!("missing file: {name}/{}", expected.path)),
                    Some(found) if found.sha256 != expected.sha256 => {
                        failures.push(format!("checksum mismatch: {name}/{}", expected.path))
                    }
                    Some(_) => {}
                }
            }
        }

        if failures.is_empty() {
            Ok(record)
        } else {
            Err(BackupError::Corrupted { failures })
        }
    }

    /// Capture the current state as an undo point
    pub async fn create_recovery_point(&self) -> Result<RecoveryPoint, BackupError> {
        let record = self
            .manager
            .create_with_id_prefix(crate::backup::BackupType::Full, "recovery-point")
            .await?;
        tracing::info!(id = %record.backup_id, "recovery point created");
        Ok(RecoveryPoint {
            id: record.backup_id,
            created_at: record.created_at,
        })
    }

    /// Restore a backup, optionally only the named components. The backup
    /// is integrity-checked first and a recovery point is created before
    /// any component is mutated.
    pub async fn restore(
        &self,
        backup_id: &str,
        only: Option<&[String]>,
    ) -> Result<RestoreReport, BackupError> {
        let record = self.validate(backup_id)?;

        if let Some(names) = only {
            for name in names {
                if !record.components.contains_key(name) {
                    return Err(BackupError::UnknownComponent(name.clone()));
                }
            }
        }
        let selected: Vec<String> = match only {
            Some(names) => names.to_vec(),
            None => record.components.keys().cloned().collect(),
        };

        let recovery_point = self.create_recovery_point().await?;
        let backup_dir = self.manager.dir_of(backup_id);
        let started = Instant::now();

        let mut components = BTreeMap::new();
        for name in &selected {
            let component_started = Instant::now();
            let outcome = match record.components[name].status {
                ComponentStatus::Failed => ComponentRestore {
                    status: ComponentStatus::Failed,
                    duration: 0,
                    error: Some("component was not captured in this backup".into()),
                },
                ComponentStatus::Completed => {
                    let component = self
                        .manager
                        .components()
                        .iter()
                        .find(|c| c.name() == name)
                        .cloned()
                        .ok_or_else(|| BackupError::UnknownComponent(name.clone()))?;
                    match component.restore(&backup_dir.join(name)).await {
                        Ok(()) => ComponentRestore {
                            status: ComponentStatus::Completed,
                            duration: component_started.elapsed().as_millis() as u64,
                            error: None,
                        },
                        Err(e) => {
                            tracing::warn!(component = %name, error = %e, "component restore failed");
                            ComponentRestore {
                                status: ComponentStatus::Failed,
                                duration: component_started.elapsed().as_millis() as u64,
                                error: Some(e.to_string()),
                            }
                        }
                    }
                }
            };
            components.insert(name.clone(), outcome);
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

        tracing::info!(%backup_id, ?status, "restore finished");
        Ok(RestoreReport {
            backup_id: backup_id.into(),
            recovery_point,
            components,
            status,
            duration: started.elapsed().as_millis() as u64,
        })
    }

    /// Whether the backup system is currently usable: the root exists or
    /// can be created, and the newest backup (if any) validates
    pub async fn system_healthy(&self) -> bool {
        match self.manager.list(None, None) {
            Ok(records) => match records.first() {
                Some(latest) => self.validate(&latest.backup_id).is_ok(),
                None => true,
            },
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupType;
    use crate::components::BackupComponent;
    use crate::testing::FakeComponent;
    use convoy_core::ManualClock;
    use std::path::PathBuf;

    struct Fixture {
        manager: Arc<BackupManager>,
        recovery: RecoveryManager,
        databases: Arc<FakeComponent>,
        cache: Arc<FakeComponent>,
    }

    fn fixture(tag: &str) -> Fixture {
        let root = std::env::temp_dir().join(format!("convoy-recovery-{tag}"));
        let _ = std::fs::remove_dir_all(&root);
        let databases = Arc::new(FakeComponent::new("databases", b"db-v1"));
        let cache = Arc::new(FakeComponent::new("cache", b"cache-v1"));
        let manager = Arc::new(
            BackupManager::new(
                &root,
                vec![
                    databases.clone() as Arc<dyn BackupComponent>,
                    cache.clone() as Arc<dyn BackupComponent>,
                ],
            )
            .with_clock(Arc::new(ManualClock::at_epoch())),
        );
        let recovery =
            RecoveryManager::new(manager.clone()).with_clock(Arc::new(ManualClock::at_epoch()));
        Fixture { manager, recovery, databases, cache }
    }

    fn corrupt(dir: PathBuf) {
        let file = dir.join("data.bin");
        let mut bytes = std::fs::read(&file).unwrap();
        bytes[0] ^= 0xFF;
        std::fs::write(&file, bytes).unwrap();
    }

    #[tokio::test]
    async fn test_full_round_trip_restores_bytes() {
        let fx = fixture("roundtrip");
        let record = fx.manager.create(BackupType::Full).await.unwrap();

        fx.databases.set_state(b"db-v2-dirty");
        fx.cache.set_state(b"cache-v2-dirty");

        let report = fx.recovery.restore(&record.backup_id, None).await.unwrap();
        assert_eq!(report.status, BackupStatus::Completed);
        assert_eq!(fx.databases.state(), b"db-v1");
        assert_eq!(fx.cache.state(), b"cache-v1");
    }

    #[tokio::test]
    async fn test_corrupted_backup_still_lists_but_refuses_restore() {
        let fx = fixture("corrupt");
        let record = fx.manager.create(BackupType::Full).await.unwrap();
        corrupt(fx.manager.dir_of(&record.backup_id).join("databases"));

        // listable: the metadata document still exists
        let listed = fx.manager.list(None, None).unwrap();
        assert_eq!(listed.len(), 1);

        let err = fx.recovery.restore(&record.backup_id, None).await.unwrap_err();
        match err {
            BackupError::Corrupted { failures } => {
                assert_eq!(failures, vec!["checksum mismatch: databases/data.bin"]);
            }
            other => panic!("expected Corrupted, got {other:?}"),
        }
        // nothing was mutated
        assert_eq!(fx.databases.state(), b"db-v1");
    }

    #[tokio::test]
    async fn test_missing_file_named_in_validation() {
        let fx = fixture("missing");
        let record = fx.manager.create(BackupType::Full).await.unwrap();
        std::fs::remove_file(
            fx.manager
                .dir_of(&record.backup_id)
                .join("cache")
                .join("data.bin"),
        )
        .unwrap();

        let err = fx.recovery.validate(&record.backup_id).unwrap_err();
        match err {
            BackupError::Corrupted { failures } => {
                assert_eq!(failures, vec!["missing file: cache/data.bin"]);
            }
            other => panic!("expected Corrupted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_selective_restore_touches_only_named_components() {
        let fx = fixture("selective");
        let record = fx.manager.create(BackupType::Full).await.unwrap();

        fx.databases.set_state(b"db-v2");
        fx.cache.set_state(b"cache-v2");

        let report = fx
            .recovery
            .restore(&record.backup_id, Some(&["databases".to_string()]))
            .await
            .unwrap();
        assert_eq!(report.components.len(), 1);
        assert_eq!(fx.databases.state(), b"db-v1");
        // cache untouched
        assert_eq!(fx.cache.state(), b"cache-v2");
    }

    #[tokio::test]
    async fn test_unknown_component_rejected() {
        let fx = fixture("unknown");
        let record = fx.manager.create(BackupType::Full).await.unwrap();
        let err = fx
            .recovery
            .restore(&record.backup_id, Some(&["tape-drive".to_string()]))
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::UnknownComponent(_)));
    }

    #[tokio::test]
    async fn test_recovery_point_captures_pre_restore_state() {
        let fx = fixture("recovery-point");
        let record = fx.manager.create(BackupType::Full).await.unwrap();
        fx.databases.set_state(b"db-v2");

        let report = fx.recovery.restore(&record.backup_id, None).await.unwrap();
        assert!(report.recovery_point.id.starts_with("recovery-point-"));

        // the recovery point holds the state from just before the restore
        let point = fx.manager.get(&report.recovery_point.id).unwrap();
        assert_eq!(point.status, BackupStatus::Completed);
        let dump = std::fs::read(
            fx.manager
                .dir_of(&point.backup_id)
                .join("databases")
                .join("data.bin"),
        )
        .unwrap();
        assert_eq!(dump, b"db-v2");
    }

    #[tokio::test]
    async fn test_partial_restore_status() {
        let fx = fixture("partial-restore");
        let record = fx.manager.create(BackupType::Full).await.unwrap();
        fx.cache.fail_restore();

        let report = fx.recovery.restore(&record.backup_id, None).await.unwrap();
        assert_eq!(report.status, BackupStatus::Partial);
        assert_eq!(report.components["cache"].status, ComponentStatus::Failed);
        assert_eq!(report.components["databases"].status, ComponentStatus::Completed);
    }

    #[tokio::test]
    async fn test_system_healthy() {
        let fx = fixture("health");
        assert!(fx.recovery.system_healthy().await);
        let record = fx.manager.create(BackupType::Full).await.unwrap();
        assert!(fx.recovery.system_healthy().await);
        corrupt(fx.manager.dir_of(&record.backup_id).join("databases"));
        assert!(!fx.recovery.system_healthy().await);
    }
}

//! Convoy Backup
//!
//! Component-wise backup and recovery for the platform's stateful pieces:
//! relational databases, the key-value cache, the vector store, source
//! repositories, and configuration. Each backup is a directory of
//! per-component subdirectories plus a metadata document; the metadata
//! document's presence *is* the backup's existence. Every component file
//! is checksummed, and restore refuses to run when a checksum disagrees.

#![allow(dead_code)]

pub mod backup;
pub mod components;
pub mod recovery;
pub mod testing;

pub use backup::{
    BackupManager, BackupRecord, BackupStatus, BackupType, ComponentResult, ComponentStatus,
    FileChecksum, PruneReport,
};
pub use components::{
    BackupComponent, CacheComponent, ComponentError, ConfigComponent, DatabaseComponent,
    RepositoriesComponent, VectorStoreComponent,
};
pub use recovery::{RecoveryManager, RecoveryPoint, RestoreReport};
pub use testing::FakeComponent;

use thiserror::Error;

/// Backup subsystem error
#[derive(Debug, Error)]
pub enum BackupError {
    /// Integrity check failed; restore refused. Lists every failure.
    #[error("backup corrupted: {}", .failures.join("; "))]
    Corrupted {
        /// One entry per missing file, checksum mismatch, or malformed field
        failures: Vec<String>,
    },
    /// No backup directory or metadata document for the id
    #[error("backup not found: {0}")]
    NotFound(String),
    /// Request cannot be satisfied as specified
    #[error("invalid backup request: {0}")]
    InvalidRequest(String),
    /// Component name not configured
    #[error("unknown component: {0}")]
    UnknownComponent(String),
    /// Metadata could not be encoded or decoded
    #[error("metadata error: {0}")]
    Metadata(String),
    /// Filesystem failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

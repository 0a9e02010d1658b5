//! In-memory backup component for tests

use crate::components::{BackupComponent, ComponentError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Component whose "state" is a byte buffer. Capture writes it to a file;
/// restore reads it back, so round-trips can assert byte equality.
pub struct FakeComponent {
    name: String,
    state: Arc<RwLock<Vec<u8>>>,
    fail_capture: AtomicBool,
    fail_restore: AtomicBool,
}

impl FakeComponent {
    /// Component with initial state bytes
    pub fn new(name: &str, state: &[u8]) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(RwLock::new(state.to_vec())),
            fail_capture: AtomicBool::new(false),
            fail_restore: AtomicBool::new(false),
        }
    }

    /// Make the next captures fail
    pub fn fail_capture(&self) {
        self.fail_capture.store(true, Ordering::SeqCst);
    }

    /// Make the next restores fail
    pub fn fail_restore(&self) {
        self.fail_restore.store(true, Ordering::SeqCst);
    }

    /// Mutate the live state, as the platform would between backups
    pub fn set_state(&self, state: &[u8]) {
        *self.state.write() = state.to_vec();
    }

    /// Current live state
    pub fn state(&self) -> Vec<u8> {
        self.state.read().clone()
    }
}

#[async_trait]
impl BackupComponent for FakeComponent {
    fn name(&self) -> &str {
        &self.name
    }

    async fn capture(&self, dest: &Path) -> Result<(), ComponentError> {
        if self.fail_capture.load(Ordering::SeqCst) {
            return Err(ComponentError::Misconfigured("capture failure injected".into()));
        }
        std::fs::write(dest.join("data.bin"), self.state.read().as_slice())?;
        Ok(())
    }

    async fn restore(&self, src: &Path) -> Result<(), ComponentError> {
        if self.fail_restore.load(Ordering::SeqCst) {
            return Err(ComponentError::Misconfigured("restore failure injected".into()));
        }
        let bytes = std::fs::read(src.join("data.bin"))?;
        *self.state.write() = bytes;
        Ok(())
    }

    async fn estimate_size(&self) -> u64 {
        self.state.read().len() as u64
    }
}

//! Secret material providers
//!
//! Configuration loading reads environment variables through this seam so
//! tests can supply fixed material without touching process state.

use std::collections::HashMap;

/// Source of secret/environment material
pub trait SecretProvider: Send + Sync {
    /// Fetch a variable; `None` when unset
    fn get(&self, key: &str) -> Option<String>;

    /// Fetch a variable, treating empty strings as unset
    fn get_non_empty(&self, key: &str) -> Option<String> {
        self.get(key).filter(|v| !v.trim().is_empty())
    }
}

/// Reads the process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnvSecrets;

impl SecretProvider for ProcessEnvSecrets {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Fixed in-memory material, for tests and embedded use
#[derive(Debug, Clone, Default)]
pub struct MapSecrets {
    values: HashMap<String, String>,
}

impl MapSecrets {
    /// Build from key/value pairs
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        Self {
            values: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    /// Insert a value
    pub fn set(&mut self, key: &str, value: &str) {
        self.values.insert(key.into(), value.into());
    }
}

impl SecretProvider for MapSecrets {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

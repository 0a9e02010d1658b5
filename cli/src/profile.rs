//! CLI profile file
//!
//! Optional defaults at `~/.config/convoy/config.toml`; flags and
//! environment variables always win.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub compose_file: String,
    pub repos_dir: String,
    pub backup_dir: String,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            compose_file: "docker-compose.yml".into(),
            repos_dir: "services".into(),
            backup_dir: "backups".into(),
        }
    }
}

impl Profile {
    /// Load the profile, falling back to defaults on any problem
    pub fn load() -> Self {
        let Some(config_dir) = dirs::config_dir() else {
            return Self::default();
        };
        let path = config_dir.join("convoy").join("config.toml");
        match std::fs::read_to_string(&path) {
            Ok(raw) => toml::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "unreadable profile; using defaults");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }
}

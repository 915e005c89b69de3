//! Layered configuration loader
//!
//! Loads configuration from:
//! 1. Default values
//! 2. User-level config: ~/.agentsync/agentsync.toml
//! 3. Project-level config: ./.agentsync/agentsync.toml
//! 4. An explicit file, when one is given
//!
//! Later configs override earlier ones.

use crate::config::schema::{home_dir, AgentSyncConfig};
use crate::error::{AgentSyncError, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

const CONFIG_FILE: &str = "agentsync.toml";

/// Configuration loader over the user, project and explicit layers
pub struct ConfigLoader {
    user_config_path: PathBuf,
    project_config_path: PathBuf,
    explicit_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            user_config_path: home_dir().join(CONFIG_FILE),
            project_config_path: PathBuf::from(".agentsync").join(CONFIG_FILE),
            explicit_path: None,
        }
    }

    /// Add an explicit config file on top of the default layers
    pub fn with_explicit_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit_path = Some(path.into());
        self
    }

    /// Override the user and project layer locations
    pub fn with_layers(mut self, user: impl Into<PathBuf>, project: impl Into<PathBuf>) -> Self {
        self.user_config_path = user.into();
        self.project_config_path = project.into();
        self
    }

    /// Load all layers; a missing explicit file is an error, missing layers are not
    pub async fn load(&self) -> Result<AgentSyncConfig> {
        let mut config = AgentSyncConfig::default();

        for path in [&self.user_config_path, &self.project_config_path] {
            if !path.exists() {
                debug!(path = %path.display(), "Config layer not present");
                continue;
            }
            let layer = Self::load_from_path(path).await?;
            debug!(path = %path.display(), "Loaded config layer");
            config.merge(layer);
        }

        if let Some(path) = &self.explicit_path {
            let layer = Self::load_from_path(path).await?;
            debug!(path = %path.display(), "Loaded explicit config");
            config.merge(layer);
        }

        config.resolve_env_vars();
        info!("Configuration loaded");
        Ok(config)
    }

    /// Parse a single TOML file
    pub async fn load_from_path(path: &Path) -> Result<AgentSyncConfig> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            AgentSyncError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        toml::from_str(&content).map_err(|e| {
            AgentSyncError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    pub fn user_config_path(&self) -> &Path {
        &self.user_config_path
    }

    pub fn project_config_path(&self) -> &Path {
        &self.project_config_path
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_layers_override_in_order() {
        let dir = TempDir::new().unwrap();
        let user = dir.path().join("user.toml");
        let project = dir.path().join("project.toml");
        let explicit = dir.path().join("explicit.toml");

        std::fs::write(&user, "[hub]\nport = 9001\n").unwrap();
        std::fs::write(&project, "[hub]\nport = 9002\n[activity]\ncapacity = 50\n").unwrap();
        std::fs::write(&explicit, "[logging]\nlevel = \"debug\"\n").unwrap();

        let config = ConfigLoader::new()
            .with_layers(&user, &project)
            .with_explicit_path(&explicit)
            .load()
            .await
            .unwrap();

        assert_eq!(config.hub.port, 9002);
        assert_eq!(config.activity.capacity, 50);
        assert_eq!(config.logging.level, "debug");
    }

    #[tokio::test]
    async fn test_missing_layers_use_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ConfigLoader::new()
            .with_layers(dir.path().join("none.toml"), dir.path().join("nope.toml"))
            .load()
            .await
            .unwrap();

        assert_eq!(config.hub.port, 8765);
    }

    #[tokio::test]
    async fn test_malformed_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        let bad = dir.path().join("bad.toml");
        std::fs::write(&bad, "[hub\nport = ").unwrap();

        let err = ConfigLoader::load_from_path(&bad).await.unwrap_err();
        assert!(matches!(err, AgentSyncError::Config(_)));
    }
}

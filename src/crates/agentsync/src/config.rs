//! Configuration management for agentsync
//!
//! Supports layered configuration:
//! - User-level: ~/.agentsync/agentsync.toml
//! - Project-level: ./.agentsync/agentsync.toml
//! - Explicit: a file passed on the command line

mod loader;
mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    home_dir, ActivityConfig, AgentSyncConfig, BackupConfig, ConflictConfig, CoordinatorConfig,
    DatabaseConfig, HubConfig, LoggingConfig, PeerConfig,
};

use crate::Result;

/// Load configuration from the default layers
pub async fn load_config() -> Result<AgentSyncConfig> {
    ConfigLoader::new().load().await
}

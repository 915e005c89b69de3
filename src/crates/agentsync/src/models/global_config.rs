//! Singleton global configuration entity

use super::{AgentMode, BackupMetadata, Metadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Id of the only config row
pub const GLOBAL_CONFIG_ID: &str = "global";

/// Store-wide settings plus the backup history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    pub id: String,
    pub max_agents: i64,
    pub default_mode: AgentMode,
    pub auto_accept: bool,
    /// Arbitrary keyed settings (docker, ports, paths, ...)
    #[serde(default)]
    pub settings: Metadata,
    /// Crate version that last wrote the row
    pub version: String,
    #[serde(default)]
    pub backup_metadata: Vec<BackupMetadata>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: GLOBAL_CONFIG_ID.to_string(),
            max_agents: 10,
            default_mode: AgentMode::Docker,
            auto_accept: false,
            settings: Metadata::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            backup_metadata: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

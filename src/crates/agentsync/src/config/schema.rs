//! Configuration schema for agentsync

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level agentsync configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentSyncConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub peer: PeerConfig,

    #[serde(default)]
    pub conflict: ConflictConfig,

    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub activity: ActivityConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Store location and access mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file path (relative to ~/.agentsync or absolute)
    pub path: String,

    /// Open without write access and skip migrations
    pub read_only: bool,

    /// Use an in-memory store instead of `path`
    pub in_memory: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "agentsync.db".to_string(),
            read_only: false,
            in_memory: false,
        }
    }
}

/// Backup location and retention policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Backup directory (relative to ~/.agentsync or absolute)
    pub dir: String,

    /// Auto-created backups older than this are pruned
    pub retention_days: i64,

    /// Number of most recent backups always kept
    pub max_backups: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            dir: "backups".to_string(),
            retention_days: 30,
            max_backups: 10,
        }
    }
}

/// Hub listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,

    /// Peers beyond this count are refused with a policy close
    pub max_connections: usize,

    /// Interval between hub pings; peers silent for two intervals are dropped
    pub heartbeat_interval_ms: u64,

    /// Largest accepted inbound frame
    pub max_payload_bytes: usize,

    /// Outbound frames buffered per peer; events beyond it are dropped
    pub peer_queue_size: usize,

    /// Consecutive drops after which a slow peer is disconnected
    pub max_dropped_events: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            max_connections: 100,
            heartbeat_interval_ms: 30_000,
            max_payload_bytes: 1024 * 1024,
            peer_queue_size: 100,
            max_dropped_events: 100,
        }
    }
}

impl HubConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Peer connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Hub URL, e.g. ws://127.0.0.1:8765
    pub url: String,

    /// Fixed delay between reconnect attempts
    pub reconnect_interval_ms: u64,

    /// Consecutive failed attempts before the peer gives up
    pub max_reconnect_attempts: u32,

    pub heartbeat_interval_ms: u64,

    /// Dial timeout; expiry counts as a failed attempt
    pub connect_timeout_ms: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8765".to_string(),
            reconnect_interval_ms: 5_000,
            max_reconnect_attempts: 10,
            heartbeat_interval_ms: 30_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl PeerConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Conflict classification windows and command lists
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Same-entity operations closer than this are resource conflicts
    pub resource_window_ms: i64,

    /// Cross-source operations closer than this are concurrent conflicts
    pub concurrent_window_ms: i64,

    /// Unordered command pairs that must not interleave
    pub incompatible_pairs: Vec<(String, String)>,

    /// Command name fragments considered read-only
    pub safe_operations: Vec<String>,

    /// Command name fragments that remove the entity; an incompatible pair
    /// involving one is a state conflict even inside the resource window
    pub destructive_operations: Vec<String>,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        let pair = |a: &str, b: &str| (a.to_string(), b.to_string());
        Self {
            resource_window_ms: 5_000,
            concurrent_window_ms: 1_000,
            incompatible_pairs: vec![
                pair("start-agent", "delete-agent"),
                pair("create-agent", "delete-agent"),
                pair("stop-agent", "start-agent"),
            ],
            safe_operations: vec!["status".into(), "list".into(), "show".into()],
            destructive_operations: vec!["delete".into()],
        }
    }
}

/// How far back the coordinator looks for colliding commands
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub window_ms: i64,
    pub limit: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            window_ms: 10_000,
            limit: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    /// Ring buffer capacity
    pub capacity: usize,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self { capacity: 10_000 }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    pub level: String,

    /// Log format: "compact", "pretty", "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl AgentSyncConfig {
    /// Merge another config into this one (other takes precedence)
    pub fn merge(&mut self, other: AgentSyncConfig) {
        self.database = other.database;
        self.backup = other.backup;
        self.hub = other.hub;
        self.peer = other.peer;
        self.conflict = other.conflict;
        self.coordinator = other.coordinator;
        self.activity = other.activity;
        self.logging = other.logging;
    }

    /// Resolve `${VAR}` references in path-like fields
    pub fn resolve_env_vars(&mut self) {
        self.database.path = Self::expand_env_var(&self.database.path);
        self.backup.dir = Self::expand_env_var(&self.backup.dir);
        self.peer.url = Self::expand_env_var(&self.peer.url);
    }

    fn expand_env_var(value: &str) -> String {
        if value.starts_with("${") && value.ends_with('}') {
            let var_name = &value[2..value.len() - 1];
            std::env::var(var_name).unwrap_or_else(|_| value.to_string())
        } else {
            value.to_string()
        }
    }

    /// Resolved database path; relative paths land under ~/.agentsync
    pub fn database_path(&self) -> PathBuf {
        resolve_home_relative(&self.database.path)
    }

    /// Resolved backup directory; relative paths land under ~/.agentsync
    pub fn backup_dir(&self) -> PathBuf {
        resolve_home_relative(&self.backup.dir)
    }
}

/// Base directory for per-user state (~/.agentsync)
pub fn home_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".agentsync")
}

fn resolve_home_relative(value: &str) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        path
    } else {
        home_dir().join(path)
    }
}

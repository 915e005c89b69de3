//! Health check functionality
//!
//! Verifies the store, its schema, the configuration and the hub.

use crate::config::AgentSyncConfig;
use crate::db::Database;
use crate::sync::SyncHub;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;

/// Hub load above which the hub is reported as degraded
const HUB_DEGRADED_LOAD: f64 = 0.9;

/// Health check status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All checks passed
    Healthy,
    /// Some checks failed but the system is partially operational
    Degraded,
    /// Critical checks failed
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Individual component check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub response_time_ms: u64,
}

impl ComponentHealth {
    pub fn healthy(name: impl Into<String>, response_time_ms: u64) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: Some("OK".to_string()),
            response_time_ms,
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>, response_time_ms: u64) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            response_time_ms,
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>, response_time_ms: u64) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            response_time_ms,
        }
    }
}

/// Overall health report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<ComponentHealth>,
    pub total_response_time_ms: u64,
    /// Unix timestamp of the check
    pub timestamp: i64,
}

impl HealthReport {
    pub fn new(checks: Vec<ComponentHealth>) -> Self {
        let status = if checks.iter().any(|c| c.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if checks.iter().any(|c| c.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        let total_response_time_ms = checks.iter().map(|c| c.response_time_ms).sum();

        Self {
            status,
            checks,
            total_response_time_ms,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

pub struct HealthChecker;

impl HealthChecker {
    pub async fn check_database(db: &Database) -> ComponentHealth {
        let start = Instant::now();
        match db.health_check().await {
            Ok(()) => ComponentHealth::healthy("database", elapsed_ms(start)),
            Err(e) => ComponentHealth::unhealthy("database", format!("Database error: {}", e), elapsed_ms(start)),
        }
    }

    /// Schema version against the newest known migration
    pub fn check_schema(db: &Database) -> ComponentHealth {
        let start = Instant::now();
        let (version, latest) = (db.version(), db.latest_version());
        if version == latest {
            ComponentHealth::healthy("schema", elapsed_ms(start))
        } else if version < latest {
            ComponentHealth::degraded(
                "schema",
                format!("Schema at version {}, {} available", version, latest),
                elapsed_ms(start),
            )
        } else {
            ComponentHealth::unhealthy(
                "schema",
                format!("Schema version {} is newer than supported {}", version, latest),
                elapsed_ms(start),
            )
        }
    }

    pub fn check_config(config: &AgentSyncConfig) -> ComponentHealth {
        let start = Instant::now();
        let mut issues = Vec::new();

        if config.hub.max_connections == 0 {
            issues.push("hub.max_connections is 0");
        }
        if config.hub.peer_queue_size == 0 {
            issues.push("hub.peer_queue_size is 0");
        }
        if config.hub.heartbeat_interval_ms == 0 {
            issues.push("hub.heartbeat_interval_ms is 0");
        }
        if config.activity.capacity == 0 {
            issues.push("activity.capacity is 0");
        }
        if config.conflict.resource_window_ms <= 0 || config.conflict.concurrent_window_ms <= 0 {
            issues.push("conflict windows must be positive");
        }
        if config.backup.retention_days <= 0 {
            issues.push("backup.retention_days must be positive");
        }

        if issues.is_empty() {
            ComponentHealth::healthy("configuration", elapsed_ms(start))
        } else {
            ComponentHealth::degraded("configuration", issues.join("; "), elapsed_ms(start))
        }
    }

    /// Hub headroom; near-full hubs are degraded
    pub fn check_hub(hub: &SyncHub) -> ComponentHealth {
        let start = Instant::now();
        let stats = hub.stats();
        let load = stats.peers as f64 / stats.max_connections.max(1) as f64;
        if load >= 1.0 {
            ComponentHealth::unhealthy(
                "hub",
                format!("At capacity ({}/{})", stats.peers, stats.max_connections),
                elapsed_ms(start),
            )
        } else if load >= HUB_DEGRADED_LOAD {
            ComponentHealth::degraded(
                "hub",
                format!("Near capacity ({}/{})", stats.peers, stats.max_connections),
                elapsed_ms(start),
            )
        } else {
            ComponentHealth::healthy("hub", elapsed_ms(start))
        }
    }

    /// Backup directory is a directory, or can still be created
    pub async fn check_backup_dir(dir: &Path) -> ComponentHealth {
        let start = Instant::now();
        match tokio::fs::metadata(dir).await {
            Ok(metadata) if metadata.is_dir() => ComponentHealth::healthy("backups", elapsed_ms(start)),
            Ok(_) => ComponentHealth::unhealthy("backups", "Backup path is not a directory", elapsed_ms(start)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                ComponentHealth::degraded("backups", "Backup directory not created yet", elapsed_ms(start))
            }
            Err(e) => ComponentHealth::unhealthy(
                "backups",
                format!("Cannot access backup directory: {}", e),
                elapsed_ms(start),
            ),
        }
    }

    pub async fn check_all(
        db: &Database,
        config: &AgentSyncConfig,
        backup_dir: &Path,
        hub: Option<&SyncHub>,
    ) -> HealthReport {
        let mut checks = vec![
            Self::check_database(db).await,
            Self::check_schema(db),
            Self::check_config(config),
            Self::check_backup_dir(backup_dir).await,
        ];
        if let Some(hub) = hub {
            checks.push(Self::check_hub(hub));
        }
        HealthReport::new(checks)
    }
}

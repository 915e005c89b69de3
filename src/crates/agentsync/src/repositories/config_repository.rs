//! Global configuration persistence
//!
//! The `config` table holds a single row keyed `global`. It is created on
//! first access and carries the backup history alongside the settings.

use super::codec::{decode_enum, decode_json, decode_time, encode_json, encode_time, merge_object};
use crate::error::{AgentSyncError, Result};
use crate::models::{BackupMetadata, GlobalConfig, GLOBAL_CONFIG_ID};
use chrono::Utc;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

const ENTITY: &str = "config";

const SELECT_GLOBAL: &str = "SELECT id, max_agents, default_mode, auto_accept, settings, version, \
     backup_metadata, created_at, updated_at FROM config WHERE id = ?";

const UPSERT_GLOBAL: &str = "INSERT INTO config \
     (id, max_agents, default_mode, auto_accept, settings, version, backup_metadata, created_at, updated_at) \
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
     ON CONFLICT(id) DO UPDATE SET \
     max_agents = excluded.max_agents, \
     default_mode = excluded.default_mode, \
     auto_accept = excluded.auto_accept, \
     settings = excluded.settings, \
     version = excluded.version, \
     backup_metadata = excluded.backup_metadata, \
     updated_at = excluded.updated_at";

/// Top-level config fields addressable by key; anything else lives in `settings`
const TOP_LEVEL_KEYS: &[&str] = &["maxAgents", "defaultMode", "autoAccept"];

/// Repository for the singleton [`GlobalConfig`]
pub struct ConfigRepository;

impl ConfigRepository {
    fn from_row(row: &SqliteRow) -> Result<GlobalConfig> {
        let default_mode: String = row.try_get("default_mode")?;
        let settings: String = row.try_get("settings")?;
        let backup_metadata: String = row.try_get("backup_metadata")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;

        Ok(GlobalConfig {
            id: row.try_get("id")?,
            max_agents: row.try_get("max_agents")?,
            default_mode: decode_enum(ENTITY, "default_mode", &default_mode)?,
            auto_accept: row.try_get("auto_accept")?,
            settings: decode_json(ENTITY, "settings", &settings)?,
            version: row.try_get("version")?,
            backup_metadata: decode_json(ENTITY, "backup_metadata", &backup_metadata)?,
            created_at: decode_time(ENTITY, "created_at", &created_at)?,
            updated_at: decode_time(ENTITY, "updated_at", &updated_at)?,
        })
    }

    /// The global row, if it has been written
    pub async fn get_global(conn: &mut SqliteConnection) -> Result<Option<GlobalConfig>> {
        let row = sqlx::query(SELECT_GLOBAL)
            .bind(GLOBAL_CONFIG_ID)
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    /// The global row, inserting defaults when absent
    pub async fn ensure_global(conn: &mut SqliteConnection) -> Result<GlobalConfig> {
        if let Some(config) = Self::get_global(conn).await? {
            return Ok(config);
        }
        let config = GlobalConfig::default();
        Self::save_global(conn, &config).await?;
        Ok(config)
    }

    pub async fn save_global(conn: &mut SqliteConnection, config: &GlobalConfig) -> Result<()> {
        sqlx::query(UPSERT_GLOBAL)
            .bind(GLOBAL_CONFIG_ID)
            .bind(config.max_agents)
            .bind(config.default_mode.as_str())
            .bind(config.auto_accept)
            .bind(encode_json(&config.settings)?)
            .bind(config.version.clone())
            .bind(encode_json(&config.backup_metadata)?)
            .bind(encode_time(&config.created_at))
            .bind(encode_time(&config.updated_at))
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Merge camelCase `changes` over the stored config
    ///
    /// `id` and `backupMetadata` are not writable this way.
    pub async fn update_global(conn: &mut SqliteConnection, changes: &Value) -> Result<GlobalConfig> {
        let current = Self::ensure_global(conn).await?;
        let mut merged = serde_json::to_value(&current)?;
        merge_object(&mut merged, changes)?;

        let mut updated: GlobalConfig = serde_json::from_value(merged)
            .map_err(|e| AgentSyncError::validation(format!("Invalid config change: {}", e)))?;
        updated.id = current.id;
        updated.backup_metadata = current.backup_metadata;
        updated.created_at = current.created_at;
        updated.updated_at = Utc::now();

        Self::save_global(conn, &updated).await?;
        Ok(updated)
    }

    /// Look up a top-level field or a key in `settings`
    pub async fn get_value(conn: &mut SqliteConnection, key: &str) -> Result<Option<Value>> {
        let config = Self::ensure_global(conn).await?;
        if TOP_LEVEL_KEYS.contains(&key) {
            let json = serde_json::to_value(&config)?;
            return Ok(json.get(key).cloned());
        }
        Ok(config.settings.get(key).cloned())
    }

    /// Write a top-level field or a key in `settings`
    pub async fn set_value(
        conn: &mut SqliteConnection,
        key: &str,
        value: Value,
    ) -> Result<GlobalConfig> {
        if TOP_LEVEL_KEYS.contains(&key) {
            let mut changes = serde_json::Map::new();
            changes.insert(key.to_string(), value);
            return Self::update_global(conn, &Value::Object(changes)).await;
        }

        let mut config = Self::ensure_global(conn).await?;
        config.settings.insert(key.to_string(), value);
        config.updated_at = Utc::now();
        Self::save_global(conn, &config).await?;
        Ok(config)
    }

    pub async fn backup_history(conn: &mut SqliteConnection) -> Result<Vec<BackupMetadata>> {
        Ok(Self::ensure_global(conn).await?.backup_metadata)
    }

    pub async fn set_backup_history(
        conn: &mut SqliteConnection,
        history: &[BackupMetadata],
    ) -> Result<()> {
        let mut config = Self::ensure_global(conn).await?;
        config.backup_metadata = history.to_vec();
        config.updated_at = Utc::now();
        Self::save_global(conn, &config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::AgentMode;
    use chrono::SubsecRound;
    use serde_json::json;

    #[tokio::test]
    async fn test_ensure_global_creates_once() {
        let db = Database::open_in_memory().await.unwrap();
        let mut conn = db.acquire().await.unwrap();

        assert!(ConfigRepository::get_global(&mut conn).await.unwrap().is_none());
        let created = ConfigRepository::ensure_global(&mut conn).await.unwrap();
        let again = ConfigRepository::ensure_global(&mut conn).await.unwrap();
        assert_eq!(created.id, "global");
        assert_eq!(again.created_at, created.created_at.trunc_subsecs(3));
    }

    #[tokio::test]
    async fn test_update_global_merges() {
        let db = Database::open_in_memory().await.unwrap();
        let mut conn = db.acquire().await.unwrap();

        let updated = ConfigRepository::update_global(
            &mut conn,
            &json!({"maxAgents": 25, "defaultMode": "tmux", "id": "other"}),
        )
        .await
        .unwrap();
        assert_eq!(updated.max_agents, 25);
        assert_eq!(updated.default_mode, AgentMode::Tmux);
        assert_eq!(updated.id, "global");

        let err = ConfigRepository::update_global(&mut conn, &json!({"defaultMode": "vm"}))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentSyncError::Validation(_)));
    }

    #[tokio::test]
    async fn test_keyed_values() {
        let db = Database::open_in_memory().await.unwrap();
        let mut conn = db.acquire().await.unwrap();

        ConfigRepository::set_value(&mut conn, "dockerImage", json!("node:20"))
            .await
            .unwrap();
        ConfigRepository::set_value(&mut conn, "autoAccept", json!(true))
            .await
            .unwrap();

        assert_eq!(
            ConfigRepository::get_value(&mut conn, "dockerImage").await.unwrap(),
            Some(json!("node:20"))
        );
        assert_eq!(
            ConfigRepository::get_value(&mut conn, "autoAccept").await.unwrap(),
            Some(json!(true))
        );
        assert_eq!(ConfigRepository::get_value(&mut conn, "missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_backup_history_round_trip() {
        let db = Database::open_in_memory().await.unwrap();
        let mut conn = db.acquire().await.unwrap();

        let record = BackupMetadata {
            id: "b1".into(),
            timestamp: Utc::now(),
            path: "/tmp/backup-1.db".into(),
            size: 4096,
            description: None,
            auto_created: true,
            version: 2,
        };
        ConfigRepository::set_backup_history(&mut conn, &[record])
            .await
            .unwrap();

        let history = ConfigRepository::backup_history(&mut conn).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].size, 4096);
        assert!(history[0].auto_created);
    }
}

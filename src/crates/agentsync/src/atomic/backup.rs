//! Snapshot backups, restore and retention
//!
//! Snapshots are whole-file copies named `backup-<timestamp>-<id>.db` in the
//! backup directory. Their history lives in the global config row, so a
//! restore merges the pre-restore history back into the restored store.

use super::AtomicOperations;
use crate::db::migrations;
use crate::error::{AgentSyncError, Result};
use crate::models::BackupMetadata;
use crate::repositories::ConfigRepository;
use chrono::{Duration, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection, SqliteConnection};
use std::collections::HashSet;
use std::path::Path;
use tokio::io::AsyncReadExt;
use tracing::{info, warn};
use uuid::Uuid;

const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";

const PRE_RESTORE_DESCRIPTION: &str = "Pre-restore backup";

/// Controls for [`AtomicOperations::restore_from_backup`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Check that the snapshot exists, is non-empty and is a SQLite file
    pub validate_before_restore: bool,
    /// Snapshot the current store first
    pub create_backup_before_restore: bool,
    /// Allow snapshots from a newer schema
    pub skip_version_check: bool,
    /// Validate only; leave the store untouched
    pub dry_run: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            validate_before_restore: true,
            create_backup_before_restore: true,
            skip_version_check: false,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestoreOutcome {
    /// True when the store was restored (or would be, for a dry run) with no
    /// integrity issues
    pub success: bool,
    pub dry_run: bool,
    pub backup_version: i64,
    pub pre_restore_backup: Option<BackupMetadata>,
    pub integrity_issues: Vec<String>,
}

impl AtomicOperations {
    /// Snapshot the store and record it in the backup history
    ///
    /// A backup without a description is marked `auto_created` and is subject
    /// to retention pruning.
    pub async fn create_backup(&self, description: Option<&str>) -> Result<BackupMetadata> {
        if self.db.is_read_only() {
            return Err(AgentSyncError::WriteOnReadOnly(
                "backup history cannot be recorded on a read-only store".to_string(),
            ));
        }

        let id = Uuid::new_v4().simple().to_string();
        let timestamp = Utc::now();
        let file_name = format!("backup-{}-{}.db", timestamp.format("%Y%m%dT%H%M%S%3fZ"), id);
        let path = self.backup_dir.join(file_name);

        self.db.backup(&path).await?;
        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|e| AgentSyncError::Backup(format!("Failed to stat {}: {}", path.display(), e)))?
            .len();

        let record = BackupMetadata {
            id,
            timestamp,
            path: path.display().to_string(),
            size,
            description: description.map(str::to_string),
            auto_created: description.is_none(),
            version: self.db.version(),
        };

        let mut conn = self.db.acquire().await?;
        let mut history = ConfigRepository::backup_history(&mut conn).await?;
        history.push(record.clone());
        ConfigRepository::set_backup_history(&mut conn, &history).await?;

        info!(
            backup_id = %record.id,
            path = %record.path,
            size,
            auto_created = record.auto_created,
            "Backup created"
        );
        Ok(record)
    }

    pub async fn backup_history(&self) -> Result<Vec<BackupMetadata>> {
        let mut conn = self.db.acquire().await?;
        ConfigRepository::backup_history(&mut conn).await
    }

    /// Replace the store with the snapshot at `path`
    pub async fn restore_from_backup(
        &self,
        path: &Path,
        options: RestoreOptions,
    ) -> Result<RestoreOutcome> {
        if self.db.is_read_only() && !options.dry_run {
            return Err(AgentSyncError::WriteOnReadOnly(
                "restore requires a writable store".to_string(),
            ));
        }
        if options.validate_before_restore {
            validate_snapshot(path).await?;
        }

        let backup_version = snapshot_version(path).await?;
        if !options.skip_version_check && backup_version > self.db.latest_version() {
            return Err(AgentSyncError::Backup(format!(
                "Backup schema version {} is newer than supported version {}",
                backup_version,
                self.db.latest_version()
            )));
        }

        if options.dry_run {
            info!(path = %path.display(), backup_version, "Restore dry run passed");
            return Ok(RestoreOutcome {
                success: true,
                dry_run: true,
                backup_version,
                pre_restore_backup: None,
                integrity_issues: Vec::new(),
            });
        }

        let pre_restore_backup = if options.create_backup_before_restore {
            Some(self.create_backup(Some(PRE_RESTORE_DESCRIPTION)).await?)
        } else {
            None
        };
        let previous_history = self.backup_history().await?;

        self.db.restore(path).await?;

        let mut conn = self.db.acquire().await?;
        let mut history = ConfigRepository::backup_history(&mut conn).await?;
        let known: HashSet<String> = history.iter().map(|b| b.id.clone()).collect();
        history.extend(
            previous_history
                .into_iter()
                .filter(|b| !known.contains(&b.id)),
        );
        history.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        ConfigRepository::set_backup_history(&mut conn, &history).await?;

        let integrity_issues = integrity_check(&mut conn).await?;
        for issue in &integrity_issues {
            warn!(issue = %issue, "Restored store failed sanity check");
        }

        info!(
            path = %path.display(),
            backup_version,
            issues = integrity_issues.len(),
            "Backup restored"
        );
        Ok(RestoreOutcome {
            success: integrity_issues.is_empty(),
            dry_run: false,
            backup_version,
            pre_restore_backup,
            integrity_issues,
        })
    }

    /// Prune the backup history
    ///
    /// Manual backups are always kept. Automatic backups are kept when newer
    /// than `retention_days`, newest first, up to `max_backups`. Returns the
    /// number of records removed.
    pub async fn cleanup_old_backups(&self, retention_days: i64, max_backups: usize) -> Result<usize> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let history = self.backup_history().await?;

        let mut recent_auto: Vec<&BackupMetadata> = history
            .iter()
            .filter(|b| b.auto_created && b.timestamp > cutoff)
            .collect();
        recent_auto.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let keep_auto: HashSet<&str> = recent_auto
            .iter()
            .take(max_backups)
            .map(|b| b.id.as_str())
            .collect();

        let (kept, removed): (Vec<BackupMetadata>, Vec<BackupMetadata>) = history
            .iter()
            .cloned()
            .partition(|b| !b.auto_created || keep_auto.contains(b.id.as_str()));

        for record in &removed {
            match tokio::fs::remove_file(&record.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %record.path, error = %e, "Failed to delete backup file"),
            }
        }

        if !removed.is_empty() {
            let mut conn = self.db.acquire().await?;
            ConfigRepository::set_backup_history(&mut conn, &kept).await?;
        }

        info!(
            removed = removed.len(),
            kept = kept.len(),
            retention_days,
            max_backups,
            "Backups pruned"
        );
        Ok(removed.len())
    }
}

async fn validate_snapshot(path: &Path) -> Result<()> {
    let mut file = tokio::fs::File::open(path).await.map_err(|e| {
        AgentSyncError::Backup(format!("Backup {} not readable: {}", path.display(), e))
    })?;
    let len = file.metadata().await?.len();
    if len == 0 {
        return Err(AgentSyncError::Backup(format!("Backup {} is empty", path.display())));
    }

    let mut header = [0u8; 16];
    let read = file.read(&mut header).await?;
    if read < header.len() || &header != SQLITE_HEADER {
        return Err(AgentSyncError::Backup(format!(
            "Backup {} is not a SQLite database",
            path.display()
        )));
    }
    Ok(())
}

/// Schema version recorded inside a snapshot, read without modifying it
async fn snapshot_version(path: &Path) -> Result<i64> {
    let mut conn = SqliteConnectOptions::new()
        .filename(path)
        .read_only(true)
        .connect()
        .await
        .map_err(|e| AgentSyncError::Backup(format!("Cannot open backup {}: {}", path.display(), e)))?;
    let version = migrations::current_version(&mut conn).await;
    conn.close().await?;
    version
}

/// Dangling references left behind by a restore
async fn integrity_check(conn: &mut SqliteConnection) -> Result<Vec<String>> {
    const CHECKS: &[(&str, &str)] = &[
        (
            "agents reference a missing project",
            "SELECT COUNT(*) FROM agents WHERE project_id IS NOT NULL \
             AND project_id NOT IN (SELECT id FROM projects)",
        ),
        (
            "tasks reference a missing project",
            "SELECT COUNT(*) FROM tasks WHERE project_id NOT IN (SELECT id FROM projects)",
        ),
        (
            "tasks are assigned to a missing agent",
            "SELECT COUNT(*) FROM tasks WHERE assigned_to_agent_id IS NOT NULL \
             AND assigned_to_agent_id NOT IN (SELECT id FROM agents)",
        ),
    ];

    let mut issues = Vec::new();
    for (label, sql) in CHECKS {
        let count: i64 = sqlx::query_scalar(sql).fetch_one(&mut *conn).await?;
        if count > 0 {
            issues.push(format!("{} {}", count, label));
        }
    }
    Ok(issues)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, StoreConfig};
    use crate::models::{Agent, Project};
    use crate::repositories::{AgentRepository, ProjectRepository};
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn file_store(dir: &TempDir) -> AtomicOperations {
        let db = Database::open(StoreConfig::file(dir.path().join("store.db")))
            .await
            .unwrap();
        AtomicOperations::new(Arc::new(db), dir.path().join("backups"))
    }

    async fn seed(ops: &AtomicOperations) {
        let mut conn = ops.database().acquire().await.unwrap();
        ProjectRepository::create(&mut conn, &Project::new("p1", "demo", "/work/demo"))
            .await
            .unwrap();
        let mut agent = Agent::new("a1", "worker", "feature/x").with_project("p1");
        agent.tags = vec!["fast".into()];
        AgentRepository::create(&mut conn, &agent).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_backup_records_history() {
        let dir = TempDir::new().unwrap();
        let ops = file_store(&dir).await;

        let auto = ops.create_backup(None).await.unwrap();
        let manual = ops.create_backup(Some("before upgrade")).await.unwrap();

        assert!(auto.auto_created);
        assert!(!manual.auto_created);
        assert!(auto.size > 0);
        assert!(Path::new(&auto.path).exists());
        assert!(auto.path.contains("backup-"));
        assert_eq!(auto.version, ops.database().version());

        let history = ops.backup_history().await.unwrap();
        let ids: Vec<_> = history.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec![auto.id.as_str(), manual.id.as_str()]);
    }

    #[tokio::test]
    async fn test_in_memory_backup_fails() {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        let dir = TempDir::new().unwrap();
        let ops = AtomicOperations::new(db, dir.path());
        let err = ops.create_backup(None).await.unwrap_err();
        assert!(matches!(err, AgentSyncError::Backup(_)));
    }

    #[tokio::test]
    async fn test_restore_reproduces_entities() {
        let dir = TempDir::new().unwrap();
        let ops = file_store(&dir).await;
        seed(&ops).await;

        let snapshot = ops.create_backup(Some("baseline")).await.unwrap();
        let before = {
            let mut conn = ops.database().acquire().await.unwrap();
            AgentRepository::find_all(&mut conn).await.unwrap()
        };

        {
            let mut conn = ops.database().acquire().await.unwrap();
            AgentRepository::delete(&mut conn, "a1").await.unwrap();
            ProjectRepository::create(&mut conn, &Project::new("p2", "extra", "/work/extra"))
                .await
                .unwrap();
        }

        let outcome = ops
            .restore_from_backup(Path::new(&snapshot.path), RestoreOptions::default())
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(outcome.integrity_issues.is_empty());
        let pre = outcome.pre_restore_backup.unwrap();
        assert_eq!(pre.description.as_deref(), Some("Pre-restore backup"));

        let mut conn = ops.database().acquire().await.unwrap();
        let after = AgentRepository::find_all(&mut conn).await.unwrap();
        assert_eq!(after, before);
        assert!(!ProjectRepository::exists(&mut conn, "p2").await.unwrap());
        drop(conn);

        let history = ops.backup_history().await.unwrap();
        assert!(history.iter().any(|b| b.id == snapshot.id));
        assert!(history.iter().any(|b| b.id == pre.id));
    }

    #[tokio::test]
    async fn test_dry_run_leaves_store_untouched() {
        let dir = TempDir::new().unwrap();
        let ops = file_store(&dir).await;
        let snapshot = ops.create_backup(None).await.unwrap();
        seed(&ops).await;

        let outcome = ops
            .restore_from_backup(
                Path::new(&snapshot.path),
                RestoreOptions {
                    dry_run: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(outcome.dry_run);
        assert!(outcome.pre_restore_backup.is_none());

        let mut conn = ops.database().acquire().await.unwrap();
        assert_eq!(AgentRepository::count(&mut conn).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_invalid_snapshots_are_rejected() {
        let dir = TempDir::new().unwrap();
        let ops = file_store(&dir).await;

        let empty = dir.path().join("empty.db");
        std::fs::write(&empty, b"").unwrap();
        let garbage = dir.path().join("garbage.db");
        std::fs::write(&garbage, b"definitely not a database file").unwrap();

        for path in [empty, garbage, dir.path().join("missing.db")] {
            let err = ops
                .restore_from_backup(&path, RestoreOptions::default())
                .await
                .unwrap_err();
            assert!(matches!(err, AgentSyncError::Backup(_)), "{}", path.display());
        }
    }

    #[tokio::test]
    async fn test_newer_schema_is_refused() {
        let dir = TempDir::new().unwrap();
        let ops = file_store(&dir).await;

        let newer_path = dir.path().join("newer.db");
        let mut schema = migrations::MIGRATIONS.to_vec();
        schema.push(migrations::SchemaMigration {
            version: 99,
            name: "future",
            sql: "CREATE TABLE future (id TEXT PRIMARY KEY);",
        });
        let newer = Database::new(StoreConfig::file(&newer_path)).with_migrations(schema);
        newer.initialize().await.unwrap();
        newer.close().await;

        let err = ops
            .restore_from_backup(&newer_path, RestoreOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("newer"));
    }

    #[tokio::test]
    async fn test_cleanup_keeps_manual_and_recent_auto() {
        let dir = TempDir::new().unwrap();
        let ops = file_store(&dir).await;
        let now = Utc::now();

        let record = |id: &str, days_old: i64, auto_created: bool| {
            let path = dir.path().join(format!("{}.db", id));
            // b3 is left without a file on disk
            if id != "b3" {
                std::fs::write(&path, b"snapshot").unwrap();
            }
            BackupMetadata {
                id: id.to_string(),
                timestamp: now - Duration::days(days_old),
                path: path.display().to_string(),
                size: 8,
                description: (!auto_created).then(|| format!("manual {}", id)),
                auto_created,
                version: 2,
            }
        };
        let history = vec![
            record("m1", 90, false),
            record("m2", 45, false),
            record("b1", 60, true),
            record("b2", 50, true),
            record("b3", 40, true),
            record("b4", 31, true),
            record("b5", 5, true),
            record("b6", 1, true),
        ];
        {
            let mut conn = ops.database().acquire().await.unwrap();
            ConfigRepository::set_backup_history(&mut conn, &history)
                .await
                .unwrap();
        }

        let removed = ops.cleanup_old_backups(30, 5).await.unwrap();
        assert_eq!(removed, 4);

        let kept: Vec<String> = ops
            .backup_history()
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(kept, vec!["m1", "m2", "b5", "b6"]);
        assert!(!dir.path().join("b1.db").exists());
        assert!(dir.path().join("m1.db").exists());
        assert!(dir.path().join("b6.db").exists());
    }

    #[tokio::test]
    async fn test_cleanup_caps_recent_auto_backups() {
        let dir = TempDir::new().unwrap();
        let ops = file_store(&dir).await;
        for _ in 0..4 {
            ops.create_backup(None).await.unwrap();
        }
        let manual = ops.create_backup(Some("keep me")).await.unwrap();

        assert_eq!(ops.cleanup_old_backups(30, 2).await.unwrap(), 2);
        let history = ops.backup_history().await.unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.iter().any(|b| b.id == manual.id));
    }
}

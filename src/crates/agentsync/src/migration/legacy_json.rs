//! Import of the legacy JSON file layout
//!
//! Reads `<data_dir>/projects/projects.json` and one file per agent under
//! `<data_dir>/agents/`, converts them into the unified models and writes them
//! through the repositories. Each source file is copied to the backup
//! directory before it is read so [`LegacyJsonMigration::rollback`] can put it
//! back.

use super::{
    DataMigration, MigrationConfig, MigrationItemError, MigrationPhase, MigrationProgress,
    MigrationReport, MigrationState, ProgressCallback,
};
use crate::db::Database;
use crate::error::{AgentSyncError, Result};
use crate::models::{Agent, AgentMode, AgentStatus, Metadata, Project, ProjectStatus};
use crate::repositories::{AgentRepository, ProjectRepository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
struct LegacyProjectFile {
    #[serde(default)]
    projects: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyProject {
    id: String,
    name: Option<String>,
    path: Option<String>,
    status: Option<String>,
    #[serde(default)]
    agent_ids: Vec<String>,
    max_agents: Option<i64>,
    task_master_enabled: Option<bool>,
    description: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    metadata: Metadata,
    git_branch: Option<String>,
    git_remote: Option<String>,
    port_range: Option<Value>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

impl LegacyProject {
    fn into_project(self) -> Result<Project> {
        let path = self
            .path
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| AgentSyncError::validation(format!("project {} has no path", self.id)))?;

        let now = Utc::now();
        let mut metadata = self.metadata;
        if self.git_branch.is_some() || self.git_remote.is_some() {
            metadata.insert(
                "gitRepository".to_string(),
                json!({
                    "branch": self.git_branch.unwrap_or_else(|| "main".to_string()),
                    "remote": self.git_remote,
                }),
            );
        }
        if let Some(port_range) = self.port_range {
            metadata.insert("portRange".to_string(), port_range);
        }

        Ok(Project {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            path,
            status: self
                .status
                .and_then(|s| s.to_lowercase().parse::<ProjectStatus>().ok())
                .unwrap_or_default(),
            agent_ids: self.agent_ids,
            max_agents: self.max_agents.filter(|n| *n > 0).unwrap_or(10),
            task_master_enabled: self.task_master_enabled.unwrap_or(true),
            description: self.description,
            tags: self.tags,
            metadata,
            created_at: self.created_at.unwrap_or(now),
            updated_at: self.updated_at.unwrap_or(now),
            last_accessed_at: None,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyAgent {
    id: String,
    name: Option<String>,
    project_id: Option<String>,
    status: Option<String>,
    docker_enabled: Option<bool>,
    branch: Option<String>,
    worktree_path: Option<String>,
    session_name: Option<String>,
    container_name: Option<String>,
    docker_image: Option<String>,
    auto_accept: Option<bool>,
    port: Option<u64>,
    #[serde(default)]
    environment: BTreeMap<String, String>,
    current_task_id: Option<String>,
    #[serde(default)]
    tasks_assigned: Vec<String>,
    description: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    metadata: Metadata,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    last_activity: Option<DateTime<Utc>>,
}

impl LegacyAgent {
    fn into_agent(self) -> Agent {
        let now = Utc::now();
        Agent {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            project_id: self.project_id.filter(|id| !id.is_empty()),
            status: self
                .status
                .and_then(|s| s.to_lowercase().parse::<AgentStatus>().ok())
                .unwrap_or(AgentStatus::Stopped),
            mode: if self.docker_enabled != Some(false) {
                AgentMode::Docker
            } else {
                AgentMode::Hybrid
            },
            branch: self.branch.unwrap_or_else(|| "main".to_string()),
            worktree_path: self.worktree_path,
            tmux_session: self.session_name,
            docker_container: self.container_name,
            docker_image: self.docker_image,
            port_range: self
                .port
                .map(|p| format!("{}-{}", p, p.saturating_add(10))),
            auto_accept: self.auto_accept.unwrap_or(false),
            environment_vars: self.environment,
            current_task_id: self.current_task_id,
            assigned_tasks: self.tasks_assigned,
            description: self.description,
            tags: self.tags,
            metadata: self.metadata,
            created_at: self.created_at.unwrap_or(now),
            updated_at: self.updated_at.unwrap_or(now),
            last_accessed_at: self.last_activity,
        }
    }
}

#[derive(Debug, Clone)]
struct BackupRecord {
    original: PathBuf,
    backup: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteOutcome {
    Written,
    Skipped,
}

#[derive(Debug, Default)]
struct Tally {
    migrated: usize,
    skipped: usize,
    errors: Vec<MigrationItemError>,
}

impl Tally {
    fn record(&mut self, item: String, outcome: Result<WriteOutcome>) {
        match outcome {
            Ok(WriteOutcome::Written) => self.migrated += 1,
            Ok(WriteOutcome::Skipped) => self.skipped += 1,
            Err(e) => self.error(item, e),
        }
    }

    fn error(&mut self, item: impl Into<String>, err: impl Display) {
        let item = item.into();
        error!(item = %item, error = %err, "Failed to migrate item");
        self.errors.push(MigrationItemError {
            item,
            error: err.to_string(),
        });
    }
}

/// Migration of the legacy JSON files into the unified store
pub struct LegacyJsonMigration {
    db: Arc<Database>,
    config: MigrationConfig,
    state: MigrationState,
    backups: Vec<BackupRecord>,
    progress: Option<ProgressCallback>,
}

impl LegacyJsonMigration {
    pub fn new(db: Arc<Database>, config: MigrationConfig) -> Self {
        Self {
            db,
            config,
            state: MigrationState::Idle,
            backups: Vec::new(),
            progress: None,
        }
    }

    /// Register a callback fired after every item
    pub fn on_progress<F>(&mut self, callback: F)
    where
        F: Fn(&MigrationProgress) + Send + Sync + 'static,
    {
        self.progress = Some(Box::new(callback));
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    fn projects_file(&self) -> PathBuf {
        self.config.data_dir.join("projects").join("projects.json")
    }

    fn agents_dir(&self) -> PathBuf {
        self.config.data_dir.join("agents")
    }

    fn report_progress(&self, progress: MigrationProgress) {
        if self.config.verbose {
            info!(
                phase = ?progress.phase,
                current = progress.current,
                total = progress.total,
                percentage = progress.percentage,
                "Migration progress"
            );
        }
        if let Some(callback) = &self.progress {
            callback(&progress);
        }
    }

    async fn backup_source(&mut self, path: &Path) -> Result<()> {
        if self.config.dry_run {
            info!(path = %path.display(), "[dry run] Would back up source");
            return Ok(());
        }

        let file_name = path
            .file_name()
            .ok_or_else(|| AgentSyncError::Backup(format!("{} has no file name", path.display())))?
            .to_string_lossy()
            .into_owned();
        let timestamp = Utc::now().format("%Y-%m-%dT%H-%M-%S-%3fZ");
        let backup = self
            .config
            .backup_dir
            .join(format!("{}.{}.backup", file_name, timestamp));

        tokio::fs::create_dir_all(&self.config.backup_dir).await?;
        tokio::fs::copy(path, &backup).await.map_err(|e| {
            AgentSyncError::Backup(format!("Failed to back up {}: {}", path.display(), e))
        })?;

        debug!(source = %path.display(), backup = %backup.display(), "Source backed up");
        self.backups.push(BackupRecord {
            original: path.to_path_buf(),
            backup,
        });
        Ok(())
    }

    async fn migrate_projects(&mut self, tally: &mut Tally) {
        let path = self.projects_file();
        if !path.exists() {
            warn!(path = %path.display(), "No legacy projects file, skipping project migration");
            return;
        }

        if let Err(e) = self.backup_source(&path).await {
            tally.error("projects.json", e);
            return;
        }

        let raw = match read_json::<LegacyProjectFile>(&path).await {
            Ok(file) => file.projects,
            Err(e) => {
                tally.error("projects.json", e);
                return;
            }
        };

        let total = raw.len();
        info!(total, "Migrating projects");
        for (index, value) in raw.into_iter().enumerate() {
            let item = match value.get("id").and_then(Value::as_str) {
                Some(id) => format!("project {}", id),
                None => format!("project #{}", index),
            };

            let outcome = match serde_json::from_value::<LegacyProject>(value) {
                Ok(legacy) => match legacy.into_project() {
                    Ok(project) => self.write_project(&project).await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e.into()),
            };
            tally.record(item, outcome);
            self.report_progress(MigrationProgress::new(MigrationPhase::Projects, index + 1, total));
        }
    }

    async fn migrate_agents(&mut self, tally: &mut Tally) {
        let dir = self.agents_dir();
        if !dir.is_dir() {
            warn!(path = %dir.display(), "No legacy agents directory, skipping agent migration");
            return;
        }

        let files = match list_json_files(&dir).await {
            Ok(files) => files,
            Err(e) => {
                tally.error("agents", e);
                return;
            }
        };

        let total = files.len();
        info!(total, "Migrating agents");
        for (index, file) in files.iter().enumerate() {
            let item = format!(
                "agent {}",
                file.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
            );
            let outcome = self.migrate_agent_file(file).await;
            tally.record(item, outcome);
            self.report_progress(MigrationProgress::new(MigrationPhase::Agents, index + 1, total));
        }
    }

    async fn migrate_agent_file(&mut self, file: &Path) -> Result<WriteOutcome> {
        self.backup_source(file).await?;
        let legacy: LegacyAgent = read_json(file).await?;
        let mut agent = legacy.into_agent();
        self.assign_project(&mut agent).await?;
        self.write_agent(&agent).await
    }

    /// Attach an agent without a project to one that contains its worktree,
    /// creating a project from the worktree's parent directory if none does
    async fn assign_project(&self, agent: &mut Agent) -> Result<()> {
        if self.config.dry_run || agent.project_id.is_some() {
            return Ok(());
        }
        let Some(worktree) = agent.worktree_path.clone() else {
            return Ok(());
        };
        let worktree = PathBuf::from(worktree);

        let mut conn = self.db.acquire().await?;
        let projects = ProjectRepository::find_all(&mut conn).await?;
        if let Some(project) = projects.iter().find(|p| worktree.starts_with(&p.path)) {
            info!(agent = %agent.name, project = %project.name, "Assigned orphaned agent to project");
            agent.project_id = Some(project.id.clone());
            return Ok(());
        }

        let parent = worktree
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or_else(|| {
                AgentSyncError::validation(format!(
                    "worktree {} has no parent directory",
                    worktree.display()
                ))
            })?;
        let name = parent
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| parent.display().to_string());

        let mut project = Project::new(
            format!("proj-{}", Uuid::new_v4().simple()),
            name,
            parent.display().to_string(),
        )
        .with_description(format!("Auto-created for agent {}", agent.name));
        project.agent_ids = vec![agent.id.clone()];
        project.task_master_enabled = false;
        ProjectRepository::create(&mut conn, &project).await?;

        info!(agent = %agent.name, project = %project.name, "Created project for orphaned agent");
        agent.project_id = Some(project.id);
        Ok(())
    }

    async fn write_project(&self, project: &Project) -> Result<WriteOutcome> {
        if self.config.dry_run {
            return Ok(WriteOutcome::Written);
        }
        let mut conn = self.db.acquire().await?;
        if ProjectRepository::exists(&mut conn, &project.id).await? {
            if !self.config.force {
                debug!(id = %project.id, "Project already exists, skipping");
                return Ok(WriteOutcome::Skipped);
            }
            ProjectRepository::upsert(&mut conn, project).await?;
        } else {
            ProjectRepository::create(&mut conn, project).await?;
        }
        if self.config.verbose {
            info!(id = %project.id, name = %project.name, "Migrated project");
        }
        Ok(WriteOutcome::Written)
    }

    async fn write_agent(&self, agent: &Agent) -> Result<WriteOutcome> {
        if self.config.dry_run {
            return Ok(WriteOutcome::Written);
        }
        let mut conn = self.db.acquire().await?;
        if AgentRepository::exists(&mut conn, &agent.id).await? {
            if !self.config.force {
                debug!(id = %agent.id, "Agent already exists, skipping");
                return Ok(WriteOutcome::Skipped);
            }
            AgentRepository::upsert(&mut conn, agent).await?;
        } else {
            AgentRepository::create(&mut conn, agent).await?;
        }
        if self.config.verbose {
            info!(id = %agent.id, name = %agent.name, "Migrated agent");
        }
        Ok(WriteOutcome::Written)
    }

    async fn legacy_project_ids(&self) -> Result<Vec<String>> {
        let path = self.projects_file();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file: LegacyProjectFile = read_json(&path).await?;
        Ok(file
            .projects
            .iter()
            .filter_map(|p| p.get("id").and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    async fn legacy_agent_ids(&self) -> Result<Vec<String>> {
        let dir = self.agents_dir();
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for file in list_json_files(&dir).await? {
            let value: Value = read_json(&file).await?;
            if let Some(id) = value.get("id").and_then(Value::as_str) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl DataMigration for LegacyJsonMigration {
    fn name(&self) -> &str {
        "legacy_json"
    }

    fn state(&self) -> MigrationState {
        self.state
    }

    async fn migrate(&mut self) -> Result<MigrationReport> {
        if self.state == MigrationState::Running {
            return Err(AgentSyncError::validation("Migration is already running"));
        }

        self.state = MigrationState::Running;
        self.backups.clear();
        let started = Instant::now();
        info!(
            data_dir = %self.config.data_dir.display(),
            dry_run = self.config.dry_run,
            force = self.config.force,
            "Starting legacy JSON migration"
        );

        if !self.config.dry_run {
            if let Err(e) = self.db.initialize().await {
                self.state = MigrationState::Failed;
                return Err(e);
            }
        }

        let mut tally = Tally::default();
        self.migrate_projects(&mut tally).await;
        self.migrate_agents(&mut tally).await;

        let processed = tally.migrated + tally.skipped + tally.errors.len();
        self.report_progress(MigrationProgress::new(
            MigrationPhase::Complete,
            processed,
            processed,
        ));

        let report = MigrationReport {
            success: tally.errors.is_empty(),
            items_migrated: tally.migrated,
            items_skipped: tally.skipped,
            errors: tally.errors,
            backup_paths: self.backups.iter().map(|b| b.backup.clone()).collect(),
            duration: started.elapsed(),
        };

        if report.success {
            self.state = MigrationState::Succeeded;
            info!(
                migrated = report.items_migrated,
                skipped = report.items_skipped,
                duration_ms = report.duration.as_millis() as u64,
                "Legacy JSON migration completed"
            );
        } else {
            self.state = MigrationState::Failed;
            warn!(
                migrated = report.items_migrated,
                skipped = report.items_skipped,
                errors = report.errors.len(),
                "Legacy JSON migration completed with errors"
            );
        }

        Ok(report)
    }

    async fn rollback(&mut self) -> Result<()> {
        if !matches!(
            self.state,
            MigrationState::Succeeded | MigrationState::Failed
        ) {
            return Err(AgentSyncError::validation(format!(
                "Cannot roll back a migration in state {}",
                self.state
            )));
        }

        info!(backups = self.backups.len(), "Rolling back legacy JSON migration");
        for record in std::mem::take(&mut self.backups) {
            if !record.backup.exists() {
                warn!(backup = %record.backup.display(), "Backup missing, cannot restore");
                continue;
            }
            tokio::fs::copy(&record.backup, &record.original).await?;
            tokio::fs::remove_file(&record.backup).await?;
            info!(path = %record.original.display(), "Restored source");
        }

        self.db.close().await;
        if let Some(path) = self.db.path() {
            let db_path = path.display().to_string();
            for candidate in [db_path.clone(), format!("{}-wal", db_path), format!("{}-shm", db_path)] {
                match tokio::fs::remove_file(&candidate).await {
                    Ok(()) => info!(path = %candidate, "Removed store file"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        self.state = MigrationState::RolledBack;
        info!("Rollback completed");
        Ok(())
    }

    async fn verify(&self) -> Result<bool> {
        self.db.initialize().await?;
        let project_ids = self.legacy_project_ids().await?;
        let agent_ids = self.legacy_agent_ids().await?;

        let mut conn = self.db.acquire().await?;

        let mut found = 0;
        for id in &project_ids {
            if ProjectRepository::exists(&mut conn, id).await? {
                found += 1;
            }
        }
        if found != project_ids.len() {
            error!(expected = project_ids.len(), found, "Project count mismatch");
            return Ok(false);
        }

        let mut found = 0;
        for id in &agent_ids {
            if AgentRepository::exists(&mut conn, id).await? {
                found += 1;
            }
        }
        if found != agent_ids.len() {
            error!(expected = agent_ids.len(), found, "Agent count mismatch");
            return Ok(false);
        }

        info!(
            projects = project_ids.len(),
            agents = agent_ids.len(),
            "Migration verified"
        );
        Ok(true)
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = tokio::fs::read_to_string(path).await?;
    serde_json::from_str(&content).map_err(|e| {
        AgentSyncError::validation(format!("Malformed JSON in {}: {}", path.display(), e))
    })
}

/// `*.json` files in `dir`, sorted by name
async fn list_json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StoreConfig;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn write(path: &Path, value: Value) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
    }

    fn seed_legacy(data: &Path) {
        write(
            &data.join("projects/projects.json"),
            json!({"projects": [
                {"id": "p1", "name": "demo", "path": "/work/demo", "gitBranch": "develop"},
                {"id": "p2", "name": "docs", "path": "/work/docs", "status": "ARCHIVED", "maxAgents": 3}
            ]}),
        );
        write(
            &data.join("agents/a1.json"),
            json!({
                "id": "a1", "name": "frontend", "projectId": "p1", "status": "RUNNING",
                "branch": "feature/ui", "port": 3000, "dockerEnabled": false,
                "worktreePath": "/work/demo/ui", "environment": {"NODE_ENV": "dev"}
            }),
        );
        write(
            &data.join("agents/a2.json"),
            json!({"id": "a2", "name": "orphan", "projectId": "", "worktreePath": "/work/demo/orphan-tree"}),
        );
        write(
            &data.join("agents/a3.json"),
            json!({"id": "a3", "name": "stray", "status": "weird", "worktreePath": "/srv/sandbox/stray"}),
        );
        std::fs::write(data.join("agents/notes.txt"), "not an agent").unwrap();
    }

    async fn memory_db() -> Arc<Database> {
        Arc::new(Database::open_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_migrates_projects_and_agents() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        seed_legacy(&data);
        let db = memory_db().await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut migration = LegacyJsonMigration::new(
            db.clone(),
            MigrationConfig::new(&data, dir.path().join("backups")),
        );
        migration.on_progress(move |p| sink.lock().unwrap().push(p.clone()));

        let report = migration.migrate().await.unwrap();
        assert!(report.success, "errors: {:?}", report.errors);
        assert_eq!(report.items_migrated, 5);
        assert_eq!(report.backup_paths.len(), 4);
        assert!(report.backup_paths.iter().all(|p| p.exists()));
        assert_eq!(migration.state(), MigrationState::Succeeded);

        let mut conn = db.acquire().await.unwrap();
        let p1 = ProjectRepository::get(&mut conn, "p1").await.unwrap();
        assert!(p1.task_master_enabled);
        assert_eq!(p1.metadata["gitRepository"]["branch"], "develop");
        let p2 = ProjectRepository::get(&mut conn, "p2").await.unwrap();
        assert_eq!(p2.status, ProjectStatus::Archived);
        assert_eq!(p2.max_agents, 3);

        let a1 = AgentRepository::get(&mut conn, "a1").await.unwrap();
        assert_eq!(a1.status, AgentStatus::Running);
        assert_eq!(a1.mode, AgentMode::Hybrid);
        assert_eq!(a1.port_range.as_deref(), Some("3000-3010"));
        assert_eq!(a1.environment_vars["NODE_ENV"], "dev");

        // Worktree under an existing project path
        let a2 = AgentRepository::get(&mut conn, "a2").await.unwrap();
        assert_eq!(a2.project_id.as_deref(), Some("p1"));
        assert_eq!(a2.mode, AgentMode::Docker);

        // No containing project: one is created from the parent directory
        let a3 = AgentRepository::get(&mut conn, "a3").await.unwrap();
        assert_eq!(a3.status, AgentStatus::Stopped);
        let created = ProjectRepository::get(&mut conn, a3.project_id.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(created.name, "sandbox");
        assert_eq!(created.path, "/srv/sandbox");
        assert_eq!(created.description.as_deref(), Some("Auto-created for agent stray"));
        drop(conn);
        assert!(migration.verify().await.unwrap());

        let seen = seen.lock().unwrap();
        assert_eq!(seen.first().unwrap().phase, MigrationPhase::Projects);
        let last = seen.last().unwrap();
        assert_eq!(last.phase, MigrationPhase::Complete);
        assert_eq!(last.percentage, 100);
    }

    #[tokio::test]
    async fn test_missing_sources_is_empty_success() {
        let dir = TempDir::new().unwrap();
        let mut migration = LegacyJsonMigration::new(
            memory_db().await,
            MigrationConfig::new(dir.path().join("nothing"), dir.path().join("backups")),
        );

        let report = migration.migrate().await.unwrap();
        assert!(report.success);
        assert_eq!(report.items_migrated, 0);
        assert!(report.backup_paths.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_source_is_reported_and_run_continues() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(data.join("projects")).unwrap();
        std::fs::write(data.join("projects/projects.json"), "{\"projects\": [").unwrap();
        write(
            &data.join("agents/a1.json"),
            json!({"id": "a1", "name": "solo", "branch": "main"}),
        );

        let mut migration = LegacyJsonMigration::new(
            memory_db().await,
            MigrationConfig::new(&data, dir.path().join("backups")),
        );
        let report = migration.migrate().await.unwrap();

        assert!(!report.success);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].item, "projects.json");
        assert_eq!(report.items_migrated, 1);
        assert_eq!(migration.state(), MigrationState::Failed);
    }

    #[tokio::test]
    async fn test_duplicates_skip_unless_forced() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        write(
            &data.join("projects/projects.json"),
            json!({"projects": [{"id": "p1", "name": "legacy-name", "path": "/work/demo"}]}),
        );
        let db = memory_db().await;
        {
            let mut conn = db.acquire().await.unwrap();
            ProjectRepository::create(&mut conn, &Project::new("p1", "current", "/work/demo"))
                .await
                .unwrap();
        }

        let config = MigrationConfig::new(&data, dir.path().join("backups"));
        let report = LegacyJsonMigration::new(db.clone(), config.clone())
            .migrate()
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.items_skipped, 1);
        assert_eq!(report.items_migrated, 0);

        let report = LegacyJsonMigration::new(db.clone(), config.force(true))
            .migrate()
            .await
            .unwrap();
        assert_eq!(report.items_migrated, 1);
        let mut conn = db.acquire().await.unwrap();
        assert_eq!(
            ProjectRepository::get(&mut conn, "p1").await.unwrap().name,
            "legacy-name"
        );
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        seed_legacy(&data);
        let db = memory_db().await;

        let mut migration = LegacyJsonMigration::new(
            db.clone(),
            MigrationConfig::new(&data, dir.path().join("backups")).dry_run(true),
        );
        let report = migration.migrate().await.unwrap();

        assert!(report.success);
        assert_eq!(report.items_migrated, 5);
        assert!(report.backup_paths.is_empty());
        assert!(!dir.path().join("backups").exists());
        let mut conn = db.acquire().await.unwrap();
        assert_eq!(ProjectRepository::count(&mut conn).await.unwrap(), 0);
        assert_eq!(AgentRepository::count(&mut conn).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rollback_restores_sources_and_removes_store() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        seed_legacy(&data);
        let original = std::fs::read_to_string(data.join("agents/a1.json")).unwrap();

        let db_path = dir.path().join("store/agentsync.db");
        let db = Arc::new(Database::new(StoreConfig::file(&db_path)));
        let mut migration =
            LegacyJsonMigration::new(db.clone(), MigrationConfig::new(&data, dir.path().join("backups")));

        let err = migration.rollback().await.unwrap_err();
        assert!(matches!(err, AgentSyncError::Validation(_)));

        migration.migrate().await.unwrap();
        assert!(db_path.exists());
        std::fs::write(data.join("agents/a1.json"), "clobbered").unwrap();

        migration.rollback().await.unwrap();
        assert_eq!(migration.state(), MigrationState::RolledBack);
        assert_eq!(std::fs::read_to_string(data.join("agents/a1.json")).unwrap(), original);
        assert!(!db_path.exists());
        assert!(!db.is_open());
    }

    #[tokio::test]
    async fn test_verify_detects_missing_records() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        seed_legacy(&data);
        let db = memory_db().await;

        let mut migration =
            LegacyJsonMigration::new(db.clone(), MigrationConfig::new(&data, dir.path().join("backups")));
        migration.migrate().await.unwrap();
        assert!(migration.verify().await.unwrap());

        let mut conn = db.acquire().await.unwrap();
        AgentRepository::delete(&mut conn, "a1").await.unwrap();
        drop(conn);
        assert!(!migration.verify().await.unwrap());
    }
}

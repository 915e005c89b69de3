//! Built-in store-backed commands
//!
//! Agent lifecycle commands only move the stored status; spawning worktrees,
//! sessions and containers happens outside this crate.

use super::command::{CommandCategory, CommandHandler, CommandOptions, CommandRegistry};
use crate::db::Database;
use crate::error::{AgentSyncError, Result};
use crate::models::{
    Agent, AgentMode, AgentStatus, EntityAction, EntityKind, Project, ProjectStatus,
};
use crate::repositories::{AgentRepository, ConfigRepository, ProjectRepository};
use crate::sync::SyncManager;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Store and optional sync transport shared by the built-in commands
#[derive(Clone)]
pub struct CommandContext {
    db: Arc<Database>,
    sync: Option<Arc<SyncManager>>,
}

impl CommandContext {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db, sync: None }
    }

    pub fn with_sync(mut self, sync: Arc<SyncManager>) -> Self {
        self.sync = Some(sync);
        self
    }

    async fn publish(
        &self,
        entity_type: EntityKind,
        entity_id: &str,
        action: EntityAction,
        data: Option<Value>,
        previous: Option<Value>,
    ) {
        if let Some(sync) = &self.sync {
            if let Err(e) = sync
                .sync_change(entity_type, entity_id, action, data, previous)
                .await
            {
                warn!(entity_id, error = %e, "Failed to publish change");
            }
        }
    }
}

/// Register every built-in command
pub fn register_builtin(registry: &mut CommandRegistry, ctx: CommandContext) {
    registry.register(Arc::new(CreateAgent(ctx.clone())));
    registry.register(Arc::new(SetAgentStatus::start(ctx.clone())));
    registry.register(Arc::new(SetAgentStatus::stop(ctx.clone())));
    registry.register(Arc::new(DeleteAgent(ctx.clone())));
    registry.register(Arc::new(ListAgents(ctx.clone())));
    registry.register(Arc::new(ShowAgentStatus(ctx.clone())));
    registry.register(Arc::new(CreateProject(ctx.clone())));
    registry.register(Arc::new(ListProjects(ctx.clone())));
    registry.register(Arc::new(GetConfig(ctx.clone())));
    registry.register(Arc::new(SetConfig(ctx)));
}

fn parse_param<T>(options: &CommandOptions, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr<Err = AgentSyncError>,
{
    options
        .str_param(key)
        .map(|raw| raw.to_ascii_lowercase().parse())
        .transpose()
}

pub struct CreateAgent(CommandContext);

#[async_trait]
impl CommandHandler for CreateAgent {
    fn name(&self) -> &str {
        "create-agent"
    }

    fn description(&self) -> &str {
        "Create a new agent on a branch"
    }

    fn category(&self) -> CommandCategory {
        CommandCategory::Agent
    }

    fn required_params(&self) -> &[&'static str] {
        &["agentId", "branch"]
    }

    fn optional_params(&self) -> &[&'static str] {
        &["name", "projectId", "mode", "autoAccept", "worktreePath"]
    }

    async fn execute(&self, options: &CommandOptions) -> Result<Value> {
        let id = options.require_str("agentId")?;
        let branch = options.require_str("branch")?;

        let mut agent = Agent::new(id, options.str_param("name").unwrap_or(id), branch);
        agent.project_id = options.str_param("projectId").map(str::to_string);
        agent.worktree_path = options.str_param("worktreePath").map(str::to_string);
        agent.auto_accept = options.bool_param("autoAccept").unwrap_or(false);
        if let Some(mode) = parse_param::<AgentMode>(options, "mode")? {
            agent.mode = mode;
        }
        agent.status = AgentStatus::Stopped;

        let mut conn = self.0.db.acquire().await?;
        if AgentRepository::exists(&mut conn, id).await? {
            return Err(AgentSyncError::validation(format!("Agent {} already exists", id)));
        }
        if let Some(project_id) = &agent.project_id {
            if !ProjectRepository::exists(&mut conn, project_id).await? {
                return Err(AgentSyncError::not_found("project", project_id));
            }
        }
        AgentRepository::create(&mut conn, &agent).await?;
        drop(conn);

        let data = serde_json::to_value(&agent)?;
        self.0
            .publish(EntityKind::Agent, id, EntityAction::Create, Some(data.clone()), None)
            .await;
        Ok(data)
    }
}

/// `start-agent` / `stop-agent`
pub struct SetAgentStatus {
    ctx: CommandContext,
    name: &'static str,
    description: &'static str,
    target: AgentStatus,
}

impl SetAgentStatus {
    pub fn start(ctx: CommandContext) -> Self {
        Self {
            ctx,
            name: "start-agent",
            description: "Mark an agent as running",
            target: AgentStatus::Running,
        }
    }

    pub fn stop(ctx: CommandContext) -> Self {
        Self {
            ctx,
            name: "stop-agent",
            description: "Mark an agent as stopped",
            target: AgentStatus::Stopped,
        }
    }
}

#[async_trait]
impl CommandHandler for SetAgentStatus {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        self.description
    }

    fn category(&self) -> CommandCategory {
        CommandCategory::Agent
    }

    fn required_params(&self) -> &[&'static str] {
        &["agentId"]
    }

    fn optional_params(&self) -> &[&'static str] {
        if self.target == AgentStatus::Stopped {
            &["force"]
        } else {
            &[]
        }
    }

    async fn execute(&self, options: &CommandOptions) -> Result<Value> {
        let id = options.require_str("agentId")?;

        let mut conn = self.ctx.db.acquire().await?;
        let mut agent = AgentRepository::get(&mut conn, id).await?;
        let previous = serde_json::to_value(&agent)?;

        let now = Utc::now();
        agent.status = self.target;
        agent.updated_at = now;
        agent.last_accessed_at = Some(now);
        AgentRepository::update(&mut conn, &agent).await?;
        drop(conn);

        let data = serde_json::to_value(&agent)?;
        self.ctx
            .publish(
                EntityKind::Agent,
                id,
                EntityAction::Update,
                Some(data),
                Some(previous),
            )
            .await;

        Ok(json!({
            "agentId": id,
            "status": self.target,
            "forced": options.bool_param("force").unwrap_or(false),
            "at": now,
        }))
    }
}

pub struct DeleteAgent(CommandContext);

#[async_trait]
impl CommandHandler for DeleteAgent {
    fn name(&self) -> &str {
        "delete-agent"
    }

    fn description(&self) -> &str {
        "Delete an agent record"
    }

    fn category(&self) -> CommandCategory {
        CommandCategory::Agent
    }

    fn required_params(&self) -> &[&'static str] {
        &["agentId"]
    }

    async fn execute(&self, options: &CommandOptions) -> Result<Value> {
        let id = options.require_str("agentId")?;

        let mut conn = self.0.db.acquire().await?;
        let agent = AgentRepository::get(&mut conn, id).await?;
        AgentRepository::delete(&mut conn, id).await?;
        drop(conn);

        self.0
            .publish(
                EntityKind::Agent,
                id,
                EntityAction::Delete,
                None,
                Some(serde_json::to_value(&agent)?),
            )
            .await;
        Ok(json!({ "agentId": id, "deleted": true }))
    }
}

pub struct ListAgents(CommandContext);

#[async_trait]
impl CommandHandler for ListAgents {
    fn name(&self) -> &str {
        "list-agents"
    }

    fn description(&self) -> &str {
        "List agents, optionally filtered by status or project"
    }

    fn category(&self) -> CommandCategory {
        CommandCategory::Agent
    }

    fn optional_params(&self) -> &[&'static str] {
        &["status", "project"]
    }

    async fn execute(&self, options: &CommandOptions) -> Result<Value> {
        let status = parse_param::<AgentStatus>(options, "status")?;

        let mut conn = self.0.db.acquire().await?;
        let mut agents = match options.str_param("project") {
            Some(project_id) => AgentRepository::find_by_project(&mut conn, project_id).await?,
            None => AgentRepository::find_all(&mut conn).await?,
        };
        if let Some(status) = status {
            agents.retain(|a| a.status == status);
        }

        Ok(json!({ "agents": agents, "total": agents.len() }))
    }
}

pub struct ShowAgentStatus(CommandContext);

#[async_trait]
impl CommandHandler for ShowAgentStatus {
    fn name(&self) -> &str {
        "agent-status"
    }

    fn description(&self) -> &str {
        "Show the stored state of one agent"
    }

    fn category(&self) -> CommandCategory {
        CommandCategory::Agent
    }

    fn required_params(&self) -> &[&'static str] {
        &["agentId"]
    }

    async fn execute(&self, options: &CommandOptions) -> Result<Value> {
        let id = options.require_str("agentId")?;
        let mut conn = self.0.db.acquire().await?;
        let agent = AgentRepository::get(&mut conn, id).await?;
        Ok(json!({ "agentId": id, "status": agent.status, "agent": agent }))
    }
}

pub struct CreateProject(CommandContext);

#[async_trait]
impl CommandHandler for CreateProject {
    fn name(&self) -> &str {
        "create-project"
    }

    fn description(&self) -> &str {
        "Register a project directory"
    }

    fn category(&self) -> CommandCategory {
        CommandCategory::Project
    }

    fn required_params(&self) -> &[&'static str] {
        &["name", "path"]
    }

    fn optional_params(&self) -> &[&'static str] {
        &["projectId", "description", "maxAgents"]
    }

    async fn execute(&self, options: &CommandOptions) -> Result<Value> {
        let name = options.require_str("name")?;
        let path = options.require_str("path")?;
        let id = options
            .str_param("projectId")
            .map(str::to_string)
            .unwrap_or_else(|| format!("proj-{}", Uuid::new_v4().simple()));

        let mut project = Project::new(id.as_str(), name, path);
        project.description = options.str_param("description").map(str::to_string);
        if let Some(max_agents) = options.param("maxAgents").and_then(Value::as_i64) {
            project.max_agents = max_agents;
        }

        let mut conn = self.0.db.acquire().await?;
        if let Some(existing) = ProjectRepository::find_by_path(&mut conn, path).await? {
            return Err(AgentSyncError::validation(format!(
                "Path {} is already registered as project {}",
                path, existing.id
            )));
        }
        ProjectRepository::create(&mut conn, &project).await?;
        drop(conn);

        let data = serde_json::to_value(&project)?;
        self.0
            .publish(EntityKind::Project, &id, EntityAction::Create, Some(data.clone()), None)
            .await;
        Ok(data)
    }
}

pub struct ListProjects(CommandContext);

#[async_trait]
impl CommandHandler for ListProjects {
    fn name(&self) -> &str {
        "list-projects"
    }

    fn description(&self) -> &str {
        "List registered projects"
    }

    fn category(&self) -> CommandCategory {
        CommandCategory::Project
    }

    fn optional_params(&self) -> &[&'static str] {
        &["status"]
    }

    async fn execute(&self, options: &CommandOptions) -> Result<Value> {
        let mut conn = self.0.db.acquire().await?;
        let projects = match parse_param::<ProjectStatus>(options, "status")? {
            Some(status) => ProjectRepository::find_by_status(&mut conn, status).await?,
            None => ProjectRepository::find_all(&mut conn).await?,
        };
        Ok(json!({ "projects": projects, "total": projects.len() }))
    }
}

pub struct GetConfig(CommandContext);

#[async_trait]
impl CommandHandler for GetConfig {
    fn name(&self) -> &str {
        "get-config"
    }

    fn description(&self) -> &str {
        "Read a global configuration value"
    }

    fn category(&self) -> CommandCategory {
        CommandCategory::Config
    }

    fn required_params(&self) -> &[&'static str] {
        &["key"]
    }

    async fn execute(&self, options: &CommandOptions) -> Result<Value> {
        let key = options.require_str("key")?;
        let mut conn = self.0.db.acquire().await?;
        let value = ConfigRepository::get_value(&mut conn, key).await?;
        Ok(json!({ "key": key, "value": value }))
    }
}

pub struct SetConfig(CommandContext);

#[async_trait]
impl CommandHandler for SetConfig {
    fn name(&self) -> &str {
        "set-config"
    }

    fn description(&self) -> &str {
        "Write a global configuration value"
    }

    fn category(&self) -> CommandCategory {
        CommandCategory::Config
    }

    fn required_params(&self) -> &[&'static str] {
        &["key", "value"]
    }

    async fn execute(&self, options: &CommandOptions) -> Result<Value> {
        let key = options.require_str("key")?;
        let value = options.param("value").cloned().unwrap_or(Value::Null);

        let mut conn = self.0.db.acquire().await?;
        let previous = serde_json::to_value(ConfigRepository::ensure_global(&mut conn).await?)?;
        let updated = ConfigRepository::set_value(&mut conn, key, value.clone()).await?;
        drop(conn);

        self.0
            .publish(
                EntityKind::Config,
                &updated.id,
                EntityAction::Update,
                Some(json!({ key: value })),
                Some(previous),
            )
            .await;
        Ok(json!({ "key": key, "value": value }))
    }
}

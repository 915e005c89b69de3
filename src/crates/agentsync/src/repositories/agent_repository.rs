//! Agent persistence

use super::codec::{
    decode_enum, decode_json, decode_time, decode_time_opt, encode_json, encode_time,
    encode_time_opt,
};
use super::{Entity, Repository, SqliteQuery};
use crate::error::Result;
use crate::models::{Agent, AgentStatus, EntityKind};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

const ENTITY: &str = "agent";

impl Entity for Agent {
    const KIND: EntityKind = EntityKind::Agent;
    const TABLE: &'static str = "agents";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "name",
        "project_id",
        "status",
        "mode",
        "branch",
        "worktree_path",
        "tmux_session",
        "docker_container",
        "docker_image",
        "port_range",
        "auto_accept",
        "environment_vars",
        "current_task_id",
        "assigned_tasks",
        "description",
        "tags",
        "metadata",
        "created_at",
        "updated_at",
        "last_accessed_at",
    ];

    fn id(&self) -> &str {
        &self.id
    }

    fn from_row(row: &SqliteRow) -> Result<Self> {
        let status: String = row.try_get("status")?;
        let mode: String = row.try_get("mode")?;
        let environment_vars: String = row.try_get("environment_vars")?;
        let assigned_tasks: String = row.try_get("assigned_tasks")?;
        let tags: String = row.try_get("tags")?;
        let metadata: String = row.try_get("metadata")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;

        Ok(Agent {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            project_id: row.try_get("project_id")?,
            status: decode_enum(ENTITY, "status", &status)?,
            mode: decode_enum(ENTITY, "mode", &mode)?,
            branch: row.try_get("branch")?,
            worktree_path: row.try_get("worktree_path")?,
            tmux_session: row.try_get("tmux_session")?,
            docker_container: row.try_get("docker_container")?,
            docker_image: row.try_get("docker_image")?,
            port_range: row.try_get("port_range")?,
            auto_accept: row.try_get("auto_accept")?,
            environment_vars: decode_json(ENTITY, "environment_vars", &environment_vars)?,
            current_task_id: row.try_get("current_task_id")?,
            assigned_tasks: decode_json(ENTITY, "assigned_tasks", &assigned_tasks)?,
            description: row.try_get("description")?,
            tags: decode_json(ENTITY, "tags", &tags)?,
            metadata: decode_json(ENTITY, "metadata", &metadata)?,
            created_at: decode_time(ENTITY, "created_at", &created_at)?,
            updated_at: decode_time(ENTITY, "updated_at", &updated_at)?,
            last_accessed_at: decode_time_opt(
                ENTITY,
                "last_accessed_at",
                row.try_get("last_accessed_at")?,
            )?,
        })
    }

    fn bind_columns<'q>(&self, query: SqliteQuery<'q>) -> Result<SqliteQuery<'q>> {
        Ok(query
            .bind(self.id.clone())
            .bind(self.name.clone())
            .bind(self.project_id.clone())
            .bind(self.status.as_str())
            .bind(self.mode.as_str())
            .bind(self.branch.clone())
            .bind(self.worktree_path.clone())
            .bind(self.tmux_session.clone())
            .bind(self.docker_container.clone())
            .bind(self.docker_image.clone())
            .bind(self.port_range.clone())
            .bind(self.auto_accept)
            .bind(encode_json(&self.environment_vars)?)
            .bind(self.current_task_id.clone())
            .bind(encode_json(&self.assigned_tasks)?)
            .bind(self.description.clone())
            .bind(encode_json(&self.tags)?)
            .bind(encode_json(&self.metadata)?)
            .bind(encode_time(&self.created_at))
            .bind(encode_time(&self.updated_at))
            .bind(encode_time_opt(self.last_accessed_at.as_ref())))
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }
}

impl Repository<Agent> {
    pub async fn find_by_project(
        conn: &mut SqliteConnection,
        project_id: &str,
    ) -> Result<Vec<Agent>> {
        Self::find_where(conn, "project_id", project_id).await
    }

    pub async fn find_by_status(
        conn: &mut SqliteConnection,
        status: AgentStatus,
    ) -> Result<Vec<Agent>> {
        Self::find_where(conn, "status", status.as_str()).await
    }

    pub async fn find_by_branch(conn: &mut SqliteConnection, branch: &str) -> Result<Vec<Agent>> {
        Self::find_where(conn, "branch", branch).await
    }
}

//! Project persistence

use super::codec::{
    decode_enum, decode_json, decode_time, decode_time_opt, encode_json, encode_time,
    encode_time_opt,
};
use super::{Entity, Repository, SqliteQuery};
use crate::error::Result;
use crate::models::{EntityKind, Project, ProjectStatus};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

const ENTITY: &str = "project";

impl Entity for Project {
    const KIND: EntityKind = EntityKind::Project;
    const TABLE: &'static str = "projects";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "name",
        "path",
        "status",
        "agent_ids",
        "max_agents",
        "task_master_enabled",
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
        let agent_ids: String = row.try_get("agent_ids")?;
        let tags: String = row.try_get("tags")?;
        let metadata: String = row.try_get("metadata")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;

        Ok(Project {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            path: row.try_get("path")?,
            status: decode_enum(ENTITY, "status", &status)?,
            agent_ids: decode_json(ENTITY, "agent_ids", &agent_ids)?,
            max_agents: row.try_get("max_agents")?,
            task_master_enabled: row.try_get("task_master_enabled")?,
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
            .bind(self.path.clone())
            .bind(self.status.as_str())
            .bind(encode_json(&self.agent_ids)?)
            .bind(self.max_agents)
            .bind(self.task_master_enabled)
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

impl Repository<Project> {
    /// Projects are unique by checkout path
    pub async fn find_by_path(conn: &mut SqliteConnection, path: &str) -> Result<Option<Project>> {
        Ok(Self::find_where(conn, "path", path).await?.into_iter().next())
    }

    pub async fn find_by_status(
        conn: &mut SqliteConnection,
        status: ProjectStatus,
    ) -> Result<Vec<Project>> {
        Self::find_where(conn, "status", status.as_str()).await
    }
}

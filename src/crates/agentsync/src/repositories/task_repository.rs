//! Task persistence

use super::codec::{
    decode_enum, decode_json, decode_time, decode_time_opt, encode_json, encode_time,
    encode_time_opt,
};
use super::{Entity, Repository, SqliteQuery};
use crate::error::Result;
use crate::models::{EntityKind, Task, TaskStatus};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

const ENTITY: &str = "task";

impl Entity for Task {
    const KIND: EntityKind = EntityKind::Task;
    const TABLE: &'static str = "tasks";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "project_id",
        "title",
        "description",
        "status",
        "priority",
        "assigned_to_agent_id",
        "parent_task_id",
        "dependencies",
        "tags",
        "metadata",
        "created_at",
        "updated_at",
        "started_at",
        "completed_at",
    ];

    fn id(&self) -> &str {
        &self.id
    }

    fn from_row(row: &SqliteRow) -> Result<Self> {
        let status: String = row.try_get("status")?;
        let priority: String = row.try_get("priority")?;
        let dependencies: String = row.try_get("dependencies")?;
        let tags: String = row.try_get("tags")?;
        let metadata: String = row.try_get("metadata")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;

        Ok(Task {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            status: decode_enum(ENTITY, "status", &status)?,
            priority: decode_enum(ENTITY, "priority", &priority)?,
            assigned_to_agent_id: row.try_get("assigned_to_agent_id")?,
            parent_task_id: row.try_get("parent_task_id")?,
            dependencies: decode_json(ENTITY, "dependencies", &dependencies)?,
            tags: decode_json(ENTITY, "tags", &tags)?,
            metadata: decode_json(ENTITY, "metadata", &metadata)?,
            created_at: decode_time(ENTITY, "created_at", &created_at)?,
            updated_at: decode_time(ENTITY, "updated_at", &updated_at)?,
            started_at: decode_time_opt(ENTITY, "started_at", row.try_get("started_at")?)?,
            completed_at: decode_time_opt(ENTITY, "completed_at", row.try_get("completed_at")?)?,
        })
    }

    fn bind_columns<'q>(&self, query: SqliteQuery<'q>) -> Result<SqliteQuery<'q>> {
        Ok(query
            .bind(self.id.clone())
            .bind(self.project_id.clone())
            .bind(self.title.clone())
            .bind(self.description.clone())
            .bind(self.status.as_str())
            .bind(self.priority.as_str())
            .bind(self.assigned_to_agent_id.clone())
            .bind(self.parent_task_id.clone())
            .bind(encode_json(&self.dependencies)?)
            .bind(encode_json(&self.tags)?)
            .bind(encode_json(&self.metadata)?)
            .bind(encode_time(&self.created_at))
            .bind(encode_time(&self.updated_at))
            .bind(encode_time_opt(self.started_at.as_ref()))
            .bind(encode_time_opt(self.completed_at.as_ref())))
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
    }
}

impl Repository<Task> {
    pub async fn find_by_project(conn: &mut SqliteConnection, project_id: &str) -> Result<Vec<Task>> {
        Self::find_where(conn, "project_id", project_id).await
    }

    pub async fn find_by_agent(conn: &mut SqliteConnection, agent_id: &str) -> Result<Vec<Task>> {
        Self::find_where(conn, "assigned_to_agent_id", agent_id).await
    }

    pub async fn find_by_status(
        conn: &mut SqliteConnection,
        status: TaskStatus,
    ) -> Result<Vec<Task>> {
        Self::find_where(conn, "status", status.as_str()).await
    }

    pub async fn find_subtasks(conn: &mut SqliteConnection, parent_id: &str) -> Result<Vec<Task>> {
        Self::find_where(conn, "parent_task_id", parent_id).await
    }
}

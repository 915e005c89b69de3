//! Sync event log
//!
//! Append-only record of entity changes. Events are written once and never
//! updated.

use super::codec::{
    decode_enum, decode_json, decode_json_opt, decode_time, encode_json, encode_json_opt,
    encode_time,
};
use crate::error::Result;
use crate::models::{EntityKind, SyncEvent};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

const ENTITY: &str = "event";

const COLUMNS: &str = "id, type, timestamp, entity_id, entity_type, action, project_id, data, \
     previous_data, source, user_id, metadata";

/// Repository for [`SyncEvent`] records
pub struct EventRepository;

impl EventRepository {
    fn from_row(row: &SqliteRow) -> Result<SyncEvent> {
        let timestamp: String = row.try_get("timestamp")?;
        let entity_type: String = row.try_get("entity_type")?;
        let action: String = row.try_get("action")?;
        let source: String = row.try_get("source")?;
        let metadata: String = row.try_get("metadata")?;

        Ok(SyncEvent {
            id: row.try_get("id")?,
            event_type: row.try_get("type")?,
            entity_type: decode_enum::<EntityKind>(ENTITY, "entity_type", &entity_type)?,
            entity_id: row.try_get("entity_id")?,
            action: decode_enum(ENTITY, "action", &action)?,
            data: decode_json_opt(ENTITY, "data", row.try_get("data")?)?,
            previous_data: decode_json_opt(ENTITY, "previous_data", row.try_get("previous_data")?)?,
            timestamp: decode_time(ENTITY, "timestamp", &timestamp)?,
            source: decode_enum(ENTITY, "source", &source)?,
            project_id: row.try_get("project_id")?,
            user_id: row.try_get("user_id")?,
            metadata: decode_json(ENTITY, "metadata", &metadata)?,
        })
    }

    pub async fn append(conn: &mut SqliteConnection, event: &SyncEvent) -> Result<()> {
        let sql = format!(
            "INSERT INTO events ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            COLUMNS
        );
        sqlx::query(&sql)
            .bind(event.id.clone())
            .bind(event.event_type.clone())
            .bind(encode_time(&event.timestamp))
            .bind(event.entity_id.clone())
            .bind(event.entity_type.as_str())
            .bind(event.action.as_str())
            .bind(event.project_id.clone())
            .bind(encode_json_opt(event.data.as_ref())?)
            .bind(encode_json_opt(event.previous_data.as_ref())?)
            .bind(event.source.as_str())
            .bind(event.user_id.clone())
            .bind(encode_json(&event.metadata)?)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn find_by_id(conn: &mut SqliteConnection, id: &str) -> Result<Option<SyncEvent>> {
        let sql = format!("SELECT {} FROM events WHERE id = ?", COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    /// Newest first
    pub async fn find_recent(conn: &mut SqliteConnection, limit: i64) -> Result<Vec<SyncEvent>> {
        let sql = format!(
            "SELECT {} FROM events ORDER BY timestamp DESC, rowid DESC LIMIT ?",
            COLUMNS
        );
        let rows = sqlx::query(&sql).bind(limit).fetch_all(&mut *conn).await?;
        rows.iter().map(Self::from_row).collect()
    }

    /// History of one entity, oldest first
    pub async fn find_by_entity(
        conn: &mut SqliteConnection,
        entity_id: &str,
    ) -> Result<Vec<SyncEvent>> {
        let sql = format!(
            "SELECT {} FROM events WHERE entity_id = ? ORDER BY timestamp, rowid",
            COLUMNS
        );
        let rows = sqlx::query(&sql).bind(entity_id).fetch_all(&mut *conn).await?;
        rows.iter().map(Self::from_row).collect()
    }

    pub async fn find_by_type(
        conn: &mut SqliteConnection,
        event_type: &str,
        limit: i64,
    ) -> Result<Vec<SyncEvent>> {
        let sql = format!(
            "SELECT {} FROM events WHERE type = ? ORDER BY timestamp DESC, rowid DESC LIMIT ?",
            COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(event_type)
            .bind(limit)
            .fetch_all(&mut *conn)
            .await?;
        rows.iter().map(Self::from_row).collect()
    }

    pub async fn count(conn: &mut SqliteConnection) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&mut *conn)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::{EntityAction, EventSource};
    use chrono::Duration;
    use serde_json::json;

    #[tokio::test]
    async fn test_append_and_query() {
        let db = Database::open_in_memory().await.unwrap();
        let mut conn = db.acquire().await.unwrap();

        let mut first = SyncEvent::new(
            EntityKind::Agent,
            "a1",
            EntityAction::Create,
            Some(json!({"name": "worker"})),
        )
        .with_source(EventSource::Cli)
        .with_project("p1");
        first.timestamp -= Duration::seconds(5);
        let second = SyncEvent::new(EntityKind::Agent, "a1", EntityAction::Update, None)
            .with_previous(Some(json!({"name": "worker"})))
            .with_user("dev");

        EventRepository::append(&mut conn, &first).await.unwrap();
        EventRepository::append(&mut conn, &second).await.unwrap();

        assert_eq!(EventRepository::count(&mut conn).await.unwrap(), 2);

        let recent = EventRepository::find_recent(&mut conn, 10).await.unwrap();
        assert_eq!(recent[0].id, second.id);
        assert_eq!(recent[1].source, EventSource::Cli);
        assert_eq!(recent[1].data, Some(json!({"name": "worker"})));

        let history = EventRepository::find_by_entity(&mut conn, "a1").await.unwrap();
        assert_eq!(history[0].event_type, "agent.created");
        assert_eq!(history[1].user_id.as_deref(), Some("dev"));

        let updates = EventRepository::find_by_type(&mut conn, "agent.updated", 10)
            .await
            .unwrap();
        assert_eq!(updates.len(), 1);
        assert!(updates[0].data.is_none());
        assert!(EventRepository::find_by_id(&mut conn, &first.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_event_ids_are_unique() {
        let db = Database::open_in_memory().await.unwrap();
        let mut conn = db.acquire().await.unwrap();

        let event = SyncEvent::new(EntityKind::Task, "t1", EntityAction::Delete, None);
        EventRepository::append(&mut conn, &event).await.unwrap();
        assert!(EventRepository::append(&mut conn, &event).await.is_err());
    }
}

//! Database repositories
//!
//! Repository functions take `&mut SqliteConnection` so the same calls work on
//! a pooled connection or inside a transaction:
//!
//! ```rust,no_run
//! # async fn example(db: &agentsync::Database) -> agentsync::Result<()> {
//! use agentsync::repositories::AgentRepository;
//!
//! let mut conn = db.acquire().await?;
//! let agents = AgentRepository::find_all(&mut conn).await?;
//! # let _ = agents;
//! # Ok(())
//! # }
//! ```

pub(crate) mod codec;

pub mod agent_repository;
pub mod config_repository;
pub mod event_repository;
pub mod project_repository;
pub mod task_repository;

pub use config_repository::ConfigRepository;
pub use event_repository::EventRepository;

use crate::error::{AgentSyncError, Result};
use crate::models::{Agent, EntityKind, Project, Task};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Sqlite, SqliteConnection};
use std::marker::PhantomData;

/// Query with SQLite arguments
pub type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// A record type with its own table, keyed by a string id
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + Unpin + 'static {
    const KIND: EntityKind;
    const TABLE: &'static str;
    /// Persisted columns, `id` first
    const COLUMNS: &'static [&'static str];

    fn id(&self) -> &str;

    fn from_row(row: &SqliteRow) -> Result<Self>;

    /// Bind one value per entry of `COLUMNS`, in order
    fn bind_columns<'q>(&self, query: SqliteQuery<'q>) -> Result<SqliteQuery<'q>>;

    /// Stamp `updated_at`
    fn touch(&mut self, at: DateTime<Utc>);
}

/// Generic CRUD over an [`Entity`] table
pub struct Repository<E> {
    _entity: PhantomData<fn() -> E>,
}

pub type AgentRepository = Repository<Agent>;
pub type ProjectRepository = Repository<Project>;
pub type TaskRepository = Repository<Task>;

impl<E: Entity> Repository<E> {
    fn select_sql(suffix: &str) -> String {
        format!("SELECT {} FROM {} {}", E::COLUMNS.join(", "), E::TABLE, suffix)
    }

    /// Load a record by id
    pub async fn find_by_id(conn: &mut SqliteConnection, id: &str) -> Result<Option<E>> {
        let sql = Self::select_sql("WHERE id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
        row.as_ref().map(E::from_row).transpose()
    }

    /// Load a record by id, failing with `NotFound`
    pub async fn get(conn: &mut SqliteConnection, id: &str) -> Result<E> {
        Self::find_by_id(conn, id)
            .await?
            .ok_or_else(|| AgentSyncError::not_found(E::KIND.as_str(), id))
    }

    /// All records, oldest first
    pub async fn find_all(conn: &mut SqliteConnection) -> Result<Vec<E>> {
        let sql = Self::select_sql("ORDER BY created_at, id");
        let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
        rows.iter().map(E::from_row).collect()
    }

    pub(crate) async fn find_where(
        conn: &mut SqliteConnection,
        column: &str,
        value: &str,
    ) -> Result<Vec<E>> {
        let sql = Self::select_sql(&format!("WHERE {} = ? ORDER BY created_at, id", column));
        let rows = sqlx::query(&sql).bind(value).fetch_all(&mut *conn).await?;
        rows.iter().map(E::from_row).collect()
    }

    pub async fn count(conn: &mut SqliteConnection) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", E::TABLE);
        Ok(sqlx::query_scalar(&sql).fetch_one(&mut *conn).await?)
    }

    pub async fn exists(conn: &mut SqliteConnection, id: &str) -> Result<bool> {
        let sql = format!("SELECT 1 FROM {} WHERE id = ?", E::TABLE);
        let found: Option<i64> = sqlx::query_scalar(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(found.is_some())
    }

    /// Insert a new record; a duplicate id is a constraint error
    pub async fn create(conn: &mut SqliteConnection, entity: &E) -> Result<()> {
        let placeholders = vec!["?"; E::COLUMNS.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            E::TABLE,
            E::COLUMNS.join(", "),
            placeholders
        );
        entity.bind_columns(sqlx::query(&sql))?.execute(&mut *conn).await?;
        Ok(())
    }

    /// Replace every column of an existing record
    pub async fn update(conn: &mut SqliteConnection, entity: &E) -> Result<()> {
        let assignments: Vec<String> = E::COLUMNS.iter().map(|c| format!("{} = ?", c)).collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?",
            E::TABLE,
            assignments.join(", ")
        );
        let result = entity
            .bind_columns(sqlx::query(&sql))?
            .bind(entity.id().to_string())
            .execute(&mut *conn)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AgentSyncError::not_found(E::KIND.as_str(), entity.id()));
        }
        Ok(())
    }

    /// Insert or replace by id
    pub async fn upsert(conn: &mut SqliteConnection, entity: &E) -> Result<()> {
        let placeholders = vec!["?"; E::COLUMNS.len()].join(", ");
        let updates: Vec<String> = E::COLUMNS
            .iter()
            .skip(1)
            .map(|c| format!("{} = excluded.{}", c, c))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {}",
            E::TABLE,
            E::COLUMNS.join(", "),
            placeholders,
            updates.join(", ")
        );
        entity.bind_columns(sqlx::query(&sql))?.execute(&mut *conn).await?;
        Ok(())
    }

    /// Delete by id; returns whether a row was removed
    pub async fn delete(conn: &mut SqliteConnection, id: &str) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE id = ?", E::TABLE);
        let result = sqlx::query(&sql).bind(id).execute(&mut *conn).await?;
        Ok(result.rows_affected() > 0)
    }
}

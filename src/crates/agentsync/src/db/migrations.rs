//! Schema migrations
//!
//! Migrations are embedded SQL files. Applied versions are recorded in the
//! `migrations` table; all pending migrations run inside one transaction.

use crate::error::Result;
use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqlitePool;
use sqlx::SqliteConnection;
use tracing::{error, info};

/// A versioned schema change
#[derive(Debug, Clone, Copy)]
pub struct SchemaMigration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

/// Built-in migrations, ordered by version
pub const MIGRATIONS: &[SchemaMigration] = &[
    SchemaMigration {
        version: 1,
        name: "initial_schema",
        sql: include_str!("../../migrations/0001_initial_schema.sql"),
    },
    SchemaMigration {
        version: 2,
        name: "backup_history",
        sql: include_str!("../../migrations/0002_backup_history.sql"),
    },
];

/// Highest built-in schema version
pub fn latest_version() -> i64 {
    MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0)
}

/// Result of a migration run
#[derive(Debug, Clone, Serialize)]
pub struct MigrationOutcome {
    pub success: bool,
    pub from_version: i64,
    pub to_version: i64,
    /// `"<version>: <name>"` for each applied migration
    pub applied: Vec<String>,
    pub errors: Vec<String>,
}

const CREATE_MIGRATIONS_TABLE: &str = "CREATE TABLE IF NOT EXISTS migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    version INTEGER NOT NULL UNIQUE,
    name TEXT NOT NULL,
    executed_at TEXT NOT NULL
)";

/// Split a SQL script into statements on line-terminating semicolons
///
/// Comment-only and blank lines are dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for line in sql.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("--") {
            continue;
        }

        current.push_str(line);
        current.push('\n');

        if trimmed.ends_with(';') {
            let stmt = current.trim();
            if !stmt.is_empty() {
                statements.push(stmt.to_string());
            }
            current.clear();
        }
    }

    let rest = current.trim();
    if !rest.is_empty() {
        statements.push(rest.to_string());
    }

    statements
}

pub(crate) async fn ensure_migrations_table(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query(CREATE_MIGRATIONS_TABLE).execute(conn).await?;
    Ok(())
}

/// Current schema version; 0 when the migrations table is absent or empty
pub(crate) async fn current_version(conn: &mut SqliteConnection) -> Result<i64> {
    let exists: Option<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'migrations'",
    )
    .fetch_optional(&mut *conn)
    .await?;

    if exists.is_none() {
        return Ok(0);
    }

    let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM migrations")
        .fetch_one(&mut *conn)
        .await?;

    Ok(version.unwrap_or(0))
}

/// Apply every migration newer than `current` in a single transaction
///
/// Failure rolls back all of them and reports `success = false` with the
/// version unchanged.
pub(crate) async fn apply_pending(
    pool: &SqlitePool,
    current: i64,
    migrations: &[SchemaMigration],
) -> MigrationOutcome {
    let mut pending: Vec<&SchemaMigration> =
        migrations.iter().filter(|m| m.version > current).collect();
    pending.sort_by_key(|m| m.version);

    let mut outcome = MigrationOutcome {
        success: true,
        from_version: current,
        to_version: current,
        applied: Vec::new(),
        errors: Vec::new(),
    };

    if pending.is_empty() {
        return outcome;
    }

    match run_in_transaction(pool, &pending).await {
        Ok(applied) => {
            outcome.to_version = pending.last().map(|m| m.version).unwrap_or(current);
            outcome.applied = applied;
            info!(
                from = current,
                to = outcome.to_version,
                count = outcome.applied.len(),
                "Schema migrations applied"
            );
        }
        Err(message) => {
            error!(from = current, error = %message, "Schema migration failed, rolled back");
            outcome.success = false;
            outcome.errors.push(message);
        }
    }

    outcome
}

async fn run_in_transaction(
    pool: &SqlitePool,
    pending: &[&SchemaMigration],
) -> std::result::Result<Vec<String>, String> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| format!("Failed to begin migration transaction: {}", e))?;

    ensure_migrations_table(&mut tx)
        .await
        .map_err(|e| format!("Failed to create migrations table: {}", e))?;

    let mut applied = Vec::with_capacity(pending.len());
    for migration in pending {
        for statement in split_statements(migration.sql) {
            if let Err(e) = sqlx::query(&statement).execute(&mut *tx).await {
                let message = format!("Migration {} failed: {}", migration.version, e);
                if let Err(rollback_err) = tx.rollback().await {
                    error!(error = %rollback_err, "Rollback after migration failure failed");
                }
                return Err(message);
            }
        }

        let recorded = sqlx::query(
            "INSERT INTO migrations (version, name, executed_at) VALUES (?, ?, ?)",
        )
        .bind(migration.version)
        .bind(migration.name)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await;

        if let Err(e) = recorded {
            let message = format!("Failed to record migration {}: {}", migration.version, e);
            if let Err(rollback_err) = tx.rollback().await {
                error!(error = %rollback_err, "Rollback after migration failure failed");
            }
            return Err(message);
        }

        applied.push(format!("{}: {}", migration.version, migration.name));
    }

    tx.commit()
        .await
        .map_err(|e| format!("Failed to commit migrations: {}", e))?;

    Ok(applied)
}

//! Named savepoints inside an open transaction
//!
//! ```rust,no_run
//! # async fn example(db: &agentsync::Database) -> agentsync::Result<()> {
//! use agentsync::atomic::{create_savepoint, rollback_to_savepoint, release_savepoint};
//!
//! db.transaction(|conn| {
//!     Box::pin(async move {
//!         create_savepoint(conn, "before_tasks").await?;
//!         // ... writes that may need undoing ...
//!         rollback_to_savepoint(conn, "before_tasks").await?;
//!         release_savepoint(conn, "before_tasks").await?;
//!         Ok(())
//!     })
//! })
//! .await
//! # }
//! ```

use crate::error::{AgentSyncError, Result};
use sqlx::SqliteConnection;
use tracing::debug;

/// Savepoint names are spliced into SQL, so only identifiers are accepted
fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(AgentSyncError::validation(format!(
            "Invalid savepoint name: {:?}",
            name
        )))
    }
}

pub async fn create_savepoint(conn: &mut SqliteConnection, name: &str) -> Result<()> {
    validate_name(name)?;
    sqlx::query(&format!("SAVEPOINT {}", name))
        .execute(&mut *conn)
        .await?;
    debug!(savepoint = name, "Savepoint created");
    Ok(())
}

/// Undo everything since `name`; the savepoint stays open
pub async fn rollback_to_savepoint(conn: &mut SqliteConnection, name: &str) -> Result<()> {
    validate_name(name)?;
    sqlx::query(&format!("ROLLBACK TO SAVEPOINT {}", name))
        .execute(&mut *conn)
        .await?;
    debug!(savepoint = name, "Rolled back to savepoint");
    Ok(())
}

pub async fn release_savepoint(conn: &mut SqliteConnection, name: &str) -> Result<()> {
    validate_name(name)?;
    sqlx::query(&format!("RELEASE SAVEPOINT {}", name))
        .execute(&mut *conn)
        .await?;
    debug!(savepoint = name, "Savepoint released");
    Ok(())
}

//! Storage engine
//!
//! Owns the SQLite connection pool, schema versioning, transactions,
//! read-only enforcement and byte-level snapshot backup/restore for the store
//! at `~/.agentsync/agentsync.db` (or an in-memory instance).

pub mod migrations;

use crate::config::AgentSyncConfig;
use crate::error::{AgentSyncError, Result};
use futures::future::BoxFuture;
use migrations::{MigrationOutcome, SchemaMigration, MIGRATIONS};
use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, SqliteConnection};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Type alias for the database connection pool
pub type DatabasePool = SqlitePool;

/// Where the store lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    InMemory,
    File(PathBuf),
}

/// Store selection and access mode
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub location: StoreLocation,
    pub read_only: bool,
    pub max_connections: u32,
}

impl StoreConfig {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            location: StoreLocation::File(path.into()),
            read_only: false,
            max_connections: 5,
        }
    }

    pub fn in_memory() -> Self {
        Self {
            location: StoreLocation::InMemory,
            read_only: false,
            max_connections: 1,
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn from_config(config: &AgentSyncConfig) -> Self {
        let base = if config.database.in_memory {
            Self::in_memory()
        } else {
            Self::file(config.database_path())
        };
        base.read_only(config.database.read_only)
    }
}

/// Rows touched by [`Database::execute`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecuteResult {
    pub rows_affected: u64,
    pub last_insert_rowid: i64,
}

/// Store statistics
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub version: i64,
    /// File path, or `:memory:`
    pub path: String,
    pub read_only: bool,
    pub page_count: i64,
    pub page_size: i64,
    pub freelist_count: i64,
    pub journal_mode: String,
    pub foreign_keys: bool,
    pub tables: Vec<String>,
}

#[derive(Debug)]
struct Connection {
    pool: DatabasePool,
    version: i64,
}

/// Storage engine handle
///
/// Construct one at startup and share it (`Arc<Database>`) with the
/// migration, atomic-operation and command layers.
#[derive(Debug)]
pub struct Database {
    config: StoreConfig,
    migrations: Vec<SchemaMigration>,
    connection: RwLock<Option<Connection>>,
}

impl Database {
    /// Create an unopened store handle; call [`Database::initialize`] next
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            migrations: MIGRATIONS.to_vec(),
            connection: RwLock::new(None),
        }
    }

    /// Replace the migration set (used for tests and embedders with their own schema)
    pub fn with_migrations(mut self, migrations: Vec<SchemaMigration>) -> Self {
        self.migrations = migrations;
        self
    }

    /// Create and initialize a store
    pub async fn open(config: StoreConfig) -> Result<Self> {
        let db = Self::new(config);
        db.initialize().await?;
        Ok(db)
    }

    /// Open and initialize an in-memory store
    pub async fn open_in_memory() -> Result<Self> {
        Self::open(StoreConfig::in_memory()).await
    }

    /// Open the store, apply baseline settings, read the schema version and,
    /// unless read-only, run pending migrations
    ///
    /// Calling it on an open store is a no-op.
    pub async fn initialize(&self) -> Result<()> {
        if self.connection.read().is_some() {
            return Ok(());
        }

        let pool = self.connect().await?;

        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| AgentSyncError::Connection(format!("Failed to acquire connection: {}", e)))?;
        let version = migrations::current_version(&mut conn).await?;
        drop(conn);

        debug!(version, read_only = self.config.read_only, "Store opened");
        *self.connection.write() = Some(Connection {
            pool,
            version,
        });

        if !self.config.read_only {
            let migrated = match self.run_migrations().await {
                Ok(outcome) if outcome.success => Ok(()),
                Ok(outcome) => Err(AgentSyncError::Migration(outcome.errors.join("; "))),
                Err(e) => Err(e),
            };
            // The store stays unopened until its schema is current
            if let Err(e) = migrated {
                self.close().await;
                return Err(e);
            }
        }

        info!(
            path = %self.display_path(),
            version = self.version(),
            "Database initialized"
        );
        Ok(())
    }

    async fn connect(&self) -> Result<DatabasePool> {
        let (options, pool_options) = match &self.config.location {
            StoreLocation::InMemory => {
                let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
                    AgentSyncError::Connection(format!("Invalid in-memory options: {}", e))
                })?;
                // Every connection to :memory: is a separate database; keep exactly one alive.
                let pool_options = SqlitePoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None);
                (options, pool_options)
            }
            StoreLocation::File(path) => {
                if !self.config.read_only {
                    if let Some(parent) = path.parent() {
                        if !parent.as_os_str().is_empty() && !parent.exists() {
                            std::fs::create_dir_all(parent).map_err(|e| {
                                AgentSyncError::Connection(format!(
                                    "Failed to create database directory: {}",
                                    e
                                ))
                            })?;
                        }
                    }
                }

                let mut options = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(!self.config.read_only)
                    .read_only(self.config.read_only);
                if !self.config.read_only {
                    options = options.journal_mode(SqliteJournalMode::Wal);
                }
                let pool_options =
                    SqlitePoolOptions::new().max_connections(self.config.max_connections.max(1));
                (options, pool_options)
            }
        };

        let options = options
            .foreign_keys(true)
            .synchronous(SqliteSynchronous::Normal);

        debug!(path = %self.display_path(), "Connecting to database");
        pool_options
            .connect_with(options)
            .await
            .map_err(|e| AgentSyncError::Connection(format!("Failed to open store: {}", e)))
    }

    /// Run migrations newer than the current version in one transaction
    pub async fn run_migrations(&self) -> Result<MigrationOutcome> {
        if self.config.read_only {
            return Err(AgentSyncError::WriteOnReadOnly(
                "migrations cannot run on a read-only store".to_string(),
            ));
        }

        let pool = self.pool()?;
        let current = self.version();
        let outcome = migrations::apply_pending(&pool, current, &self.migrations).await;

        if outcome.success && outcome.to_version != current {
            if let Some(conn) = self.connection.write().as_mut() {
                conn.version = outcome.to_version;
            }
        }

        Ok(outcome)
    }

    /// Clone of the live pool
    pub fn pool(&self) -> Result<DatabasePool> {
        self.connection
            .read()
            .as_ref()
            .map(|conn| conn.pool.clone())
            .ok_or_else(|| {
                AgentSyncError::Connection(
                    "Database not initialized. Call initialize() first.".to_string(),
                )
            })
    }

    /// Check out a pooled connection for repository calls
    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>> {
        let pool = self.pool()?;
        Ok(pool.acquire().await?)
    }

    /// Current schema version (0 when closed)
    pub fn version(&self) -> i64 {
        self.connection
            .read()
            .as_ref()
            .map(|conn| conn.version)
            .unwrap_or(0)
    }

    pub fn is_open(&self) -> bool {
        self.connection.read().is_some()
    }

    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    pub fn is_in_memory(&self) -> bool {
        self.config.location == StoreLocation::InMemory
    }

    /// File path of a file-backed store
    pub fn path(&self) -> Option<&Path> {
        match &self.config.location {
            StoreLocation::File(path) => Some(path.as_path()),
            StoreLocation::InMemory => None,
        }
    }

    /// Highest schema version this handle knows how to apply
    pub fn latest_version(&self) -> i64 {
        self.migrations.iter().map(|m| m.version).max().unwrap_or(0)
    }

    fn display_path(&self) -> String {
        match &self.config.location {
            StoreLocation::File(path) => path.display().to_string(),
            StoreLocation::InMemory => ":memory:".to_string(),
        }
    }

    /// Execute a single statement with JSON-typed parameters
    ///
    /// Mutating statements are rejected on a read-only store before they reach SQLite.
    pub async fn execute(&self, query: &str, params: &[Value]) -> Result<ExecuteResult> {
        if self.config.read_only && is_write_query(query) {
            warn!(query = %query, "Rejected write on read-only store");
            return Err(AgentSyncError::WriteOnReadOnly(query.trim().to_string()));
        }

        let pool = self.pool()?;
        let mut statement = sqlx::query(query);
        for param in params {
            statement = match param {
                Value::Null => statement.bind(None::<String>),
                Value::Bool(b) => statement.bind(*b),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => statement.bind(i),
                    None => statement.bind(n.as_f64().unwrap_or_default()),
                },
                Value::String(s) => statement.bind(s.clone()),
                other => statement.bind(other.to_string()),
            };
        }

        let result = statement.execute(&pool).await?;
        Ok(ExecuteResult {
            rows_affected: result.rows_affected(),
            last_insert_rowid: result.last_insert_rowid(),
        })
    }

    /// Run `f` as one atomic unit; an `Err` rolls everything back
    ///
    /// ```rust,no_run
    /// # async fn example(db: &agentsync::Database) -> agentsync::Result<()> {
    /// let agents: i64 = db
    ///     .transaction(|conn| {
    ///         Box::pin(async move {
    ///             let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM agents")
    ///                 .fetch_one(&mut *conn)
    ///                 .await?;
    ///             Ok(n)
    ///         })
    ///     })
    ///     .await?;
    /// assert!(agents >= 0);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>> + Send,
    {
        let pool = self.pool()?;
        let mut tx = pool.begin().await?;

        match f(&mut *tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Transaction rollback failed");
                }
                debug!(error = %err, "Transaction rolled back");
                Err(err)
            }
        }
    }

    /// Perform a health check by running a simple query
    pub async fn health_check(&self) -> Result<()> {
        let pool = self.pool()?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(())
    }

    /// Byte-level snapshot of the store file into `destination`
    ///
    /// Returns the snapshot size in bytes. In-memory stores cannot be backed up.
    pub async fn backup(&self, destination: &Path) -> Result<u64> {
        let source = match &self.config.location {
            StoreLocation::InMemory => {
                return Err(AgentSyncError::Backup(
                    "Cannot back up an in-memory store".to_string(),
                ))
            }
            StoreLocation::File(path) => path.clone(),
        };

        let pool = self.pool()?;
        if !self.config.read_only {
            // Fold the WAL into the main file so the copy is complete.
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(&pool)
                .await?;
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AgentSyncError::Backup(format!("Failed to create backup directory: {}", e))
            })?;
        }

        let size = tokio::fs::copy(&source, destination)
            .await
            .map_err(|e| AgentSyncError::Backup(format!("Failed to copy store: {}", e)))?;

        info!(
            source = %source.display(),
            destination = %destination.display(),
            size,
            "Store backed up"
        );
        Ok(size)
    }

    /// Replace the store file with a snapshot and reinitialize
    pub async fn restore(&self, source: &Path) -> Result<()> {
        let target = match &self.config.location {
            StoreLocation::InMemory => {
                return Err(AgentSyncError::Backup(
                    "Cannot restore into an in-memory store".to_string(),
                ))
            }
            StoreLocation::File(path) => path.clone(),
        };
        if self.config.read_only {
            return Err(AgentSyncError::WriteOnReadOnly(
                "restore requires a writable store".to_string(),
            ));
        }

        let metadata = tokio::fs::metadata(source).await.map_err(|e| {
            AgentSyncError::Backup(format!("Backup {} not readable: {}", source.display(), e))
        })?;
        if metadata.len() == 0 {
            return Err(AgentSyncError::Backup(format!(
                "Backup {} is empty",
                source.display()
            )));
        }

        self.close().await;

        tokio::fs::copy(source, &target)
            .await
            .map_err(|e| AgentSyncError::Backup(format!("Failed to copy snapshot: {}", e)))?;

        for suffix in ["-wal", "-shm"] {
            let sidecar = PathBuf::from(format!("{}{}", target.display(), suffix));
            match tokio::fs::remove_file(&sidecar).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(AgentSyncError::Backup(format!(
                        "Failed to remove {}: {}",
                        sidecar.display(),
                        e
                    )))
                }
            }
        }

        info!(source = %source.display(), target = %target.display(), "Store restored");
        self.initialize().await
    }

    /// Store statistics for introspection
    pub async fn stats(&self) -> Result<StoreStats> {
        let pool = self.pool()?;

        let page_count: i64 = sqlx::query_scalar("PRAGMA page_count")
            .fetch_one(&pool)
            .await?;
        let page_size: i64 = sqlx::query_scalar("PRAGMA page_size")
            .fetch_one(&pool)
            .await?;
        let freelist_count: i64 = sqlx::query_scalar("PRAGMA freelist_count")
            .fetch_one(&pool)
            .await?;
        let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await?;
        let foreign_keys: i64 = sqlx::query_scalar("PRAGMA foreign_keys")
            .fetch_one(&pool)
            .await?;
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await?;

        Ok(StoreStats {
            version: self.version(),
            path: self.display_path(),
            read_only: self.config.read_only,
            page_count,
            page_size,
            freelist_count,
            journal_mode,
            foreign_keys: foreign_keys == 1,
            tables,
        })
    }

    /// Close the connection pool; the handle can be reinitialized later
    pub async fn close(&self) {
        let connection = self.connection.write().take();
        if let Some(conn) = connection {
            conn.pool.close().await;
            info!(path = %self.display_path(), "Database connection closed");
        }
    }
}

/// Whether a statement mutates the store, judged by its leading keyword
pub fn is_write_query(query: &str) -> bool {
    static WRITE_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    WRITE_PATTERN
        .get_or_init(|| Regex::new(r"(?i)^\s*(INSERT|UPDATE|DELETE|CREATE|DROP|ALTER|REPLACE)\s").ok())
        .as_ref()
        .map_or(true, |re| re.is_match(query))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_in_memory_initialize_runs_migrations() {
        let db = Database::open_in_memory().await.unwrap();
        assert_eq!(db.version(), migrations::latest_version());
        assert!(db.health_check().await.is_ok());

        let stats = db.stats().await.unwrap();
        assert!(stats.tables.contains(&"agents".to_string()));
        assert!(stats.tables.contains(&"migrations".to_string()));
        assert!(stats.foreign_keys);
        assert_eq!(stats.path, ":memory:");
    }

    #[tokio::test]
    async fn test_second_migration_run_is_noop() {
        let db = Database::open_in_memory().await.unwrap();
        let outcome = db.run_migrations().await.unwrap();
        assert!(outcome.success);
        assert!(outcome.applied.is_empty());
        assert_eq!(outcome.from_version, outcome.to_version);
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let db = Database::open_in_memory().await.unwrap();
        db.execute(
            "INSERT INTO projects (id, name, path, status, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?)",
            &[
                "p1".into(),
                "demo".into(),
                "/tmp/demo".into(),
                "active".into(),
                "2025-01-01T00:00:00Z".into(),
                "2025-01-01T00:00:00Z".into(),
            ],
        )
        .await
        .unwrap();

        db.initialize().await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM projects")
            .fetch_one(&db.pool().unwrap())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    fn broken_migrations() -> Vec<SchemaMigration> {
        vec![
            SchemaMigration {
                version: 1,
                name: "good",
                sql: "CREATE TABLE ok_table (id TEXT PRIMARY KEY);",
            },
            SchemaMigration {
                version: 2,
                name: "broken",
                sql: "CREATE TABLE broken (id TEXT PRIMARY KEY;",
            },
        ]
    }

    #[tokio::test]
    async fn test_failed_migration_keeps_version() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.db");
        let db = Database::new(StoreConfig::file(&path)).with_migrations(broken_migrations());

        let err = db.initialize().await.unwrap_err();
        assert!(matches!(err, AgentSyncError::Migration(_)));
        assert_eq!(db.version(), 0);

        let reader = Database::new(StoreConfig::file(&path).read_only(true));
        reader.initialize().await.unwrap();
        assert_eq!(reader.version(), 0);
        let tables = reader.stats().await.unwrap().tables;
        assert!(!tables.contains(&"ok_table".to_string()));
    }

    #[tokio::test]
    async fn test_initialize_after_failed_migration_retries() {
        let db = Database::new(StoreConfig::in_memory()).with_migrations(broken_migrations());

        assert!(db.initialize().await.is_err());
        assert!(db.pool().is_err());

        // a second call must not report a half-open store as ready
        let err = db.initialize().await.unwrap_err();
        assert!(matches!(err, AgentSyncError::Migration(_)));
        assert_eq!(db.version(), 0);
        assert!(db.health_check().await.is_err());
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().await.unwrap();

        let result: Result<()> = db
            .transaction(|conn| {
                Box::pin(async move {
                    sqlx::query(
                        "INSERT INTO projects (id, name, path, status, created_at, updated_at)
                         VALUES ('p1', 'demo', '/tmp/p1', 'active', 'x', 'x')",
                    )
                    .execute(&mut *conn)
                    .await?;
                    Err(AgentSyncError::validation("abort"))
                })
            })
            .await;
        assert!(result.is_err());

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM projects")
            .fetch_one(&db.pool().unwrap())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_in_memory_backup_is_rejected() {
        let db = Database::open_in_memory().await.unwrap();
        let dir = TempDir::new().unwrap();
        let err = db.backup(&dir.path().join("snap.db")).await.unwrap_err();
        assert!(matches!(err, AgentSyncError::Backup(_)));
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");
        Database::open(StoreConfig::file(&path)).await.unwrap().close().await;

        let db = Database::open(StoreConfig::file(&path).read_only(true))
            .await
            .unwrap();
        assert_eq!(db.version(), migrations::latest_version());

        let err = db
            .execute("  delete from agents", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, AgentSyncError::WriteOnReadOnly(_)));

        let read = db.execute("SELECT COUNT(*) FROM agents", &[]).await;
        assert!(read.is_ok());
    }

    #[tokio::test]
    async fn test_unopenable_store_is_connection_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent.db");
        let err = Database::open(StoreConfig::file(&missing).read_only(true))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentSyncError::Connection(_)));
    }

    #[test]
    fn test_write_detection() {
        assert!(is_write_query("INSERT INTO x VALUES (1)"));
        assert!(is_write_query("\n  replace into x values (1)"));
        assert!(is_write_query("drop table x"));
        assert!(!is_write_query("SELECT * FROM x"));
        assert!(!is_write_query("PRAGMA page_count"));
        assert!(!is_write_query("INSERTED"));
    }
}

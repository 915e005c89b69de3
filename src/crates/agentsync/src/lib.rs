//! # agentsync - consistency core for multi-agent orchestration
//!
//! Keeps agents, projects, tasks and global configuration consistent while a
//! GUI, a CLI and API clients work on them at the same time.
//!
//! ## Features
//!
//! - **Storage engine** - SQLite store with embedded, versioned migrations
//! - **Legacy import** - Moves the old JSON layout into the unified schema
//! - **Atomic batches** - All-or-nothing batches, savepoints, backup and restore
//! - **Event sync** - WebSocket hub and reconnecting peers
//! - **Coordination** - Command registry, activity log and conflict detection
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agentsync::atomic::{AtomicOperation, AtomicOperations};
//! use agentsync::models::EntityKind;
//! use agentsync::Database;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> agentsync::Result<()> {
//! let db = Arc::new(Database::open_in_memory().await?);
//! let atomic = AtomicOperations::new(db, "/tmp/agentsync-backups");
//!
//! let result = atomic
//!     .execute_batch(vec![AtomicOperation::create(
//!         EntityKind::Project,
//!         "p1",
//!         json!({"name": "demo", "path": "/work/demo"}),
//!     )])
//!     .await?;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! One process owns the store. Other sessions either talk to it in-process
//! through the [`coordination::CoreCoordinator`] or over WebSocket through a
//! [`sync::SyncHub`].

pub mod atomic;
pub mod clock;
pub mod config;
pub mod coordination;
pub mod db;
pub mod health;
pub mod migration;
pub mod models;
pub mod repositories;
pub mod shutdown;
pub mod sync;

mod error;

pub use error::{AgentSyncError, Result};

pub use db::{Database, StoreConfig};
pub use config::{load_config, AgentSyncConfig, ConfigLoader};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};

pub use atomic::{AtomicOperation, AtomicOperations, BatchResult, BulkOperations};
pub use coordination::{CommandOptions, CommandRegistry, CommandResult, CoreCoordinator};
pub use migration::{DataMigration, LegacyJsonMigration, MigrationConfig, MigrationReport};
pub use sync::{SyncHub, SyncManager, SyncPeer};

pub use health::{ComponentHealth, HealthChecker, HealthReport, HealthStatus};
pub use shutdown::ShutdownCoordinator;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

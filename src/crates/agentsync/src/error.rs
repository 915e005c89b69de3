//! Error types for agentsync
//!
//! One error enum covers the store, migrations, batches, backups, sync and
//! command coordination so callers can match on a single taxonomy.

use thiserror::Error;

/// Result type alias for agentsync operations
pub type Result<T> = std::result::Result<T, AgentSyncError>;

/// Main error type for agentsync operations
#[derive(Debug, Error)]
pub enum AgentSyncError {
    /// The store could not be opened or is not initialized
    #[error("Connection error: {0}")]
    Connection(String),

    /// A schema migration statement failed; the version was not advanced
    #[error("Migration failed: {0}")]
    Migration(String),

    /// A mutating statement was issued against a read-only store
    #[error("Write rejected on read-only store: {0}")]
    WriteOnReadOnly(String),

    /// An operation inside an atomic batch failed and the batch was rolled back
    #[error("Batch aborted at operation {index} ({operation_id}): {message}")]
    BatchAbort {
        index: usize,
        operation_id: String,
        message: String,
    },

    /// Backup or restore failure
    #[error("Backup error: {0}")]
    Backup(String),

    /// Unknown command, missing parameter or otherwise invalid input
    #[error("Validation error: {0}")]
    Validation(String),

    /// No resolution strategy could settle a conflict
    #[error("Conflict {conflict_id} unresolved: {reason}")]
    ConflictUnresolved { conflict_id: String, reason: String },

    /// Persisted JSON could not be decoded into its typed form
    #[error("Decode error in {entity}.{field}: {message}")]
    Decode {
        entity: &'static str,
        field: &'static str,
        message: String,
    },

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed or unexpected sync protocol traffic
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// SQL error
    #[error("SQL error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl AgentSyncError {
    /// Create a NotFound error for an entity
    pub fn not_found(entity: &str, id: &str) -> Self {
        Self::NotFound(format!("{} {}", entity, id))
    }

    /// Create a Validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether a retry (or reconnect) may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(_) | Self::WebSocket(_) | Self::Connection(_) => true,
            Self::Sqlx(err) => matches!(
                err,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            _ => false,
        }
    }

    /// Short machine-readable kind, used in result envelopes
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Migration(_) => "migration",
            Self::WriteOnReadOnly(_) => "write_on_read_only",
            Self::BatchAbort { .. } => "batch_abort",
            Self::Backup(_) => "backup",
            Self::Validation(_) => "validation",
            Self::ConflictUnresolved { .. } => "conflict_unresolved",
            Self::Decode { .. } => "decode",
            Self::NotFound(_) => "not_found",
            Self::Protocol(_) => "protocol",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Serde(_) => "serde",
            Self::Sqlx(_) => "sql",
            Self::WebSocket(_) => "websocket",
        }
    }
}

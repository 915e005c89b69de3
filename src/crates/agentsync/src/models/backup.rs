//! Backup history record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One snapshot in the backup history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// Location of the snapshot file
    pub path: String,
    /// Snapshot size in bytes
    pub size: u64,
    #[serde(default)]
    pub description: Option<String>,
    /// True when the backup was taken without a description
    pub auto_created: bool,
    /// Schema version of the store at snapshot time
    pub version: i64,
}

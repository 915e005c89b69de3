//! Data migration framework
//!
//! Moves data from older storage layouts into the unified schema. Unlike the
//! atomic batch layer, a migration is best effort: individual items that fail
//! are collected into the report and the run carries on.

pub mod legacy_json;

pub use legacy_json::LegacyJsonMigration;

use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Lifecycle of a migration run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Idle,
    Running,
    Succeeded,
    Failed,
    RolledBack,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(name)
    }
}

/// Options for a migration run
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Root of the legacy data layout
    pub data_dir: PathBuf,
    /// Read and transform without writing anything
    pub dry_run: bool,
    /// Log every migrated item
    pub verbose: bool,
    /// Where source files are copied before migrating
    pub backup_dir: PathBuf,
    /// Overwrite records whose id already exists
    pub force: bool,
}

impl MigrationConfig {
    pub fn new(data_dir: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            dry_run: false,
            verbose: false,
            backup_dir: backup_dir.into(),
            force: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

/// One item that could not be migrated
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationItemError {
    pub item: String,
    pub error: String,
}

/// Outcome of a migration run
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    /// False iff `errors` is non-empty
    pub success: bool,
    pub items_migrated: usize,
    /// Existing ids left untouched because `force` was off
    pub items_skipped: usize,
    pub errors: Vec<MigrationItemError>,
    pub backup_paths: Vec<PathBuf>,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationPhase {
    Projects,
    Agents,
    Complete,
}

/// Progress notification, fired after each item
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationProgress {
    pub phase: MigrationPhase,
    pub current: usize,
    pub total: usize,
    /// Rounded to the nearest whole percent; 0 when `total` is 0
    pub percentage: u8,
}

impl MigrationProgress {
    pub fn new(phase: MigrationPhase, current: usize, total: usize) -> Self {
        let percentage = if total == 0 {
            0
        } else {
            ((current as f64 / total as f64) * 100.0).round().min(100.0) as u8
        };
        Self {
            phase,
            current,
            total,
            percentage,
        }
    }
}

pub type ProgressCallback = Box<dyn Fn(&MigrationProgress) + Send + Sync>;

/// A versioned, backup-guarded data transformation
#[async_trait]
pub trait DataMigration: Send + Sync {
    fn name(&self) -> &str;

    fn state(&self) -> MigrationState;

    /// Run the migration, collecting per-item failures into the report
    async fn migrate(&mut self) -> Result<MigrationReport>;

    /// Restore backed-up sources and remove the destination store
    async fn rollback(&mut self) -> Result<()>;

    /// Compare source counts against what the store now holds
    async fn verify(&self) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_percentage_rounds() {
        assert_eq!(MigrationProgress::new(MigrationPhase::Agents, 1, 3).percentage, 33);
        assert_eq!(MigrationProgress::new(MigrationPhase::Agents, 2, 3).percentage, 67);
        assert_eq!(MigrationProgress::new(MigrationPhase::Complete, 0, 0).percentage, 0);
    }

    #[test]
    fn test_report_serializes_duration_as_millis() {
        let report = MigrationReport {
            success: true,
            items_migrated: 3,
            items_skipped: 0,
            errors: Vec::new(),
            backup_paths: Vec::new(),
            duration: Duration::from_millis(1500),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["duration"], 1500);
        assert_eq!(json["items_migrated"], 3);
    }
}

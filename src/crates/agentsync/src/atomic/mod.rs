//! Atomic multi-entity operations
//!
//! A batch of creates, updates and deletes across agents, projects, tasks and
//! the global config is applied inside one transaction. Either every
//! operation lands or the store is left exactly as it was.

pub mod backup;
pub mod savepoint;

pub use backup::{RestoreOptions, RestoreOutcome};
pub use savepoint::{create_savepoint, release_savepoint, rollback_to_savepoint};

use crate::db::Database;
use crate::error::{AgentSyncError, Result};
use crate::models::{Agent, EntityKind, Project, Task};
use crate::repositories::codec::merge_object;
use crate::repositories::{ConfigRepository, Entity, Repository};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqliteConnection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Kind of mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

/// One mutation inside a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtomicOperation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub entity_type: EntityKind,
    pub entity_id: String,
    /// Full record for creates, partial changes for updates
    pub data: Option<Value>,
    /// State before the operation, kept for compensation and auditing
    pub previous_data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl AtomicOperation {
    fn new(
        kind: OperationKind,
        entity_type: EntityKind,
        entity_id: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            id: format!("op_{}", Uuid::new_v4().simple()),
            kind,
            entity_type,
            entity_id: entity_id.into(),
            data,
            previous_data: None,
            timestamp: Utc::now(),
        }
    }

    pub fn create(entity_type: EntityKind, entity_id: impl Into<String>, data: Value) -> Self {
        Self::new(OperationKind::Create, entity_type, entity_id, Some(data))
    }

    /// `changes` is merged over the stored record
    pub fn update(entity_type: EntityKind, entity_id: impl Into<String>, changes: Value) -> Self {
        Self::new(OperationKind::Update, entity_type, entity_id, Some(changes))
    }

    pub fn delete(entity_type: EntityKind, entity_id: impl Into<String>) -> Self {
        Self::new(OperationKind::Delete, entity_type, entity_id, None)
    }

    pub fn with_previous(mut self, previous: Option<Value>) -> Self {
        self.previous_data = previous;
        self
    }
}

/// What happened to an individual operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Applied,
    /// Ran, then undone when a later operation failed
    RolledBack,
    Failed,
    /// Never attempted because an earlier operation failed
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationResult {
    pub operation_id: String,
    pub status: OperationStatus,
    /// Stored record after a create or update
    pub data: Option<Value>,
    pub error: Option<String>,
}

/// Structured failure entry of a batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchError {
    pub index: usize,
    pub operation_id: String,
    pub kind: String,
    pub message: String,
}

/// Outcome of [`AtomicOperations::execute_batch`]
///
/// When `rollback_performed` is true nothing was persisted and
/// `operations_applied` is 0.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult {
    pub success: bool,
    pub operations_applied: usize,
    pub operations_failed: usize,
    pub errors: Vec<BatchError>,
    pub rollback_performed: bool,
    pub operation_results: Vec<OperationResult>,
}

impl BatchResult {
    fn empty() -> Self {
        Self {
            success: true,
            operations_applied: 0,
            operations_failed: 0,
            errors: Vec::new(),
            rollback_performed: false,
            operation_results: Vec::new(),
        }
    }

    /// Turn an aborted batch into [`AgentSyncError::BatchAbort`]
    pub fn into_result(self) -> Result<Self> {
        if self.success {
            return Ok(self);
        }
        let (index, operation_id, message) = self
            .errors
            .first()
            .map(|e| (e.index, e.operation_id.clone(), e.message.clone()))
            .unwrap_or_else(|| (0, String::new(), "batch failed".to_string()));
        Err(AgentSyncError::BatchAbort {
            index,
            operation_id,
            message,
        })
    }
}

/// Partial update of one record in a bulk request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdate {
    pub id: String,
    pub changes: Value,
}

impl EntityUpdate {
    pub fn new(id: impl Into<String>, changes: Value) -> Self {
        Self {
            id: id.into(),
            changes,
        }
    }
}

/// Typed create/update/delete lists for one entity type
#[derive(Debug, Clone)]
pub struct BulkOperations<E> {
    pub create: Vec<E>,
    pub update: Vec<EntityUpdate>,
    pub delete: Vec<String>,
}

impl<E> Default for BulkOperations<E> {
    fn default() -> Self {
        Self {
            create: Vec::new(),
            update: Vec::new(),
            delete: Vec::new(),
        }
    }
}

/// Batch executor, backup manager and savepoint helpers over one store
pub struct AtomicOperations {
    db: Arc<Database>,
    backup_dir: PathBuf,
}

impl AtomicOperations {
    pub fn new(db: Arc<Database>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            backup_dir: backup_dir.into(),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Apply `operations` in order inside one transaction
    ///
    /// The first failing operation rolls back the whole batch; the failure is
    /// reported in the result rather than as `Err`. Infrastructure failures
    /// (no connection, commit error) are returned as `Err`.
    pub async fn execute_batch(&self, operations: Vec<AtomicOperation>) -> Result<BatchResult> {
        if operations.is_empty() {
            return Ok(BatchResult::empty());
        }
        if self.db.is_read_only() {
            return Err(AgentSyncError::WriteOnReadOnly(format!(
                "batch of {} operations",
                operations.len()
            )));
        }

        let pool = self.db.pool()?;
        let mut tx = pool.begin().await?;
        let mut results: Vec<OperationResult> = Vec::with_capacity(operations.len());

        for (index, operation) in operations.iter().enumerate() {
            match apply_operation(&mut *tx, operation).await {
                Ok(data) => results.push(OperationResult {
                    operation_id: operation.id.clone(),
                    status: OperationStatus::Applied,
                    data,
                    error: None,
                }),
                Err(err) => {
                    if let Err(rollback_err) = tx.rollback().await {
                        warn!(error = %rollback_err, "Batch rollback failed");
                    }
                    warn!(
                        index,
                        operation_id = %operation.id,
                        entity_type = %operation.entity_type,
                        entity_id = %operation.entity_id,
                        error = %err,
                        "Batch rolled back"
                    );
                    return Ok(aborted(&operations, results, index, err));
                }
            }
        }

        tx.commit().await?;
        info!(operations = results.len(), "Batch committed");

        Ok(BatchResult {
            success: true,
            operations_applied: results.len(),
            operations_failed: 0,
            errors: Vec::new(),
            rollback_performed: false,
            operation_results: results,
        })
    }

    /// Translate typed lists into a batch, capturing prior state for updates
    /// and deletes
    pub async fn bulk_operations<E: Entity>(&self, bulk: BulkOperations<E>) -> Result<BatchResult> {
        let mut operations =
            Vec::with_capacity(bulk.create.len() + bulk.update.len() + bulk.delete.len());

        for entity in &bulk.create {
            operations.push(AtomicOperation::create(
                E::KIND,
                entity.id(),
                serde_json::to_value(entity)?,
            ));
        }

        if !bulk.update.is_empty() || !bulk.delete.is_empty() {
            let mut conn = self.db.acquire().await?;
            for update in bulk.update {
                let previous = Repository::<E>::find_by_id(&mut conn, &update.id)
                    .await?
                    .map(serde_json::to_value)
                    .transpose()?;
                operations.push(
                    AtomicOperation::update(E::KIND, update.id, update.changes)
                        .with_previous(previous),
                );
            }
            for id in bulk.delete {
                let previous = Repository::<E>::find_by_id(&mut conn, &id)
                    .await?
                    .map(serde_json::to_value)
                    .transpose()?;
                operations.push(AtomicOperation::delete(E::KIND, id).with_previous(previous));
            }
        }

        debug!(entity_type = %E::KIND, operations = operations.len(), "Bulk request prepared");
        self.execute_batch(operations).await
    }

    pub async fn bulk_agent_operations(&self, bulk: BulkOperations<Agent>) -> Result<BatchResult> {
        self.bulk_operations(bulk).await
    }

    pub async fn bulk_project_operations(&self, bulk: BulkOperations<Project>) -> Result<BatchResult> {
        self.bulk_operations(bulk).await
    }

    pub async fn bulk_task_operations(&self, bulk: BulkOperations<Task>) -> Result<BatchResult> {
        self.bulk_operations(bulk).await
    }
}

fn aborted(
    operations: &[AtomicOperation],
    mut results: Vec<OperationResult>,
    failed_index: usize,
    err: AgentSyncError,
) -> BatchResult {
    for result in &mut results {
        result.status = OperationStatus::RolledBack;
        result.data = None;
    }
    let failed = &operations[failed_index];
    results.push(OperationResult {
        operation_id: failed.id.clone(),
        status: OperationStatus::Failed,
        data: None,
        error: Some(err.to_string()),
    });
    for skipped in &operations[failed_index + 1..] {
        results.push(OperationResult {
            operation_id: skipped.id.clone(),
            status: OperationStatus::Skipped,
            data: None,
            error: None,
        });
    }

    BatchResult {
        success: false,
        operations_applied: 0,
        operations_failed: 1,
        errors: vec![BatchError {
            index: failed_index,
            operation_id: failed.id.clone(),
            kind: err.kind().to_string(),
            message: err.to_string(),
        }],
        rollback_performed: true,
        operation_results: results,
    }
}

async fn apply_operation(
    conn: &mut SqliteConnection,
    operation: &AtomicOperation,
) -> Result<Option<Value>> {
    match operation.entity_type {
        EntityKind::Agent => apply_entity::<Agent>(conn, operation).await,
        EntityKind::Project => apply_entity::<Project>(conn, operation).await,
        EntityKind::Task => apply_entity::<Task>(conn, operation).await,
        EntityKind::Config => apply_config(conn, operation).await,
    }
}

fn require_data(operation: &AtomicOperation) -> Result<&Value> {
    operation.data.as_ref().ok_or_else(|| {
        AgentSyncError::validation(format!(
            "{:?} of {} {} requires data",
            operation.kind, operation.entity_type, operation.entity_id
        ))
    })
}

fn decode_payload<E: Entity>(value: Value) -> Result<E> {
    serde_json::from_value(value).map_err(|e| {
        AgentSyncError::validation(format!("Invalid {} payload: {}", E::KIND, e))
    })
}

async fn apply_entity<E: Entity>(
    conn: &mut SqliteConnection,
    operation: &AtomicOperation,
) -> Result<Option<Value>> {
    match operation.kind {
        OperationKind::Create => {
            let mut payload = require_data(operation)?.clone();
            if let Some(object) = payload.as_object_mut() {
                object
                    .entry("id")
                    .or_insert_with(|| Value::String(operation.entity_id.clone()));
            }
            let entity: E = decode_payload(payload)?;
            if entity.id() != operation.entity_id {
                return Err(AgentSyncError::validation(format!(
                    "payload id {} does not match {}",
                    entity.id(),
                    operation.entity_id
                )));
            }
            Repository::<E>::create(conn, &entity).await?;
            Ok(Some(serde_json::to_value(&entity)?))
        }
        OperationKind::Update => {
            let changes = require_data(operation)?;
            let current = Repository::<E>::get(conn, &operation.entity_id).await?;
            let mut merged = serde_json::to_value(&current)?;
            merge_object(&mut merged, changes)?;

            let mut updated: E = decode_payload(merged)?;
            if updated.id() != operation.entity_id {
                return Err(AgentSyncError::validation("update cannot change an entity id"));
            }
            updated.touch(Utc::now());
            Repository::<E>::update(conn, &updated).await?;
            Ok(Some(serde_json::to_value(&updated)?))
        }
        OperationKind::Delete => {
            if !Repository::<E>::delete(conn, &operation.entity_id).await? {
                return Err(AgentSyncError::not_found(E::KIND.as_str(), &operation.entity_id));
            }
            Ok(None)
        }
    }
}

async fn apply_config(
    conn: &mut SqliteConnection,
    operation: &AtomicOperation,
) -> Result<Option<Value>> {
    match operation.kind {
        OperationKind::Update => {
            let updated = ConfigRepository::update_global(conn, require_data(operation)?).await?;
            Ok(Some(serde_json::to_value(&updated)?))
        }
        kind => Err(AgentSyncError::validation(format!(
            "global config supports update only, got {:?}",
            kind
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentStatus;
    use crate::repositories::{AgentRepository, ProjectRepository};
    use serde_json::json;

    async fn atomic() -> AtomicOperations {
        let db = Arc::new(Database::open_in_memory().await.unwrap());
        AtomicOperations::new(db, std::env::temp_dir().join("agentsync-unused"))
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop_success() {
        let ops = atomic().await;
        let result = ops.execute_batch(Vec::new()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.operations_applied, 0);
        assert!(!result.rollback_performed);
    }

    #[tokio::test]
    async fn test_mixed_batch_commits() {
        let ops = atomic().await;
        let result = ops
            .execute_batch(vec![
                AtomicOperation::create(
                    EntityKind::Project,
                    "p1",
                    json!({"name": "demo", "path": "/work/demo"}),
                ),
                AtomicOperation::create(
                    EntityKind::Agent,
                    "a1",
                    json!({"name": "worker", "branch": "main", "projectId": "p1"}),
                ),
                AtomicOperation::update(EntityKind::Agent, "a1", json!({"status": "running"})),
                AtomicOperation::update(EntityKind::Config, "global", json!({"maxAgents": 4})),
            ])
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.operations_applied, 4);
        assert_eq!(result.operation_results[2].data.as_ref().unwrap()["status"], "running");

        let mut conn = ops.database().acquire().await.unwrap();
        let agent = AgentRepository::get(&mut conn, "a1").await.unwrap();
        assert_eq!(agent.status, AgentStatus::Running);
        assert_eq!(agent.project_id.as_deref(), Some("p1"));
        assert_eq!(
            ConfigRepository::ensure_global(&mut conn).await.unwrap().max_agents,
            4
        );
    }

    #[tokio::test]
    async fn test_failing_operation_rolls_back_everything() {
        let ops = atomic().await;
        let result = ops
            .execute_batch(vec![
                AtomicOperation::create(
                    EntityKind::Project,
                    "p1",
                    json!({"name": "demo", "path": "/work/demo"}),
                ),
                AtomicOperation::update(EntityKind::Agent, "ghost", json!({"name": "x"})),
                AtomicOperation::delete(EntityKind::Project, "p1"),
            ])
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.rollback_performed);
        assert_eq!(result.operations_applied, 0);
        assert_eq!(result.operations_failed, 1);
        assert_eq!(result.errors[0].index, 1);
        assert_eq!(result.errors[0].kind, "not_found");
        let statuses: Vec<_> = result.operation_results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                OperationStatus::RolledBack,
                OperationStatus::Failed,
                OperationStatus::Skipped
            ]
        );

        let mut conn = ops.database().acquire().await.unwrap();
        assert_eq!(ProjectRepository::count(&mut conn).await.unwrap(), 0);
        drop(conn);

        let err = result.into_result().unwrap_err();
        assert!(matches!(err, AgentSyncError::BatchAbort { index: 1, .. }));
    }

    #[tokio::test]
    async fn test_config_create_is_rejected() {
        let ops = atomic().await;
        let result = ops
            .execute_batch(vec![AtomicOperation::create(
                EntityKind::Config,
                "global",
                json!({}),
            )])
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.errors[0].kind, "validation");
    }

    #[tokio::test]
    async fn test_bulk_create_on_empty_store() {
        let ops = atomic().await;
        let result = ops
            .bulk_agent_operations(BulkOperations {
                create: vec![Agent::new("x", "X", "main"), Agent::new("y", "Y", "dev")],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.operations_applied, 2);

        let mut conn = ops.database().acquire().await.unwrap();
        let ids: Vec<String> = AgentRepository::find_all(&mut conn)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"x".to_string()) && ids.contains(&"y".to_string()));
    }

    #[tokio::test]
    async fn test_bulk_update_and_delete_capture_previous_state() {
        let ops = atomic().await;
        {
            let mut conn = ops.database().acquire().await.unwrap();
            ProjectRepository::create(&mut conn, &Project::new("p1", "one", "/one"))
                .await
                .unwrap();
            ProjectRepository::create(&mut conn, &Project::new("p2", "two", "/two"))
                .await
                .unwrap();
        }

        let result = ops
            .bulk_project_operations(BulkOperations {
                update: vec![EntityUpdate::new("p1", json!({"name": "uno"}))],
                delete: vec!["p2".to_string()],
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.operations_applied, 2);

        let mut conn = ops.database().acquire().await.unwrap();
        assert_eq!(ProjectRepository::get(&mut conn, "p1").await.unwrap().name, "uno");
        assert!(!ProjectRepository::exists(&mut conn, "p2").await.unwrap());
    }
}

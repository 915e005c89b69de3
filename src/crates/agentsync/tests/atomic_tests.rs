//! Atomic batches, backup round trips and retention against file stores

mod common;

use agentsync::atomic::{
    AtomicOperation, AtomicOperations, BulkOperations, OperationStatus, RestoreOptions,
};
use agentsync::models::{Agent, EntityKind, Project};
use agentsync::repositories::{AgentRepository, ConfigRepository, ProjectRepository};
use agentsync::AgentSyncError;
use common::{seed_project_with_agent, setup_file_db};
use serde_json::json;

#[tokio::test]
async fn test_failing_operation_rolls_back_whole_batch() {
    let (temp_dir, db) = setup_file_db().await;
    seed_project_with_agent(&db, "p1", "a1").await;
    let atomic = AtomicOperations::new(db.clone(), temp_dir.path().join("backups"));

    let result = atomic
        .execute_batch(vec![
            AtomicOperation::update(EntityKind::Agent, "a1", json!({"status": "running"})),
            AtomicOperation::create(
                EntityKind::Project,
                "p2",
                json!({"name": "second", "path": "/work/p2"}),
            ),
            AtomicOperation::delete(EntityKind::Task, "missing"),
        ])
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result.rollback_performed);
    assert_eq!(result.operations_applied, 0);
    assert_eq!(
        result
            .operation_results
            .iter()
            .map(|r| r.status)
            .collect::<Vec<_>>(),
        vec![
            OperationStatus::RolledBack,
            OperationStatus::RolledBack,
            OperationStatus::Failed
        ]
    );

    let mut conn = db.acquire().await.unwrap();
    assert_eq!(
        AgentRepository::get(&mut conn, "a1").await.unwrap().status.as_str(),
        "created"
    );
    assert!(!ProjectRepository::exists(&mut conn, "p2").await.unwrap());
    drop(conn);

    assert!(matches!(
        result.into_result(),
        Err(AgentSyncError::BatchAbort { index: 2, .. })
    ));
}

#[tokio::test]
async fn test_bulk_create_commits_all_or_nothing() {
    let (temp_dir, db) = setup_file_db().await;
    let atomic = AtomicOperations::new(db.clone(), temp_dir.path().join("backups"));

    let ok = atomic
        .bulk_project_operations(BulkOperations {
            create: vec![
                Project::new("x", "X", "/work/x"),
                Project::new("y", "Y", "/work/y"),
            ],
            ..BulkOperations::default()
        })
        .await
        .unwrap();
    assert!(ok.success);
    assert_eq!(ok.operations_applied, 2);

    // second creation of "x" violates the primary key
    let duplicate = atomic
        .bulk_project_operations(BulkOperations {
            create: vec![
                Project::new("z", "Z", "/work/z"),
                Project::new("x", "X again", "/work/x2"),
            ],
            ..BulkOperations::default()
        })
        .await
        .unwrap();
    assert!(!duplicate.success);

    let mut conn = db.acquire().await.unwrap();
    assert_eq!(ProjectRepository::count(&mut conn).await.unwrap(), 2);
    assert!(!ProjectRepository::exists(&mut conn, "z").await.unwrap());
}

#[tokio::test]
async fn test_backup_restore_round_trip() {
    let (temp_dir, db) = setup_file_db().await;
    seed_project_with_agent(&db, "p1", "a1").await;
    let atomic = AtomicOperations::new(db.clone(), temp_dir.path().join("backups"));

    let snapshot = atomic.create_backup(Some("before edits")).await.unwrap();
    assert!(!snapshot.auto_created);
    assert!(snapshot.size > 0);

    {
        let mut conn = db.acquire().await.unwrap();
        AgentRepository::create(&mut conn, &Agent::new("a2", "extra", "dev"))
            .await
            .unwrap();
        ConfigRepository::update_global(&mut conn, &json!({"maxAgents": 2}))
            .await
            .unwrap();
    }

    let outcome = atomic
        .restore_from_backup(std::path::Path::new(&snapshot.path), RestoreOptions::default())
        .await
        .unwrap();
    assert!(outcome.success, "{:?}", outcome.integrity_issues);
    let pre_restore = outcome.pre_restore_backup.unwrap();

    let mut conn = db.acquire().await.unwrap();
    assert!(AgentRepository::exists(&mut conn, "a1").await.unwrap());
    assert!(!AgentRepository::exists(&mut conn, "a2").await.unwrap());
    drop(conn);

    let history = atomic.backup_history().await.unwrap();
    let ids: Vec<_> = history.iter().map(|b| b.id.as_str()).collect();
    assert!(ids.contains(&snapshot.id.as_str()));
    assert!(ids.contains(&pre_restore.id.as_str()));
}

#[tokio::test]
async fn test_cleanup_keeps_described_backups() {
    let (temp_dir, db) = setup_file_db().await;
    let atomic = AtomicOperations::new(db.clone(), temp_dir.path().join("backups"));

    let manual = atomic.create_backup(Some("keep me")).await.unwrap();
    for _ in 0..3 {
        atomic.create_backup(None).await.unwrap();
    }

    let removed = atomic.cleanup_old_backups(30, 1).await.unwrap();
    assert_eq!(removed, 2);

    let history = atomic.backup_history().await.unwrap();
    assert_eq!(history.len(), 2);
    assert!(history.iter().any(|b| b.id == manual.id));
    assert!(std::path::Path::new(&manual.path).exists());
}

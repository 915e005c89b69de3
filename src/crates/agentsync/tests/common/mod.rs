//! Common test utilities and setup

#![allow(dead_code)]

use agentsync::models::{Agent, Project};
use agentsync::repositories::{AgentRepository, ProjectRepository};
use agentsync::{Database, StoreConfig};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

static TEST_DB_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// File-backed store with a unique name; keep the `TempDir` alive
pub async fn setup_file_db() -> (TempDir, Arc<Database>) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db = Database::open(StoreConfig::file(unique_db_path(&temp_dir)))
        .await
        .expect("Failed to open test database");
    (temp_dir, Arc::new(db))
}

pub fn unique_db_path(temp_dir: &TempDir) -> PathBuf {
    let counter = TEST_DB_COUNTER.fetch_add(1, Ordering::SeqCst);
    temp_dir.path().join(format!("test_{}.db", counter))
}

pub async fn setup_memory_db() -> Arc<Database> {
    Arc::new(
        Database::open_in_memory()
            .await
            .expect("Failed to open in-memory database"),
    )
}

/// Insert a project and one agent assigned to it
pub async fn seed_project_with_agent(db: &Database, project_id: &str, agent_id: &str) {
    let mut conn = db.acquire().await.expect("Failed to acquire connection");
    let project = Project::new(project_id, format!("{} project", project_id), format!("/work/{}", project_id));
    ProjectRepository::create(&mut conn, &project)
        .await
        .expect("Failed to create project");
    let agent = Agent::new(agent_id, format!("{} agent", agent_id), "main").with_project(project_id);
    AgentRepository::create(&mut conn, &agent)
        .await
        .expect("Failed to create agent");
}

/// Poll `check` until it returns true or `timeout` elapses
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}

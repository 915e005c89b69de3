//! Agent model

use super::{string_enum, Metadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Agent lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    Suspended,
}

string_enum!(AgentStatus {
    Created => "created",
    Starting => "starting",
    Running => "running",
    Stopping => "stopping",
    Stopped => "stopped",
    Error => "error",
    Suspended => "suspended",
});

/// Execution environment of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Tmux,
    #[default]
    Docker,
    Hybrid,
}

string_enum!(AgentMode {
    Tmux => "tmux",
    Docker => "docker",
    Hybrid => "hybrid",
});

/// An agent working on a branch of a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub status: AgentStatus,
    #[serde(default)]
    pub mode: AgentMode,
    pub branch: String,
    #[serde(default)]
    pub worktree_path: Option<String>,
    #[serde(default)]
    pub tmux_session: Option<String>,
    #[serde(default)]
    pub docker_container: Option<String>,
    #[serde(default)]
    pub docker_image: Option<String>,
    #[serde(default)]
    pub port_range: Option<String>,
    #[serde(default)]
    pub auto_accept: bool,
    #[serde(default)]
    pub environment_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub current_task_id: Option<String>,
    #[serde(default)]
    pub assigned_tasks: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_accessed_at: Option<DateTime<Utc>>,
}

impl Agent {
    pub fn new(id: impl Into<String>, name: impl Into<String>, branch: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            project_id: None,
            status: AgentStatus::Created,
            mode: AgentMode::Docker,
            branch: branch.into(),
            worktree_path: None,
            tmux_session: None,
            docker_container: None,
            docker_image: None,
            port_range: None,
            auto_accept: false,
            environment_vars: BTreeMap::new(),
            current_task_id: None,
            assigned_tasks: Vec::new(),
            description: None,
            tags: Vec::new(),
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
            last_accessed_at: None,
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_worktree(mut self, path: impl Into<String>) -> Self {
        self.worktree_path = Some(path.into());
        self
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_mode(mut self, mode: AgentMode) -> Self {
        self.mode = mode;
        self
    }
}

//! Project model

use super::{string_enum, Metadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Project status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    #[default]
    Active,
    Inactive,
    Archived,
}

string_enum!(ProjectStatus {
    Active => "active",
    Inactive => "inactive",
    Archived => "archived",
});

fn default_max_agents() -> i64 {
    10
}

/// A repository checkout that agents work in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub status: ProjectStatus,
    #[serde(default)]
    pub agent_ids: Vec<String>,
    #[serde(default = "default_max_agents")]
    pub max_agents: i64,
    #[serde(default)]
    pub task_master_enabled: bool,
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

impl Project {
    pub fn new(id: impl Into<String>, name: impl Into<String>, path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            path: path.into(),
            status: ProjectStatus::Active,
            agent_ids: Vec::new(),
            max_agents: default_max_agents(),
            task_master_enabled: false,
            description: None,
            tags: Vec::new(),
            metadata: Metadata::new(),
            created_at: now,
            updated_at: now,
            last_accessed_at: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

//! Domain models
//!
//! Agents, projects, tasks, the singleton global config, backup records and
//! sync events. Persistence lives in [`crate::repositories`].

/// Implements `as_str`, `Display` and `FromStr` for a lowercase status enum
macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = $crate::error::AgentSyncError;

            fn from_str(s: &str) -> $crate::error::Result<Self> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err($crate::error::AgentSyncError::validation(format!(
                        concat!("Unknown ", stringify!($ty), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

pub(crate) use string_enum;

pub mod agent;
pub mod backup;
pub mod event;
pub mod global_config;
pub mod project;
pub mod task;

pub use agent::{Agent, AgentMode, AgentStatus};
pub use backup::BackupMetadata;
pub use event::{EntityAction, EventSource, SyncEvent};
pub use global_config::{GlobalConfig, GLOBAL_CONFIG_ID};
pub use project::{Project, ProjectStatus};
pub use task::{Task, TaskPriority, TaskStatus};

use crate::error::{AgentSyncError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Free-form metadata attached to every entity
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Kind of entity owned by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Agent,
    Project,
    Task,
    Config,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Project => "project",
            Self::Task => "task",
            Self::Config => "config",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = AgentSyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "agent" => Ok(Self::Agent),
            "project" => Ok(Self::Project),
            "task" => Ok(Self::Task),
            "config" => Ok(Self::Config),
            other => Err(AgentSyncError::validation(format!(
                "Unknown entity type: {}",
                other
            ))),
        }
    }
}

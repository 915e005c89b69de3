//! Entity change events
//!
//! A [`SyncEvent`] describes one create/update/delete on an entity. Events are
//! appended to the event log and fanned out to connected peers.

use super::{string_enum, EntityKind, Metadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Mutation applied to an entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityAction {
    Create,
    Update,
    Delete,
}

string_enum!(EntityAction {
    Create => "create",
    Update => "update",
    Delete => "delete",
});

impl EntityAction {
    /// Suffix used in event type names (`agent.created`)
    pub fn past_tense(&self) -> &'static str {
        match self {
            Self::Create => "created",
            Self::Update => "updated",
            Self::Delete => "deleted",
        }
    }
}

/// Front end or subsystem that produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Cli,
    Gui,
    Api,
    #[default]
    System,
    External,
}

string_enum!(EventSource {
    Cli => "cli",
    Gui => "gui",
    Api => "api",
    System => "system",
    External => "external",
});

/// Entity change event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub id: String,
    /// `<entity>.<past-tense action>`, e.g. `agent.created`
    #[serde(rename = "type")]
    pub event_type: String,
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub action: EntityAction,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub previous_data: Option<Value>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub source: EventSource,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl SyncEvent {
    pub fn new(
        entity_type: EntityKind,
        entity_id: impl Into<String>,
        action: EntityAction,
        data: Option<Value>,
    ) -> Self {
        Self {
            id: format!("sync_{}", Uuid::new_v4()),
            event_type: Self::type_name(entity_type, action),
            entity_type,
            entity_id: entity_id.into(),
            action,
            data,
            previous_data: None,
            timestamp: Utc::now(),
            source: EventSource::System,
            project_id: None,
            user_id: None,
            metadata: Metadata::new(),
        }
    }

    /// Event type name for an entity/action pair
    pub fn type_name(entity_type: EntityKind, action: EntityAction) -> String {
        format!("{}.{}", entity_type.as_str(), action.past_tense())
    }

    /// Every entity change type, the default peer subscription
    pub fn all_entity_types() -> Vec<String> {
        let mut types = Vec::new();
        for kind in [EntityKind::Agent, EntityKind::Project, EntityKind::Task] {
            for action in [EntityAction::Create, EntityAction::Update, EntityAction::Delete] {
                types.push(Self::type_name(kind, action));
            }
        }
        types.push(Self::type_name(EntityKind::Config, EntityAction::Update));
        types
    }

    pub fn with_previous(mut self, previous: Option<Value>) -> Self {
        self.previous_data = previous;
        self
    }

    pub fn with_source(mut self, source: EventSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

//! Command registry and result envelope
//!
//! Front ends submit commands by name with a parameter map. The registry
//! checks required parameters, runs the handler, times it and wraps the
//! outcome into a [`CommandResult`], so callers never see a raw error.

use crate::error::{AgentSyncError, Result};
use crate::models::EventSource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Command parameters keyed by camelCase name
pub type Params = serde_json::Map<String, Value>;

/// Command category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandCategory {
    Agent,
    Project,
    System,
    Config,
}

/// Who issued a command and with what parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOptions {
    pub source: EventSource,
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub params: Params,
}

impl CommandOptions {
    pub fn new(source: EventSource, session_id: impl Into<String>) -> Self {
        Self {
            source,
            session_id: session_id.into(),
            user_id: None,
            params: Params::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// String parameter, `None` when absent or not a string
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }

    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.str_param(key).ok_or_else(|| {
            AgentSyncError::validation(format!("Parameter {} must be a string", key))
        })
    }

    pub fn bool_param(&self, key: &str) -> Option<bool> {
        self.params.get(key).and_then(Value::as_bool)
    }
}

/// Error half of a [`CommandResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandError {
    /// Short machine-readable kind, see [`AgentSyncError::kind`]
    pub kind: String,
    pub message: String,
}

impl From<&AgentSyncError> for CommandError {
    fn from(err: &AgentSyncError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

/// Envelope returned for every command, successful or not
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<CommandError>,
    pub execution_time_ms: u64,
    pub command_id: String,
    pub source: EventSource,
    pub timestamp: DateTime<Utc>,
}

/// A command runnable from any front end
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Registry key, e.g. `create-agent`
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn category(&self) -> CommandCategory;

    /// Checked by the registry before `execute` runs
    fn required_params(&self) -> &[&'static str] {
        &[]
    }

    fn optional_params(&self) -> &[&'static str] {
        &[]
    }

    async fn execute(&self, options: &CommandOptions) -> Result<Value>;
}

/// Command metadata for listings
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandInfo {
    pub name: String,
    pub description: String,
    pub category: CommandCategory,
    pub required_params: Vec<String>,
    pub optional_params: Vec<String>,
}

impl CommandInfo {
    fn of(command: &dyn CommandHandler) -> Self {
        Self {
            name: command.name().to_string(),
            description: command.description().to_string(),
            category: command.category(),
            required_params: command.required_params().iter().map(|p| p.to_string()).collect(),
            optional_params: command.optional_params().iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Registry of commands by name
#[derive(Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command, replacing any command with the same name
    pub fn register(&mut self, command: Arc<dyn CommandHandler>) {
        let name = command.name().to_string();
        if self.commands.insert(name.clone(), command).is_some() {
            debug!(command = %name, "Replaced registered command");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.commands.get(name).cloned()
    }

    /// Registered command names, sorted
    pub fn names(&self) -> Vec<String> {
        self.commands.keys().cloned().collect()
    }

    pub fn list(&self) -> Vec<CommandInfo> {
        self.commands.values().map(|c| CommandInfo::of(c.as_ref())).collect()
    }

    pub fn list_by_category(&self, category: CommandCategory) -> Vec<CommandInfo> {
        self.commands
            .values()
            .filter(|c| c.category() == category)
            .map(|c| CommandInfo::of(c.as_ref()))
            .collect()
    }

    fn resolve(&self, name: &str, options: &CommandOptions) -> Result<Arc<dyn CommandHandler>> {
        let command = self.get(name).ok_or_else(|| {
            AgentSyncError::validation(format!(
                "Unknown command: {} (available: {})",
                name,
                self.names().join(", ")
            ))
        })?;

        let missing: Vec<&str> = command
            .required_params()
            .iter()
            .copied()
            .filter(|param| !options.params.contains_key(*param))
            .collect();
        if !missing.is_empty() {
            return Err(AgentSyncError::validation(format!(
                "Missing required parameters for {}: {}",
                name,
                missing.join(", ")
            )));
        }
        Ok(command)
    }

    /// Validate, run and time a command
    pub async fn execute_command(&self, name: &str, options: &CommandOptions) -> CommandResult {
        let started = Instant::now();
        let command_id = format!("cmd_{}", Uuid::new_v4().simple());

        let outcome = match self.resolve(name, options) {
            Ok(command) => command.execute(options).await,
            Err(err) => Err(err),
        };
        let execution_time_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(data) => {
                debug!(command = name, command_id = %command_id, execution_time_ms, "Command executed");
                CommandResult {
                    success: true,
                    data: Some(data),
                    error: None,
                    execution_time_ms,
                    command_id,
                    source: options.source,
                    timestamp: Utc::now(),
                }
            }
            Err(err) => {
                warn!(command = name, command_id = %command_id, error = %err, "Command failed");
                CommandResult {
                    success: false,
                    data: None,
                    error: Some(CommandError::from(&err)),
                    execution_time_ms,
                    command_id,
                    source: options.source,
                    timestamp: Utc::now(),
                }
            }
        }
    }
}

//! Command execution pipeline shared by all front ends
//!
//! Every command runs through the registry, lands in the activity log and is
//! announced on the bridge as `command.executed`. Successful commands are then
//! compared with recent activity and any conflicts are resolved and announced
//! as `sync.conflict`.

use super::activity::{ActivityEntry, ActivityFilter, ActivityLogger};
use super::bridge::{EventPayload, SyncBridge};
use super::command::{CommandOptions, CommandRegistry, CommandResult};
use super::conflict::{ConflictInfo, ConflictResolver};
use crate::clock::SharedClock;
use crate::config::{AgentSyncConfig, CoordinatorConfig};
use crate::models::EventSource;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

pub const COMMAND_EXECUTED: &str = "command.executed";
pub const SYNC_CONFLICT: &str = "sync.conflict";

/// Session id stamped on coordinator-originated events
const COORDINATOR_SESSION: &str = "coordinator";

pub struct CoreCoordinator {
    registry: CommandRegistry,
    bridge: Arc<SyncBridge>,
    activity: Arc<ActivityLogger>,
    conflicts: Arc<ConflictResolver>,
    config: CoordinatorConfig,
    clock: SharedClock,
}

impl CoreCoordinator {
    pub fn new(registry: CommandRegistry, config: &AgentSyncConfig, clock: SharedClock) -> Self {
        Self {
            registry,
            bridge: Arc::new(SyncBridge::new(clock.clone())),
            activity: Arc::new(ActivityLogger::new(config.activity.capacity, clock.clone())),
            conflicts: Arc::new(ConflictResolver::new(config.conflict.clone(), clock.clone())),
            config: config.coordinator.clone(),
            clock,
        }
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut CommandRegistry {
        &mut self.registry
    }

    pub fn bridge(&self) -> &Arc<SyncBridge> {
        &self.bridge
    }

    pub fn activity(&self) -> &Arc<ActivityLogger> {
        &self.activity
    }

    pub fn conflicts(&self) -> &Arc<ConflictResolver> {
        &self.conflicts
    }

    /// Run a command and record it
    pub async fn execute_command(&self, name: &str, options: CommandOptions) -> CommandResult {
        let result = self.registry.execute_command(name, &options).await;
        let entry = self.activity.log(name, &options, result.clone());

        let payload = EventPayload::new(
            COMMAND_EXECUTED,
            json!({
                "command": name,
                "params": options.params,
                "result": result,
                "logEntryId": entry.id,
            }),
            options.source,
            options.session_id.as_str(),
            self.clock.now(),
        )
        .with_user(options.user_id.clone());
        self.bridge.broadcast(&payload);

        if result.success {
            self.check_conflicts(&entry);
        }
        result
    }

    /// Compare `entry` with recent activity, resolving and announcing conflicts
    pub fn check_conflicts(&self, entry: &ActivityEntry) -> Vec<ConflictInfo> {
        let since = self.clock.now() - chrono::Duration::milliseconds(self.config.window_ms);
        let recent = self
            .activity
            .get_logs(&ActivityFilter::since(since).with_limit(self.config.limit + 1));

        let mut found = Vec::new();
        for other in recent.iter().filter(|e| e.id != entry.id).take(self.config.limit) {
            let Some(conflict) = self.conflicts.detect_conflict(entry, other) else {
                continue;
            };
            if !self.conflicts.resolve_conflict(&conflict) {
                warn!(conflict_id = %conflict.id, "Conflict requires manual resolution");
            }
            let conflict = self
                .conflicts
                .get_conflict(&conflict.id)
                .unwrap_or(conflict);

            match serde_json::to_value(&conflict) {
                Ok(data) => {
                    let payload = EventPayload::new(
                        SYNC_CONFLICT,
                        data,
                        EventSource::System,
                        COORDINATOR_SESSION,
                        self.clock.now(),
                    );
                    self.bridge.broadcast(&payload);
                }
                Err(e) => warn!(conflict_id = %conflict.id, error = %e, "Failed to encode conflict"),
            }
            found.push(conflict);
        }

        debug!(entry_id = %entry.id, conflicts = found.len(), "Conflict check finished");
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::coordination::command::{CommandCategory, CommandHandler};
    use crate::coordination::conflict::{ConflictFilter, ConflictType, Severity};
    use crate::error::Result;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use serde_json::Value;

    struct Noop(&'static str);

    #[async_trait]
    impl CommandHandler for Noop {
        fn name(&self) -> &str {
            self.0
        }

        fn description(&self) -> &str {
            "Does nothing"
        }

        fn category(&self) -> CommandCategory {
            CommandCategory::Agent
        }

        fn required_params(&self) -> &[&'static str] {
            &["agentId"]
        }

        async fn execute(&self, options: &CommandOptions) -> Result<Value> {
            Ok(json!({ "agentId": options.require_str("agentId")? }))
        }
    }

    fn coordinator(clock: Arc<ManualClock>) -> CoreCoordinator {
        let mut registry = CommandRegistry::new();
        for name in ["create-agent", "delete-agent", "start-agent", "stop-agent"] {
            registry.register(Arc::new(Noop(name)));
        }
        CoreCoordinator::new(registry, &AgentSyncConfig::default(), clock)
    }

    #[tokio::test]
    async fn test_create_then_delete_raises_state_conflict() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let coordinator = coordinator(clock.clone());
        coordinator.bridge().subscribe("gui", [SYNC_CONFLICT, COMMAND_EXECUTED]);
        let mut gui = coordinator.bridge().on_sync("gui");

        let create = CommandOptions::new(EventSource::Gui, "gui").with_param("agentId", "a1");
        assert!(coordinator.execute_command("create-agent", create).await.success);
        clock.advance(Duration::seconds(2));
        let delete = CommandOptions::new(EventSource::Cli, "cli").with_param("agentId", "a1");
        assert!(coordinator.execute_command("delete-agent", delete).await.success);

        let conflicts = coordinator.conflicts().get_conflicts(&ConflictFilter::default());
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::State);
        assert_eq!(conflicts[0].severity, Severity::High);
        assert!(!conflicts[0].auto_resolved);

        // own create is suppressed; the CLI delete and the conflict arrive
        let first = gui.recv().await.unwrap();
        assert_eq!(first.event_type, COMMAND_EXECUTED);
        assert_eq!(first.session_id, "cli");
        let second = gui.recv().await.unwrap();
        assert_eq!(second.event_type, SYNC_CONFLICT);
        assert_eq!(second.data["type"], "state");
    }

    #[tokio::test]
    async fn test_activity_outside_window_is_ignored() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let coordinator = coordinator(clock.clone());

        let options = CommandOptions::new(EventSource::Cli, "cli").with_param("agentId", "a1");
        coordinator.execute_command("stop-agent", options.clone()).await;
        clock.advance(Duration::seconds(11));
        coordinator.execute_command("start-agent", options).await;

        assert!(coordinator
            .conflicts()
            .get_conflicts(&ConflictFilter::default())
            .is_empty());
        assert_eq!(coordinator.activity().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_commands_are_logged_without_conflict_check() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let coordinator = coordinator(clock.clone());

        let options = CommandOptions::new(EventSource::Cli, "cli").with_param("agentId", "a1");
        coordinator.execute_command("start-agent", options).await;
        let missing = CommandOptions::new(EventSource::Cli, "cli");
        let result = coordinator.execute_command("start-agent", missing).await;

        assert!(!result.success);
        assert_eq!(coordinator.activity().len(), 2);
        assert!(coordinator
            .conflicts()
            .get_conflicts(&ConflictFilter::default())
            .is_empty());
    }
}

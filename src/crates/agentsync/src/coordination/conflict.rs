//! Conflict detection between recent commands
//!
//! Classification, highest priority first:
//!
//! - `resource`: both commands target the same entity within
//!   `resource_window_ms`, unless they form an incompatible pair involving a
//!   destructive command
//! - `state`: the command pair is incompatible and targets the same entity
//! - `concurrent`: different sources within `concurrent_window_ms`
//!
//! The destructive exception departs from the plain rule that any same-entity
//! pair inside the resource window is a resource conflict: a start or create
//! followed by a delete within five seconds is reported as a `state` conflict.
//!
//! Each type has a resolution strategy; strategies can be replaced at runtime.

use super::activity::ActivityEntry;
use crate::clock::SharedClock;
use crate::config::ConflictConfig;
use crate::error::{AgentSyncError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictType {
    Resource,
    State,
    Concurrent,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resource => "resource",
            Self::State => "state",
            Self::Concurrent => "concurrent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// A detected conflict between two commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub command_a: ActivityEntry,
    pub command_b: ActivityEntry,
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub severity: Severity,
    pub auto_resolved: bool,
    #[serde(default)]
    pub resolution: Option<String>,
}

impl ConflictInfo {
    /// The more recent of the two commands
    pub fn later(&self) -> &ActivityEntry {
        if self.command_b.timestamp > self.command_a.timestamp {
            &self.command_b
        } else {
            &self.command_a
        }
    }
}

/// Resolution strategy
///
/// `Ok(Some(resolution))` resolves the conflict, `Ok(None)` leaves it for
/// manual handling and `Err` marks the attempt as failed.
pub type Strategy = Arc<dyn Fn(&ConflictInfo) -> Result<Option<String>> + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct ConflictFilter {
    pub resolved: Option<bool>,
    pub severity: Option<Severity>,
    pub since: Option<DateTime<Utc>>,
}

impl ConflictFilter {
    fn matches(&self, conflict: &ConflictInfo) -> bool {
        self.resolved.map_or(true, |r| conflict.auto_resolved == r)
            && self.severity.map_or(true, |s| conflict.severity == s)
            && self.since.map_or(true, |since| conflict.timestamp >= since)
    }
}

pub struct ConflictResolver {
    config: ConflictConfig,
    clock: SharedClock,
    conflicts: RwLock<Vec<ConflictInfo>>,
    strategies: RwLock<HashMap<ConflictType, Strategy>>,
}

impl ConflictResolver {
    /// Resolver with the default strategy for every conflict type
    pub fn new(config: ConflictConfig, clock: SharedClock) -> Self {
        let resolver = Self {
            config,
            clock,
            conflicts: RwLock::new(Vec::new()),
            strategies: RwLock::new(HashMap::new()),
        };
        resolver.register_strategy(ConflictType::Resource, Arc::new(later_operation_wins));
        let safe = resolver.config.safe_operations.clone();
        resolver.register_strategy(
            ConflictType::State,
            Arc::new(move |conflict: &ConflictInfo| prefer_safe_operation(&safe, conflict)),
        );
        resolver.register_strategy(ConflictType::Concurrent, Arc::new(allow_concurrent));
        resolver
    }

    pub fn config(&self) -> &ConflictConfig {
        &self.config
    }

    /// Replace the strategy for a conflict type
    pub fn register_strategy(&self, conflict_type: ConflictType, strategy: Strategy) {
        self.strategies.write().insert(conflict_type, strategy);
    }

    fn matches_any(operations: &[String], command: &str) -> bool {
        operations.iter().any(|op| command.contains(op.as_str()))
    }

    fn is_incompatible(&self, a: &str, b: &str) -> bool {
        self.config
            .incompatible_pairs
            .iter()
            .any(|(x, y)| (x == a && y == b) || (x == b && y == a))
    }

    /// Classify a pair of commands without recording anything
    pub fn classify(&self, a: &ActivityEntry, b: &ActivityEntry) -> Option<(ConflictType, Severity)> {
        let same_entity = matches!((a.entity_id(), b.entity_id()), (Some(x), Some(y)) if x == y);
        let gap_ms = (a.timestamp - b.timestamp).num_milliseconds().abs();
        let incompatible = same_entity && self.is_incompatible(&a.command, &b.command);
        let destructive = Self::matches_any(&self.config.destructive_operations, &a.command)
            || Self::matches_any(&self.config.destructive_operations, &b.command);

        if same_entity && gap_ms < self.config.resource_window_ms && !(incompatible && destructive) {
            return Some((ConflictType::Resource, Severity::Medium));
        }
        if incompatible {
            return Some((ConflictType::State, Severity::High));
        }
        if a.source != b.source && gap_ms < self.config.concurrent_window_ms {
            return Some((ConflictType::Concurrent, Severity::Low));
        }
        None
    }

    /// Classify and record a conflict between two commands
    pub fn detect_conflict(&self, a: &ActivityEntry, b: &ActivityEntry) -> Option<ConflictInfo> {
        let (conflict_type, severity) = self.classify(a, b)?;
        let conflict = ConflictInfo {
            id: format!("conflict_{}", Uuid::new_v4().simple()),
            timestamp: self.clock.now(),
            command_a: a.clone(),
            command_b: b.clone(),
            conflict_type,
            severity,
            auto_resolved: false,
            resolution: None,
        };
        warn!(
            conflict_id = %conflict.id,
            conflict_type = conflict_type.as_str(),
            command_a = %a.command,
            command_b = %b.command,
            "Conflict detected"
        );
        self.conflicts.write().push(conflict.clone());
        Some(conflict)
    }

    /// Run the strategy for a conflict; true when it auto-resolved
    ///
    /// The recorded conflict is updated with the outcome.
    pub fn resolve_conflict(&self, conflict: &ConflictInfo) -> bool {
        let strategy = self.strategies.read().get(&conflict.conflict_type).cloned();
        let (resolved, resolution) = match strategy {
            None => (false, None),
            Some(strategy) => match strategy(conflict) {
                Ok(Some(resolution)) => (true, Some(resolution)),
                Ok(None) => (false, None),
                Err(e) => (false, Some(format!("Auto-resolution failed: {}", e))),
            },
        };

        if resolved {
            info!(conflict_id = %conflict.id, resolution = ?resolution, "Conflict resolved");
        }

        let mut conflicts = self.conflicts.write();
        if let Some(stored) = conflicts.iter_mut().find(|c| c.id == conflict.id) {
            stored.auto_resolved = resolved;
            stored.resolution = resolution;
        }
        resolved
    }

    /// Like [`Self::resolve_conflict`], failing when manual resolution is needed
    pub fn try_resolve(&self, conflict: &ConflictInfo) -> Result<ConflictInfo> {
        if self.resolve_conflict(conflict) {
            return self
                .get_conflict(&conflict.id)
                .ok_or_else(|| AgentSyncError::not_found("conflict", &conflict.id));
        }
        let reason = self
            .get_conflict(&conflict.id)
            .and_then(|c| c.resolution)
            .unwrap_or_else(|| "Requires manual resolution".to_string());
        Err(AgentSyncError::ConflictUnresolved {
            conflict_id: conflict.id.clone(),
            reason,
        })
    }

    pub fn get_conflict(&self, id: &str) -> Option<ConflictInfo> {
        self.conflicts.read().iter().find(|c| c.id == id).cloned()
    }

    /// Recorded conflicts, oldest first
    pub fn get_conflicts(&self, filter: &ConflictFilter) -> Vec<ConflictInfo> {
        self.conflicts
            .read()
            .iter()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect()
    }
}

fn later_operation_wins(conflict: &ConflictInfo) -> Result<Option<String>> {
    Ok(Some(format!(
        "Resolved by allowing later operation: {}",
        conflict.later().command
    )))
}

/// Resolves only when exactly one side is read-only
fn prefer_safe_operation(safe: &[String], conflict: &ConflictInfo) -> Result<Option<String>> {
    let a = &conflict.command_a.command;
    let b = &conflict.command_b.command;
    let a_safe = ConflictResolver::matches_any(safe, a);
    let b_safe = ConflictResolver::matches_any(safe, b);
    Ok(match (a_safe, b_safe) {
        (true, false) => Some(format!("Prioritized safe operation: {}", a)),
        (false, true) => Some(format!("Prioritized safe operation: {}", b)),
        _ => None,
    })
}

fn allow_concurrent(_conflict: &ConflictInfo) -> Result<Option<String>> {
    Ok(Some(
        "Allowed concurrent operations from different sources".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::coordination::activity::ActivityLogger;
    use crate::coordination::command::{CommandOptions, CommandResult};
    use crate::models::EventSource;
    use chrono::Duration;

    struct Fixture {
        clock: Arc<ManualClock>,
        logger: ActivityLogger,
        resolver: ConflictResolver,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new(Utc::now()));
            Self {
                logger: ActivityLogger::new(100, clock.clone()),
                resolver: ConflictResolver::new(ConflictConfig::default(), clock.clone()),
                clock,
            }
        }

        fn run(&self, command: &str, source: EventSource, agent: &str) -> ActivityEntry {
            let options = CommandOptions::new(source, "session").with_param("agentId", agent);
            let result = CommandResult {
                success: true,
                data: None,
                error: None,
                execution_time_ms: 0,
                command_id: "cmd_x".into(),
                source,
                timestamp: self.clock.now(),
            };
            self.logger.log(command, &options, result)
        }
    }

    #[test]
    fn test_same_entity_within_window_is_resource() {
        let f = Fixture::new();
        let a = f.run("stop-agent", EventSource::Cli, "a1");
        f.clock.advance(Duration::seconds(2));
        let b = f.run("start-agent", EventSource::Cli, "a1");

        let conflict = f.resolver.detect_conflict(&b, &a).unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::Resource);
        assert_eq!(conflict.severity, Severity::Medium);

        assert!(f.resolver.resolve_conflict(&conflict));
        let stored = f.resolver.get_conflict(&conflict.id).unwrap();
        assert_eq!(
            stored.resolution.as_deref(),
            Some("Resolved by allowing later operation: start-agent")
        );
    }

    #[test]
    fn test_create_then_delete_is_unresolved_state_conflict() {
        let f = Fixture::new();
        let a = f.run("create-agent", EventSource::Gui, "a1");
        f.clock.advance(Duration::seconds(2));
        let b = f.run("delete-agent", EventSource::Cli, "a1");

        let conflict = f.resolver.detect_conflict(&b, &a).unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::State);
        assert_eq!(conflict.severity, Severity::High);
        assert!(!f.resolver.resolve_conflict(&conflict));

        let err = f.resolver.try_resolve(&conflict).unwrap_err();
        assert!(matches!(err, AgentSyncError::ConflictUnresolved { .. }));

        let unresolved = f.resolver.get_conflicts(&ConflictFilter {
            resolved: Some(false),
            severity: Some(Severity::High),
            ..ConflictFilter::default()
        });
        assert_eq!(unresolved.len(), 1);
    }

    #[test]
    fn test_start_then_delete_inside_window_is_state_not_resource() {
        let f = Fixture::new();
        let a = f.run("start-agent", EventSource::Cli, "a1");
        f.clock.advance(Duration::seconds(4));
        let b = f.run("delete-agent", EventSource::Cli, "a1");

        let (kind, severity) = f.resolver.classify(&b, &a).unwrap();
        assert_eq!(kind, ConflictType::State);
        assert_eq!(severity, Severity::High);
    }

    #[test]
    fn test_incompatible_pair_outside_window_is_state() {
        let f = Fixture::new();
        let a = f.run("stop-agent", EventSource::Cli, "a1");
        f.clock.advance(Duration::seconds(8));
        let b = f.run("start-agent", EventSource::Cli, "a1");

        let (kind, _) = f.resolver.classify(&b, &a).unwrap();
        assert_eq!(kind, ConflictType::State);
    }

    #[test]
    fn test_different_sources_are_concurrent() {
        let f = Fixture::new();
        let a = f.run("create-agent", EventSource::Gui, "a1");
        f.clock.advance(Duration::milliseconds(300));
        let b = f.run("create-agent", EventSource::Cli, "a2");

        let conflict = f.resolver.detect_conflict(&b, &a).unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::Concurrent);
        assert!(f.resolver.try_resolve(&conflict).unwrap().auto_resolved);

        f.clock.advance(Duration::seconds(5));
        let c = f.run("list-agents", EventSource::Gui, "a3");
        assert!(f.resolver.detect_conflict(&c, &b).is_none());
    }

    #[test]
    fn test_state_strategy_prefers_single_safe_side() {
        let f = Fixture::new();
        let a = f.run("agent-status", EventSource::Cli, "a1");
        let b = f.run("delete-agent", EventSource::Gui, "a1");
        let conflict = ConflictInfo {
            id: "conflict_manual".into(),
            timestamp: f.clock.now(),
            command_a: a,
            command_b: b,
            conflict_type: ConflictType::State,
            severity: Severity::High,
            auto_resolved: false,
            resolution: None,
        };
        assert!(f.resolver.resolve_conflict(&conflict));
    }

    #[test]
    fn test_custom_strategy_errors_are_recorded() {
        let f = Fixture::new();
        f.resolver.register_strategy(
            ConflictType::Resource,
            Arc::new(|_: &ConflictInfo| Err(AgentSyncError::validation("no"))),
        );
        let a = f.run("start-agent", EventSource::Cli, "a1");
        let b = f.run("start-agent", EventSource::Cli, "a1");
        let conflict = f.resolver.detect_conflict(&b, &a).unwrap();

        assert!(!f.resolver.resolve_conflict(&conflict));
        let stored = f.resolver.get_conflict(&conflict.id).unwrap();
        assert!(stored.resolution.unwrap().starts_with("Auto-resolution failed"));
    }
}

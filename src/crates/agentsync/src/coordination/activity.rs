//! Bounded in-memory activity log
//!
//! Entries are kept newest first; once `capacity` is reached the oldest entry
//! is evicted.

use super::command::{CommandOptions, CommandResult, Params};
use crate::clock::SharedClock;
use crate::models::EventSource;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use uuid::Uuid;

/// Entries returned in [`ActivityStats::recent`]
const RECENT_ENTRIES: usize = 10;

/// One executed command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source: EventSource,
    pub command: String,
    pub params: Params,
    pub result: CommandResult,
    #[serde(default)]
    pub user_id: Option<String>,
    pub session_id: String,
}

impl ActivityEntry {
    /// Entity the command targets, from `agentId` or `projectId`
    pub fn entity_id(&self) -> Option<&str> {
        self.params
            .get("agentId")
            .or_else(|| self.params.get("projectId"))
            .and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActivityFilter {
    pub source: Option<EventSource>,
    pub command: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    /// Inclusive lower bound on the entry timestamp
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl ActivityFilter {
    pub fn since(since: DateTime<Utc>) -> Self {
        Self {
            since: Some(since),
            ..Self::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_source(mut self, source: EventSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    fn matches(&self, entry: &ActivityEntry) -> bool {
        self.source.map_or(true, |s| entry.source == s)
            && self.command.as_deref().map_or(true, |c| entry.command == c)
            && self
                .user_id
                .as_deref()
                .map_or(true, |u| entry.user_id.as_deref() == Some(u))
            && self
                .session_id
                .as_deref()
                .map_or(true, |s| entry.session_id == s)
            && self.since.map_or(true, |since| entry.timestamp >= since)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityStats {
    pub total: usize,
    pub by_source: BTreeMap<String, usize>,
    pub by_command: BTreeMap<String, usize>,
    pub recent: Vec<ActivityEntry>,
}

pub struct ActivityLogger {
    entries: RwLock<VecDeque<ActivityEntry>>,
    capacity: usize,
    clock: SharedClock,
}

impl ActivityLogger {
    pub fn new(capacity: usize, clock: SharedClock) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
            clock,
        }
    }

    /// Record a command execution, stamped with the logger's clock
    pub fn log(&self, command: &str, options: &CommandOptions, result: CommandResult) -> ActivityEntry {
        let entry = ActivityEntry {
            id: format!("log_{}", Uuid::new_v4().simple()),
            timestamp: self.clock.now(),
            source: options.source,
            command: command.to_string(),
            params: options.params.clone(),
            result,
            user_id: options.user_id.clone(),
            session_id: options.session_id.clone(),
        };

        let mut entries = self.entries.write();
        entries.push_front(entry.clone());
        entries.truncate(self.capacity);
        entry
    }

    /// Matching entries, newest first
    pub fn get_logs(&self, filter: &ActivityFilter) -> Vec<ActivityEntry> {
        let entries = self.entries.read();
        let matching = entries.iter().filter(|e| filter.matches(e)).cloned();
        match filter.limit {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }

    pub fn get_log_by_id(&self, id: &str) -> Option<ActivityEntry> {
        self.entries.read().iter().find(|e| e.id == id).cloned()
    }

    /// Remove entries older than `older_than`, or everything with `None`
    pub fn clear_logs(&self, older_than: Option<DateTime<Utc>>) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        match older_than {
            Some(cutoff) => entries.retain(|e| e.timestamp >= cutoff),
            None => entries.clear(),
        }
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn stats(&self) -> ActivityStats {
        let entries = self.entries.read();
        let mut by_source = BTreeMap::new();
        let mut by_command = BTreeMap::new();
        for entry in entries.iter() {
            *by_source.entry(entry.source.to_string()).or_insert(0) += 1;
            *by_command.entry(entry.command.clone()).or_insert(0) += 1;
        }
        ActivityStats {
            total: entries.len(),
            by_source,
            by_command,
            recent: entries.iter().take(RECENT_ENTRIES).cloned().collect(),
        }
    }
}

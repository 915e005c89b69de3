//! In-process event bridge between front-end sessions
//!
//! Each session subscribes to event types and registers one or more
//! listeners. A broadcast reaches every subscribed session except the one
//! that produced it.

use crate::clock::SharedClock;
use crate::models::EventSource;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Queue depth per listener; a full listener misses events
pub const LISTENER_CAPACITY: usize = 256;

/// Event exchanged between sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub source: EventSource,
    pub timestamp: DateTime<Utc>,
    /// Originating session, never delivered back to it
    pub session_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl EventPayload {
    pub fn new(
        event_type: impl Into<String>,
        data: Value,
        source: EventSource,
        session_id: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            source,
            timestamp,
            session_id: session_id.into(),
            user_id: None,
        }
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }
}

pub struct SyncBridge {
    /// event type -> subscribed sessions
    subscriptions: DashMap<String, BTreeSet<String>>,
    /// session -> listener queues
    listeners: DashMap<String, Vec<mpsc::Sender<EventPayload>>>,
    last_sync: RwLock<Option<DateTime<Utc>>>,
    clock: SharedClock,
}

impl SyncBridge {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            subscriptions: DashMap::new(),
            listeners: DashMap::new(),
            last_sync: RwLock::new(None),
            clock,
        }
    }

    pub fn subscribe<I, S>(&self, session_id: &str, event_types: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for event_type in event_types {
            self.subscriptions
                .entry(event_type.into())
                .or_default()
                .insert(session_id.to_string());
        }
        debug!(session_id, "Session subscribed");
    }

    /// Drop the given subscriptions, or all of them with `None`
    pub fn unsubscribe(&self, session_id: &str, event_types: Option<&[String]>) {
        match event_types {
            Some(types) => {
                for event_type in types {
                    if let Some(mut sessions) = self.subscriptions.get_mut(event_type) {
                        sessions.remove(session_id);
                    }
                }
            }
            None => {
                for mut sessions in self.subscriptions.iter_mut() {
                    sessions.remove(session_id);
                }
            }
        }
        self.subscriptions.retain(|_, sessions| !sessions.is_empty());
    }

    /// Register a listener for a session
    pub fn on_sync(&self, session_id: &str) -> mpsc::Receiver<EventPayload> {
        let (tx, rx) = mpsc::channel(LISTENER_CAPACITY);
        self.listeners
            .entry(session_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Remove every listener of a session
    pub fn off_sync(&self, session_id: &str) {
        self.listeners.remove(session_id);
    }

    /// Deliver to every subscribed session except the originator
    ///
    /// Returns the number of sessions that received the event.
    pub fn broadcast(&self, payload: &EventPayload) -> usize {
        *self.last_sync.write() = Some(self.clock.now());

        let targets: Vec<String> = match self.subscriptions.get(&payload.event_type) {
            Some(sessions) => sessions
                .iter()
                .filter(|s| **s != payload.session_id)
                .cloned()
                .collect(),
            None => return 0,
        };

        let mut delivered = 0;
        for session_id in targets {
            let Some(mut senders) = self.listeners.get_mut(&session_id) else {
                continue;
            };
            let mut reached = false;
            senders.retain(|tx| match tx.try_send(payload.clone()) {
                Ok(()) => {
                    reached = true;
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(session_id = %session_id, event_type = %payload.event_type, "Listener queue full, event dropped");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
            if reached {
                delivered += 1;
            }
        }

        debug!(event_type = %payload.event_type, delivered, "Bridge broadcast");
        delivered
    }

    /// Time of the most recent broadcast
    pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.read()
    }

    /// Subscribed sessions per event type
    pub fn subscribers(&self) -> BTreeMap<String, Vec<String>> {
        self.subscriptions
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().iter().cloned().collect()))
            .collect()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.iter().map(|entry| entry.value().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use serde_json::json;

    fn payload(session_id: &str) -> EventPayload {
        EventPayload::new(
            "agent.updated",
            json!({"agentId": "a1"}),
            EventSource::Cli,
            session_id,
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_broadcast_suppresses_echo() {
        let bridge = SyncBridge::new(system_clock());
        bridge.subscribe("s1", ["agent.updated"]);
        bridge.subscribe("s2", ["agent.updated"]);
        let mut rx1 = bridge.on_sync("s1");
        let mut rx2 = bridge.on_sync("s2");

        assert_eq!(bridge.broadcast(&payload("s1")), 1);
        assert_eq!(rx2.recv().await.unwrap().session_id, "s1");
        assert!(rx1.try_recv().is_err());
        assert!(bridge.last_sync_time().is_some());
    }

    #[tokio::test]
    async fn test_unsubscribed_types_are_not_delivered() {
        let bridge = SyncBridge::new(system_clock());
        bridge.subscribe("s2", ["project.created"]);
        let mut rx2 = bridge.on_sync("s2");

        assert_eq!(bridge.broadcast(&payload("s1")), 0);
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_unsubscribe_and_off_sync() {
        let bridge = SyncBridge::new(system_clock());
        bridge.subscribe("s1", ["a", "b"]);
        bridge.subscribe("s2", ["a"]);

        bridge.unsubscribe("s1", Some(&["a".to_string()]));
        let subscribers = bridge.subscribers();
        assert_eq!(subscribers["a"], vec!["s2"]);
        assert_eq!(subscribers["b"], vec!["s1"]);

        bridge.unsubscribe("s1", None);
        assert!(!bridge.subscribers().contains_key("b"));

        let _rx = bridge.on_sync("s2");
        assert_eq!(bridge.listener_count(), 1);
        bridge.off_sync("s2");
        assert_eq!(bridge.listener_count(), 0);
    }

    #[test]
    fn test_closed_listeners_are_pruned() {
        let bridge = SyncBridge::new(system_clock());
        bridge.subscribe("s2", ["agent.updated"]);
        drop(bridge.on_sync("s2"));

        assert_eq!(bridge.broadcast(&payload("s1")), 0);
        assert_eq!(bridge.listener_count(), 0);
    }
}

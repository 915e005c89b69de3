//! Hub/peer wire messages
//!
//! Every frame is a JSON text message tagged by `type`.

use crate::error::{AgentSyncError, Result};
use crate::models::SyncEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

/// Message exchanged between the hub and its peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    /// Keep-alive ping
    Ping,

    /// Keep-alive pong response
    Pong,

    /// Add event types to the sender's subscription set
    Subscribe {
        #[serde(rename = "eventTypes")]
        event_types: Vec<String>,
    },

    /// Remove event types from the sender's subscription set
    Unsubscribe {
        #[serde(rename = "eventTypes")]
        event_types: Vec<String>,
    },

    /// Entity change
    SyncEvent { data: SyncEvent },

    /// Error event
    Error { message: String },
}

const KNOWN_TYPES: &[&str] = &["ping", "pong", "subscribe", "unsubscribe", "sync_event", "error"];

impl SyncMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn event(event: SyncEvent) -> Self {
        Self::SyncEvent { data: event }
    }

    /// Parse a text frame
    ///
    /// The error message distinguishes unparseable JSON, unknown message
    /// types and known types with bad fields; it is sent back verbatim.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|_| AgentSyncError::Protocol("Invalid message format".to_string()))?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentSyncError::Protocol("Message has no type".to_string()))?;
        if !KNOWN_TYPES.contains(&kind) {
            return Err(AgentSyncError::Protocol(format!(
                "Unknown message type: {}",
                kind
            )));
        }

        let kind = kind.to_string();
        serde_json::from_value(value)
            .map_err(|e| AgentSyncError::Protocol(format!("Invalid {} message: {}", kind, e)))
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// WebSocket text frame carrying this message
    pub fn to_frame(&self) -> Result<Message> {
        Ok(Message::Text(self.to_text()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityAction, EntityKind};
    use serde_json::json;

    #[test]
    fn test_wire_shapes() {
        assert_eq!(SyncMessage::Ping.to_text().unwrap(), r#"{"type":"ping"}"#);

        let subscribe = SyncMessage::Subscribe {
            event_types: vec!["agent.created".into()],
        };
        assert_eq!(
            serde_json::to_value(&subscribe).unwrap(),
            json!({"type": "subscribe", "eventTypes": ["agent.created"]})
        );

        let error = serde_json::to_value(SyncMessage::error("boom")).unwrap();
        assert_eq!(error, json!({"type": "error", "message": "boom"}));
    }

    #[test]
    fn test_sync_event_frame() {
        let event = SyncEvent::new(EntityKind::Task, "t1", EntityAction::Update, Some(json!({"title": "x"})));
        let text = SyncMessage::event(event.clone()).to_text().unwrap();

        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "sync_event");
        assert_eq!(value["data"]["type"], "task.updated");
        assert_eq!(value["data"]["entityId"], "t1");

        assert_eq!(SyncMessage::parse(&text).unwrap(), SyncMessage::event(event));
    }

    #[test]
    fn test_parse_errors() {
        let err = SyncMessage::parse("{not json").unwrap_err();
        assert_eq!(err.to_string(), "Protocol error: Invalid message format");

        let err = SyncMessage::parse(r#"{"type":"teleport"}"#).unwrap_err();
        assert!(err.to_string().contains("Unknown message type: teleport"));

        let err = SyncMessage::parse(r#"{"type":"subscribe"}"#).unwrap_err();
        assert!(err.to_string().contains("Invalid subscribe message"));

        assert!(SyncMessage::parse(r#"{"eventTypes":[]}"#).is_err());
    }
}

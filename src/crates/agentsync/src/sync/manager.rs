//! Bridges local entity changes and the sync transport
//!
//! [`SyncManager`] turns repository changes into [`SyncEvent`]s for a hub or
//! peer, and applies events received from the other side to the local store.

use super::hub::SyncHub;
use super::peer::SyncPeer;
use crate::db::Database;
use crate::error::{AgentSyncError, Result};
use crate::models::{Agent, EntityAction, EntityKind, EventSource, Project, SyncEvent, Task};
use crate::repositories::codec::merge_object;
use crate::repositories::{ConfigRepository, Entity, EventRepository, Repository};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use sqlx::SqliteConnection;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Transport that local changes are published through
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Publish an event, returning the number of recipients it was queued for
    async fn publish(&self, event: &SyncEvent) -> Result<usize>;

    /// Whether the sink appends published events to the event log itself
    fn records_events(&self) -> bool;

    /// Live connections behind this sink
    fn connections(&self) -> usize;
}

#[async_trait]
impl EventSink for SyncHub {
    async fn publish(&self, event: &SyncEvent) -> Result<usize> {
        self.broadcast_event(event).await
    }

    fn records_events(&self) -> bool {
        true
    }

    fn connections(&self) -> usize {
        self.peer_count()
    }
}

#[async_trait]
impl EventSink for SyncPeer {
    async fn publish(&self, event: &SyncEvent) -> Result<usize> {
        self.send_event(event.clone())?;
        Ok(1)
    }

    /// The hub records events sent by peers
    fn records_events(&self) -> bool {
        true
    }

    fn connections(&self) -> usize {
        usize::from(self.is_connected())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStats {
    pub connections: Option<usize>,
    pub events_processed: i64,
    pub last_event_time: Option<DateTime<Utc>>,
}

/// Publishes local changes and applies remote ones
pub struct SyncManager {
    db: Arc<Database>,
    sink: Option<Arc<dyn EventSink>>,
    source: EventSource,
    remote: Mutex<Option<broadcast::Receiver<SyncEvent>>>,
    applied: broadcast::Sender<SyncEvent>,
}

impl SyncManager {
    /// Manager without a transport; changes are only recorded in the event log
    pub fn new(db: Arc<Database>) -> Self {
        let (applied, _) = broadcast::channel(256);
        Self {
            db,
            sink: None,
            source: EventSource::Api,
            remote: Mutex::new(None),
            applied,
        }
    }

    /// Publish through `hub` and apply events its peers send
    pub fn with_hub(mut self, hub: Arc<SyncHub>) -> Self {
        *self.remote.get_mut() = Some(hub.events());
        self.sink = Some(hub);
        self
    }

    /// Publish through `peer`, subscribed to every entity change type
    pub fn with_peer(mut self, peer: Arc<SyncPeer>) -> Result<Self> {
        peer.subscribe(SyncEvent::all_entity_types())?;
        *self.remote.get_mut() = Some(peer.events());
        self.sink = Some(peer);
        Ok(self)
    }

    /// Source stamped on locally produced events
    pub fn with_source(mut self, source: EventSource) -> Self {
        self.source = source;
        self
    }

    /// Events applied from remote sides
    pub fn applied_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.applied.subscribe()
    }

    /// Spawn the task applying remote events; `None` without a transport or
    /// when already started
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut remote = self.remote.lock().take()?;
        let manager = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                match remote.recv().await {
                    Ok(event) => {
                        if let Err(e) = manager.apply_remote(&event).await {
                            warn!(event_id = %event.id, error = %e, "Failed to apply remote event");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Remote event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Remote event listener stopped");
        }))
    }

    /// Publish a local change
    ///
    /// Transport failures are logged and the event is recorded locally; the
    /// change itself has already been persisted by the caller.
    pub async fn sync_change(
        &self,
        entity_type: EntityKind,
        entity_id: &str,
        action: EntityAction,
        data: Option<Value>,
        previous: Option<Value>,
    ) -> Result<SyncEvent> {
        let mut event = SyncEvent::new(entity_type, entity_id, action, data)
            .with_previous(previous)
            .with_source(self.source);
        if let Some(project_id) = event
            .data
            .as_ref()
            .and_then(|d| d.get("projectId"))
            .and_then(Value::as_str)
        {
            event.project_id = Some(project_id.to_string());
        }
        self.publish(&event).await?;
        Ok(event)
    }

    /// Publish an event built by the caller
    ///
    /// An event the transport could not take is appended to the local event
    /// log instead, so every change is recorded somewhere.
    pub async fn publish(&self, event: &SyncEvent) -> Result<()> {
        let recorded_by_sink = match &self.sink {
            Some(sink) => match sink.publish(event).await {
                Ok(recipients) => {
                    debug!(event_type = %event.event_type, recipients, "Change published");
                    sink.records_events()
                }
                Err(e) => {
                    warn!(event_id = %event.id, error = %e, "Failed to publish change, recording locally");
                    false
                }
            },
            None => false,
        };
        if !recorded_by_sink {
            self.record(event).await?;
        }
        Ok(())
    }

    async fn record(&self, event: &SyncEvent) -> Result<()> {
        let mut conn = self.db.acquire().await?;
        EventRepository::append(&mut conn, event).await
    }

    /// Apply a change received from another session
    pub async fn apply_remote(&self, event: &SyncEvent) -> Result<()> {
        let mut conn = self.db.acquire().await?;
        match event.entity_type {
            EntityKind::Agent => apply_entity::<Agent>(&mut conn, event).await?,
            EntityKind::Project => apply_entity::<Project>(&mut conn, event).await?,
            EntityKind::Task => apply_entity::<Task>(&mut conn, event).await?,
            EntityKind::Config => match (event.action, event.data.as_ref()) {
                (EntityAction::Delete, _) => {
                    debug!(event_id = %event.id, "Ignoring config delete");
                }
                (_, Some(data)) => {
                    ConfigRepository::update_global(&mut conn, data).await?;
                }
                (_, None) => return Err(missing_data(event)),
            },
        }
        drop(conn);

        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            entity_id = %event.entity_id,
            "Remote change applied"
        );
        let _ = self.applied.send(event.clone());
        Ok(())
    }

    pub async fn stats(&self) -> Result<SyncStats> {
        let mut conn = self.db.acquire().await?;
        let events_processed = EventRepository::count(&mut conn).await?;
        let last_event_time = EventRepository::find_recent(&mut conn, 1)
            .await?
            .first()
            .map(|e| e.timestamp);
        Ok(SyncStats {
            connections: self.sink.as_ref().map(|s| s.connections()),
            events_processed,
            last_event_time,
        })
    }
}

fn missing_data(event: &SyncEvent) -> AgentSyncError {
    AgentSyncError::Protocol(format!("{} event {} carries no data", event.event_type, event.id))
}

/// Creates and updates become upserts so replays converge; an update merges
/// over the local record when one exists
async fn apply_entity<E: Entity>(conn: &mut SqliteConnection, event: &SyncEvent) -> Result<()> {
    match event.action {
        EntityAction::Delete => {
            if !Repository::<E>::delete(conn, &event.entity_id).await? {
                debug!(entity_id = %event.entity_id, "Remote delete of unknown entity");
            }
        }
        EntityAction::Create | EntityAction::Update => {
            let data = event.data.as_ref().ok_or_else(|| missing_data(event))?;
            let mut record = match (event.action, Repository::<E>::find_by_id(conn, &event.entity_id).await?) {
                (EntityAction::Update, Some(current)) => serde_json::to_value(&current)?,
                _ => Value::Object(serde_json::Map::new()),
            };
            merge_object(&mut record, data)?;
            if let Some(object) = record.as_object_mut() {
                object.insert("id".to_string(), Value::String(event.entity_id.clone()));
            }
            let entity: E = serde_json::from_value(record).map_err(|e| {
                AgentSyncError::Protocol(format!("Invalid {} payload: {}", E::KIND, e))
            })?;
            Repository::<E>::upsert(conn, &entity).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::repositories::AgentRepository;
    use serde_json::json;

    async fn manager() -> SyncManager {
        SyncManager::new(Arc::new(Database::open_in_memory().await.unwrap()))
    }

    #[tokio::test]
    async fn test_sync_change_without_transport_records_event() {
        let manager = manager().await;
        let event = manager
            .sync_change(
                EntityKind::Agent,
                "a1",
                EntityAction::Create,
                Some(json!({"id": "a1", "projectId": "p1"})),
                None,
            )
            .await
            .unwrap();
        assert_eq!(event.event_type, "agent.created");
        assert_eq!(event.source, EventSource::Api);
        assert_eq!(event.project_id.as_deref(), Some("p1"));

        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.events_processed, 1);
        assert!(stats.connections.is_none());
        assert!(stats.last_event_time.is_some());
    }

    #[tokio::test]
    async fn test_apply_remote_lifecycle() {
        let manager = manager().await;
        let mut applied = manager.applied_events();

        let create = SyncEvent::new(
            EntityKind::Agent,
            "a1",
            EntityAction::Create,
            Some(json!({"name": "remote", "branch": "main"})),
        );
        manager.apply_remote(&create).await.unwrap();
        // Replaying a create converges instead of failing
        manager.apply_remote(&create).await.unwrap();

        let update = SyncEvent::new(
            EntityKind::Agent,
            "a1",
            EntityAction::Update,
            Some(json!({"status": "running"})),
        );
        manager.apply_remote(&update).await.unwrap();

        {
            let mut conn = manager.db.acquire().await.unwrap();
            let agent = AgentRepository::get(&mut conn, "a1").await.unwrap();
            assert_eq!(agent.name, "remote");
            assert_eq!(agent.status.as_str(), "running");
        }

        let delete = SyncEvent::new(EntityKind::Agent, "a1", EntityAction::Delete, None);
        manager.apply_remote(&delete).await.unwrap();
        manager.apply_remote(&delete).await.unwrap();

        let mut conn = manager.db.acquire().await.unwrap();
        assert!(!AgentRepository::exists(&mut conn, "a1").await.unwrap());
        drop(conn);
        assert_eq!(applied.recv().await.unwrap().id, create.id);
    }

    #[tokio::test]
    async fn test_apply_remote_config_and_bad_payloads() {
        let manager = manager().await;

        let config = SyncEvent::new(
            EntityKind::Config,
            "global",
            EntityAction::Update,
            Some(json!({"maxAgents": 3})),
        );
        manager.apply_remote(&config).await.unwrap();
        {
            let mut conn = manager.db.acquire().await.unwrap();
            assert_eq!(
                ConfigRepository::ensure_global(&mut conn).await.unwrap().max_agents,
                3
            );
        }

        let no_data = SyncEvent::new(EntityKind::Project, "p1", EntityAction::Create, None);
        assert!(matches!(
            manager.apply_remote(&no_data).await,
            Err(AgentSyncError::Protocol(_))
        ));

        let incomplete = SyncEvent::new(
            EntityKind::Project,
            "p1",
            EntityAction::Update,
            Some(json!({"name": "no path"})),
        );
        assert!(manager.apply_remote(&incomplete).await.is_err());
    }
    #[tokio::test]
    async fn test_change_is_recorded_when_peer_is_offline() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let peer = Arc::new(SyncPeer::connect(PeerConfig {
            url: format!("ws://127.0.0.1:{}", port),
            reconnect_interval_ms: 10,
            max_reconnect_attempts: 1,
            connect_timeout_ms: 200,
            ..PeerConfig::default()
        }));
        let manager = SyncManager::new(Arc::new(Database::open_in_memory().await.unwrap()))
            .with_peer(peer.clone())
            .unwrap();
        assert!(
            peer.wait_for_status(crate::sync::PeerStatus::Exhausted, std::time::Duration::from_secs(5))
                .await
        );

        let event = manager
            .sync_change(EntityKind::Agent, "a1", EntityAction::Delete, None, None)
            .await
            .unwrap();

        let mut conn = manager.db.acquire().await.unwrap();
        assert_eq!(EventRepository::count(&mut conn).await.unwrap(), 1);
        let logged = EventRepository::find_by_id(&mut conn, &event.id).await.unwrap();
        assert_eq!(logged.map(|e| e.event_type).as_deref(), Some("agent.deleted"));
    }
}

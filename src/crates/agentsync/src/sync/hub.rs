//! Sync hub
//!
//! Accepts WebSocket peers, tracks their subscriptions and fans entity change
//! events out to them. Every event that passes through the hub is appended to
//! the event log.
//!
//! Each peer has a bounded outbound queue. Events that find it full are
//! dropped, and a peer that keeps it full for `max_dropped_events` events in a
//! row is disconnected.

use super::protocol::SyncMessage;
use crate::config::HubConfig;
use crate::db::Database;
use crate::error::{AgentSyncError, Result};
use crate::models::SyncEvent;
use crate::repositories::EventRepository;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::borrow::Cow;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long a close frame may wait on a peer that stopped reading
const SLOW_PEER_CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Connected peer as seen by the hub
struct PeerEntry {
    tx: mpsc::Sender<Message>,
    /// Empty means every event type
    subscriptions: RwLock<HashSet<String>>,
    remote: SocketAddr,
    connected_at: DateTime<Utc>,
    dropped: AtomicU64,
    /// Drops since the last successful enqueue
    dropped_in_row: AtomicU64,
    evict: Notify,
}

impl PeerEntry {
    fn new(tx: mpsc::Sender<Message>, remote: SocketAddr) -> Self {
        Self {
            tx,
            subscriptions: RwLock::new(HashSet::new()),
            remote,
            connected_at: Utc::now(),
            dropped: AtomicU64::new(0),
            dropped_in_row: AtomicU64::new(0),
            evict: Notify::new(),
        }
    }
}

/// Snapshot of one connected peer
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub id: String,
    pub remote: SocketAddr,
    pub subscriptions: Vec<String>,
    pub connected_at: DateTime<Utc>,
    pub dropped_events: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub local_addr: SocketAddr,
    pub peers: usize,
    pub max_connections: usize,
    pub connections_total: u64,
    pub connections_rejected: u64,
    pub events_broadcast: u64,
    pub events_dropped: u64,
}

struct HubInner {
    config: HubConfig,
    db: Arc<Database>,
    peers: DashMap<String, Arc<PeerEntry>>,
    /// Slots reserved by admitted peers
    active: AtomicUsize,
    connections_total: AtomicU64,
    connections_rejected: AtomicU64,
    events_broadcast: AtomicU64,
    events_dropped: AtomicU64,
    inbound: broadcast::Sender<SyncEvent>,
}

/// WebSocket hub
pub struct SyncHub {
    inner: Arc<HubInner>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncHub {
    /// Bind `config.host:config.port` and start accepting peers
    ///
    /// Port 0 picks a free port; see [`SyncHub::local_addr`].
    pub async fn start(config: HubConfig, db: Arc<Database>) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_address()).await.map_err(|e| {
            AgentSyncError::Connection(format!(
                "Failed to bind hub on {}: {}",
                config.bind_address(),
                e
            ))
        })?;
        let local_addr = listener.local_addr()?;

        let (inbound, _) = broadcast::channel(256);
        let inner = Arc::new(HubInner {
            config,
            db,
            peers: DashMap::new(),
            active: AtomicUsize::new(0),
            connections_total: AtomicU64::new(0),
            connections_rejected: AtomicU64::new(0),
            events_broadcast: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            inbound,
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, inner.clone(), shutdown_rx));

        info!(
            addr = %local_addr,
            max_connections = inner.config.max_connections,
            "Sync hub listening"
        );
        Ok(Self {
            inner,
            local_addr,
            shutdown,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `ws://` URL peers can dial
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.inner
            .peers
            .iter()
            .map(|entry| {
                let mut subscriptions: Vec<String> =
                    entry.subscriptions.read().iter().cloned().collect();
                subscriptions.sort();
                PeerInfo {
                    id: entry.key().clone(),
                    remote: entry.remote,
                    subscriptions,
                    connected_at: entry.connected_at,
                    dropped_events: entry.dropped.load(Ordering::Relaxed),
                }
            })
            .collect()
    }

    /// Events received from peers
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.inbound.subscribe()
    }

    /// Send `event` to every subscribed peer and append it to the event log
    ///
    /// Returns the number of peers the event was queued for. Delivery is
    /// at most once per peer.
    pub async fn broadcast_event(&self, event: &SyncEvent) -> Result<usize> {
        self.inner.publish(event, None).await
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            local_addr: self.local_addr,
            peers: self.inner.peers.len(),
            max_connections: self.inner.config.max_connections,
            connections_total: self.inner.connections_total.load(Ordering::Relaxed),
            connections_rejected: self.inner.connections_rejected.load(Ordering::Relaxed),
            events_broadcast: self.inner.events_broadcast.load(Ordering::Relaxed),
            events_dropped: self.inner.events_dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting, close every peer and wait for the listener to exit
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let task = self.accept_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Hub accept loop ended abnormally");
            }
        }
        info!(addr = %self.local_addr, "Sync hub stopped");
    }
}

impl HubInner {
    fn try_reserve(&self) -> bool {
        let previous = self.active.fetch_add(1, Ordering::SeqCst);
        if previous >= self.config.max_connections {
            self.active.fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn release(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    async fn publish(&self, event: &SyncEvent, origin: Option<&str>) -> Result<usize> {
        let frame = SyncMessage::event(event.clone()).to_frame()?;

        let mut delivered = 0;
        for peer in self.peers.iter() {
            if origin == Some(peer.key().as_str()) {
                continue;
            }
            let wanted = {
                let subscriptions = peer.subscriptions.read();
                subscriptions.is_empty() || subscriptions.contains(&event.event_type)
            };
            if !wanted {
                continue;
            }
            match peer.tx.try_send(frame.clone()) {
                Ok(()) => {
                    peer.dropped_in_row.store(0, Ordering::Relaxed);
                    delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    peer.dropped.fetch_add(1, Ordering::Relaxed);
                    self.events_dropped.fetch_add(1, Ordering::Relaxed);
                    let in_row = peer.dropped_in_row.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(
                        peer_id = %peer.key(),
                        event_id = %event.id,
                        dropped_in_row = in_row,
                        "Peer queue full, dropping event"
                    );
                    if in_row >= self.config.max_dropped_events {
                        peer.evict.notify_one();
                    }
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        self.events_broadcast.fetch_add(1, Ordering::Relaxed);
        debug!(event_id = %event.id, event_type = %event.event_type, delivered, "Event broadcast");

        let mut conn = self.db.acquire().await?;
        EventRepository::append(&mut conn, event).await?;
        Ok(delivered)
    }

    /// Handle one text frame from `peer_id`, returning the reply if any
    async fn handle_text(&self, peer_id: &str, text: &str) -> Option<SyncMessage> {
        let message = match SyncMessage::parse(text) {
            Ok(message) => message,
            Err(AgentSyncError::Protocol(reason)) => {
                debug!(peer_id, reason = %reason, "Rejected peer message");
                return Some(SyncMessage::error(reason));
            }
            Err(e) => return Some(SyncMessage::error(e.to_string())),
        };

        match message {
            SyncMessage::Ping => Some(SyncMessage::Pong),
            SyncMessage::Pong => None,
            SyncMessage::Subscribe { event_types } => {
                if let Some(peer) = self.peers.get(peer_id) {
                    peer.subscriptions.write().extend(event_types);
                }
                None
            }
            SyncMessage::Unsubscribe { event_types } => {
                if let Some(peer) = self.peers.get(peer_id) {
                    let mut subscriptions = peer.subscriptions.write();
                    for event_type in &event_types {
                        subscriptions.remove(event_type);
                    }
                }
                None
            }
            SyncMessage::SyncEvent { data } => {
                if let Err(e) = self.publish(&data, Some(peer_id)).await {
                    error!(peer_id, event_id = %data.id, error = %e, "Failed to record peer event");
                }
                let _ = self.inbound.send(data);
                None
            }
            SyncMessage::Error { message } => {
                warn!(peer_id, message = %message, "Peer reported an error");
                None
            }
        }
    }
}

async fn accept_loop(listener: TcpListener, inner: Arc<HubInner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    tokio::spawn(handle_connection(inner.clone(), stream, remote, shutdown.clone()));
                }
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn handle_connection(
    inner: Arc<HubInner>,
    stream: TcpStream,
    remote: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(inner.config.max_payload_bytes);
    ws_config.max_frame_size = Some(inner.config.max_payload_bytes);

    let mut ws = match tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(remote = %remote, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    if !inner.try_reserve() {
        inner.connections_rejected.fetch_add(1, Ordering::Relaxed);
        warn!(remote = %remote, max = inner.config.max_connections, "Hub at capacity, refusing peer");
        if let Ok(frame) = SyncMessage::error("Server at capacity").to_frame() {
            let _ = ws.send(frame).await;
        }
        let _ = ws
            .close(Some(CloseFrame {
                code: CloseCode::Policy,
                reason: Cow::Borrowed("Server at capacity"),
            }))
            .await;
        return;
    }

    let peer_id = Uuid::new_v4().to_string();
    let (tx, mut outbound) = mpsc::channel(inner.config.peer_queue_size.max(1));
    let entry = Arc::new(PeerEntry::new(tx, remote));
    inner.peers.insert(peer_id.clone(), entry.clone());
    inner.connections_total.fetch_add(1, Ordering::Relaxed);
    info!(peer_id = %peer_id, remote = %remote, peers = inner.peers.len(), "Peer connected");

    let (mut sink, mut stream) = ws.split();
    let interval = inner.config.heartbeat_interval();
    let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = sink.send(frame).await {
                    debug!(peer_id = %peer_id, error = %e, "Send to peer failed");
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(message)) => {
                    last_seen = Instant::now();
                    let reply = match message {
                        Message::Text(text) => inner.handle_text(&peer_id, &text).await,
                        Message::Binary(_) => Some(SyncMessage::error("Binary frames are not supported")),
                        Message::Close(_) => break,
                        _ => None,
                    };
                    if let Some(reply) = reply {
                        match reply.to_frame() {
                            Ok(frame) => {
                                if sink.send(frame).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "Failed to encode reply"),
                        }
                    }
                }
                Some(Err(tungstenite::Error::Capacity(e))) => {
                    warn!(peer_id = %peer_id, error = %e, "Peer frame exceeds payload limit");
                    if let Ok(frame) = SyncMessage::error("Message too large").to_frame() {
                        let _ = sink.send(frame).await;
                    }
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Size,
                            reason: Cow::Borrowed("Message too large"),
                        })))
                        .await;
                    break;
                }
                Some(Err(e)) => {
                    debug!(peer_id = %peer_id, error = %e, "Peer connection error");
                    break;
                }
                None => break,
            },
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > interval * 2 {
                    warn!(peer_id = %peer_id, "Peer missed heartbeats, dropping");
                    break;
                }
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            _ = entry.evict.notified() => {
                warn!(
                    peer_id = %peer_id,
                    dropped = entry.dropped.load(Ordering::Relaxed),
                    "Peer too slow, disconnecting"
                );
                let close = sink.send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Again,
                    reason: Cow::Borrowed("Peer too slow"),
                })));
                let _ = tokio::time::timeout(SLOW_PEER_CLOSE_TIMEOUT, close).await;
                break;
            }
            _ = shutdown.changed() => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Away,
                        reason: Cow::Borrowed("Hub shutting down"),
                    })))
                    .await;
                break;
            }
        }
    }

    inner.peers.remove(&peer_id);
    inner.release();
    info!(peer_id = %peer_id, peers = inner.peers.len(), "Peer disconnected");
}

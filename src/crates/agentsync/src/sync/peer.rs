//! Sync peer
//!
//! Dials a hub and keeps the connection alive. A background supervisor
//! reconnects with a fixed delay, re-sends the subscription set after every
//! connect and gives up after `max_reconnect_attempts` consecutive failures.
//! A session the hub refuses, or one that drops within a heartbeat interval,
//! counts as a failed attempt.

use super::protocol::SyncMessage;
use crate::config::PeerConfig;
use crate::error::{AgentSyncError, Result};
use crate::models::SyncEvent;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type HubStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state of a [`SyncPeer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Connecting,
    Connected,
    Disconnected,
    /// Reconnect attempts used up; the supervisor has stopped
    Exhausted,
}

enum PeerCommand {
    Send(SyncMessage),
    Close,
}

enum SessionEnd {
    Closed,
    Lost,
    /// Hub closed with a policy violation, e.g. at capacity
    Refused,
}

/// Shared between the handle and the supervisor task
struct PeerShared {
    config: PeerConfig,
    status: watch::Sender<PeerStatus>,
    events: broadcast::Sender<SyncEvent>,
    subscriptions: Mutex<BTreeSet<String>>,
}

/// WebSocket client of a [`super::SyncHub`]
pub struct SyncPeer {
    shared: Arc<PeerShared>,
    commands: mpsc::UnboundedSender<PeerCommand>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SyncPeer {
    /// Start the connection supervisor and return immediately
    ///
    /// Use [`SyncPeer::wait_for_status`] to block until connected.
    pub fn connect(config: PeerConfig) -> Self {
        let (status, _) = watch::channel(PeerStatus::Connecting);
        let (events, _) = broadcast::channel(256);
        let shared = Arc::new(PeerShared {
            config,
            status,
            events,
            subscriptions: Mutex::new(BTreeSet::new()),
        });

        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(supervise(shared.clone(), command_rx));

        Self {
            shared,
            commands,
            task: tokio::sync::Mutex::new(Some(task)),
        }
    }

    pub fn status(&self) -> PeerStatus {
        *self.shared.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == PeerStatus::Connected
    }

    pub fn status_updates(&self) -> watch::Receiver<PeerStatus> {
        self.shared.status.subscribe()
    }

    /// Wait until the peer reaches `target`, up to `timeout`
    pub async fn wait_for_status(&self, target: PeerStatus, timeout: Duration) -> bool {
        let mut updates = self.status_updates();
        let wait = async {
            loop {
                if *updates.borrow_and_update() == target {
                    return true;
                }
                if updates.changed().await.is_err() {
                    return *updates.borrow() == target;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    /// Events relayed by the hub
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    /// Current subscription set; empty means every event type
    pub fn subscriptions(&self) -> Vec<String> {
        self.shared.subscriptions.lock().iter().cloned().collect()
    }

    /// Publish a local change to the hub
    pub fn send_event(&self, event: SyncEvent) -> Result<()> {
        if !self.is_connected() {
            return Err(AgentSyncError::Connection(format!(
                "Not connected to hub at {}",
                self.shared.config.url
            )));
        }
        self.send(SyncMessage::event(event))
    }

    /// Add event types; remembered across reconnects
    pub fn subscribe(&self, event_types: Vec<String>) -> Result<()> {
        self.shared
            .subscriptions
            .lock()
            .extend(event_types.iter().cloned());
        if self.is_connected() {
            self.send(SyncMessage::Subscribe { event_types })?;
        }
        Ok(())
    }

    pub fn unsubscribe(&self, event_types: Vec<String>) -> Result<()> {
        {
            let mut subscriptions = self.shared.subscriptions.lock();
            for event_type in &event_types {
                subscriptions.remove(event_type);
            }
        }
        if self.is_connected() {
            self.send(SyncMessage::Unsubscribe { event_types })?;
        }
        Ok(())
    }

    fn send(&self, message: SyncMessage) -> Result<()> {
        self.commands
            .send(PeerCommand::Send(message))
            .map_err(|_| AgentSyncError::Connection("Peer supervisor has stopped".to_string()))
    }

    /// Close the connection and stop reconnecting
    pub async fn close(&self) {
        let _ = self.commands.send(PeerCommand::Close);
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Peer supervisor ended abnormally");
            }
        }
    }
}

async fn supervise(shared: Arc<PeerShared>, mut commands: mpsc::UnboundedReceiver<PeerCommand>) {
    let config = &shared.config;
    let mut failures: u32 = 0;

    loop {
        shared.status.send_replace(PeerStatus::Connecting);
        match tokio::time::timeout(config.connect_timeout(), connect_async(config.url.as_str())).await {
            Ok(Ok((ws, _))) => {
                shared.status.send_replace(PeerStatus::Connected);
                info!(url = %config.url, "Connected to hub");

                let started = Instant::now();
                let end = run_session(&shared, ws, &mut commands).await;
                shared.status.send_replace(PeerStatus::Disconnected);
                match end {
                    SessionEnd::Closed => {
                        info!(url = %config.url, "Peer closed");
                        return;
                    }
                    SessionEnd::Refused => {
                        failures += 1;
                        warn!(url = %config.url, attempt = failures, "Hub refused the connection");
                    }
                    SessionEnd::Lost if started.elapsed() < config.heartbeat_interval() => {
                        failures += 1;
                        warn!(url = %config.url, attempt = failures, "Lost connection to hub during setup");
                    }
                    SessionEnd::Lost => {
                        failures = 0;
                        warn!(url = %config.url, "Lost connection to hub");
                    }
                }
            }
            Ok(Err(e)) => {
                failures += 1;
                warn!(url = %config.url, attempt = failures, error = %e, "Hub connection failed");
            }
            Err(_) => {
                failures += 1;
                warn!(url = %config.url, attempt = failures, "Hub connection timed out");
            }
        }

        if failures >= config.max_reconnect_attempts {
            shared.status.send_replace(PeerStatus::Exhausted);
            error!(
                url = %config.url,
                attempts = failures,
                "Reconnect attempts exhausted"
            );
            return;
        }

        shared.status.send_replace(PeerStatus::Disconnected);
        let retry_at = Instant::now() + config.reconnect_interval();
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(retry_at) => break,
                command = commands.recv() => match command {
                    Some(PeerCommand::Send(message)) => {
                        debug!(?message, "Not connected, dropping message");
                    }
                    Some(PeerCommand::Close) | None => return,
                },
            }
        }
    }
}

async fn run_session(
    shared: &PeerShared,
    ws: HubStream,
    commands: &mut mpsc::UnboundedReceiver<PeerCommand>,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();

    let event_types: Vec<String> = shared.subscriptions.lock().iter().cloned().collect();
    if !event_types.is_empty() {
        let resubscribe = SyncMessage::Subscribe { event_types };
        match resubscribe.to_frame() {
            Ok(frame) => {
                if sink.send(frame).await.is_err() {
                    return SessionEnd::Lost;
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode subscription"),
        }
    }

    let interval = shared.config.heartbeat_interval();
    let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(PeerCommand::Send(message)) => match message.to_frame() {
                    Ok(frame) => {
                        if sink.send(frame).await.is_err() {
                            return SessionEnd::Lost;
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode message"),
                },
                Some(PeerCommand::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Closed;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => match SyncMessage::parse(&text) {
                    Ok(SyncMessage::SyncEvent { data }) => {
                        let _ = shared.events.send(data);
                    }
                    Ok(SyncMessage::Ping) => {
                        if let Ok(frame) = SyncMessage::Pong.to_frame() {
                            if sink.send(frame).await.is_err() {
                                return SessionEnd::Lost;
                            }
                        }
                    }
                    Ok(SyncMessage::Error { message }) => {
                        warn!(message = %message, "Hub reported an error");
                    }
                    Ok(other) => debug!(?other, "Ignoring hub message"),
                    Err(e) => warn!(error = %e, "Malformed hub message"),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "Hub closed the connection");
                    return match frame {
                        Some(frame) if frame.code == CloseCode::Policy => SessionEnd::Refused,
                        _ => SessionEnd::Lost,
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "Hub connection error");
                    return SessionEnd::Lost;
                }
                None => return SessionEnd::Lost,
            },
            _ = heartbeat.tick() => {
                let Ok(frame) = SyncMessage::Ping.to_frame() else { continue };
                if sink.send(frame).await.is_err() {
                    return SessionEnd::Lost;
                }
            }
        }
    }
}

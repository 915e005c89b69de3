//! Real-time event synchronization
//!
//! A [`SyncHub`] accepts WebSocket peers and fans entity change events out to
//! them; a [`SyncPeer`] keeps one connection to a hub alive. The
//! [`SyncManager`] ties either side to the local store.
//!
//! Delivery is at most once per peer with no ordering across peers. The event
//! log in the store is the durable record.

pub mod hub;
pub mod manager;
pub mod peer;
pub mod protocol;

pub use hub::{HubStats, PeerInfo, SyncHub};
pub use manager::{EventSink, SyncManager, SyncStats};
pub use peer::{PeerStatus, SyncPeer};
pub use protocol::SyncMessage;

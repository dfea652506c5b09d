//! Room hub: client connections, room membership and event fan-out.

use cloudroom_protocol::RoomEvent;
use dashmap::DashMap;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{broadcast, mpsc};

/// Size of the broadcast channel for events.
const EVENT_BUFFER_SIZE: usize = 256;

/// Size of the per-connection send buffer.
const CONNECTION_BUFFER_SIZE: usize = 256;

/// A sender for events to one client connection.
pub type EventSender = mpsc::Sender<RoomEvent>;

/// Hub tracking which clients are connected and which rooms they observe.
///
/// The hub is responsible for:
/// - Tracking live connections per client id
/// - The membership set of every room
/// - Delivering room-scoped events to the room's members
pub struct RoomHub {
    /// Client ID -> its live connections
    connections: DashMap<String, Vec<(usize, EventSender)>>,

    /// Room ID -> set of member client IDs
    members: DashMap<String, HashSet<String>>,

    /// Every published (room, event), for in-process observers
    event_tx: broadcast::Sender<(String, RoomEvent)>,

    next_conn_id: AtomicUsize,
}

impl RoomHub {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self {
            connections: DashMap::new(),
            members: DashMap::new(),
            event_tx,
            next_conn_id: AtomicUsize::new(0),
        }
    }

    /// Register a new connection for a client.
    ///
    /// Returns the receiver for events targeted at this connection and its id.
    pub fn register_connection(&self, client_id: &str) -> (mpsc::Receiver<RoomEvent>, usize) {
        let (tx, rx) = mpsc::channel(CONNECTION_BUFFER_SIZE);
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.connections
            .entry(client_id.to_string())
            .or_default()
            .push((conn_id, tx));
        info!("Registered connection {} for client {}", conn_id, client_id);
        (rx, conn_id)
    }

    /// Unregister a connection. Returns true when the client has no connection left.
    pub fn unregister_connection(&self, client_id: &str, conn_id: usize) -> bool {
        if let Some(mut conns) = self.connections.get_mut(client_id) {
            conns.retain(|(id, _)| *id != conn_id);
            info!(
                "Unregistered connection {} for client {}",
                conn_id, client_id
            );
        }
        self.connections.remove_if(client_id, |_, conns| conns.is_empty());
        !self.connections.contains_key(client_id)
    }

    /// Add a client to a room. Returns false if it already was a member.
    pub fn join_room(&self, client_id: &str, room_id: &str) -> bool {
        let added = self
            .members
            .entry(room_id.to_string())
            .or_default()
            .insert(client_id.to_string());
        if added {
            info!("Client {} joined room {}", client_id, room_id);
        }
        added
    }

    /// Remove a client from a room. Returns how many members remain.
    pub fn leave_room(&self, client_id: &str, room_id: &str) -> usize {
        if let Some(mut members) = self.members.get_mut(room_id)
            && members.remove(client_id)
        {
            info!("Client {} left room {}", client_id, room_id);
        }
        self.members.remove_if(room_id, |_, members| members.is_empty());
        self.member_count(room_id)
    }

    pub fn member_count(&self, room_id: &str) -> usize {
        self.members.get(room_id).map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_member(&self, client_id: &str, room_id: &str) -> bool {
        self.members
            .get(room_id)
            .map(|m| m.contains(client_id))
            .unwrap_or(false)
    }

    /// Rooms a client is a member of.
    pub fn client_rooms(&self, client_id: &str) -> Vec<String> {
        self.members
            .iter()
            .filter(|entry| entry.value().contains(client_id))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Members of a room.
    pub fn room_members(&self, room_id: &str) -> Vec<String> {
        self.members
            .get(room_id)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Forget a room's membership entirely.
    pub fn drop_room(&self, room_id: &str) {
        self.members.remove(room_id);
    }

    /// Send an event to every connection of one client.
    pub async fn send_to_client(&self, client_id: &str, event: RoomEvent) {
        let senders: Vec<(usize, EventSender)> = self
            .connections
            .get(client_id)
            .map(|conns| conns.clone())
            .unwrap_or_default();
        for (conn_id, tx) in senders {
            if tx.send(event.clone()).await.is_err() {
                warn!(
                    "Failed to send {} to client {} connection {}",
                    event.kind(),
                    client_id,
                    conn_id
                );
            }
        }
    }

    /// Publish an event to every member of a room.
    pub async fn publish(&self, room_id: &str, event: RoomEvent) {
        debug!("publish {} to room {}", event.kind(), room_id);
        let _ = self.event_tx.send((room_id.to_string(), event.clone()));
        for client_id in self.room_members(room_id) {
            self.send_to_client(&client_id, event.clone()).await;
        }
    }

    /// Subscribe to every published event as `(room_id, event)`.
    pub fn subscribe_events(&self) -> broadcast::Receiver<(String, RoomEvent)> {
        self.event_tx.subscribe()
    }

    pub fn connected_client_count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for RoomHub {
    fn default() -> Self {
        Self::new()
    }
}

//! Connection Hub
//!
//! Registry of live connections, room membership and identity bindings.
//! Outbound delivery is a non-blocking `try_send` into each connection's
//! bounded queue; a full or closed queue costs the connection its room
//! membership, never the sender's progress.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::core::ids::{ConnectionId, GameId, PlayerAddress};
use crate::network::protocol::ServerMessage;

/// Serialized frame shared by every recipient of a broadcast.
pub type OutboundFrame = Arc<str>;

/// Sending half of a connection's outbound queue.
pub type OutboundSender = mpsc::Sender<OutboundFrame>;

/// Hub errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// Connection is not registered.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// No connection is bound to the identity.
    #[error("no connection for identity {0}")]
    UnknownIdentity(PlayerAddress),

    /// Outbound queue full or closed.
    #[error("delivery to {0} failed")]
    DeliveryFailure(ConnectionId),
}

/// Result of [`ConnectionHub::join`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomJoin {
    /// Room joined.
    pub room: GameId,
    /// Room left on the way, if different.
    pub previous: Option<GameId>,
    /// Members after joining.
    pub members: usize,
}

/// What a disconnected connection left behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departed {
    /// The connection.
    pub id: ConnectionId,
    /// Identity it held, if still bound to it.
    pub identity: Option<PlayerAddress>,
    /// Room it was in.
    pub room: Option<GameId>,
}

/// Result of a broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Frames queued.
    pub delivered: usize,
    /// Members whose queue rejected the frame.
    pub failed: usize,
    /// Members removed from the room as a result.
    pub dropped: Vec<ConnectionId>,
}

struct ConnectionEntry {
    sender: OutboundSender,
    identity: Option<PlayerAddress>,
    room: Option<GameId>,
    connected_at: Instant,
}

#[derive(Default)]
struct HubState {
    connections: BTreeMap<ConnectionId, ConnectionEntry>,
    rooms: BTreeMap<GameId, BTreeSet<ConnectionId>>,
    identities: BTreeMap<PlayerAddress, ConnectionId>,
}

impl HubState {
    /// Remove `id` from its room, dropping the room once empty.
    fn leave_room(&mut self, id: ConnectionId) -> Option<GameId> {
        let room = self.connections.get_mut(&id)?.room.take()?;
        if let Some(members) = self.rooms.get_mut(&room) {
            members.remove(&id);
            if members.is_empty() {
                self.rooms.remove(&room);
            }
        }
        Some(room)
    }
}

/// Live connections, rooms and identities.
#[derive(Default)]
pub struct ConnectionHub {
    state: RwLock<HubState>,
}

fn encode(msg: &ServerMessage) -> Option<OutboundFrame> {
    match msg.to_json() {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            error!(event = msg.event.name(), error = %e, "Failed to serialize message");
            None
        }
    }
}

impl ConnectionHub {
    /// Create an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection.
    pub async fn connect(&self, sender: OutboundSender) -> ConnectionId {
        let id = ConnectionId::random();
        self.state.write().await.connections.insert(
            id,
            ConnectionEntry {
                sender,
                identity: None,
                room: None,
                connected_at: Instant::now(),
            },
        );
        debug!(conn = %id, "Connection registered");
        id
    }

    /// Forget a connection, its room membership and its identity binding.
    pub async fn disconnect(&self, id: ConnectionId) -> Option<Departed> {
        let mut state = self.state.write().await;
        let room = state.leave_room(id);
        let entry = state.connections.remove(&id)?;

        let identity = entry.identity.filter(|identity| {
            // Only if the binding still points here
            state.identities.get(identity) == Some(&id)
        });
        if let Some(identity) = &identity {
            state.identities.remove(identity);
        }

        debug!(
            conn = %id,
            connected_for = ?entry.connected_at.elapsed(),
            "Connection removed"
        );
        Some(Departed { id, identity, room })
    }

    /// Move `id` into `room`, leaving any previous room. Idempotent.
    pub async fn join(&self, id: ConnectionId, room: &GameId) -> Result<RoomJoin, HubError> {
        let mut state = self.state.write().await;
        let current = state
            .connections
            .get(&id)
            .ok_or(HubError::UnknownConnection(id))?
            .room
            .clone();

        let previous = match current {
            Some(current) if &current == room => None,
            Some(_) => state.leave_room(id),
            None => None,
        };

        state.rooms.entry(room.clone()).or_default().insert(id);
        if let Some(entry) = state.connections.get_mut(&id) {
            entry.room = Some(room.clone());
        }
        let members = state.rooms.get(room).map_or(0, BTreeSet::len);

        Ok(RoomJoin {
            room: room.clone(),
            previous,
            members,
        })
    }

    /// Leave the current room.
    pub async fn leave(&self, id: ConnectionId) -> Option<GameId> {
        self.state.write().await.leave_room(id)
    }

    /// Send `msg` to every member of `room`. Members whose queue rejects the
    /// frame are removed from the room and listed in the report.
    pub async fn broadcast(&self, room: &GameId, msg: &ServerMessage) -> BroadcastReport {
        let Some(frame) = encode(msg) else {
            return BroadcastReport::default();
        };

        let targets: Vec<(ConnectionId, OutboundSender)> = {
            let state = self.state.read().await;
            let Some(members) = state.rooms.get(room) else {
                return BroadcastReport::default();
            };
            members
                .iter()
                .filter_map(|id| state.connections.get(id).map(|c| (*id, c.sender.clone())))
                .collect()
        };

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();
        for (id, sender) in targets {
            if sender.try_send(frame.clone()).is_ok() {
                report.delivered += 1;
            } else {
                failed.push(id);
            }
        }

        if !failed.is_empty() {
            let mut state = self.state.write().await;
            for id in &failed {
                let in_room = state
                    .connections
                    .get(id)
                    .is_some_and(|c| c.room.as_ref() == Some(room));
                if in_room {
                    state.leave_room(*id);
                    report.dropped.push(*id);
                }
                warn!(conn = %id, room = %room, "Delivery failed, dropped from room");
            }
            report.failed = failed.len();
        }

        report
    }

    /// Send `msg` to one connection.
    pub async fn send_to(&self, id: ConnectionId, msg: &ServerMessage) -> Result<(), HubError> {
        let sender = {
            let state = self.state.read().await;
            state
                .connections
                .get(&id)
                .ok_or(HubError::UnknownConnection(id))?
                .sender
                .clone()
        };
        let frame = encode(msg).ok_or(HubError::DeliveryFailure(id))?;
        sender.try_send(frame).map_err(|_| HubError::DeliveryFailure(id))
    }

    /// Send `msg` to whichever connection holds `identity`.
    pub async fn send_to_identity(
        &self,
        identity: &PlayerAddress,
        msg: &ServerMessage,
    ) -> Result<(), HubError> {
        let id = self
            .connection_of(identity)
            .await
            .ok_or_else(|| HubError::UnknownIdentity(identity.clone()))?;
        self.send_to(id, msg).await
    }

    /// Bind `identity` to `id`. The last registration wins: a previous
    /// connection holding the identity loses it and is returned.
    pub async fn register_identity(
        &self,
        id: ConnectionId,
        identity: PlayerAddress,
    ) -> Result<Option<ConnectionId>, HubError> {
        let mut state = self.state.write().await;
        let old_identity = state
            .connections
            .get(&id)
            .ok_or(HubError::UnknownConnection(id))?
            .identity
            .clone();

        if old_identity.as_ref() == Some(&identity) {
            return Ok(None);
        }
        if let Some(old) = old_identity {
            if state.identities.get(&old) == Some(&id) {
                state.identities.remove(&old);
            }
        }

        let superseded = state
            .identities
            .insert(identity.clone(), id)
            .filter(|prev| *prev != id);
        if let Some(prev) = superseded {
            if let Some(entry) = state.connections.get_mut(&prev) {
                entry.identity = None;
            }
            info!(identity = identity.short(), old = %prev, new = %id, "Identity moved to new connection");
        }
        if let Some(entry) = state.connections.get_mut(&id) {
            entry.identity = Some(identity);
        }
        Ok(superseded)
    }

    /// Identity bound to `id`.
    pub async fn identity_of(&self, id: ConnectionId) -> Option<PlayerAddress> {
        self.state.read().await.connections.get(&id)?.identity.clone()
    }

    /// Connection bound to `identity`.
    pub async fn connection_of(&self, identity: &PlayerAddress) -> Option<ConnectionId> {
        self.state.read().await.identities.get(identity).copied()
    }

    /// Room `id` is in.
    pub async fn room_of(&self, id: ConnectionId) -> Option<GameId> {
        self.state.read().await.connections.get(&id)?.room.clone()
    }

    /// Members of `room`.
    pub async fn room_size(&self, room: &GameId) -> usize {
        self.state.read().await.rooms.get(room).map_or(0, BTreeSet::len)
    }

    /// Whether `id` is in `room`.
    pub async fn is_member(&self, id: ConnectionId, room: &GameId) -> bool {
        self.state
            .read()
            .await
            .rooms
            .get(room)
            .is_some_and(|members| members.contains(&id))
    }

    /// Live connections.
    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    /// Non-empty rooms.
    pub async fn room_count(&self) -> usize {
        self.state.read().await.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::ServerEvent;

    fn pong() -> ServerMessage {
        ServerMessage::new(ServerEvent::Pong { client_timestamp: None, server_time: 1 })
    }

    async fn connect(hub: &ConnectionHub, capacity: usize) -> (ConnectionId, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (hub.connect(tx).await, rx)
    }

    #[tokio::test]
    async fn test_join_moves_between_rooms() {
        let hub = ConnectionHub::new();
        let (a, _rx) = connect(&hub, 8).await;
        let room1 = GameId::new("r1");
        let room2 = GameId::new("r2");

        let join = hub.join(a, &room1).await.unwrap();
        assert_eq!(join.previous, None);
        assert_eq!(join.members, 1);

        let again = hub.join(a, &room1).await.unwrap();
        assert_eq!(again.previous, None);
        assert_eq!(again.members, 1);

        let moved = hub.join(a, &room2).await.unwrap();
        assert_eq!(moved.previous, Some(room1.clone()));
        assert!(!hub.is_member(a, &room1).await);
        assert!(hub.is_member(a, &room2).await);
        assert_eq!(hub.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_join_unknown_connection() {
        let hub = ConnectionHub::new();
        let ghost = ConnectionId::new([9; 16]);
        assert_eq!(
            hub.join(ghost, &GameId::new("r")).await,
            Err(HubError::UnknownConnection(ghost))
        );
    }

    #[tokio::test]
    async fn test_leave_deletes_empty_room() {
        let hub = ConnectionHub::new();
        let (a, _ra) = connect(&hub, 8).await;
        let (b, _rb) = connect(&hub, 8).await;
        let room = GameId::new("r");
        hub.join(a, &room).await.unwrap();
        hub.join(b, &room).await.unwrap();

        assert_eq!(hub.leave(a).await, Some(room.clone()));
        assert_eq!(hub.room_size(&room).await, 1);
        assert_eq!(hub.leave(a).await, None);
        hub.leave(b).await;
        assert_eq!(hub.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_members_only() {
        let hub = ConnectionHub::new();
        let (a, mut ra) = connect(&hub, 8).await;
        let (b, mut rb) = connect(&hub, 8).await;
        let (_c, mut rc) = connect(&hub, 8).await;
        let room = GameId::new("r");
        hub.join(a, &room).await.unwrap();
        hub.join(b, &room).await.unwrap();

        let report = hub.broadcast(&room, &pong()).await;
        assert_eq!(report, BroadcastReport { delivered: 2, failed: 0, dropped: vec![] });

        let fa = ra.try_recv().unwrap();
        let fb = rb.try_recv().unwrap();
        assert!(Arc::ptr_eq(&fa, &fb), "serialized once");
        assert!(rc.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_drops_slow_member() {
        let hub = ConnectionHub::new();
        let (fast, mut rfast) = connect(&hub, 8).await;
        let (slow, _rslow) = connect(&hub, 1).await;
        let room = GameId::new("r");
        hub.join(fast, &room).await.unwrap();
        hub.join(slow, &room).await.unwrap();

        assert_eq!(hub.broadcast(&room, &pong()).await.delivered, 2);
        let report = hub.broadcast(&room, &pong()).await;
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 1, dropped: vec![slow] });

        assert!(!hub.is_member(slow, &room).await);
        assert_eq!(hub.room_of(slow).await, None);
        assert!(hub.is_member(fast, &room).await);
        assert_eq!(hub.connection_count().await, 2);
        assert!(rfast.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_to_closed_member_reports_drop() {
        let hub = ConnectionHub::new();
        let (a, _ra) = connect(&hub, 8).await;
        let (gone, rgone) = connect(&hub, 8).await;
        let room = GameId::new("r");
        hub.join(a, &room).await.unwrap();
        hub.join(gone, &room).await.unwrap();
        drop(rgone);

        let report = hub.broadcast(&room, &pong()).await;
        assert_eq!(report.dropped, vec![gone]);

        // Already out of the room, so nothing more to report
        let report = hub.broadcast(&room, &pong()).await;
        assert_eq!(report, BroadcastReport { delivered: 1, failed: 0, dropped: vec![] });
    }

    #[tokio::test]
    async fn test_broadcast_to_empty_room() {
        let hub = ConnectionHub::new();
        assert_eq!(
            hub.broadcast(&GameId::new("nobody"), &pong()).await,
            BroadcastReport::default()
        );
    }

    #[tokio::test]
    async fn test_identity_last_registration_wins() {
        let hub = ConnectionHub::new();
        let (a, _ra) = connect(&hub, 8).await;
        let (b, mut rb) = connect(&hub, 8).await;
        let alice = PlayerAddress::new("0xalice");

        assert_eq!(hub.register_identity(a, alice.clone()).await, Ok(None));
        assert_eq!(hub.register_identity(a, alice.clone()).await, Ok(None));
        assert_eq!(hub.register_identity(b, alice.clone()).await, Ok(Some(a)));

        assert_eq!(hub.identity_of(a).await, None);
        assert_eq!(hub.identity_of(b).await, Some(alice.clone()));

        hub.send_to_identity(&alice, &pong()).await.unwrap();
        assert!(rb.try_recv().is_ok());

        // Old connection leaving must not unbind the new one
        let departed = hub.disconnect(a).await.unwrap();
        assert_eq!(departed.identity, None);
        assert_eq!(hub.connection_of(&alice).await, Some(b));

        let departed = hub.disconnect(b).await.unwrap();
        assert_eq!(departed.identity, Some(alice.clone()));
        assert_eq!(
            hub.send_to_identity(&alice, &pong()).await,
            Err(HubError::UnknownIdentity(alice))
        );
    }

    #[tokio::test]
    async fn test_send_to_failures() {
        let hub = ConnectionHub::new();
        let (a, ra) = connect(&hub, 1).await;
        let ghost = ConnectionId::new([1; 16]);

        assert_eq!(hub.send_to(ghost, &pong()).await, Err(HubError::UnknownConnection(ghost)));
        hub.send_to(a, &pong()).await.unwrap();
        assert_eq!(hub.send_to(a, &pong()).await, Err(HubError::DeliveryFailure(a)));

        drop(ra);
        assert_eq!(hub.send_to(a, &pong()).await, Err(HubError::DeliveryFailure(a)));
    }

    #[tokio::test]
    async fn test_disconnect_cleans_room() {
        let hub = ConnectionHub::new();
        let (a, _ra) = connect(&hub, 8).await;
        let room = GameId::new("r");
        hub.join(a, &room).await.unwrap();

        let departed = hub.disconnect(a).await.unwrap();
        assert_eq!(departed.room, Some(room.clone()));
        assert_eq!(hub.room_count().await, 0);
        assert_eq!(hub.connection_count().await, 0);
        assert!(hub.disconnect(a).await.is_none());
    }
}

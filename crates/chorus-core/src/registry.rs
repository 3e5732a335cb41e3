//! Room registry: membership and fan-out.
//!
//! Membership is recorded on both sides, the connection's `joined_rooms` and
//! the room's member map, under the connection's lock. Locks are always taken
//! connection first, room second. Fan-out snapshots the member list, releases
//! the room, then queues on each member's sink.

use crate::connection::{ConnectionId, ConnectionManager};
use crate::error::{ChatError, ChatResult};
use crate::presence::PresenceStatus;
use crate::room::{
    validate_room_id, AccessPolicy, Member, PrefixAccessPolicy, Room, RoomId, RoomInfo,
};
use chorus_protocol::Envelope;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Registry limits.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of live rooms.
    pub max_rooms: usize,
    /// Maximum rooms a single connection may join.
    pub max_rooms_per_connection: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_rooms: 10_000,
            max_rooms_per_connection: 100,
        }
    }
}

/// Result of a join.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// `false` when the connection was already a member.
    pub newly_joined: bool,
    pub info: RoomInfo,
}

/// The live room registry.
pub struct RoomRegistry {
    connections: Arc<ConnectionManager>,
    rooms: DashMap<RoomId, Room>,
    policy: Arc<dyn AccessPolicy>,
    config: RegistryConfig,
}

impl RoomRegistry {
    #[must_use]
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self::with_config(connections, RegistryConfig::default(), Arc::new(PrefixAccessPolicy))
    }

    #[must_use]
    pub fn with_config(
        connections: Arc<ConnectionManager>,
        config: RegistryConfig,
        policy: Arc<dyn AccessPolicy>,
    ) -> Self {
        info!("Creating room registry with config: {:?}", config);
        Self {
            connections,
            rooms: DashMap::new(),
            policy,
            config,
        }
    }

    #[must_use]
    pub fn policy(&self) -> &dyn AccessPolicy {
        self.policy.as_ref()
    }

    /// Add a connection to a room, creating the room if absent.
    ///
    /// `confirm` builds the confirmation for the joining connection. It is
    /// queued before any broadcast to the room can reach that connection.
    /// Joining a room twice is a no-op that still confirms.
    ///
    /// # Errors
    ///
    /// Fails on an invalid room id, refused access, exceeded limits, or an
    /// unknown connection.
    pub fn join(
        &self,
        connection: &ConnectionId,
        room_id: &str,
        confirm: impl FnOnce(&RoomInfo) -> Envelope,
    ) -> ChatResult<JoinOutcome> {
        validate_room_id(room_id).map_err(ChatError::validation)?;
        let identity = self
            .connections
            .identity(connection)
            .ok_or_else(|| connection_gone(connection))?;
        self.policy.check(&identity, room_id)?;

        self.connections
            .with_connection_mut(connection, |state| {
                if state.joined_rooms.contains(room_id) {
                    let info = self
                        .rooms
                        .get(room_id)
                        .map(|room| room.info())
                        .ok_or_else(|| ChatError::Internal(format!("room {room_id} missing")))?;
                    state.send(Arc::new(confirm(&info)));
                    return Ok(JoinOutcome {
                        newly_joined: false,
                        info,
                    });
                }

                if state.joined_rooms.len() >= self.config.max_rooms_per_connection {
                    return Err(ChatError::validation("Maximum rooms per connection reached"));
                }
                if !self.rooms.contains_key(room_id) && self.rooms.len() >= self.config.max_rooms {
                    return Err(ChatError::validation("Maximum number of rooms reached"));
                }

                let mut room = self.rooms.entry(room_id.to_string()).or_insert_with(|| {
                    debug!(room = %room_id, "Creating room");
                    Room::new(room_id)
                });
                room.add_member(connection.clone(), Member::new(connection, &identity));
                let info = room.info();
                drop(room);

                state.joined_rooms.insert(room_id.to_string());
                state.send(Arc::new(confirm(&info)));

                debug!(
                    room = %room_id,
                    connection = %connection,
                    members = info.member_count,
                    "Joined room"
                );
                Ok(JoinOutcome {
                    newly_joined: true,
                    info,
                })
            })
            .ok_or_else(|| connection_gone(connection))?
    }

    /// Remove a connection from a room.
    ///
    /// Returns the removed membership, or `None` if the connection was not a
    /// member. The room is discarded once empty.
    ///
    /// # Errors
    ///
    /// Fails if the connection is unknown.
    pub fn leave(&self, connection: &ConnectionId, room_id: &str) -> ChatResult<Option<Member>> {
        let removed = self
            .connections
            .with_connection_mut(connection, |state| {
                if !state.joined_rooms.remove(room_id) {
                    return None;
                }
                self.rooms
                    .get_mut(room_id)
                    .and_then(|mut room| room.remove_member(connection))
            })
            .ok_or_else(|| connection_gone(connection))?;

        if removed.is_some() {
            self.evict_if_empty(room_id);
            debug!(room = %room_id, connection = %connection, "Left room");
        }
        Ok(removed)
    }

    /// Remove a departed connection from the given rooms.
    ///
    /// Used after the connection itself was discarded; returns each room
    /// left with the membership it held.
    pub fn remove_from_rooms(
        &self,
        connection: &ConnectionId,
        rooms: impl IntoIterator<Item = RoomId>,
    ) -> Vec<(RoomId, Member)> {
        let mut left = Vec::new();
        for room_id in rooms {
            let removed = self
                .rooms
                .get_mut(&room_id)
                .and_then(|mut room| room.remove_member(connection));
            if let Some(member) = removed {
                self.evict_if_empty(&room_id);
                left.push((room_id, member));
            }
        }
        debug!(connection = %connection, rooms = left.len(), "Removed from all rooms");
        left
    }

    fn evict_if_empty(&self, room_id: &str) {
        if self.rooms.remove_if(room_id, |_, room| room.is_empty()).is_some() {
            debug!(room = %room_id, "Discarded empty room");
        }
    }

    /// Deliver an event to every current member of a room.
    ///
    /// Returns the number of members the event was queued for.
    pub fn broadcast(
        &self,
        room_id: &str,
        kind: &str,
        payload: Value,
        exclude: Option<&ConnectionId>,
    ) -> usize {
        self.broadcast_envelope(room_id, Envelope::new(kind, payload).with_room(room_id), exclude)
    }

    /// Deliver a prepared envelope to every current member of a room.
    pub fn broadcast_envelope(
        &self,
        room_id: &str,
        envelope: Envelope,
        exclude: Option<&ConnectionId>,
    ) -> usize {
        let recipients = match self.rooms.get(room_id) {
            Some(room) => room.recipients(exclude),
            None => {
                trace!(room = %room_id, "Broadcast to absent room");
                return 0;
            }
        };

        let envelope = Arc::new(envelope);
        let delivered = recipients
            .iter()
            .filter(|id| self.connections.send(id, Arc::clone(&envelope)))
            .count();
        trace!(room = %room_id, kind = %envelope.kind, recipients = delivered, "Broadcast");
        delivered
    }

    /// Snapshot of a live room, `None` when it has no members.
    #[must_use]
    pub fn room_info(&self, room_id: &str) -> Option<RoomInfo> {
        self.rooms.get(room_id).map(|room| room.info())
    }

    #[must_use]
    pub fn is_member(&self, connection: &ConnectionId, room_id: &str) -> bool {
        self.connections.is_in_room(connection, room_id)
    }

    #[must_use]
    pub fn member_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map_or(0, |room| room.member_count())
    }

    /// Refresh a member's last-seen time and optionally its status.
    pub fn touch(
        &self,
        connection: &ConnectionId,
        room_id: &str,
        status: Option<PresenceStatus>,
    ) -> Option<Member> {
        let mut room = self.rooms.get_mut(room_id)?;
        let member = room.member_mut(connection)?;
        member.touch(status);
        Some(member.clone())
    }

    /// Count a message in a live room's statistics.
    pub fn record_message(&self, room_id: &str, is_file: bool) {
        if let Some(mut room) = self.rooms.get_mut(room_id) {
            room.record_message(is_file);
        }
    }

    /// Attach metadata to a live room.
    pub fn set_metadata(&self, room_id: &str, metadata: Value) -> bool {
        match self.rooms.get_mut(room_id) {
            Some(mut room) => {
                room.set_metadata(metadata);
                true
            }
            None => false,
        }
    }

    /// Number of live rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    #[must_use]
    pub fn room_ids(&self) -> Vec<RoomId> {
        self.rooms.iter().map(|e| e.key().clone()).collect()
    }

    #[must_use]
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }
}

fn connection_gone(connection: &ConnectionId) -> ChatError {
    ChatError::Transport(format!("connection {connection} is closed"))
}

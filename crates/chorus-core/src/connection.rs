//! Live connection tracking.
//!
//! Each connection owns an outbound sink. Sends never block: a closed sink
//! only affects its own connection and is reported to the caller, which
//! treats it as a disconnect.

use crate::identity::{Identity, UserId};
use crate::room::RoomId;
use chorus_protocol::Envelope;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};
use uuid::Uuid;

/// Outbound half of a connection: envelopes queued for its writer task.
pub type Outbound = mpsc::UnboundedSender<Arc<Envelope>>;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", Uuid::new_v4().simple()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A transport session handed to [`ConnectionManager::register`].
#[derive(Debug, Clone)]
pub struct Transport {
    /// Stable key of the underlying session; registering the same key twice
    /// yields the same connection.
    pub key: String,
    pub sink: Outbound,
}

impl Transport {
    #[must_use]
    pub fn new(key: impl Into<String>, sink: Outbound) -> Self {
        Self {
            key: key.into(),
            sink,
        }
    }
}

/// State of one live connection.
#[derive(Debug)]
pub struct ConnectionState {
    pub id: ConnectionId,
    pub transport_key: String,
    pub identity: Identity,
    pub joined_rooms: HashSet<RoomId>,
    pub connected_at: DateTime<Utc>,
    sink: Outbound,
}

impl ConnectionState {
    /// Queue an envelope on this connection. Returns `false` if the writer
    /// side is gone.
    pub fn send(&self, envelope: Arc<Envelope>) -> bool {
        self.sink.send(envelope).is_ok()
    }
}

/// Tracks live connections and their identities.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: DashMap<ConnectionId, ConnectionState>,
    /// Transport key -> connection.
    transports: DashMap<String, ConnectionId>,
    /// User id -> that user's live connections.
    users: DashMap<UserId, HashSet<ConnectionId>>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport session.
    ///
    /// Anonymous identities are accepted; they are restricted later by room
    /// access and role permissions.
    pub fn register(&self, transport: Transport, identity: Identity) -> ConnectionId {
        match self.transports.entry(transport.key.clone()) {
            Entry::Occupied(existing) => {
                trace!(transport = %transport.key, "Transport already registered");
                existing.get().clone()
            }
            Entry::Vacant(slot) => {
                let id = ConnectionId::generate();
                if let Some(user_id) = identity.user_id() {
                    self.users
                        .entry(user_id.to_string())
                        .or_default()
                        .insert(id.clone());
                }
                info!(
                    connection = %id,
                    user = identity.user_id().unwrap_or("anonymous"),
                    "Connection registered"
                );
                self.connections.insert(
                    id.clone(),
                    ConnectionState {
                        id: id.clone(),
                        transport_key: transport.key,
                        identity,
                        joined_rooms: HashSet::new(),
                        connected_at: Utc::now(),
                        sink: transport.sink,
                    },
                );
                slot.insert(id.clone());
                id
            }
        }
    }

    /// Discard a connection's state. Room cleanup is the caller's job.
    pub fn remove(&self, id: &ConnectionId) -> Option<ConnectionState> {
        let (_, state) = self.connections.remove(id)?;
        self.transports
            .remove_if(&state.transport_key, |_, owner| owner == id);
        if let Some(user_id) = state.identity.user_id() {
            if let Some(mut conns) = self.users.get_mut(user_id) {
                conns.remove(id);
            }
            self.users.remove_if(user_id, |_, conns| conns.is_empty());
        }
        info!(connection = %id, rooms = state.joined_rooms.len(), "Connection removed");
        Some(state)
    }

    /// Queue an envelope for one connection.
    ///
    /// Returns `false` if the connection is unknown or its sink is closed.
    pub fn send(&self, id: &ConnectionId, envelope: Arc<Envelope>) -> bool {
        let Some(conn) = self.connections.get(id) else {
            return false;
        };
        let delivered = conn.send(envelope);
        if !delivered {
            debug!(connection = %id, "Send to closed connection");
        }
        delivered
    }

    /// Deliver an envelope to every live connection of a user: the user's
    /// private channel. Returns the number of connections reached.
    pub fn send_to_user(&self, user_id: &str, envelope: Arc<Envelope>) -> usize {
        let targets: Vec<ConnectionId> = self
            .users
            .get(user_id)
            .map(|conns| conns.iter().cloned().collect())
            .unwrap_or_default();
        targets
            .iter()
            .filter(|id| self.send(id, Arc::clone(&envelope)))
            .count()
    }

    #[must_use]
    pub fn identity(&self, id: &ConnectionId) -> Option<Identity> {
        self.connections.get(id).map(|c| c.identity.clone())
    }

    #[must_use]
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Rooms a connection currently belongs to.
    #[must_use]
    pub fn joined_rooms(&self, id: &ConnectionId) -> Vec<RoomId> {
        self.connections
            .get(id)
            .map(|c| c.joined_rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_in_room(&self, id: &ConnectionId, room_id: &str) -> bool {
        self.connections
            .get(id)
            .is_some_and(|c| c.joined_rooms.contains(room_id))
    }

    /// Run `f` with exclusive access to a connection.
    ///
    /// Room locks may be taken inside `f`; never the other way round.
    pub(crate) fn with_connection_mut<R>(
        &self,
        id: &ConnectionId,
        f: impl FnOnce(&mut ConnectionState) -> R,
    ) -> Option<R> {
        self.connections.get_mut(id).map(|mut c| f(&mut c))
    }

    /// Number of live connections.
    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Number of live connections for a user.
    #[must_use]
    pub fn user_connection_count(&self, user_id: &str) -> usize {
        self.users.get(user_id).map_or(0, |c| c.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Role;
    use serde_json::json;

    fn transport(key: &str) -> (Transport, mpsc::UnboundedReceiver<Arc<Envelope>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Transport::new(key, tx), rx)
    }

    #[test]
    fn test_connection_id_generate() {
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        assert!(a.as_str().starts_with("conn_"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_register_is_idempotent_per_transport() {
        let manager = ConnectionManager::new();
        let (t, _rx) = transport("socket-1");

        let first = manager.register(t.clone(), Identity::Anonymous);
        let second = manager.register(t, Identity::Anonymous);
        assert_eq!(first, second);
        assert_eq!(manager.count(), 1);
    }

    #[test]
    fn test_send_and_private_channel() {
        let manager = ConnectionManager::new();
        let (t1, mut rx1) = transport("s1");
        let (t2, mut rx2) = transport("s2");
        let bob = Identity::user("b", Role::Participant, "Bob");
        let c1 = manager.register(t1, bob.clone());
        manager.register(t2, bob);

        let env = Arc::new(Envelope::new("chat:mention", json!({})));
        assert_eq!(manager.send_to_user("b", Arc::clone(&env)), 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());

        assert!(manager.send(&c1, env));
        assert_eq!(manager.send_to_user("nobody", Arc::new(Envelope::new("x", json!({})))), 0);
    }

    #[test]
    fn test_closed_sink_is_isolated() {
        let manager = ConnectionManager::new();
        let (t1, rx1) = transport("s1");
        let (t2, mut rx2) = transport("s2");
        let c1 = manager.register(t1, Identity::Anonymous);
        let c2 = manager.register(t2, Identity::Anonymous);
        drop(rx1);

        let env = Arc::new(Envelope::new("x", json!({})));
        assert!(!manager.send(&c1, Arc::clone(&env)));
        assert!(manager.send(&c2, env));
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_remove_clears_indexes() {
        let manager = ConnectionManager::new();
        let (t, _rx) = transport("s1");
        let id = manager.register(t.clone(), Identity::user("a", Role::Admin, "A"));
        assert_eq!(manager.user_connection_count("a"), 1);

        let state = manager.remove(&id).unwrap();
        assert_eq!(state.transport_key, "s1");
        assert!(!manager.contains(&id));
        assert_eq!(manager.user_connection_count("a"), 0);
        assert!(manager.remove(&id).is_none());

        // The transport key is free again.
        let again = manager.register(t, Identity::Anonymous);
        assert_ne!(again, id);
    }
}

//! Presence and typing indicators.
//!
//! Both are ephemeral and layered on the room registry. Typing flags expire
//! on their own after a fixed timeout unless refreshed. Last-seen records are
//! persisted on a best-effort basis.

use crate::connection::ConnectionId;
use crate::error::{ChatError, ChatResult};
use crate::identity::UserIdentity;
use crate::registry::RoomRegistry;
use crate::room::{Member, RoomId};
use crate::store::{Store, PRESENCE};
use chorus_protocol::outbound;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Default typing indicator lifetime.
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(5);

/// A member's presence status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    #[default]
    Online,
    Away,
    Busy,
    Offline,
}

type TypingKey = (RoomId, String);

/// Presence and typing state.
pub struct Presence {
    registry: Arc<RoomRegistry>,
    store: Arc<dyn Store>,
    /// Active typing flags, keyed by (room, user), valued by generation.
    typing: Arc<DashMap<TypingKey, u64>>,
    generation: AtomicU64,
    typing_timeout: Duration,
}

impl Presence {
    #[must_use]
    pub fn new(registry: Arc<RoomRegistry>, store: Arc<dyn Store>, typing_timeout: Duration) -> Self {
        Self {
            registry,
            store,
            typing: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            typing_timeout,
        }
    }

    /// Mark a user as typing in a room and schedule the flag's expiry.
    ///
    /// # Errors
    ///
    /// Fails if the connection is not a member of the room.
    pub fn typing_start(
        &self,
        connection: &ConnectionId,
        user: &UserIdentity,
        room_id: &str,
    ) -> ChatResult<()> {
        self.ensure_member(connection, room_id)?;

        let key = (room_id.to_string(), user.user_id.clone());
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.typing.insert(key.clone(), generation);
        self.registry.broadcast(
            room_id,
            outbound::USER_TYPING,
            typing_payload(room_id, user, true),
            Some(connection),
        );

        let typing = Arc::clone(&self.typing);
        let registry = Arc::clone(&self.registry);
        let timeout = self.typing_timeout;
        let connection = connection.clone();
        let user = user.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if typing.remove_if(&key, |_, g| *g == generation).is_some() {
                trace!(room = %key.0, user = %key.1, "Typing indicator expired");
                registry.broadcast(
                    &key.0,
                    outbound::USER_TYPING,
                    typing_payload(&key.0, &user, false),
                    Some(&connection),
                );
            }
        });
        Ok(())
    }

    /// Clear a typing flag. Returns `false` if the user was not typing.
    ///
    /// # Errors
    ///
    /// Fails if the connection is not a member of the room.
    pub fn typing_stop(
        &self,
        connection: &ConnectionId,
        user: &UserIdentity,
        room_id: &str,
    ) -> ChatResult<bool> {
        self.ensure_member(connection, room_id)?;
        let key = (room_id.to_string(), user.user_id.clone());
        if self.typing.remove(&key).is_none() {
            return Ok(false);
        }
        self.registry.broadcast(
            room_id,
            outbound::USER_TYPING,
            typing_payload(room_id, user, false),
            Some(connection),
        );
        Ok(true)
    }

    #[must_use]
    pub fn is_typing(&self, room_id: &str, user_id: &str) -> bool {
        self.typing
            .contains_key(&(room_id.to_string(), user_id.to_string()))
    }

    /// Drop a departed member's typing flag, telling the rest of the room.
    ///
    /// Call after the membership was removed so only remaining members hear
    /// the stop. Returns `false` if the member was not typing.
    pub fn clear_typing(&self, room_id: &str, member: &Member) -> bool {
        let Some(user_id) = &member.user_id else {
            return false;
        };
        if self
            .typing
            .remove(&(room_id.to_string(), user_id.clone()))
            .is_none()
        {
            return false;
        }
        self.registry.broadcast(
            room_id,
            outbound::USER_TYPING,
            json!({
                "roomId": room_id,
                "userId": user_id,
                "displayName": member.display_name,
                "isTyping": false,
            }),
            None,
        );
        true
    }

    /// Update a member's presence, rebroadcast it and persist last-seen.
    ///
    /// # Errors
    ///
    /// Fails if the connection is not a member of the room.
    pub async fn update(
        &self,
        connection: &ConnectionId,
        user: &UserIdentity,
        room_id: &str,
        status: PresenceStatus,
    ) -> ChatResult<Member> {
        let member = self
            .registry
            .touch(connection, room_id, Some(status))
            .ok_or_else(|| ChatError::denied("Not a member of this room"))?;

        self.registry.broadcast(
            room_id,
            outbound::PRESENCE_UPDATE,
            json!({
                "roomId": room_id,
                "userId": user.user_id,
                "status": status,
                "lastSeen": member.last_seen,
            }),
            Some(connection),
        );
        debug!(room = %room_id, user = %user.user_id, status = ?status, "Presence updated");

        self.persist_last_seen(room_id, user, &member).await;
        Ok(member)
    }

    async fn persist_last_seen(&self, room_id: &str, user: &UserIdentity, member: &Member) {
        let id = format!("{room_id}:{}", user.user_id);
        let record = json!({
            "id": id,
            "roomId": room_id,
            "userId": user.user_id,
            "status": member.status,
            "lastSeen": member.last_seen,
        });
        let result = match self.store.read(PRESENCE, &id).await {
            Ok(Some(_)) => self.store.update(PRESENCE, &id, record).await,
            Ok(None) => self.store.create(PRESENCE, record).await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            warn!(room = %room_id, user = %user.user_id, error = %err, "Failed to persist presence");
        }
    }

    fn ensure_member(&self, connection: &ConnectionId, room_id: &str) -> ChatResult<()> {
        if self.registry.is_member(connection, room_id) {
            Ok(())
        } else {
            Err(ChatError::denied("Not a member of this room"))
        }
    }
}

fn typing_payload(room_id: &str, user: &UserIdentity, is_typing: bool) -> serde_json::Value {
    json!({
        "roomId": room_id,
        "userId": user.user_id,
        "displayName": user.display_name,
        "isTyping": is_typing,
    })
}

//! The hub: one explicit owner for all realtime state.
//!
//! A hub is built once at startup and shared by reference with every
//! handler. Tests build isolated hubs with their own store and limiter.

use crate::chatroom::{
    ChatRoomRecord, CreateRoomRequest, RoomDirectory, RoomStatus, RoomUpdate,
};
use crate::connection::{ConnectionId, ConnectionManager, Transport};
use crate::dispatch::{EventContext, EventRouter};
use crate::engine::{EngineConfig, MessageEngine};
use crate::error::{ChatError, ChatResult};
use crate::handlers::register_chat_handlers;
use crate::identity::Identity;
use crate::moderation::{KeywordModerator, Moderator, DEFAULT_BLOCKED_KEYWORDS};
use crate::presence::{Presence, DEFAULT_TYPING_TIMEOUT};
use crate::ratelimit::{Action, RateDecision, RateLimitPolicy, RateLimiter, SlidingWindowLimiter};
use crate::registry::{JoinOutcome, RegistryConfig, RoomRegistry};
use crate::room::{validate_room_id, AccessPolicy, Member, PrefixAccessPolicy, RoomInfo, USER_CHANNEL_PREFIX};
use crate::store::{MemoryStore, Store};
use chorus_protocol::{outbound, Envelope};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Number of recent messages included when a connection joins a room.
pub const RECENT_MESSAGES_ON_JOIN: usize = 50;

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub registry: RegistryConfig,
    pub engine: EngineConfig,
    /// Overrides of the default per-action rate limit policies.
    pub rate_limits: HashMap<Action, RateLimitPolicy>,
    pub blocked_keywords: Vec<String>,
    pub typing_timeout: Duration,
    pub recent_messages: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            engine: EngineConfig::default(),
            rate_limits: HashMap::new(),
            blocked_keywords: DEFAULT_BLOCKED_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
            recent_messages: RECENT_MESSAGES_ON_JOIN,
        }
    }
}

/// Builder for [`Hub`] with pluggable collaborators.
pub struct HubBuilder {
    config: HubConfig,
    store: Option<Arc<dyn Store>>,
    moderator: Option<Arc<dyn Moderator>>,
    limiter: Option<Arc<dyn RateLimiter>>,
    policy: Option<Arc<dyn AccessPolicy>>,
}

impl HubBuilder {
    #[must_use]
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn moderator(mut self, moderator: Arc<dyn Moderator>) -> Self {
        self.moderator = Some(moderator);
        self
    }

    #[must_use]
    pub fn rate_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    #[must_use]
    pub fn access_policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    #[must_use]
    pub fn build(self) -> Hub {
        let config = self.config;
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let moderator = self
            .moderator
            .unwrap_or_else(|| Arc::new(KeywordModerator::new(&config.blocked_keywords)));
        let limiter = self.limiter.unwrap_or_else(|| {
            Arc::new(SlidingWindowLimiter::with_policies(config.rate_limits.clone()))
        });
        let policy = self.policy.unwrap_or_else(|| Arc::new(PrefixAccessPolicy));

        let connections = Arc::new(ConnectionManager::new());
        let registry = Arc::new(RoomRegistry::with_config(
            Arc::clone(&connections),
            config.registry.clone(),
            policy,
        ));
        let directory = Arc::new(RoomDirectory::new(Arc::clone(&store), Arc::clone(&limiter)));
        let engine = MessageEngine::new(
            Arc::clone(&registry),
            Arc::clone(&directory),
            Arc::clone(&store),
            moderator,
            Arc::clone(&limiter),
            config.engine.clone(),
        );
        let presence = Presence::new(Arc::clone(&registry), store, config.typing_timeout);

        let router = EventRouter::new();
        register_chat_handlers(&router);

        info!("Hub ready");
        Hub {
            config,
            connections,
            registry,
            limiter,
            directory,
            engine,
            presence,
            router,
        }
    }
}

/// Durable room record merged with live registry state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomView {
    #[serde(flatten)]
    pub room: ChatRoomRecord,
    pub live: Option<RoomInfo>,
}

/// Owner of connections, rooms, and the message pipeline.
pub struct Hub {
    config: HubConfig,
    connections: Arc<ConnectionManager>,
    registry: Arc<RoomRegistry>,
    limiter: Arc<dyn RateLimiter>,
    directory: Arc<RoomDirectory>,
    engine: MessageEngine,
    presence: Presence,
    router: EventRouter,
}

impl Hub {
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        Self::builder(config).build()
    }

    #[must_use]
    pub fn builder(config: HubConfig) -> HubBuilder {
        HubBuilder {
            config,
            store: None,
            moderator: None,
            limiter: None,
            policy: None,
        }
    }

    /// Register a transport session with the identity supplied for it.
    pub fn register(&self, transport: Transport, identity: Identity) -> ConnectionId {
        self.connections.register(transport, identity)
    }

    /// Discard a connection, leaving every room it belonged to.
    ///
    /// Returns the number of rooms left; one `user-left` is broadcast per room.
    pub fn unregister(&self, connection: &ConnectionId) -> usize {
        let Some(state) = self.connections.remove(connection) else {
            return 0;
        };
        let left = self.registry.remove_from_rooms(connection, state.joined_rooms);
        for (room_id, member) in &left {
            self.presence.clear_typing(room_id, member);
            self.announce_leave(room_id, member);
        }
        left.len()
    }

    /// Join a room and announce the new member.
    ///
    /// The joining connection receives `room-joined` with the room snapshot,
    /// durable settings and recent messages before any other room event.
    ///
    /// # Errors
    ///
    /// `RateLimited`, `PermissionDenied`, `Validation`, or `Transport` if the
    /// connection is gone.
    pub async fn join_room(&self, connection: &ConnectionId, room_id: &str) -> ChatResult<JoinOutcome> {
        validate_room_id(room_id).map_err(ChatError::validation)?;
        let identity = self
            .connections
            .identity(connection)
            .ok_or_else(|| ChatError::Transport(format!("connection {connection} is closed")))?;

        self.registry.policy().check(&identity, room_id)?;

        let record = match self.directory.find(room_id).await {
            Ok(record) => record,
            Err(err) => {
                warn!(room = %room_id, error = %err, "Room settings unavailable");
                None
            }
        };
        if record
            .as_ref()
            .is_some_and(|r| r.status == RoomStatus::Disabled)
        {
            return Err(ChatError::denied("Chat room is disabled"));
        }

        // Only joins that passed access checks count against the quota.
        let key = identity
            .user_id()
            .map_or_else(|| connection.to_string(), str::to_string);
        if let RateDecision::Denied { .. } = self.limiter.check(&key, Action::JoinRoom) {
            return Err(ChatError::RateLimited(Action::JoinRoom));
        }
        let messages = match self.engine.recent(room_id, self.config.recent_messages).await {
            Ok(messages) => messages,
            Err(err) => {
                warn!(room = %room_id, error = %err, "Recent messages unavailable");
                Vec::new()
            }
        };

        let outcome = self.registry.join(connection, room_id, |info| {
            Envelope::new(
                outbound::ROOM_JOINED,
                json!({
                    "roomId": room_id,
                    "room": info,
                    "chatRoom": record,
                    "messages": messages,
                }),
            )
            .with_room(room_id)
        })?;

        if outcome.newly_joined {
            self.registry.broadcast(
                room_id,
                outbound::USER_JOINED,
                json!({
                    "roomId": room_id,
                    "connectionId": connection.as_str(),
                    "userId": identity.user_id(),
                    "displayName": identity.as_user().map(|u| u.display_name.as_str()),
                    "role": identity.role(),
                    "memberCount": outcome.info.member_count,
                }),
                None,
            );
        }
        Ok(outcome)
    }

    /// Leave a room. Returns `false` if the connection was not a member.
    ///
    /// # Errors
    ///
    /// `Transport` if the connection is gone.
    pub fn leave_room(&self, connection: &ConnectionId, room_id: &str) -> ChatResult<bool> {
        let Some(member) = self.registry.leave(connection, room_id)? else {
            return Ok(false);
        };
        self.connections.send(
            connection,
            Arc::new(Envelope::new(outbound::ROOM_LEFT, json!({ "roomId": room_id })).with_room(room_id)),
        );
        self.presence.clear_typing(room_id, &member);
        self.announce_leave(room_id, &member);
        Ok(true)
    }

    fn announce_leave(&self, room_id: &str, member: &Member) {
        self.registry.broadcast(
            room_id,
            outbound::USER_LEFT,
            json!({
                "roomId": room_id,
                "connectionId": member.connection_id,
                "userId": member.user_id,
                "memberCount": self.registry.member_count(room_id),
            }),
            None,
        );
    }

    /// Fan an event out to a room. Returns the number of recipients.
    pub fn broadcast(
        &self,
        room_id: &str,
        kind: &str,
        payload: Value,
        exclude: Option<&ConnectionId>,
    ) -> usize {
        self.registry.broadcast(room_id, kind, payload, exclude)
    }

    #[must_use]
    pub fn room_info(&self, room_id: &str) -> Option<RoomInfo> {
        self.registry.room_info(room_id)
    }

    /// Route one inbound envelope.
    ///
    /// Failures are reported to the sender only, as `chat:error`, and
    /// returned for accounting.
    ///
    /// # Errors
    ///
    /// The handler's error, after it was sent to the connection.
    pub async fn dispatch(&self, connection: &ConnectionId, envelope: Envelope) -> ChatResult<()> {
        let Some(identity) = self.connections.identity(connection) else {
            return Err(ChatError::Transport(format!("connection {connection} is closed")));
        };
        let kind = envelope.kind.clone();
        let ctx = EventContext {
            connection: connection.clone(),
            identity,
        };

        let result = match self.router.handler(&kind) {
            Some(handler) => handler.handle(self, &ctx, envelope).await,
            None => self.route_default(&ctx, envelope),
        };

        if let Err(err) = &result {
            debug!(connection = %connection, kind = %kind, code = err.code(), "Event failed");
            self.connections
                .send(connection, Arc::new(err.to_envelope(Some(&kind))));
        }
        result
    }

    /// Relay an envelope with no registered handler to its room or target.
    fn route_default(&self, ctx: &EventContext, mut envelope: Envelope) -> ChatResult<()> {
        envelope.source = Some(ctx.connection.to_string());

        if let Some(room_id) = envelope.room.clone() {
            if !self.registry.is_member(&ctx.connection, &room_id) {
                return Err(ChatError::denied("Not a member of this room"));
            }
            self.registry
                .broadcast_envelope(&room_id, envelope, Some(&ctx.connection));
            return Ok(());
        }

        if let Some(target) = envelope.target.clone() {
            let envelope = Arc::new(envelope);
            let reached = match target.strip_prefix(USER_CHANNEL_PREFIX) {
                Some(user_id) => self.connections.send_to_user(user_id, envelope),
                None => usize::from(self.connections.send(&ConnectionId::from(target.as_str()), envelope)),
            };
            if reached == 0 {
                return Err(ChatError::NotFound("Target".into()));
            }
            return Ok(());
        }

        Err(ChatError::validation("Envelope needs a room or a target"))
    }

    /// Create an event's durable chat room.
    ///
    /// # Errors
    ///
    /// See [`RoomDirectory::create`].
    pub async fn create_room(
        &self,
        identity: &Identity,
        request: CreateRoomRequest,
    ) -> ChatResult<ChatRoomRecord> {
        self.directory.create(identity, request).await
    }

    /// # Errors
    ///
    /// `NotFound` when the room has no durable record.
    pub async fn get_room(&self, room_id: &str) -> ChatResult<RoomView> {
        let room = self.directory.get(room_id).await?;
        Ok(RoomView {
            live: self.registry.room_info(room_id),
            room,
        })
    }

    /// Update a durable room. A status change is announced in the room as a
    /// system message.
    ///
    /// # Errors
    ///
    /// See [`RoomDirectory::update`].
    pub async fn update_room(
        &self,
        identity: &Identity,
        room_id: &str,
        update: RoomUpdate,
    ) -> ChatResult<ChatRoomRecord> {
        let outcome = self.directory.update(identity, room_id, update).await?;
        if let Some(previous) = outcome.previous_status {
            let text = format!(
                "Chat room status changed from {} to {}",
                previous.as_str(),
                outcome.room.status.as_str()
            );
            if let Err(err) = self.engine.post_system(room_id, text).await {
                warn!(room = %room_id, error = %err, "Failed to post status message");
            }
        }
        Ok(outcome.room)
    }

    /// Re-check the rate limiter's idle keys.
    pub fn sweep_rate_limits(&self) -> usize {
        self.limiter.sweep()
    }

    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    #[must_use]
    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    #[must_use]
    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    #[must_use]
    pub fn engine(&self) -> &MessageEngine {
        &self.engine
    }

    #[must_use]
    pub fn directory(&self) -> &RoomDirectory {
        &self.directory
    }

    #[must_use]
    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    #[must_use]
    pub fn router(&self) -> &EventRouter {
        &self.router
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

//! Message lifecycle: send, edit, delete, react, list.
//!
//! Every mutation passes the same gates in the same order: an authenticated
//! actor, role permission, room access, rate limit, then content
//! sanitization and moderation. Results are fanned out through the room
//! registry after the store write succeeds.
//!
//! Overlapping mutations of one message are last-writer-wins: each operation
//! re-reads the message right before computing its update.

use crate::chatroom::{ChatRoomRecord, RoomDirectory, RoomStatus};
use crate::connection::ConnectionId;
use crate::error::{ChatError, ChatResult};
use crate::identity::{Identity, Role, UserId, UserIdentity};
use crate::message::{ChatMessage, FileAttachment, MessageContent, MessageId, PublicMessage};
use crate::moderation::{plain_text, sanitize, Moderator, Verdict};
use crate::ratelimit::{Action, RateDecision, RateLimiter};
use crate::registry::RoomRegistry;
use crate::room::{user_channel, validate_room_id};
use crate::store::{Store, MESSAGES};
use chorus_protocol::{outbound, Envelope};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

/// Default maximum message length, in characters.
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 2000;
/// Default cap on mentions notified per message.
pub const DEFAULT_MAX_MENTIONS: usize = 20;
/// Maximum emoji length, in characters.
pub const MAX_EMOJI_LENGTH: usize = 32;
pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_content_length: usize,
    pub max_mentions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            max_mentions: DEFAULT_MAX_MENTIONS,
        }
    }
}

/// Who is acting, and through which connection if any.
///
/// Requests without a connection come from the HTTP surface and skip the
/// live membership check.
#[derive(Debug, Clone)]
pub struct Actor {
    pub identity: Identity,
    pub connection: Option<ConnectionId>,
}

impl Actor {
    #[must_use]
    pub fn connected(connection: ConnectionId, identity: Identity) -> Self {
        Self {
            identity,
            connection: Some(connection),
        }
    }

    #[must_use]
    pub fn request(identity: Identity) -> Self {
        Self {
            identity,
            connection: None,
        }
    }

    fn user(&self) -> ChatResult<&UserIdentity> {
        self.identity
            .as_user()
            .ok_or_else(|| ChatError::denied("Authentication required"))
    }
}

/// Content as submitted by a client: a bare string or a tagged object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawContent {
    Plain(String),
    Tagged(MessageContent),
}

impl RawContent {
    /// Accept the content kinds clients may send directly.
    ///
    /// # Errors
    ///
    /// `Validation` for file and system content.
    pub fn into_content(self) -> ChatResult<MessageContent> {
        match self {
            RawContent::Plain(text) => Ok(MessageContent::Text { text }),
            RawContent::Tagged(
                content @ (MessageContent::Text { .. } | MessageContent::Reaction { .. }),
            ) => Ok(content),
            RawContent::Tagged(other) => Err(ChatError::validation(format!(
                "{} content cannot be sent directly",
                other.kind()
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    #[serde(default)]
    pub room_id: String,
    pub content: RawContent,
    #[serde(default)]
    pub mentions: Vec<UserId>,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRequest {
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub caption: String,
    pub file: FileAttachment,
}

/// Listing cursor and page size.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
    pub before: Option<MessageId>,
    pub after: Option<MessageId>,
}

#[derive(Debug, Clone)]
pub struct ReactionOutcome {
    pub message: ChatMessage,
    /// `false` when the toggle was a no-op.
    pub changed: bool,
    pub count: usize,
}

/// Extract `@user` tokens from plain text.
#[must_use]
pub fn parse_mentions(text: &str) -> Vec<UserId> {
    text.split_whitespace()
        .filter_map(|word| word.strip_prefix('@'))
        .map(|rest| {
            rest.chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
                .collect::<String>()
        })
        .filter(|name| !name.is_empty())
        .collect()
}

fn validate_emoji(emoji: &str) -> ChatResult<&str> {
    let emoji = emoji.trim();
    if emoji.is_empty() || emoji.chars().count() > MAX_EMOJI_LENGTH {
        return Err(ChatError::validation("Invalid emoji"));
    }
    Ok(emoji)
}

/// The message lifecycle engine.
pub struct MessageEngine {
    registry: Arc<RoomRegistry>,
    directory: Arc<RoomDirectory>,
    store: Arc<dyn Store>,
    moderator: Arc<dyn Moderator>,
    limiter: Arc<dyn RateLimiter>,
    config: EngineConfig,
}

impl MessageEngine {
    #[must_use]
    pub fn new(
        registry: Arc<RoomRegistry>,
        directory: Arc<RoomDirectory>,
        store: Arc<dyn Store>,
        moderator: Arc<dyn Moderator>,
        limiter: Arc<dyn RateLimiter>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            directory,
            store,
            moderator,
            limiter,
            config,
        }
    }

    /// Send a text or reaction message into a room.
    ///
    /// # Errors
    ///
    /// `PermissionDenied`, `RateLimited`, `Validation`, `EmptyContent`,
    /// `ModerationBlocked`, or a store failure.
    pub async fn send(&self, actor: &Actor, request: SendRequest) -> ChatResult<ChatMessage> {
        let user = actor.user()?;
        if !user.role.permissions().send_messages {
            return Err(ChatError::denied("Cannot send messages"));
        }
        let room_id = request.room_id.as_str();
        self.ensure_room_access(actor, room_id).await?;
        self.check_rate(&user.user_id, Action::SendMessage)?;

        let content = match request.content.into_content()? {
            MessageContent::Text { text } => MessageContent::Text {
                text: self.clean_text(&text, false).await?,
            },
            MessageContent::Reaction { emoji } => MessageContent::Reaction {
                emoji: validate_emoji(&emoji)?.to_string(),
            },
            other => {
                return Err(ChatError::validation(format!(
                    "{} content cannot be sent directly",
                    other.kind()
                )))
            }
        };

        if let Some(parent_id) = request.reply_to {
            let parent = self
                .load(parent_id)
                .await
                .map_err(|_| ChatError::validation("Reply target does not exist"))?;
            if parent.room_id != room_id {
                return Err(ChatError::validation(
                    "Reply must reference a message in the same room",
                ));
            }
        }

        let mentions = self.resolve_mentions(&request.mentions, &content, &user.user_id);
        let message = ChatMessage::new(
            room_id,
            user.user_id.clone(),
            user.display_name.clone(),
            user.role,
            content,
        )
        .with_mentions(mentions)
        .with_reply_to(request.reply_to);

        self.store
            .create(MESSAGES, serde_json::to_value(&message)?)
            .await?;
        self.publish_new(&message, false).await;
        debug!(room = %room_id, message = %message.id, author = %user.user_id, "Message sent");
        Ok(message)
    }

    /// Send a file attachment with an optional caption.
    ///
    /// # Errors
    ///
    /// As [`MessageEngine::send`], plus `Validation` when the file breaks the
    /// room's upload settings.
    pub async fn send_file(&self, actor: &Actor, request: FileRequest) -> ChatResult<ChatMessage> {
        let user = actor.user()?;
        if !user.role.permissions().upload_files {
            return Err(ChatError::denied("Cannot upload files"));
        }
        let room_id = request.room_id.as_str();
        let record = self.ensure_room_access(actor, room_id).await?;
        self.check_rate(&user.user_id, Action::UploadFile)?;

        let settings = record.map(|r| r.settings).unwrap_or_default();
        if !settings.allow_file_upload {
            return Err(ChatError::denied("File uploads are disabled in this room"));
        }
        let file = request.file;
        match file.extension() {
            Some(ext) if settings.allows_extension(&ext) => {}
            _ => return Err(ChatError::validation("File type not allowed")),
        }
        if file.size == 0 || file.size > settings.max_file_size_bytes() {
            return Err(ChatError::validation(format!(
                "File size must be between 1 byte and {} MB",
                settings.max_file_size_mb
            )));
        }

        let caption = self.clean_text(&request.caption, true).await?;
        let message = ChatMessage::new(
            room_id,
            user.user_id.clone(),
            user.display_name.clone(),
            user.role,
            MessageContent::File {
                text: caption,
                file,
            },
        );
        self.store
            .create(MESSAGES, serde_json::to_value(&message)?)
            .await?;
        self.publish_new(&message, true).await;
        debug!(room = %room_id, message = %message.id, "File message sent");
        Ok(message)
    }

    /// Post a server-generated message, bypassing user checks.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn post_system(&self, room_id: &str, text: impl Into<String>) -> ChatResult<ChatMessage> {
        let message = ChatMessage::new(
            room_id,
            "system",
            "System",
            Role::Admin,
            MessageContent::System { text: text.into() },
        );
        self.store
            .create(MESSAGES, serde_json::to_value(&message)?)
            .await?;
        self.publish_new(&message, false).await;
        Ok(message)
    }

    /// Replace the text of a message.
    ///
    /// # Errors
    ///
    /// `NotFound` for missing or deleted messages, `PermissionDenied` unless
    /// the editor is the author or a moderator, `ModerationBlocked`.
    pub async fn edit(
        &self,
        actor: &Actor,
        message_id: MessageId,
        new_text: &str,
    ) -> ChatResult<ChatMessage> {
        let user = actor.user()?;
        let current = self.load_live(message_id).await?;
        authorize_owner(user, &current, "edit")?;
        self.ensure_room_access(actor, &current.room_id).await?;
        if !matches!(
            current.content,
            MessageContent::Text { .. } | MessageContent::File { .. }
        ) {
            return Err(ChatError::validation("This message cannot be edited"));
        }

        let text = self.clean_text(new_text, false).await?;

        let mut message = self.load_live(message_id).await?;
        let edited_at = Utc::now();
        if !message.apply_edit(text, edited_at) {
            return Err(ChatError::validation("This message cannot be edited"));
        }
        self.save(&message).await?;

        self.registry.broadcast(
            &message.room_id,
            outbound::MESSAGE_EDITED,
            json!({
                "messageId": message.id,
                "roomId": message.room_id,
                "newContent": message.content,
                "editedAt": edited_at,
                "editedBy": user.user_id,
                "message": message.public_view(),
            }),
            None,
        );
        debug!(message = %message_id, editor = %user.user_id, "Message edited");
        Ok(message)
    }

    /// Soft-delete a message. Deleting twice is a silent no-op.
    ///
    /// # Errors
    ///
    /// `NotFound`, or `PermissionDenied` unless the actor is the author or a
    /// moderator.
    pub async fn delete(&self, actor: &Actor, message_id: MessageId) -> ChatResult<ChatMessage> {
        let user = actor.user()?;
        let mut message = self.load(message_id).await?;
        authorize_owner(user, &message, "delete")?;
        if let Some(connection) = &actor.connection {
            if !self.registry.is_member(connection, &message.room_id) {
                return Err(ChatError::denied("Not a member of this room"));
            }
        }

        if !message.soft_delete(&user.user_id, Utc::now()) {
            debug!(message = %message_id, "Message already deleted");
            return Ok(message);
        }
        self.save(&message).await?;

        self.registry.broadcast(
            &message.room_id,
            outbound::MESSAGE_DELETED,
            json!({
                "messageId": message.id,
                "roomId": message.room_id,
                "deletedBy": user.user_id,
            }),
            None,
        );
        info!(message = %message_id, actor = %user.user_id, "Message deleted");
        Ok(message)
    }

    /// # Errors
    ///
    /// `NotFound` for missing or deleted messages, `Validation` for a bad
    /// emoji, `PermissionDenied`.
    pub async fn add_reaction(
        &self,
        actor: &Actor,
        message_id: MessageId,
        emoji: &str,
    ) -> ChatResult<ReactionOutcome> {
        self.react(actor, message_id, emoji, true).await
    }

    /// # Errors
    ///
    /// As [`MessageEngine::add_reaction`].
    pub async fn remove_reaction(
        &self,
        actor: &Actor,
        message_id: MessageId,
        emoji: &str,
    ) -> ChatResult<ReactionOutcome> {
        self.react(actor, message_id, emoji, false).await
    }

    async fn react(
        &self,
        actor: &Actor,
        message_id: MessageId,
        emoji: &str,
        add: bool,
    ) -> ChatResult<ReactionOutcome> {
        let user = actor.user()?;
        if !user.role.permissions().send_messages {
            return Err(ChatError::denied("Cannot react to messages"));
        }
        let emoji = validate_emoji(emoji)?;
        let room_id = self.load_live(message_id).await?.room_id;
        self.ensure_room_access(actor, &room_id).await?;

        let mut message = self.load_live(message_id).await?;
        let changed = if add {
            message.add_reaction(emoji, &user.user_id)
        } else {
            message.remove_reaction(emoji, &user.user_id)
        };
        let count = message.reaction_count(emoji);

        if changed {
            self.save(&message).await?;
            let kind = if add {
                outbound::REACTION_ADDED
            } else {
                outbound::REACTION_REMOVED
            };
            self.registry.broadcast(
                &room_id,
                kind,
                json!({
                    "messageId": message.id,
                    "roomId": room_id,
                    "emoji": emoji,
                    "userId": user.user_id,
                    "count": count,
                }),
                None,
            );
        }
        Ok(ReactionOutcome {
            message,
            changed,
            count,
        })
    }

    /// A page of visible messages in chronological order.
    ///
    /// Without cursors the newest page is returned; `after` pages forward.
    ///
    /// # Errors
    ///
    /// `Validation` for a bad limit or room id, `PermissionDenied` if the
    /// room is not accessible, `NotFound` for an unknown cursor.
    pub async fn list(
        &self,
        actor: &Actor,
        room_id: &str,
        query: &ListQuery,
    ) -> ChatResult<Vec<PublicMessage>> {
        validate_room_id(room_id).map_err(ChatError::validation)?;
        self.registry.policy().check(&actor.identity, room_id)?;
        self.page(room_id, query).await
    }

    /// The newest visible messages of a room, without access checks.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn recent(&self, room_id: &str, count: usize) -> ChatResult<Vec<PublicMessage>> {
        let query = ListQuery {
            limit: Some(count.clamp(1, MAX_PAGE_SIZE)),
            ..ListQuery::default()
        };
        self.page(room_id, &query).await
    }

    async fn page(&self, room_id: &str, query: &ListQuery) -> ChatResult<Vec<PublicMessage>> {
        let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(ChatError::validation(format!(
                "limit must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }

        let mut all = self
            .store
            .find(MESSAGES, json!({ "roomId": room_id }))
            .await?
            .into_iter()
            .map(serde_json::from_value::<ChatMessage>)
            .collect::<Result<Vec<_>, _>>()?;
        all.sort_by_key(|m| (m.created_at, m.id));

        let cursor = |id: Option<MessageId>| -> ChatResult<Option<_>> {
            id.map(|id| {
                all.iter()
                    .find(|m| m.id == id)
                    .map(|m| (m.created_at, m.id))
                    .ok_or_else(|| ChatError::NotFound("Cursor message".into()))
            })
            .transpose()
        };
        let before = cursor(query.before)?;
        let after = cursor(query.after)?;

        let visible: Vec<&ChatMessage> = all
            .iter()
            .filter(|m| m.is_visible())
            .filter(|m| before.map_or(true, |b| (m.created_at, m.id) < b))
            .filter(|m| after.map_or(true, |a| (m.created_at, m.id) > a))
            .collect();

        let page = if after.is_some() && before.is_none() {
            &visible[..limit.min(visible.len())]
        } else {
            &visible[visible.len().saturating_sub(limit)..]
        };
        Ok(page.iter().map(|m| m.public_view()).collect())
    }

    /// Read a message, including deleted ones.
    ///
    /// # Errors
    ///
    /// `NotFound`, store failures.
    pub async fn load(&self, message_id: MessageId) -> ChatResult<ChatMessage> {
        let value = self
            .store
            .read(MESSAGES, &message_id.to_string())
            .await?
            .ok_or_else(|| ChatError::NotFound("Message".into()))?;
        Ok(serde_json::from_value(value)?)
    }

    async fn load_live(&self, message_id: MessageId) -> ChatResult<ChatMessage> {
        let message = self.load(message_id).await?;
        if message.moderation.is_deleted {
            return Err(ChatError::NotFound("Message".into()));
        }
        Ok(message)
    }

    async fn save(&self, message: &ChatMessage) -> ChatResult<()> {
        self.store
            .update(MESSAGES, &message.id.to_string(), serde_json::to_value(message)?)
            .await?;
        Ok(())
    }

    /// Room-level gates shared by all mutations.
    async fn ensure_room_access(
        &self,
        actor: &Actor,
        room_id: &str,
    ) -> ChatResult<Option<ChatRoomRecord>> {
        validate_room_id(room_id).map_err(ChatError::validation)?;
        self.registry.policy().check(&actor.identity, room_id)?;
        if let Some(connection) = &actor.connection {
            if !self.registry.is_member(connection, room_id) {
                return Err(ChatError::denied("Not a member of this room"));
            }
        }
        let record = self.directory.find(room_id).await?;
        if let Some(room) = &record {
            if room.status != RoomStatus::Active {
                return Err(ChatError::denied("Chat room is not active"));
            }
        }
        Ok(record)
    }

    fn check_rate(&self, key: &str, action: Action) -> ChatResult<()> {
        match self.limiter.check(key, action) {
            RateDecision::Allowed => Ok(()),
            RateDecision::Denied { .. } => Err(ChatError::RateLimited(action)),
        }
    }

    /// Length check, sanitization, then moderation of the plain text.
    async fn clean_text(&self, raw: &str, allow_empty: bool) -> ChatResult<String> {
        if raw.chars().count() > self.config.max_content_length {
            return Err(ChatError::validation(format!(
                "Message exceeds {} characters",
                self.config.max_content_length
            )));
        }
        let sanitized = sanitize(raw);
        let plain = plain_text(&sanitized);
        if plain.trim().is_empty() {
            return if allow_empty {
                Ok(String::new())
            } else {
                Err(ChatError::EmptyContent)
            };
        }
        match self.moderator.evaluate(&plain).await {
            Verdict::Allowed => Ok(sanitized),
            Verdict::Blocked(reason) => Err(ChatError::ModerationBlocked(reason)),
        }
    }

    fn resolve_mentions(
        &self,
        explicit: &[UserId],
        content: &MessageContent,
        author: &str,
    ) -> Vec<UserId> {
        let parsed = content
            .as_text()
            .map(|text| parse_mentions(&plain_text(text)))
            .unwrap_or_default();
        let mut mentions: Vec<UserId> = Vec::new();
        for user in explicit.iter().map(|u| u.trim().to_string()).chain(parsed) {
            if !user.is_empty() && user != author && !mentions.contains(&user) {
                mentions.push(user);
            }
        }
        mentions.truncate(self.config.max_mentions);
        mentions
    }

    /// Statistics, fan-out and mention notifications for a stored message.
    async fn publish_new(&self, message: &ChatMessage, is_file: bool) {
        self.registry.record_message(&message.room_id, is_file);
        self.registry.broadcast(
            &message.room_id,
            outbound::MESSAGE_RECEIVED,
            json!({
                "roomId": message.room_id,
                "message": message.public_view(),
            }),
            None,
        );

        let connections = self.registry.connections();
        for user in &message.mentions {
            let envelope = Envelope::new(
                outbound::MENTION,
                json!({
                    "messageId": message.id,
                    "roomId": message.room_id,
                    "authorId": message.author_id,
                    "authorName": message.author_name,
                    "content": message.content.as_text(),
                }),
            )
            .with_room(message.room_id.clone())
            .with_target(user_channel(user));
            let reached = connections.send_to_user(user, Arc::new(envelope));
            debug!(user = %user, connections = reached, "Mention notified");
        }

        self.directory.record_activity(&message.room_id, is_file).await;
    }
}

fn authorize_owner(user: &UserIdentity, message: &ChatMessage, action: &str) -> ChatResult<()> {
    if message.author_id == user.user_id || user.role.permissions().moderate_messages {
        Ok(())
    } else {
        Err(ChatError::denied(format!("Cannot {action} other users' messages")))
    }
}

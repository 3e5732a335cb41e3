//! Chat message types.
//!
//! A message's `id`, `roomId` and `authorId` never change after creation.
//! Edits append the prior content to the history, and deletion is soft: the
//! content stays readable internally but [`ChatMessage::public_view`] never
//! exposes it.

use crate::identity::{Role, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// A unique message identifier.
pub type MessageId = Uuid;

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    Uuid::new_v4()
}

/// Metadata of a file stored by the external file service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileAttachment {
    pub original_name: String,
    pub stored_name: String,
    pub mime_type: String,
    pub size: u64,
    pub url: String,
}

impl FileAttachment {
    /// Lowercased extension of the original file name.
    #[must_use]
    pub fn extension(&self) -> Option<String> {
        self.original_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
    }
}

/// Message content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageContent {
    Text {
        text: String,
    },
    File {
        /// Caption.
        text: String,
        file: FileAttachment,
    },
    /// Generated by the server, e.g. when a room's status changes.
    System {
        text: String,
    },
    /// A standalone emoji burst.
    Reaction {
        emoji: String,
    },
}

impl MessageContent {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        MessageContent::Text { text: text.into() }
    }

    /// The textual part of the content, if any.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text { text }
            | MessageContent::File { text, .. }
            | MessageContent::System { text } => Some(text),
            MessageContent::Reaction { .. } => None,
        }
    }

    /// Replace the user-editable text. Returns `false` for content that
    /// cannot be edited.
    pub fn replace_text(&mut self, new_text: String) -> bool {
        match self {
            MessageContent::Text { text } | MessageContent::File { text, .. } => {
                *text = new_text;
                true
            }
            MessageContent::System { .. } | MessageContent::Reaction { .. } => false,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            MessageContent::Text { .. } => "text",
            MessageContent::File { .. } => "file",
            MessageContent::System { .. } => "system",
            MessageContent::Reaction { .. } => "reaction",
        }
    }
}

/// One accepted edit: the content as it was before the edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditRecord {
    pub content: MessageContent,
    pub edited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditState {
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub history: Vec<EditRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationState {
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by: Option<UserId>,
    pub is_hidden: bool,
}

/// A chat message as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub room_id: String,
    pub author_id: UserId,
    pub author_name: String,
    pub role: Role,
    pub content: MessageContent,
    #[serde(default)]
    pub mentions: Vec<UserId>,
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    /// Emoji to the set of users who reacted with it.
    #[serde(default)]
    pub reactions: BTreeMap<String, BTreeSet<UserId>>,
    #[serde(default)]
    pub edited: EditState,
    #[serde(default)]
    pub moderation: ModerationState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatMessage {
    /// Create a new message.
    #[must_use]
    pub fn new(
        room_id: impl Into<String>,
        author_id: impl Into<UserId>,
        author_name: impl Into<String>,
        role: Role,
        content: MessageContent,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: generate_message_id(),
            room_id: room_id.into(),
            author_id: author_id.into(),
            author_name: author_name.into(),
            role,
            content,
            mentions: Vec::new(),
            reply_to: None,
            reactions: BTreeMap::new(),
            edited: EditState::default(),
            moderation: ModerationState::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_mentions(mut self, mentions: Vec<UserId>) -> Self {
        self.mentions = mentions;
        self
    }

    #[must_use]
    pub fn with_reply_to(mut self, reply_to: Option<MessageId>) -> Self {
        self.reply_to = reply_to;
        self
    }

    /// Whether the message is visible in default listings.
    #[must_use]
    pub fn is_visible(&self) -> bool {
        !self.moderation.is_deleted && !self.moderation.is_hidden
    }

    /// Apply an edit, recording the prior content.
    ///
    /// Returns `false` if the content kind is not editable.
    pub fn apply_edit(&mut self, new_text: String, at: DateTime<Utc>) -> bool {
        let previous = self.content.clone();
        if !self.content.replace_text(new_text) {
            return false;
        }
        self.edited.is_edited = true;
        self.edited.edited_at = Some(at);
        self.edited.history.push(EditRecord {
            content: previous,
            edited_at: at,
        });
        self.updated_at = at;
        true
    }

    /// Soft-delete the message. Returns `false` if it was already deleted.
    pub fn soft_delete(&mut self, actor: &str, at: DateTime<Utc>) -> bool {
        if self.moderation.is_deleted {
            return false;
        }
        self.moderation.is_deleted = true;
        self.moderation.deleted_at = Some(at);
        self.moderation.deleted_by = Some(actor.to_string());
        self.updated_at = at;
        true
    }

    /// Add a user's reaction. Returns `false` if already present.
    pub fn add_reaction(&mut self, emoji: &str, user: &str) -> bool {
        let added = self
            .reactions
            .entry(emoji.to_string())
            .or_default()
            .insert(user.to_string());
        if added {
            self.updated_at = Utc::now();
        }
        added
    }

    /// Remove a user's reaction. Returns `false` if it was not present.
    pub fn remove_reaction(&mut self, emoji: &str, user: &str) -> bool {
        let Some(users) = self.reactions.get_mut(emoji) else {
            return false;
        };
        let removed = users.remove(user);
        if users.is_empty() {
            self.reactions.remove(emoji);
        }
        if removed {
            self.updated_at = Utc::now();
        }
        removed
    }

    /// Number of users who reacted with an emoji.
    #[must_use]
    pub fn reaction_count(&self, emoji: &str) -> usize {
        self.reactions.get(emoji).map_or(0, BTreeSet::len)
    }

    /// The client-facing representation.
    #[must_use]
    pub fn public_view(&self) -> PublicMessage {
        let deleted = self.moderation.is_deleted;
        PublicMessage {
            id: self.id,
            room_id: self.room_id.clone(),
            author_id: self.author_id.clone(),
            author_name: self.author_name.clone(),
            role: self.role,
            content: (!deleted).then(|| self.content.clone()),
            mentions: self.mentions.clone(),
            reply_to: self.reply_to,
            reactions: self
                .reactions
                .iter()
                .map(|(emoji, users)| ReactionSummary {
                    emoji: emoji.clone(),
                    users: users.iter().cloned().collect(),
                    count: users.len(),
                })
                .collect(),
            is_edited: self.edited.is_edited,
            edited_at: self.edited.edited_at,
            edit_history: if deleted {
                Vec::new()
            } else {
                self.edited.history.clone()
            },
            is_deleted: deleted,
            deleted_by: self.moderation.deleted_by.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Reaction aggregate as sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionSummary {
    pub emoji: String,
    pub users: Vec<UserId>,
    pub count: usize,
}

/// A message as exposed to clients. Deleted messages carry no content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicMessage {
    pub id: MessageId,
    pub room_id: String,
    pub author_id: UserId,
    pub author_name: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    pub mentions: Vec<UserId>,
    pub reply_to: Option<MessageId>,
    pub reactions: Vec<ReactionSummary>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub edit_history: Vec<EditRecord>,
    pub is_deleted: bool,
    pub deleted_by: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ChatMessage {
        ChatMessage::new("event-42", "a", "Alice", Role::Participant, MessageContent::text("Hello @B"))
    }

    #[test]
    fn test_message_creation() {
        let msg = sample();
        assert_eq!(msg.room_id, "event-42");
        assert!(!msg.edited.is_edited);
        assert!(msg.is_visible());
        assert_eq!(msg.created_at, msg.updated_at);
    }

    #[test]
    fn test_unique_message_ids() {
        assert_ne!(generate_message_id(), generate_message_id());
    }

    #[test]
    fn test_edit_records_history() {
        let mut msg = sample();
        let id = msg.id;
        assert!(msg.apply_edit("Hello again @B".into(), Utc::now()));

        assert_eq!(msg.id, id);
        assert!(msg.edited.is_edited);
        assert_eq!(msg.edited.history.len(), 1);
        assert_eq!(msg.edited.history[0].content, MessageContent::text("Hello @B"));
        assert_eq!(msg.content.as_text(), Some("Hello again @B"));
    }

    #[test]
    fn test_reaction_content_not_editable() {
        let mut msg = ChatMessage::new(
            "r",
            "a",
            "A",
            Role::Participant,
            MessageContent::Reaction { emoji: "🎉".into() },
        );
        assert!(!msg.apply_edit("text".into(), Utc::now()));
        assert!(msg.edited.history.is_empty());
    }

    #[test]
    fn test_soft_delete_hides_content() {
        let mut msg = sample();
        assert!(msg.soft_delete("a", Utc::now()));
        assert!(!msg.soft_delete("a", Utc::now()));

        let view = msg.public_view();
        assert!(view.is_deleted);
        assert!(view.content.is_none());
        assert_eq!(view.deleted_by.as_deref(), Some("a"));
        // Still readable internally for audit.
        assert_eq!(msg.content.as_text(), Some("Hello @B"));

        let json = serde_json::to_value(&view).unwrap();
        assert!(json.get("content").is_none());
    }

    #[test]
    fn test_reactions_idempotent() {
        let mut msg = sample();
        assert!(msg.add_reaction("👍", "b"));
        assert!(!msg.add_reaction("👍", "b"));
        assert_eq!(msg.reaction_count("👍"), 1);

        assert!(!msg.remove_reaction("🎉", "b"));
        assert!(msg.remove_reaction("👍", "b"));
        assert!(!msg.remove_reaction("👍", "b"));
        assert!(msg.reactions.is_empty());
    }

    #[test]
    fn test_stored_shape() {
        let msg = sample();
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["roomId"], "event-42");
        assert_eq!(value["authorId"], "a");
        assert_eq!(value["content"]["type"], "text");
        assert_eq!(value["moderation"]["isDeleted"], false);

        let back: ChatMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_file_extension() {
        let file = FileAttachment {
            original_name: "Slides.PDF".into(),
            stored_name: "abc".into(),
            mime_type: "application/pdf".into(),
            size: 10,
            url: "/uploads/chat/abc".into(),
        };
        assert_eq!(file.extension().as_deref(), Some("pdf"));
    }
}

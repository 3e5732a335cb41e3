//! Canonical event type names.

/// Inbound chat event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChatEvent {
    JoinRoom,
    LeaveRoom,
    SendMessage,
    EditMessage,
    DeleteMessage,
    AddReaction,
    RemoveReaction,
    TypingStart,
    TypingStop,
    UserPresence,
}

impl ChatEvent {
    /// Every inbound chat event, in registration order.
    pub const ALL: [ChatEvent; 10] = [
        ChatEvent::JoinRoom,
        ChatEvent::LeaveRoom,
        ChatEvent::SendMessage,
        ChatEvent::EditMessage,
        ChatEvent::DeleteMessage,
        ChatEvent::AddReaction,
        ChatEvent::RemoveReaction,
        ChatEvent::TypingStart,
        ChatEvent::TypingStop,
        ChatEvent::UserPresence,
    ];

    /// The wire name of this event.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ChatEvent::JoinRoom => "chat:join-room",
            ChatEvent::LeaveRoom => "chat:leave-room",
            ChatEvent::SendMessage => "chat:send-message",
            ChatEvent::EditMessage => "chat:edit-message",
            ChatEvent::DeleteMessage => "chat:delete-message",
            ChatEvent::AddReaction => "chat:add-reaction",
            ChatEvent::RemoveReaction => "chat:remove-reaction",
            ChatEvent::TypingStart => "chat:typing-start",
            ChatEvent::TypingStop => "chat:typing-stop",
            ChatEvent::UserPresence => "chat:user-presence",
        }
    }
}

impl TryFrom<&str> for ChatEvent {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        ChatEvent::ALL
            .into_iter()
            .find(|event| event.as_str() == value)
            .ok_or("Unknown chat event")
    }
}

impl std::fmt::Display for ChatEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound event types.
pub mod outbound {
    pub const CONNECTED: &str = "connected";
    pub const ROOM_JOINED: &str = "chat:room-joined";
    pub const ROOM_LEFT: &str = "chat:room-left";
    pub const USER_JOINED: &str = "chat:user-joined";
    pub const USER_LEFT: &str = "chat:user-left";
    pub const MESSAGE_RECEIVED: &str = "chat:message-received";
    pub const MESSAGE_EDITED: &str = "chat:message-edited";
    pub const MESSAGE_DELETED: &str = "chat:message-deleted";
    pub const REACTION_ADDED: &str = "chat:reaction-added";
    pub const REACTION_REMOVED: &str = "chat:reaction-removed";
    pub const USER_TYPING: &str = "chat:user-typing";
    pub const PRESENCE_UPDATE: &str = "chat:presence-update";
    pub const ERROR: &str = "chat:error";
    pub const MENTION: &str = "chat:mention";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_event_names() {
        assert_eq!(ChatEvent::JoinRoom.as_str(), "chat:join-room");
        assert_eq!(ChatEvent::UserPresence.to_string(), "chat:user-presence");
    }

    #[test]
    fn test_chat_event_parse() {
        assert_eq!(ChatEvent::try_from("chat:typing-start"), Ok(ChatEvent::TypingStart));
        assert_eq!(ChatEvent::try_from("chat:delete-message"), Ok(ChatEvent::DeleteMessage));
        assert!(ChatEvent::try_from("poll:start").is_err());
    }
}

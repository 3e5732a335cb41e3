//! Error taxonomy for chat operations.
//!
//! Every per-action failure is recovered locally and reported only to the
//! requesting connection as `chat:error{code, message}`.

use crate::ratelimit::Action;
use crate::store::StoreError;
use chorus_protocol::Envelope;
use thiserror::Error;

/// Chat operation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChatError {
    /// Malformed or oversized input.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The actor lacks the required permission.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The actor exceeded the rate limit for an action.
    #[error("Rate limit exceeded for {0}")]
    RateLimited(Action),

    /// Content was rejected by the moderator.
    #[error("Message blocked by moderation")]
    ModerationBlocked(Option<String>),

    /// Content was empty after sanitization.
    #[error("Empty message")]
    EmptyContent,

    /// The referenced entity does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Conflicting mutation.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The connection's transport failed or is gone.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The record store failed.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// Stable wire code for this error.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Validation(_) => "VALIDATION_ERROR",
            ChatError::PermissionDenied(_) => "PERMISSION_DENIED",
            ChatError::RateLimited(_) => "RATE_LIMIT",
            ChatError::ModerationBlocked(_) => "MODERATION_BLOCKED",
            ChatError::EmptyContent => "EMPTY_MESSAGE",
            ChatError::NotFound(_) => "NOT_FOUND",
            ChatError::Conflict(_) => "CONFLICT",
            ChatError::Transport(_) => "TRANSPORT_ERROR",
            ChatError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Build the `chat:error` envelope sent to the requesting connection.
    #[must_use]
    pub fn to_envelope(&self, request_type: Option<&str>) -> Envelope {
        let mut envelope = Envelope::error(self.code(), self.to_string());
        if let serde_json::Value::Object(map) = &mut envelope.payload {
            if let ChatError::ModerationBlocked(Some(reason)) = self {
                map.insert("reason".into(), reason.clone().into());
            }
            if let Some(kind) = request_type {
                map.insert("requestType".into(), kind.into());
            }
        }
        envelope
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        ChatError::Validation(msg.into())
    }

    pub(crate) fn denied(msg: impl Into<String>) -> Self {
        ChatError::PermissionDenied(msg.into())
    }
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { collection, id } => {
                ChatError::NotFound(format!("{collection}/{id}"))
            }
            StoreError::Duplicate { id, .. } => ChatError::Conflict(format!("{id} already exists")),
            other => ChatError::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::Internal(format!("record encoding: {err}"))
    }
}

/// Result type for chat operations.
pub type ChatResult<T> = Result<T, ChatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ChatError::RateLimited(Action::SendMessage).code(), "RATE_LIMIT");
        assert_eq!(ChatError::EmptyContent.code(), "EMPTY_MESSAGE");
        assert_eq!(ChatError::NotFound("Message".into()).to_string(), "Message not found");
    }

    #[test]
    fn test_error_envelope_carries_reason() {
        let err = ChatError::ModerationBlocked(Some("Contains inappropriate content: spam".into()));
        let env = err.to_envelope(Some("chat:send-message"));

        assert_eq!(env.kind, "chat:error");
        assert_eq!(env.payload["code"], "MODERATION_BLOCKED");
        assert_eq!(env.payload["reason"], "Contains inappropriate content: spam");
        assert_eq!(env.payload["requestType"], "chat:send-message");
    }

    #[test]
    fn test_store_error_mapping() {
        let err: ChatError = StoreError::NotFound {
            collection: "chatMessages".into(),
            id: "m1".into(),
        }
        .into();
        assert_eq!(err.code(), "NOT_FOUND");
    }
}

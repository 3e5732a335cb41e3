//! The wire envelope exchanged between clients and the server.
//!
//! Every message in either direction is a single envelope:
//! `{type, payload, room?, target?}`. The `type` string selects a handler on
//! the way in and names the event on the way out.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum length of an envelope type string.
pub const MAX_TYPE_LENGTH: usize = 64;

/// A protocol envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event type, e.g. `chat:send-message`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Event payload. Handlers expect a JSON object.
    #[serde(default)]
    pub payload: Value,

    /// Target room, for room-scoped events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,

    /// Direct target: a connection id or a `user-<id>` private channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Originator of a relayed envelope. Set by the server only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl Envelope {
    /// Create a new envelope.
    #[must_use]
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            room: None,
            target: None,
            source: None,
        }
    }

    /// Scope the envelope to a room.
    #[must_use]
    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    /// Address the envelope to a direct target.
    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Record the originator of the envelope.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Build a `chat:error` envelope.
    #[must_use]
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::new(
            crate::events::outbound::ERROR,
            serde_json::json!({ "code": code, "message": message.into() }),
        )
    }

    /// Validate the envelope shape.
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.kind.is_empty() {
            return Err("Envelope type cannot be empty");
        }
        if self.kind.len() > MAX_TYPE_LENGTH {
            return Err("Envelope type too long");
        }
        if !matches!(self.payload, Value::Null | Value::Object(_)) {
            return Err("Envelope payload must be an object");
        }
        Ok(())
    }

    /// Read a string field from the payload.
    #[must_use]
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload.get(field).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_json_shape() {
        let env = Envelope::new("chat:send-message", json!({"content": "hi"})).with_room("event-1");
        let value = serde_json::to_value(&env).unwrap();

        assert_eq!(value["type"], "chat:send-message");
        assert_eq!(value["room"], "event-1");
        assert!(value.get("target").is_none());
        assert!(value.get("source").is_none());
    }

    #[test]
    fn test_envelope_missing_optional_fields() {
        let env: Envelope = serde_json::from_str(r#"{"type":"chat:typing-stop"}"#).unwrap();
        assert_eq!(env.kind, "chat:typing-stop");
        assert_eq!(env.payload, Value::Null);
        assert!(env.room.is_none());
    }

    #[test]
    fn test_envelope_validation() {
        assert!(Envelope::new("x", json!({})).validate().is_ok());
        assert!(Envelope::new("", json!({})).validate().is_err());
        assert!(Envelope::new("x", json!([1, 2])).validate().is_err());
        assert!(Envelope::new("a".repeat(MAX_TYPE_LENGTH + 1), Value::Null)
            .validate()
            .is_err());
    }

    #[test]
    fn test_error_envelope() {
        let env = Envelope::error("RATE_LIMIT", "Rate limit exceeded");
        assert_eq!(env.kind, "chat:error");
        assert_eq!(env.payload_str("code"), Some("RATE_LIMIT"));
    }
}

//! Inbound event routing.
//!
//! The router maps an envelope `type` to a handler. It is shared by every
//! realtime feature: chat registers its handlers here, and so do unrelated
//! domains such as polls, which reuse room fan-out through the [`Hub`].
//! Types without a handler take the hub's default route.

use crate::connection::ConnectionId;
use crate::engine::Actor;
use crate::error::{ChatError, ChatResult};
use crate::hub::Hub;
use crate::identity::{Identity, UserIdentity};
use async_trait::async_trait;
use chorus_protocol::Envelope;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// The connection an inbound envelope arrived on.
#[derive(Debug, Clone)]
pub struct EventContext {
    pub connection: ConnectionId,
    pub identity: Identity,
}

impl EventContext {
    #[must_use]
    pub fn actor(&self) -> Actor {
        Actor::connected(self.connection.clone(), self.identity.clone())
    }

    /// # Errors
    ///
    /// `PermissionDenied` for anonymous connections.
    pub fn user(&self) -> ChatResult<&UserIdentity> {
        self.identity
            .as_user()
            .ok_or_else(|| ChatError::denied("Authentication required"))
    }
}

/// Handles one or more inbound event types.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, hub: &Hub, ctx: &EventContext, envelope: Envelope) -> ChatResult<()>;
}

/// Decode an envelope payload into a typed request.
///
/// # Errors
///
/// `Validation` when the payload does not match.
pub fn parse_payload<T: DeserializeOwned>(payload: Value) -> ChatResult<T> {
    let payload = match payload {
        Value::Null => Value::Object(serde_json::Map::new()),
        other => other,
    };
    serde_json::from_value(payload)
        .map_err(|err| ChatError::validation(format!("Invalid payload: {err}")))
}

/// Registry of event handlers keyed by envelope type.
#[derive(Default)]
pub struct EventRouter {
    handlers: DashMap<String, Arc<dyn EventHandler>>,
}

impl EventRouter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, returning the one it replaced.
    pub fn register(
        &self,
        kind: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) -> Option<Arc<dyn EventHandler>> {
        let kind = kind.into();
        debug!(kind = %kind, "Registering event handler");
        self.handlers.insert(kind, handler)
    }

    pub fn unregister(&self, kind: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.remove(kind).map(|(_, handler)| handler)
    }

    /// Look up a handler. The map is not borrowed past this call.
    #[must_use]
    pub fn handler(&self, kind: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(kind).map(|h| Arc::clone(h.value()))
    }

    #[must_use]
    pub fn is_registered(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered types, sorted.
    #[must_use]
    pub fn registered_types(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        kinds.sort();
        kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl EventHandler for Noop {
        async fn handle(&self, _: &Hub, _: &EventContext, _: Envelope) -> ChatResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_unregister() {
        let router = EventRouter::new();
        assert!(router.register("poll:start", Arc::new(Noop)).is_none());
        assert!(router.register("poll:start", Arc::new(Noop)).is_some());
        router.register("poll:end", Arc::new(Noop));

        assert_eq!(router.registered_types(), vec!["poll:end", "poll:start"]);
        assert!(router.handler("poll:start").is_some());
        assert!(router.unregister("poll:start").is_some());
        assert!(!router.is_registered("poll:start"));
        assert!(router.handler("poll:start").is_none());
    }

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Room {
        room_id: Option<String>,
    }

    #[test]
    fn test_parse_payload() {
        let parsed: Room = parse_payload(json!({"roomId": "lobby"})).unwrap();
        assert_eq!(parsed.room_id.as_deref(), Some("lobby"));

        let empty: Room = parse_payload(Value::Null).unwrap();
        assert!(empty.room_id.is_none());

        let err = parse_payload::<Room>(json!({"roomId": 5})).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}

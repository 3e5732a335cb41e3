//! Poll relay.
//!
//! Poll state lives with the poll service; the socket server only fans
//! poll lifecycle events out to `poll:<pollId>` and `event:<eventId>` rooms.

use async_trait::async_trait;
use chorus_core::{parse_payload, ChatError, ChatResult, EventContext, EventHandler, EventRouter, Hub};
use chorus_protocol::Envelope;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

pub const POLL_START: &str = "poll:start";
pub const POLL_END: &str = "poll:end";
pub const POLL_RESPONSE: &str = "poll:response";

pub const POLL_STARTED: &str = "poll:started";
pub const POLL_ENDED: &str = "poll:ended";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollPayload {
    poll_id: String,
    #[serde(default)]
    event_id: Option<String>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollEvent {
    Start,
    End,
    Response,
}

struct PollHandler(PollEvent);

/// Register the poll relay on a router.
pub fn register_poll_handlers(router: &EventRouter) {
    router.register(POLL_START, Arc::new(PollHandler(PollEvent::Start)));
    router.register(POLL_END, Arc::new(PollHandler(PollEvent::End)));
    router.register(POLL_RESPONSE, Arc::new(PollHandler(PollEvent::Response)));
}

/// Rooms a poll event is delivered to.
fn poll_rooms(poll_id: &str, event_id: Option<&str>) -> Vec<String> {
    let mut rooms = vec![format!("poll:{poll_id}")];
    if let Some(event_id) = event_id.filter(|id| !id.is_empty()) {
        rooms.push(format!("event:{event_id}"));
    }
    rooms
}

#[async_trait]
impl EventHandler for PollHandler {
    async fn handle(&self, hub: &Hub, ctx: &EventContext, envelope: Envelope) -> ChatResult<()> {
        let PollPayload {
            poll_id,
            event_id,
            rest,
        } = parse_payload(envelope.payload)?;
        if poll_id.trim().is_empty() {
            return Err(ChatError::Validation("pollId is required".into()));
        }

        let user = ctx
            .identity
            .as_user()
            .ok_or_else(|| ChatError::PermissionDenied("Authentication required".into()))?;
        let timestamp = chrono::Utc::now();

        let (kind, payload) = match self.0 {
            PollEvent::Start | PollEvent::End => {
                if !user.role.permissions().create_rooms {
                    return Err(ChatError::PermissionDenied(
                        "Only speakers can control polls".into(),
                    ));
                }
                let kind = if self.0 == PollEvent::Start { POLL_STARTED } else { POLL_ENDED };
                (
                    kind,
                    json!({
                        "pollId": poll_id,
                        "eventId": event_id,
                        "poll": rest,
                        "by": user.user_id,
                        "timestamp": timestamp,
                    }),
                )
            }
            PollEvent::Response => (
                POLL_RESPONSE,
                json!({
                    "pollId": poll_id,
                    "eventId": event_id,
                    "response": rest,
                    "userId": user.user_id,
                    "timestamp": timestamp,
                }),
            ),
        };

        let mut delivered = 0;
        for room in poll_rooms(&poll_id, event_id.as_deref()) {
            delivered += hub.broadcast(&room, kind, payload.clone(), None);
        }
        debug!(poll = %poll_id, kind, delivered, "Poll event relayed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::{Identity, Role, Transport};
    use tokio::sync::mpsc;

    #[test]
    fn test_poll_rooms() {
        assert_eq!(poll_rooms("7", None), vec!["poll:7"]);
        assert_eq!(poll_rooms("7", Some("")), vec!["poll:7"]);
        assert_eq!(poll_rooms("7", Some("42")), vec!["poll:7", "event:42"]);
    }

    #[tokio::test]
    async fn test_poll_relay() {
        let hub = Hub::default();
        register_poll_handlers(hub.router());

        let (tx, mut speaker_rx) = mpsc::unbounded_channel();
        let speaker = hub.register(Transport::new("s", tx), Identity::user("s", Role::Speaker, "Sam"));
        let (tx, mut viewer_rx) = mpsc::unbounded_channel();
        let viewer = hub.register(Transport::new("v", tx), Identity::user("v", Role::Participant, "Vi"));

        hub.join_room(&viewer, "event:42").await.unwrap();
        hub.join_room(&speaker, "poll:7").await.unwrap();
        while viewer_rx.try_recv().is_ok() {}
        while speaker_rx.try_recv().is_ok() {}

        let start = Envelope::new(POLL_START, json!({"pollId": "7", "eventId": "42", "question": "?"}));
        hub.dispatch(&speaker, start).await.unwrap();
        let started = viewer_rx.try_recv().unwrap();
        assert_eq!(started.kind, POLL_STARTED);
        assert_eq!(started.payload["poll"]["question"], "?");
        assert_eq!(speaker_rx.try_recv().unwrap().kind, POLL_STARTED);

        // Participants may answer but not control the poll.
        let end = Envelope::new(POLL_END, json!({"pollId": "7", "eventId": "42"}));
        let err = hub.dispatch(&viewer, end).await.unwrap_err();
        assert_eq!(err.code(), "PERMISSION_DENIED");
        assert_eq!(viewer_rx.try_recv().unwrap().kind, "chat:error");

        let answer = Envelope::new(POLL_RESPONSE, json!({"pollId": "7", "eventId": "42", "option": 2}));
        hub.dispatch(&viewer, answer).await.unwrap();
        let relayed = speaker_rx.try_recv().unwrap();
        assert_eq!(relayed.kind, POLL_RESPONSE);
        assert_eq!(relayed.payload["userId"], "v");
        assert_eq!(relayed.payload["response"]["option"], 2);
    }
}

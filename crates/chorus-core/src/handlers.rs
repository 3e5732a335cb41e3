//! Chat event handlers registered on the shared router.

use crate::dispatch::{parse_payload, EventContext, EventHandler, EventRouter};
use crate::engine::SendRequest;
use crate::error::{ChatError, ChatResult};
use crate::hub::Hub;
use crate::message::MessageId;
use crate::presence::PresenceStatus;
use async_trait::async_trait;
use chorus_protocol::{ChatEvent, Envelope};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoomPayload {
    room_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EditPayload {
    message_id: MessageId,
    #[serde(alias = "content")]
    new_content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessagePayload {
    message_id: MessageId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReactionPayload {
    message_id: MessageId,
    emoji: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PresencePayload {
    room_id: Option<String>,
    status: PresenceStatus,
}

/// The room named by the payload, falling back to the envelope's room.
fn room_of(payload_room: Option<String>, envelope_room: Option<String>) -> ChatResult<String> {
    payload_room
        .filter(|r| !r.is_empty())
        .or(envelope_room)
        .ok_or_else(|| ChatError::validation("roomId is required"))
}

struct ChatHandler(ChatEvent);

/// Register handlers for every inbound chat event.
pub fn register_chat_handlers(router: &EventRouter) {
    for event in ChatEvent::ALL {
        router.register(event.as_str(), Arc::new(ChatHandler(event)));
    }
}

#[async_trait]
impl EventHandler for ChatHandler {
    async fn handle(&self, hub: &Hub, ctx: &EventContext, envelope: Envelope) -> ChatResult<()> {
        let Envelope { payload, room, .. } = envelope;
        let actor = ctx.actor();

        match self.0 {
            ChatEvent::JoinRoom => {
                let p: RoomPayload = parse_payload(payload)?;
                hub.join_room(&ctx.connection, &room_of(p.room_id, room)?)
                    .await?;
            }
            ChatEvent::LeaveRoom => {
                let p: RoomPayload = parse_payload(payload)?;
                hub.leave_room(&ctx.connection, &room_of(p.room_id, room)?)?;
            }
            ChatEvent::SendMessage => {
                let mut request: SendRequest = parse_payload(payload)?;
                if request.room_id.is_empty() {
                    request.room_id = room_of(None, room)?;
                }
                hub.engine().send(&actor, request).await?;
            }
            ChatEvent::EditMessage => {
                let p: EditPayload = parse_payload(payload)?;
                hub.engine().edit(&actor, p.message_id, &p.new_content).await?;
            }
            ChatEvent::DeleteMessage => {
                let p: MessagePayload = parse_payload(payload)?;
                hub.engine().delete(&actor, p.message_id).await?;
            }
            ChatEvent::AddReaction => {
                let p: ReactionPayload = parse_payload(payload)?;
                hub.engine().add_reaction(&actor, p.message_id, &p.emoji).await?;
            }
            ChatEvent::RemoveReaction => {
                let p: ReactionPayload = parse_payload(payload)?;
                hub.engine()
                    .remove_reaction(&actor, p.message_id, &p.emoji)
                    .await?;
            }
            ChatEvent::TypingStart => {
                let p: RoomPayload = parse_payload(payload)?;
                let room_id = room_of(p.room_id, room)?;
                hub.presence()
                    .typing_start(&ctx.connection, ctx.user()?, &room_id)?;
            }
            ChatEvent::TypingStop => {
                let p: RoomPayload = parse_payload(payload)?;
                let room_id = room_of(p.room_id, room)?;
                hub.presence()
                    .typing_stop(&ctx.connection, ctx.user()?, &room_id)?;
            }
            ChatEvent::UserPresence => {
                let p: PresencePayload = parse_payload(payload)?;
                let user = ctx.user()?;
                // Without a room the status applies to every joined room.
                let rooms = match p.room_id.filter(|r| !r.is_empty()).or(room) {
                    Some(room_id) => vec![room_id],
                    None => hub.connections().joined_rooms(&ctx.connection),
                };
                for room_id in rooms {
                    hub.presence()
                        .update(&ctx.connection, user, &room_id, p.status)
                        .await?;
                }
            }
        }
        Ok(())
    }
}
